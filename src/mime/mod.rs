//! MIME encoding for email messages.
//!
//! Provides RFC 5322 compliant message formatting with:
//! - Header encoding (RFC 2047) and folding
//! - Quoted-printable text bodies
//! - `multipart/mixed` construction with base64 attachments
//! - DATA dot-stuffing (RFC 5321 section 4.5.2)

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::types::{Address, Attachment, Email};

/// Maximum header line length before folding.
const MAX_HEADER_LINE: usize = 78;

/// Base64 line length for attachment bodies.
const BASE64_LINE: usize = 76;

/// Raw bytes per RFC 2047 encoded word, keeping each word under 75 characters.
const ENCODED_WORD_CHUNK: usize = 45;

/// MIME content types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentType {
    /// Plain text.
    TextPlain,
    /// Multipart mixed (body + attachments).
    MultipartMixed(String),
    /// Other content type.
    Other(String),
}

impl ContentType {
    /// Returns the MIME type string.
    pub fn mime_type(&self) -> String {
        match self {
            ContentType::TextPlain => "text/plain; charset=utf-8".to_string(),
            ContentType::MultipartMixed(boundary) => {
                format!("multipart/mixed; boundary=\"{}\"", boundary)
            }
            ContentType::Other(s) => s.clone(),
        }
    }
}

/// Transfer encoding types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferEncoding {
    /// Quoted-printable encoding.
    #[default]
    QuotedPrintable,
    /// Base64 encoding.
    Base64,
}

impl TransferEncoding {
    /// Returns the header value.
    pub fn header_value(&self) -> &'static str {
        match self {
            TransferEncoding::QuotedPrintable => "quoted-printable",
            TransferEncoding::Base64 => "base64",
        }
    }
}

/// An RFC 5322 message ready for submission.
#[derive(Debug, Clone)]
pub struct EncodedMessage {
    /// Message ID written to the `Message-ID` header, without angle brackets.
    pub message_id: String,
    /// Encoded message, CRLF line endings, not yet dot-stuffed.
    pub bytes: Vec<u8>,
}

impl EncodedMessage {
    /// Returns the encoded size in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// MIME encoder for email messages.
#[derive(Debug, Clone, Default)]
pub struct MimeEncoder {
    /// Fixed date for the Date header; `None` uses the time of encoding.
    date: Option<DateTime<Utc>>,
    /// Domain for message IDs; `None` uses the sender's domain.
    domain: Option<String>,
}

impl MimeEncoder {
    /// Creates a new encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a fixed domain for generated message IDs.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Uses a fixed date for the Date header.
    pub fn with_date(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    /// Encodes an email to RFC 5322 format.
    pub fn encode(&self, email: &Email) -> SmtpResult<EncodedMessage> {
        let date = self.date.unwrap_or_else(Utc::now);
        let message_id = match &email.message_id {
            Some(id) => id.clone(),
            None => {
                let domain = self.domain.as_deref().unwrap_or_else(|| email.from.domain());
                generate_message_id(domain, &date)
            }
        };

        let mut output = Vec::new();

        self.write_header(&mut output, "Date", &date.to_rfc2822())?;
        self.write_header(&mut output, "From", &self.encode_address(&email.from))?;

        if !email.to.is_empty() {
            self.write_header(&mut output, "To", &self.encode_address_list(&email.to))?;
        }

        if !email.cc.is_empty() {
            self.write_header(&mut output, "Cc", &self.encode_address_list(&email.cc))?;
        }

        // Bcc recipients only appear in the envelope.

        if let Some(reply_to) = &email.reply_to {
            self.write_header(&mut output, "Reply-To", &self.encode_address(reply_to))?;
        }

        self.write_header(&mut output, "Subject", &self.encode_header(&email.subject))?;
        self.write_header(&mut output, "Message-ID", &format!("<{}>", message_id))?;

        for (name, value) in &email.headers {
            self.write_header(&mut output, name, &self.encode_header(value))?;
        }

        self.write_header(&mut output, "MIME-Version", "1.0")?;

        if email.has_attachments() {
            let boundary = self.generate_boundary();
            self.write_header(
                &mut output,
                "Content-Type",
                &ContentType::MultipartMixed(boundary.clone()).mime_type(),
            )?;
            output.extend_from_slice(b"\r\n");

            output.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
            self.write_text_part(&mut output, &email.text)?;

            for attachment in &email.attachments {
                output.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
                self.write_attachment(&mut output, attachment)?;
            }

            output.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
        } else {
            self.write_text_part(&mut output, &email.text)?;
        }

        Ok(EncodedMessage {
            message_id,
            bytes: output,
        })
    }

    /// Writes a header line.
    fn write_header(&self, output: &mut Vec<u8>, name: &str, value: &str) -> SmtpResult<()> {
        if name.is_empty() || name.chars().any(|c| !c.is_ascii_graphic() || c == ':') {
            return Err(SmtpError::message_error(
                SmtpErrorKind::InvalidHeader,
                format!("Invalid header name: {:?}", name),
            ));
        }

        if value.contains(['\r', '\n']) {
            return Err(SmtpError::message_error(
                SmtpErrorKind::InvalidHeader,
                format!("Header {} contains a line break", name),
            ));
        }

        let header = format!("{}: {}", name, value);
        output.extend_from_slice(self.fold_header(&header).as_bytes());
        output.extend_from_slice(b"\r\n");
        Ok(())
    }

    /// Folds a header line at 78 characters.
    fn fold_header(&self, header: &str) -> String {
        if header.len() <= MAX_HEADER_LINE {
            return header.to_string();
        }

        let mut result = String::new();
        let mut current_line = String::new();

        for word in header.split(' ') {
            if current_line.is_empty() {
                current_line = word.to_string();
            } else if current_line.len() + 1 + word.len() <= MAX_HEADER_LINE - 2 {
                current_line.push(' ');
                current_line.push_str(word);
            } else {
                result.push_str(&current_line);
                result.push_str("\r\n ");
                current_line = word.to_string();
            }
        }

        result.push_str(&current_line);
        result
    }

    /// Encodes a header value using RFC 2047 when it is not plain printable ASCII.
    fn encode_header(&self, value: &str) -> String {
        if value.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
            return value.to_string();
        }

        let mut words = Vec::new();
        let mut chunk = String::new();
        for c in value.chars() {
            if chunk.len() + c.len_utf8() > ENCODED_WORD_CHUNK {
                words.push(format!("=?UTF-8?B?{}?=", BASE64.encode(chunk.as_bytes())));
                chunk.clear();
            }
            chunk.push(c);
        }
        if !chunk.is_empty() {
            words.push(format!("=?UTF-8?B?{}?=", BASE64.encode(chunk.as_bytes())));
        }

        words.join(" ")
    }

    /// Formats an address for a header, encoding a non-ASCII display name.
    fn encode_address(&self, address: &Address) -> String {
        match address.name() {
            Some(name) if !name.is_ascii() => {
                format!("{} <{}>", self.encode_header(name), address.email())
            }
            _ => address.to_header(),
        }
    }

    fn encode_address_list(&self, addresses: &[Address]) -> String {
        addresses
            .iter()
            .map(|a| self.encode_address(a))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Formats a filename as a quoted MIME parameter value.
    fn encode_filename(&self, filename: &str) -> String {
        if filename.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
            format!("\"{}\"", filename.replace('\\', "\\\\").replace('"', "\\\""))
        } else {
            format!("\"{}\"", self.encode_header(filename))
        }
    }

    /// Generates a unique boundary.
    fn generate_boundary(&self) -> String {
        format!("----=_Part_{}", Uuid::new_v4().simple())
    }

    /// Writes the plain text body part.
    fn write_text_part(&self, output: &mut Vec<u8>, text: &str) -> SmtpResult<()> {
        self.write_header(output, "Content-Type", &ContentType::TextPlain.mime_type())?;
        self.write_header(
            output,
            "Content-Transfer-Encoding",
            TransferEncoding::QuotedPrintable.header_value(),
        )?;
        output.extend_from_slice(b"\r\n");

        let normalized = text.replace("\r\n", "\n").replace('\n', "\r\n");
        output.extend_from_slice(&quoted_printable::encode(normalized.as_bytes()));
        output.extend_from_slice(b"\r\n");
        Ok(())
    }

    /// Writes an attachment part.
    fn write_attachment(&self, output: &mut Vec<u8>, attachment: &Attachment) -> SmtpResult<()> {
        let filename = self.encode_filename(&attachment.filename);
        self.write_header(
            output,
            "Content-Type",
            &format!("{}; name={}", attachment.content_type, filename),
        )?;
        self.write_header(
            output,
            "Content-Transfer-Encoding",
            TransferEncoding::Base64.header_value(),
        )?;
        self.write_header(
            output,
            "Content-Disposition",
            &format!("attachment; filename={}", filename),
        )?;
        output.extend_from_slice(b"\r\n");

        let encoded = BASE64.encode(&attachment.data);
        for chunk in encoded.as_bytes().chunks(BASE64_LINE) {
            output.extend_from_slice(chunk);
            output.extend_from_slice(b"\r\n");
        }

        Ok(())
    }

    /// Prepares the DATA content with dot-stuffing and the final terminator.
    pub fn prepare_data_content(encoded_email: &[u8]) -> Vec<u8> {
        let mut output = Vec::with_capacity(encoded_email.len() + 100);
        let mut at_line_start = true;

        for &byte in encoded_email {
            if at_line_start && byte == b'.' {
                output.push(b'.');
            }

            output.push(byte);
            at_line_start = byte == b'\n';
        }

        if !output.ends_with(b"\r\n") {
            if output.ends_with(b"\n") {
                output.pop();
            }
            output.extend_from_slice(b"\r\n");
        }

        output.extend_from_slice(b".\r\n");

        output
    }
}

/// Generates a unique message ID for the given domain.
pub fn generate_message_id(domain: &str, date: &DateTime<Utc>) -> String {
    format!("{}.{}@{}", Uuid::new_v4().simple(), date.timestamp(), domain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn report_email(attachments: Vec<Attachment>) -> Email {
        Email::builder()
            .from("sender@example.com").unwrap()
            .to("recipient@example.com").unwrap()
            .bcc("hidden@example.com").unwrap()
            .subject("GPU Benchmark Report")
            .text("Benchmark Report attached")
            .attachments(attachments)
            .build()
            .unwrap()
    }

    #[test]
    fn test_header_encoding() {
        let encoder = MimeEncoder::new();

        assert_eq!(encoder.encode_header("Hello"), "Hello");

        let encoded = encoder.encode_header("Héllo");
        assert!(encoded.starts_with("=?UTF-8?B?"));

        let long = "é".repeat(60);
        let encoded = encoder.encode_header(&long);
        assert!(encoded.split(' ').all(|word| word.len() <= 75));
        assert_eq!(encoded.split(' ').count(), 3);
    }

    #[test]
    fn test_header_rejects_line_breaks() {
        let encoder = MimeEncoder::new();
        let mut output = Vec::new();
        let err = encoder
            .write_header(&mut output, "X-Test", "a\r\nBcc: victim@example.com")
            .unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::InvalidHeader);

        let err = encoder.write_header(&mut output, "Bad Name", "value").unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::InvalidHeader);
    }

    #[test]
    fn test_fold_long_header() {
        let encoder = MimeEncoder::new();
        let header = format!("To: {}", vec!["someone@example.com"; 8].join(", "));
        let folded = encoder.fold_header(&header);
        assert!(folded.contains("\r\n "));
        assert!(folded.split("\r\n").all(|line| line.len() <= MAX_HEADER_LINE));
    }

    #[test]
    fn test_message_id_uses_sender_domain() {
        let encoded = MimeEncoder::new().encode(&report_email(vec![])).unwrap();
        assert!(encoded.message_id.ends_with("@example.com"));

        let encoded = MimeEncoder::new()
            .with_domain("mailer.local")
            .encode(&report_email(vec![]))
            .unwrap();
        assert!(encoded.message_id.ends_with("@mailer.local"));
    }

    #[test]
    fn test_dot_stuffing() {
        let input = b"Hello\r\n.World\r\n..Test\r\n";
        let output = MimeEncoder::prepare_data_content(input);
        let output_str = String::from_utf8_lossy(&output);
        assert!(output_str.contains("\r\n..World"));
        assert!(output_str.contains("\r\n...Test"));
        assert!(output_str.ends_with("\r\n.\r\n"));

        let output = MimeEncoder::prepare_data_content(b".leading\nbare");
        assert_eq!(output, b"..leading\nbare\r\n.\r\n".to_vec());
    }

    #[test]
    fn test_text_only_encoding() {
        let date = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let encoded = MimeEncoder::new()
            .with_date(date)
            .encode(&report_email(vec![]))
            .unwrap();
        let content = String::from_utf8(encoded.bytes).unwrap();

        assert!(content.starts_with("Date: Wed, 1 May 2024 12:00:00 +0000\r\n"));
        assert!(content.contains("From: sender@example.com\r\n"));
        assert!(content.contains("To: recipient@example.com\r\n"));
        assert!(content.contains("Subject: GPU Benchmark Report\r\n"));
        assert!(content.contains("MIME-Version: 1.0\r\n"));
        assert!(content.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(content.contains("\r\n\r\nBenchmark Report attached\r\n"));
        assert!(!content.contains("hidden@example.com"));
        assert!(!content.contains("multipart"));
    }

    #[test]
    fn test_attachment_parts() {
        let email = report_email(vec![
            Attachment::binary("benchmark_report.txt", b"gpu=a100 fps=120\n".to_vec()),
            Attachment::binary("raw.bin", vec![0, 159, 255]),
        ]);
        let encoded = MimeEncoder::new().encode(&email).unwrap();
        let content = String::from_utf8(encoded.bytes).unwrap();

        assert!(content.contains("Content-Type: multipart/mixed; boundary=\"----=_Part_"));
        assert!(content.contains(
            "Content-Type: application/octet-stream; name=\"benchmark_report.txt\"\r\n"
        ));
        assert!(content.contains(
            "Content-Disposition: attachment; filename=\"benchmark_report.txt\"\r\n"
        ));
        assert!(content.contains(&format!("\r\n{}\r\n", BASE64.encode(b"gpu=a100 fps=120\n"))));
        assert!(content.contains(&format!("\r\n{}\r\n", BASE64.encode([0u8, 159, 255]))));

        let first = content.find("benchmark_report.txt").unwrap();
        let second = content.find("raw.bin").unwrap();
        assert!(first < second);
        assert!(content.trim_end().ends_with("--"));
    }

    #[test]
    fn test_non_ascii_filename() {
        let email = report_email(vec![Attachment::binary("résumé.pdf", vec![1])]);
        let content = String::from_utf8(MimeEncoder::new().encode(&email).unwrap().bytes).unwrap();
        assert!(content.contains("filename=\"=?UTF-8?B?"));
        assert!(!content.contains("résumé"));
    }

    #[test]
    fn test_named_addresses_in_headers() {
        let mut email = report_email(vec![]);
        email.from = Address::with_name("Bench Bot", "bot@example.com").unwrap();
        let content = String::from_utf8(MimeEncoder::new().encode(&email).unwrap().bytes).unwrap();
        assert!(content.contains("From: Bench Bot <bot@example.com>\r\n"));
    }

    #[test]
    fn test_non_ascii_display_names_are_encoded() {
        let mut email = report_email(vec![]);
        email.from = Address::parse("José Müller <jose@example.com>").unwrap();
        email.cc = vec![
            Address::with_name("Zoë", "zoe@example.com").unwrap(),
            Address::with_name("Ops", "ops@example.com").unwrap(),
        ];
        let content = String::from_utf8(MimeEncoder::new().encode(&email).unwrap().bytes).unwrap();

        let expected_from = format!(
            "From: =?UTF-8?B?{}?= <jose@example.com>\r\n",
            BASE64.encode("José Müller")
        );
        assert!(content.contains(&expected_from), "{}", content);
        assert!(content.contains(&format!(
            "Cc: =?UTF-8?B?{}?= <zoe@example.com>, Ops <ops@example.com>\r\n",
            BASE64.encode("Zoë")
        )));
        assert!(content.is_ascii());
    }
}
