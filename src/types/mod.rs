//! Core types for the mailer.
//!
//! This module provides:
//! - Address types with validation
//! - File attachments read from disk
//! - The outgoing message and its builder
//! - Send and connection-check result types

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};

/// Email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Display name (e.g., "John Doe").
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com").
    pub email: String,
}

impl Address {
    /// Creates a new address with just an email.
    pub fn new(email: impl Into<String>) -> SmtpResult<Self> {
        let email = email.into();
        Self::validate_email(&email)?;
        Ok(Self { name: None, email })
    }

    /// Creates a new address with display name and email.
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> SmtpResult<Self> {
        let email = email.into();
        Self::validate_email(&email)?;
        let name = name.into();
        Ok(Self {
            name: if name.is_empty() { None } else { Some(name) },
            email,
        })
    }

    /// Parses an address from a string (e.g., "John Doe <john@example.com>").
    pub fn parse(s: &str) -> SmtpResult<Self> {
        let s = s.trim();

        if let (Some(start), Some(end)) = (s.find('<'), s.rfind('>')) {
            if start < end {
                let name = s[..start].trim().trim_matches('"');
                let email = s[start + 1..end].trim();
                return Self::with_name(name, email);
            }
        }

        Self::new(s)
    }

    /// Parses a comma separated address list.
    ///
    /// Commas inside quotes or angle brackets do not split, and a piece
    /// without an `@` is joined to the one after it, so both
    /// `"Doe, Jane" <jane@example.com>` and `Doe, Jane <jane@example.com>`
    /// yield one address.
    pub fn parse_list(s: &str) -> SmtpResult<Vec<Self>> {
        let mut pieces = Vec::new();
        let mut current = String::new();
        let mut quoted = false;
        let mut angle = false;

        for c in s.chars() {
            match c {
                '"' => quoted = !quoted,
                '<' if !quoted => angle = true,
                '>' if !quoted => angle = false,
                ',' if !quoted && !angle => {
                    pieces.push(std::mem::take(&mut current));
                    continue;
                }
                _ => {}
            }
            current.push(c);
        }
        pieces.push(current);

        let mut addresses = Vec::new();
        let mut pending = String::new();
        for piece in pieces {
            if !pending.is_empty() {
                pending.push(',');
            }
            pending.push_str(&piece);
            if piece.contains('@') {
                addresses.push(Self::parse(&pending)?);
                pending.clear();
            }
        }

        if !pending.trim().is_empty() {
            addresses.push(Self::parse(&pending)?);
        }

        Ok(addresses)
    }

    /// Validates an email address according to RFC 5321/5322 length and shape rules.
    fn validate_email(email: &str) -> SmtpResult<()> {
        let invalid = |message: &str| {
            Err(SmtpError::message_error(
                SmtpErrorKind::InvalidRecipientAddress,
                format!("{}: {:?}", message, email),
            ))
        };

        if email.is_empty() {
            return invalid("Email address cannot be empty");
        }

        if email.len() > 254 {
            return invalid("Email address too long (max 254 characters)");
        }

        if email.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return invalid("Email address cannot contain whitespace or control characters");
        }

        let Some((local, domain)) = email.split_once('@') else {
            return invalid("Email address must contain exactly one @");
        };

        if domain.contains('@') {
            return invalid("Email address must contain exactly one @");
        }

        if local.is_empty() || local.len() > 64 {
            return invalid("Local part must be 1-64 characters");
        }

        if domain.is_empty() {
            return invalid("Domain cannot be empty");
        }

        Ok(())
    }

    /// Returns the email part only.
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Returns the display name if present.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the domain part of the address.
    pub fn domain(&self) -> &str {
        self.email
            .split_once('@')
            .map(|(_, domain)| domain)
            .unwrap_or_default()
    }

    /// Formats the address for SMTP MAIL FROM/RCPT TO commands.
    pub fn to_smtp(&self) -> String {
        format!("<{}>", self.email)
    }

    /// Formats the address for email headers.
    pub fn to_header(&self) -> String {
        match &self.name {
            Some(name) => {
                if name.contains(|c: char| !c.is_alphanumeric() && c != ' ') {
                    let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
                    format!("\"{}\" <{}>", escaped, self.email)
                } else {
                    format!("{} <{}>", name, self.email)
                }
            }
            None => self.email.clone(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_header())
    }
}

/// Values the message builder accepts as addresses.
pub trait IntoAddress {
    /// Converts into a validated address.
    fn into_address(self) -> SmtpResult<Address>;
}

impl IntoAddress for Address {
    fn into_address(self) -> SmtpResult<Address> {
        Ok(self)
    }
}

impl IntoAddress for &Address {
    fn into_address(self) -> SmtpResult<Address> {
        Ok(self.clone())
    }
}

impl IntoAddress for &str {
    fn into_address(self) -> SmtpResult<Address> {
        Address::parse(self)
    }
}

impl IntoAddress for String {
    fn into_address(self) -> SmtpResult<Address> {
        Address::parse(&self)
    }
}

impl IntoAddress for &String {
    fn into_address(self) -> SmtpResult<Address> {
        Address::parse(self)
    }
}

/// How the content type of a file attachment is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentTypePolicy {
    /// Always `application/octet-stream`.
    #[default]
    Binary,
    /// Guessed from the file extension, falling back to `application/octet-stream`.
    Guess,
}

/// File attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Filename shown to the recipient.
    pub filename: String,
    /// MIME content type.
    pub content_type: String,
    /// Binary content.
    pub data: Vec<u8>,
}

impl Attachment {
    /// Creates a new attachment.
    pub fn new(filename: impl Into<String>, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            data,
        }
    }

    /// Creates an attachment with the generic binary content type.
    pub fn binary(filename: impl Into<String>, data: Vec<u8>) -> Self {
        Self::new(filename, mime::APPLICATION_OCTET_STREAM.essence_str(), data)
    }

    /// Creates an attachment with a content type guessed from the filename.
    pub fn guessed(filename: impl Into<String>, data: Vec<u8>) -> Self {
        let filename = filename.into();
        let content_type = mime_guess::from_path(&filename)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Self::new(filename, content_type, data)
    }

    /// Reads a file from disk in binary mode.
    ///
    /// The attachment is named after the final component of `path`. A
    /// missing or unreadable file yields an [`SmtpErrorKind::AttachmentError`].
    pub async fn from_path(path: impl AsRef<Path>, policy: ContentTypePolicy) -> SmtpResult<Self> {
        let path = path.as_ref();

        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                SmtpError::message_error(
                    SmtpErrorKind::AttachmentError,
                    format!("Attachment path has no file name: {}", path.display()),
                )
            })?;

        let data = tokio::fs::read(path)
            .await
            .map_err(|e| SmtpError::attachment(path, e))?;

        tracing::debug!(path = %path.display(), bytes = data.len(), "Read attachment");

        Ok(match policy {
            ContentTypePolicy::Binary => Self::binary(filename, data),
            ContentTypePolicy::Guess => Self::guessed(filename, data),
        })
    }

    /// Returns the size of the content in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Complete email message.
#[derive(Debug, Clone)]
pub struct Email {
    /// Sender address.
    pub from: Address,
    /// Primary recipients.
    pub to: Vec<Address>,
    /// CC recipients.
    pub cc: Vec<Address>,
    /// BCC recipients.
    pub bcc: Vec<Address>,
    /// Reply-to address.
    pub reply_to: Option<Address>,
    /// Email subject.
    pub subject: String,
    /// Plain text body.
    pub text: String,
    /// File attachments, in the order they are sent.
    pub attachments: Vec<Attachment>,
    /// Additional headers.
    pub headers: BTreeMap<String, String>,
    /// Message ID (generated if not set).
    pub message_id: Option<String>,
}

impl Email {
    /// Creates a new email builder.
    pub fn builder() -> EmailBuilder {
        EmailBuilder::default()
    }

    /// Returns all recipients (to + cc + bcc).
    pub fn all_recipients(&self) -> impl Iterator<Item = &Address> {
        self.to.iter().chain(self.cc.iter()).chain(self.bcc.iter())
    }

    /// Returns the count of all recipients.
    pub fn recipient_count(&self) -> usize {
        self.to.len() + self.cc.len() + self.bcc.len()
    }

    /// Returns true if the email has any attachments.
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Returns the total size of all attachments in bytes.
    pub fn attachment_bytes(&self) -> usize {
        self.attachments.iter().map(Attachment::size).sum()
    }
}

/// Builder for Email messages.
#[derive(Debug, Default)]
pub struct EmailBuilder {
    from: Option<Address>,
    to: Vec<Address>,
    cc: Vec<Address>,
    bcc: Vec<Address>,
    reply_to: Option<Address>,
    subject: String,
    text: Option<String>,
    attachments: Vec<Attachment>,
    headers: BTreeMap<String, String>,
    message_id: Option<String>,
}

impl EmailBuilder {
    /// Sets the sender address.
    pub fn from(mut self, address: impl IntoAddress) -> SmtpResult<Self> {
        let address = address.into_address().map_err(|e| {
            SmtpError::message_error(SmtpErrorKind::InvalidFromAddress, e.message().to_string())
        })?;
        self.from = Some(address);
        Ok(self)
    }

    /// Adds a primary recipient.
    pub fn to(mut self, address: impl IntoAddress) -> SmtpResult<Self> {
        self.to.push(address.into_address()?);
        Ok(self)
    }

    /// Adds multiple primary recipients.
    pub fn to_many<I, A>(mut self, addresses: I) -> SmtpResult<Self>
    where
        I: IntoIterator<Item = A>,
        A: IntoAddress,
    {
        for addr in addresses {
            self.to.push(addr.into_address()?);
        }
        Ok(self)
    }

    /// Adds a CC recipient.
    pub fn cc(mut self, address: impl IntoAddress) -> SmtpResult<Self> {
        self.cc.push(address.into_address()?);
        Ok(self)
    }

    /// Adds a BCC recipient.
    pub fn bcc(mut self, address: impl IntoAddress) -> SmtpResult<Self> {
        self.bcc.push(address.into_address()?);
        Ok(self)
    }

    /// Sets the reply-to address.
    pub fn reply_to(mut self, address: impl IntoAddress) -> SmtpResult<Self> {
        self.reply_to = Some(address.into_address()?);
        Ok(self)
    }

    /// Sets the subject.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Sets the plain text body.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Adds an attachment.
    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Adds several attachments, preserving their order.
    pub fn attachments(mut self, attachments: impl IntoIterator<Item = Attachment>) -> Self {
        self.attachments.extend(attachments);
        self
    }

    /// Adds a custom header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the message ID (without angle brackets).
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Builds the email.
    pub fn build(self) -> SmtpResult<Email> {
        let from = self.from.ok_or_else(|| {
            SmtpError::message_error(SmtpErrorKind::InvalidFromAddress, "From address is required")
        })?;

        if self.to.is_empty() && self.cc.is_empty() && self.bcc.is_empty() {
            return Err(SmtpError::message_error(
                SmtpErrorKind::InvalidRecipientAddress,
                "At least one recipient is required",
            ));
        }

        let text = self.text.ok_or_else(|| {
            SmtpError::message_error(SmtpErrorKind::EncodingFailed, "Email body is required")
        })?;

        Ok(Email {
            from,
            to: self.to,
            cc: self.cc,
            bcc: self.bcc,
            reply_to: self.reply_to,
            subject: self.subject,
            text,
            attachments: self.attachments,
            headers: self.headers,
            message_id: self.message_id,
        })
    }
}

/// Result of sending a message.
#[derive(Debug, Clone, Serialize)]
pub struct SendResult {
    /// Client-generated message ID.
    pub message_id: String,
    /// Recipients accepted by the server.
    pub accepted: Vec<Address>,
    /// Recipients rejected by the server.
    pub rejected: Vec<RejectedRecipient>,
    /// Final server response to the message data.
    pub response: String,
    /// Wall-clock duration of the send.
    #[serde(serialize_with = "crate::config::humantime_serde::serialize")]
    pub duration: Duration,
}

impl SendResult {
    /// Returns true if all recipients were accepted.
    pub fn is_complete_success(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// A recipient that was rejected by the server.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedRecipient {
    /// The rejected address.
    pub address: Address,
    /// SMTP status code.
    pub code: u16,
    /// Error message from server.
    pub message: String,
}

/// Information about a verified SMTP connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// TLS status.
    pub tls_enabled: bool,
    /// Server capabilities advertised after the final EHLO.
    pub capabilities: Vec<String>,
    /// Server EHLO banner.
    pub banner: String,
    /// Authenticated user.
    pub authenticated_user: Option<String>,
}
