//! SMTP protocol implementation.
//!
//! Implements RFC 5321 SMTP commands and responses,
//! including the ESMTP extensions a submission client needs.

use std::collections::HashSet;
use std::fmt;

use crate::auth::AuthMethod;
use crate::errors::{EnhancedStatusCode, SmtpError, SmtpResult};

/// Placeholder printed instead of authentication payloads.
const REDACTED: &str = "<redacted>";

/// SMTP commands.
#[derive(Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Basic HELLO.
    Helo(String),
    /// Start TLS negotiation.
    StartTls,
    /// Authenticate.
    Auth {
        /// Authentication mechanism.
        mechanism: String,
        /// Initial response (optional).
        initial_response: Option<String>,
    },
    /// Client line in an authentication exchange (after a 334 challenge).
    AuthResponse(String),
    /// MAIL FROM command.
    MailFrom {
        /// Sender address, including angle brackets.
        address: String,
        /// SIZE parameter (optional).
        size: Option<usize>,
        /// 8BITMIME parameter.
        body_8bit: bool,
    },
    /// RCPT TO command.
    RcptTo {
        /// Recipient address, including angle brackets.
        address: String,
    },
    /// DATA command.
    Data,
    /// Reset transaction.
    Rset,
    /// No operation (keepalive).
    Noop,
    /// Quit connection.
    Quit,
}

impl SmtpCommand {
    /// Formats the command for sending.
    pub fn to_smtp_string(&self) -> String {
        match self {
            SmtpCommand::Ehlo(domain) => format!("EHLO {}", domain),
            SmtpCommand::Helo(domain) => format!("HELO {}", domain),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::Auth {
                mechanism,
                initial_response,
            } => {
                if let Some(response) = initial_response {
                    format!("AUTH {} {}", mechanism, response)
                } else {
                    format!("AUTH {}", mechanism)
                }
            }
            SmtpCommand::AuthResponse(line) => line.clone(),
            SmtpCommand::MailFrom {
                address,
                size,
                body_8bit,
            } => {
                let mut cmd = format!("MAIL FROM:{}", address);
                if let Some(s) = size {
                    cmd.push_str(&format!(" SIZE={}", s));
                }
                if *body_8bit {
                    cmd.push_str(" BODY=8BITMIME");
                }
                cmd
            }
            SmtpCommand::RcptTo { address } => format!("RCPT TO:{}", address),
            SmtpCommand::Data => "DATA".to_string(),
            SmtpCommand::Rset => "RSET".to_string(),
            SmtpCommand::Noop => "NOOP".to_string(),
            SmtpCommand::Quit => "QUIT".to_string(),
        }
    }

    /// Returns true if the command carries credential material.
    pub fn is_sensitive(&self) -> bool {
        matches!(
            self,
            SmtpCommand::Auth { initial_response: Some(_), .. } | SmtpCommand::AuthResponse(_)
        )
    }
}

/// Printable form, safe for logs: authentication payloads are redacted.
impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpCommand::Auth {
                mechanism,
                initial_response: Some(_),
            } => write!(f, "AUTH {} {}", mechanism, REDACTED),
            SmtpCommand::AuthResponse(_) => f.write_str(REDACTED),
            other => f.write_str(&other.to_smtp_string()),
        }
    }
}

impl fmt::Debug for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SmtpCommand({})", self)
    }
}

/// SMTP response from server.
#[derive(Debug, Clone)]
pub struct SmtpResponse {
    /// Status code (e.g., 250, 354, 550).
    pub code: u16,
    /// Enhanced status code (optional).
    pub enhanced_code: Option<EnhancedStatusCode>,
    /// Response message lines.
    pub message: Vec<String>,
    /// Whether this is a multiline response.
    pub is_multiline: bool,
}

impl SmtpResponse {
    /// Creates a new response.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced_code: None,
            message: vec![message.into()],
            is_multiline: false,
        }
    }

    /// Parses a response from raw lines (line terminators already stripped).
    pub fn parse(lines: &[String]) -> SmtpResult<Self> {
        if lines.is_empty() {
            return Err(SmtpError::protocol("Empty response"));
        }

        let mut messages = Vec::with_capacity(lines.len());
        let mut code = 0u16;
        let mut enhanced_code = None;

        for (i, line) in lines.iter().enumerate() {
            let parsed_code: u16 = line
                .get(..3)
                .filter(|c| c.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| SmtpError::protocol(format!("Invalid status code: {:?}", line)))?;

            match line.as_bytes().get(3) {
                None | Some(b' ') | Some(b'-') => {}
                Some(_) => {
                    return Err(SmtpError::protocol(format!("Malformed response line: {:?}", line)));
                }
            }

            if i == 0 {
                code = parsed_code;
            } else if parsed_code != code {
                return Err(SmtpError::protocol("Inconsistent status codes in multiline response"));
            }

            let text = line.get(4..).unwrap_or("");
            let message = if i == 0 {
                match Self::parse_enhanced_code(text) {
                    Some((esc, rest)) => {
                        enhanced_code = Some(esc);
                        rest.trim().to_string()
                    }
                    None => text.to_string(),
                }
            } else {
                text.to_string()
            };

            messages.push(message);
        }

        Ok(Self {
            code,
            enhanced_code,
            message: messages,
            is_multiline: lines.len() > 1,
        })
    }

    /// Parses enhanced status code from message start.
    fn parse_enhanced_code(msg: &str) -> Option<(EnhancedStatusCode, &str)> {
        // Format: X.Y.Z rest
        let (code, rest) = msg.split_once(' ').unwrap_or((msg, ""));
        let code = EnhancedStatusCode::parse(code)?;
        Some((code, rest))
    }

    /// Returns true if this is a success response (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns true if this is a permanent failure (5xx).
    pub fn is_permanent_failure(&self) -> bool {
        (500..600).contains(&self.code)
    }

    /// Returns the first message line.
    pub fn first_message(&self) -> &str {
        self.message.first().map(|s| s.as_str()).unwrap_or("")
    }

    /// Returns all message lines joined.
    pub fn full_message(&self) -> String {
        self.message.join("\n")
    }

    /// Converts to an error if not successful.
    pub fn to_error(&self) -> SmtpError {
        let mut err = SmtpError::from_smtp_response(self.code, self.full_message());
        if let Some(enhanced) = &self.enhanced_code {
            err = err.with_enhanced_code(enhanced.clone());
        }
        err
    }

    /// Returns `self` when the code matches, otherwise the mapped error.
    pub fn expect_code(self, expected: u16) -> SmtpResult<Self> {
        if self.code == expected {
            Ok(self)
        } else {
            Err(self.to_error())
        }
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.first_message())
    }
}

/// ESMTP server capabilities.
#[derive(Debug, Clone, Default)]
pub struct EsmtpCapabilities {
    /// Advertised SIZE value. `Some(0)` when SIZE is offered without a limit.
    pub size: Option<usize>,
    /// Supported authentication mechanisms.
    pub auth_mechanisms: HashSet<AuthMethod>,
    /// STARTTLS supported.
    pub starttls: bool,
    /// 8BITMIME supported.
    pub eight_bit_mime: bool,
    /// Enhanced status codes supported.
    pub enhanced_status_codes: bool,
    /// Raw capability strings, excluding the greeting line.
    pub raw: Vec<String>,
}

impl EsmtpCapabilities {
    /// Parses capabilities from EHLO response.
    ///
    /// The first line carries the server's identity and is skipped.
    pub fn from_ehlo_response(response: &SmtpResponse) -> Self {
        let mut caps = Self::default();

        for line in response.message.iter().skip(1) {
            let line = line.trim().to_uppercase();
            if line.is_empty() {
                continue;
            }
            caps.raw.push(line.clone());

            let (capability, params) = line.split_once([' ', '=']).unwrap_or((line.as_str(), ""));

            match capability {
                "SIZE" => {
                    caps.size = Some(params.trim().parse().unwrap_or(0));
                }
                "AUTH" => {
                    for mech in params.split_whitespace() {
                        if let Some(method) = AuthMethod::from_capability(mech) {
                            caps.auth_mechanisms.insert(method);
                        }
                    }
                }
                "STARTTLS" => caps.starttls = true,
                "8BITMIME" => caps.eight_bit_mime = true,
                "ENHANCEDSTATUSCODES" => caps.enhanced_status_codes = true,
                _ => {}
            }
        }

        caps
    }

    /// Returns the advertised size limit, if the server enforces one.
    pub fn size_limit(&self) -> Option<usize> {
        self.size.filter(|s| *s > 0)
    }
}

/// SMTP transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Initial state, nothing received yet.
    Initial,
    /// Connected, received server greeting.
    Connected,
    /// EHLO/HELO accepted, ready for TLS or AUTH.
    Greeted,
    /// TLS established.
    TlsEstablished,
    /// Authenticated.
    Authenticated,
    /// In mail transaction (after MAIL FROM).
    InTransaction,
    /// Recipients added (after RCPT TO).
    RecipientsAdded,
    /// Sending data (after DATA).
    SendingData,
    /// Transaction complete.
    Complete,
    /// Connection closed.
    Closed,
}

impl TransactionState {
    /// Returns true if authentication is allowed in this state.
    pub fn can_authenticate(&self) -> bool {
        matches!(self, TransactionState::Greeted | TransactionState::TlsEstablished)
    }

    /// Returns true if MAIL FROM is allowed in this state.
    pub fn can_start_mail(&self) -> bool {
        matches!(
            self,
            TransactionState::Greeted
                | TransactionState::TlsEstablished
                | TransactionState::Authenticated
                | TransactionState::Complete
        )
    }

    /// Returns true if RCPT TO is allowed in this state.
    pub fn can_add_recipient(&self) -> bool {
        matches!(
            self,
            TransactionState::InTransaction | TransactionState::RecipientsAdded
        )
    }

    /// Returns true if DATA is allowed in this state.
    pub fn can_send_data(&self) -> bool {
        matches!(self, TransactionState::RecipientsAdded)
    }

    /// Returns the state reached after a response to `command` with the given code.
    ///
    /// Unsuccessful replies leave the state unchanged.
    pub fn after(self, command: &SmtpCommand, code: u16) -> Self {
        use TransactionState::*;

        match (command, code) {
            (SmtpCommand::Ehlo(_) | SmtpCommand::Helo(_), codes::OK) => {
                if self == TlsEstablished { TlsEstablished } else { Greeted }
            }
            (SmtpCommand::StartTls, codes::SERVICE_READY) => TlsEstablished,
            (SmtpCommand::Auth { .. } | SmtpCommand::AuthResponse(_), codes::AUTH_SUCCESS) => {
                Authenticated
            }
            (SmtpCommand::MailFrom { .. }, codes::OK) => InTransaction,
            (SmtpCommand::RcptTo { .. }, codes::OK | codes::WILL_FORWARD) => RecipientsAdded,
            (SmtpCommand::Data, codes::START_MAIL_INPUT) => SendingData,
            (SmtpCommand::Rset, codes::OK) => match self {
                InTransaction | RecipientsAdded => Complete,
                other => other,
            },
            (SmtpCommand::Quit, _) => Closed,
            _ => self,
        }
    }
}

/// Response codes for common SMTP operations.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Authentication successful.
    pub const AUTH_SUCCESS: u16 = 235;
    /// OK.
    pub const OK: u16 = 250;
    /// User not local; will forward.
    pub const WILL_FORWARD: u16 = 251;
    /// Continue (AUTH).
    pub const AUTH_CONTINUE: u16 = 334;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
    /// Service unavailable.
    pub const SERVICE_UNAVAILABLE: u16 = 421;
    /// Authentication required.
    pub const AUTH_REQUIRED: u16 = 530;
    /// Authentication failed.
    pub const AUTH_FAILED: u16 = 535;
    /// Message too big.
    pub const MESSAGE_TOO_BIG: u16 = 552;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SmtpErrorKind;

    #[test]
    fn test_command_formatting() {
        assert_eq!(
            SmtpCommand::Ehlo("localhost".to_string()).to_smtp_string(),
            "EHLO localhost"
        );
        assert_eq!(SmtpCommand::StartTls.to_smtp_string(), "STARTTLS");
        assert_eq!(
            SmtpCommand::MailFrom {
                address: "<bench@example.com>".to_string(),
                size: Some(48213),
                body_8bit: true,
            }
            .to_smtp_string(),
            "MAIL FROM:<bench@example.com> SIZE=48213 BODY=8BITMIME"
        );
        assert_eq!(
            SmtpCommand::RcptTo { address: "<r@example.com>".to_string() }.to_smtp_string(),
            "RCPT TO:<r@example.com>"
        );
    }

    #[test]
    fn test_auth_commands_are_redacted() {
        let auth = SmtpCommand::Auth {
            mechanism: "PLAIN".to_string(),
            initial_response: Some("AHVzZXIAc2VjcmV0".to_string()),
        };
        assert_eq!(auth.to_smtp_string(), "AUTH PLAIN AHVzZXIAc2VjcmV0");
        assert_eq!(auth.to_string(), "AUTH PLAIN <redacted>");
        assert!(!format!("{:?}", auth).contains("AHVzZXIAc2VjcmV0"));
        assert!(auth.is_sensitive());

        let line = SmtpCommand::AuthResponse("c2VjcmV0".to_string());
        assert_eq!(line.to_string(), "<redacted>");

        let bare = SmtpCommand::Auth { mechanism: "LOGIN".to_string(), initial_response: None };
        assert_eq!(bare.to_string(), "AUTH LOGIN");
        assert!(!bare.is_sensitive());
    }

    #[test]
    fn test_response_parse() {
        let response = SmtpResponse::parse(&["235 2.7.0 Accepted".to_string()]).unwrap();
        assert_eq!(response.code, 235);
        assert!(response.is_success());
        assert!(!response.is_multiline);
        assert_eq!(response.first_message(), "Accepted");
        assert_eq!(response.enhanced_code, Some(EnhancedStatusCode::new(2, 7, 0)));

        let lines: Vec<String> = [
            "250-smtp.gmail.com at your service, [203.0.113.7]",
            "250-SIZE 35882577",
            "250-8BITMIME",
            "250 STARTTLS",
        ]
        .iter()
        .map(|l| l.to_string())
        .collect();
        let response = SmtpResponse::parse(&lines).unwrap();
        assert!(response.is_multiline);
        assert_eq!(response.message[3], "STARTTLS");
        assert_eq!(response.to_string(), "250 smtp.gmail.com at your service, [203.0.113.7]");

        let response = SmtpResponse::parse(&["334 ".to_string()]).unwrap();
        assert_eq!(response.code, codes::AUTH_CONTINUE);
        assert_eq!(response.first_message(), "");
    }

    #[test]
    fn test_response_parse_rejects_garbage() {
        for line in ["", "2", "abc OK", "25O OK", "250xOK", "2é0 OK"] {
            assert!(SmtpResponse::parse(&[line.to_string()]).is_err(), "{:?}", line);
        }

        let mixed = vec!["250-first".to_string(), "220 second".to_string()];
        assert!(SmtpResponse::parse(&mixed).is_err());
    }

    #[test]
    fn test_rejection_keeps_enhanced_code() {
        let lines = vec!["550 5.1.1 The email account that you tried to reach does not exist".to_string()];
        let response = SmtpResponse::parse(&lines).unwrap();
        assert!(response.is_permanent_failure());
        assert!(response.first_message().starts_with("The email account"));

        let err = response.to_error();
        assert_eq!(err.kind(), SmtpErrorKind::InvalidRecipientAddress);
        assert_eq!(err.smtp_code(), Some(550));
        assert_eq!(err.enhanced_code(), Some(&EnhancedStatusCode::new(5, 1, 1)));

        let busy = SmtpResponse::parse(&["421 4.7.0 Try again later".to_string()]).unwrap();
        assert!(!busy.is_success() && !busy.is_permanent_failure());
        assert_eq!(busy.to_error().kind(), SmtpErrorKind::ServerShutdown);
    }

    #[test]
    fn test_expect_code() {
        assert!(SmtpResponse::new(235, "ok").expect_code(235).is_ok());
        let err = SmtpResponse::new(535, "bad").expect_code(235).unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::CredentialsInvalid);
    }

    #[test]
    fn test_capabilities_parse() {
        let response = SmtpResponse {
            code: 250,
            enhanced_code: None,
            message: vec![
                "mail.example.net ESMTP".to_string(),
                "SIZE 52428800".to_string(),
                "AUTH PLAIN LOGIN CRAM-MD5 XOAUTH2".to_string(),
                "STARTTLS".to_string(),
                "8BITMIME".to_string(),
                "PIPELINING".to_string(),
                "ENHANCEDSTATUSCODES".to_string(),
            ],
            is_multiline: true,
        };

        let caps = EsmtpCapabilities::from_ehlo_response(&response);
        assert_eq!(caps.size_limit(), Some(52428800));
        assert_eq!(caps.auth_mechanisms.len(), 3);
        for method in [AuthMethod::Plain, AuthMethod::Login, AuthMethod::CramMd5] {
            assert!(caps.auth_mechanisms.contains(&method));
        }
        assert!(caps.starttls);
        assert!(caps.eight_bit_mime);
        assert!(caps.enhanced_status_codes);
        assert_eq!(caps.raw.len(), 6);
    }

    #[test]
    fn test_legacy_auth_equals_syntax() {
        let response = SmtpResponse {
            code: 250,
            enhanced_code: None,
            message: vec!["mx".to_string(), "AUTH=LOGIN".to_string(), "SIZE 0".to_string()],
            is_multiline: true,
        };
        let caps = EsmtpCapabilities::from_ehlo_response(&response);
        assert!(caps.auth_mechanisms.contains(&AuthMethod::Login));
        assert_eq!(caps.size, Some(0));
        assert_eq!(caps.size_limit(), None);
    }

    #[test]
    fn test_bare_size_keyword() {
        let response = SmtpResponse {
            code: 250,
            enhanced_code: None,
            message: vec!["mx".to_string(), "SIZE".to_string(), "8BITMIME".to_string()],
            is_multiline: true,
        };
        let caps = EsmtpCapabilities::from_ehlo_response(&response);
        assert_eq!(caps.size, Some(0));
        assert_eq!(caps.size_limit(), None);

        let without = EsmtpCapabilities::from_ehlo_response(&SmtpResponse::new(250, "mx"));
        assert_eq!(without.size, None);
    }

    #[test]
    fn test_state_guards() {
        use TransactionState::*;

        assert!(TlsEstablished.can_authenticate());
        assert!(!Authenticated.can_authenticate());
        assert!(!Connected.can_start_mail());
        assert!(Complete.can_start_mail());
        assert!(!Authenticated.can_add_recipient());
        assert!(!InTransaction.can_send_data());
    }

    #[test]
    fn test_state_transitions() {
        use TransactionState::*;

        let ehlo = SmtpCommand::Ehlo("localhost".to_string());
        assert_eq!(Connected.after(&ehlo, 250), Greeted);
        assert_eq!(TlsEstablished.after(&ehlo, 250), TlsEstablished);
        assert_eq!(Greeted.after(&SmtpCommand::StartTls, 220), TlsEstablished);
        assert_eq!(Greeted.after(&SmtpCommand::StartTls, 454), Greeted);
        assert_eq!(
            Authenticated.after(
                &SmtpCommand::MailFrom { address: "<a@b.c>".into(), size: None, body_8bit: false },
                250
            ),
            InTransaction
        );
        assert_eq!(
            InTransaction.after(&SmtpCommand::RcptTo { address: "<a@b.c>".into() }, 550),
            InTransaction
        );
        assert_eq!(RecipientsAdded.after(&SmtpCommand::Data, 354), SendingData);
        assert_eq!(RecipientsAdded.after(&SmtpCommand::Rset, 250), Complete);
        assert_eq!(Complete.after(&SmtpCommand::Quit, 221), Closed);
    }
}
