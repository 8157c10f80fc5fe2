//! Error types for the mailer.
//!
//! A run either delivers the message or stops at the first failure. Each
//! error records the [`Stage`] it happened in, the server reply code when
//! there was one, and the underlying cause.

use std::fmt;
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::protocol::codes;

/// Result type for mailer operations.
pub type SmtpResult<T> = Result<T, SmtpError>;

/// Part of a run an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Configuration, message assembly or attachment reading; no network I/O yet.
    Setup,
    /// Name resolution, TCP connect and socket I/O.
    Connect,
    /// STARTTLS or implicit TLS negotiation.
    Tls,
    /// SMTP AUTH exchange.
    Auth,
    /// Envelope, DATA and reply handling.
    Submit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Setup => "setup",
            Stage::Connect => "connect",
            Stage::Tls => "tls",
            Stage::Auth => "auth",
            Stage::Submit => "submit",
        })
    }
}

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmtpErrorKind {
    /// Host name did not resolve.
    DnsResolution,
    /// Server actively refused the TCP connection.
    ConnectionRefused,
    /// Server closed or reset the connection mid-session.
    ConnectionReset,
    /// Any other socket failure.
    ConnectionFailed,
    /// No connection within the connect timeout.
    ConnectTimeout,
    /// No reply within the command timeout.
    ReadTimeout,
    /// Socket write stalled past the command timeout.
    WriteTimeout,

    /// TLS negotiation failed.
    TlsHandshakeFailed,
    /// CA bundle unreadable or server certificate rejected.
    CertificateInvalid,
    /// STARTTLS required but not offered or refused.
    StarttlsNotSupported,

    /// Server rejected the credentials.
    CredentialsInvalid,
    /// No usable AUTH mechanism on this connection.
    AuthMethodNotSupported,
    /// Server demands AUTH but none was configured.
    AuthenticationRequired,

    /// Reply could not be parsed.
    InvalidResponse,
    /// Reply code the session did not expect.
    UnexpectedResponse,
    /// Server is closing the channel (421).
    ServerShutdown,
    /// Sender address malformed or refused.
    InvalidFromAddress,
    /// Recipient address malformed or refused.
    InvalidRecipientAddress,
    /// Message larger than the local or server limit.
    MessageTooLarge,

    /// Header name or value cannot be written.
    InvalidHeader,
    /// Message body missing or not encodable.
    EncodingFailed,
    /// Attachment or body file could not be read.
    AttachmentError,
    /// Settings missing, malformed or contradictory.
    ConfigurationInvalid,

    /// Anything not covered above.
    Unknown,
}

impl SmtpErrorKind {
    /// Returns the stage this kind of failure happens in.
    pub fn stage(&self) -> Stage {
        use SmtpErrorKind::*;

        match self {
            DnsResolution | ConnectionRefused | ConnectionReset | ConnectionFailed
            | ConnectTimeout | ReadTimeout | WriteTimeout => Stage::Connect,
            TlsHandshakeFailed | CertificateInvalid | StarttlsNotSupported => Stage::Tls,
            CredentialsInvalid | AuthMethodNotSupported | AuthenticationRequired => Stage::Auth,
            InvalidHeader | EncodingFailed | AttachmentError | ConfigurationInvalid => Stage::Setup,
            InvalidResponse | UnexpectedResponse | ServerShutdown | InvalidFromAddress
            | InvalidRecipientAddress | MessageTooLarge | Unknown => Stage::Submit,
        }
    }

    fn describe(&self) -> &'static str {
        use SmtpErrorKind::*;

        match self {
            DnsResolution => "host not found",
            ConnectionRefused => "connection refused",
            ConnectionReset => "connection dropped",
            ConnectionFailed => "connection failed",
            ConnectTimeout => "timed out connecting",
            ReadTimeout => "timed out waiting for reply",
            WriteTimeout => "timed out sending",
            TlsHandshakeFailed => "handshake failed",
            CertificateInvalid => "certificate rejected",
            StarttlsNotSupported => "STARTTLS unavailable",
            CredentialsInvalid => "credentials rejected",
            AuthMethodNotSupported => "no usable mechanism",
            AuthenticationRequired => "login required",
            InvalidResponse => "malformed reply",
            UnexpectedResponse => "unexpected reply",
            ServerShutdown => "server closing",
            InvalidFromAddress => "sender rejected",
            InvalidRecipientAddress => "recipient rejected",
            MessageTooLarge => "message too large",
            InvalidHeader => "bad header",
            EncodingFailed => "cannot encode message",
            AttachmentError => "cannot read file",
            ConfigurationInvalid => "bad configuration",
            Unknown => "failed",
        }
    }
}

impl fmt::Display for SmtpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage(), self.describe())
    }
}

/// Enhanced mail system status code (RFC 3463), e.g. `5.1.1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedStatusCode {
    /// 2, 4 or 5.
    pub class: u8,
    /// Area the status refers to (1 addressing, 2 mailbox, 7 security, ...).
    pub subject: u16,
    /// Detail within the subject.
    pub detail: u16,
}

impl EnhancedStatusCode {
    /// Builds a code from its three components.
    pub fn new(class: u8, subject: u16, detail: u16) -> Self {
        Self { class, subject, detail }
    }

    /// Parses `class.subject.detail`; anything else yields `None`.
    pub fn parse(s: &str) -> Option<Self> {
        let mut fields = s.splitn(4, '.');
        let code = Self::new(
            fields.next()?.parse().ok()?,
            fields.next()?.parse().ok()?,
            fields.next()?.parse().ok()?,
        );
        match (fields.next(), code.class) {
            (None, 2 | 4 | 5) => Some(code),
            _ => None,
        }
    }

    /// 4.x.x: the server may accept a later attempt.
    pub fn is_transient(&self) -> bool {
        self.class == 4
    }

    /// 5.x.x: the server will not accept this as sent.
    pub fn is_permanent(&self) -> bool {
        self.class == 5
    }
}

impl fmt::Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// Mailer error.
#[derive(Error, Debug)]
pub struct SmtpError {
    kind: SmtpErrorKind,
    /// Overrides the stage implied by `kind`.
    stage: Option<Stage>,
    message: String,
    smtp_code: Option<u16>,
    enhanced_code: Option<EnhancedStatusCode>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SmtpError {
    /// Creates an error of the given kind.
    pub fn new(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage: None,
            message: message.into(),
            smtp_code: None,
            enhanced_code: None,
            cause: None,
        }
    }

    /// Attaches the server's reply code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Attaches the server's enhanced status code.
    pub fn with_enhanced_code(mut self, code: EnhancedStatusCode) -> Self {
        self.enhanced_code = Some(code);
        self
    }

    /// Records that the error happened in `stage`, whatever its kind.
    pub fn in_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Attaches the lower-level error that caused this one.
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> SmtpErrorKind {
        self.kind
    }

    /// Returns the stage the error happened in.
    pub fn stage(&self) -> Stage {
        self.stage.unwrap_or_else(|| self.kind.stage())
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the server reply code, if any.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Returns the enhanced status code, if any.
    pub fn enhanced_code(&self) -> Option<&EnhancedStatusCode> {
        self.enhanced_code.as_ref()
    }

    /// Socket-level failure without a more specific kind.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConnectionFailed, message)
    }

    /// TLS negotiation failure.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::TlsHandshakeFailed, message)
    }

    /// Authentication failure.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::CredentialsInvalid, message)
    }

    /// Reply that does not follow RFC 5321 syntax.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::InvalidResponse, message)
    }

    /// Message construction or envelope failure of the given kind.
    pub fn message_error(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Invalid configuration.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConfigurationInvalid, message)
    }

    /// A file named on the command line could not be read.
    pub fn attachment(path: &Path, cause: io::Error) -> Self {
        Self::new(SmtpErrorKind::AttachmentError, path.display().to_string()).with_cause(cause)
    }

    /// Classifies a negative server reply.
    pub fn from_smtp_response(code: u16, message: impl Into<String>) -> Self {
        use SmtpErrorKind::*;

        let kind = match code {
            codes::SERVICE_UNAVAILABLE => ServerShutdown,
            500..=504 => InvalidResponse,
            codes::AUTH_REQUIRED => AuthenticationRequired,
            534 | codes::AUTH_FAILED => CredentialsInvalid,
            550 | 551 => InvalidRecipientAddress,
            codes::MESSAGE_TOO_BIG => MessageTooLarge,
            553 => InvalidFromAddress,
            400..=599 => UnexpectedResponse,
            _ => Unknown,
        };
        Self::new(kind, message).with_smtp_code(code)
    }
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.stage(), self.kind.describe(), self.message)?;
        match (self.smtp_code, &self.enhanced_code) {
            (Some(code), Some(enhanced)) => write!(f, " ({} {})", code, enhanced),
            (Some(code), None) => write!(f, " ({})", code),
            (None, Some(enhanced)) => write!(f, " ({})", enhanced),
            (None, None) => Ok(()),
        }
    }
}
