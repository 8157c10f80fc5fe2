//! # report-mailer
//!
//! Composes one message, attaches local files and submits it to an SMTP
//! server over an authenticated STARTTLS connection:
//! - RFC 5321 submission with EHLO/HELO, STARTTLS or implicit TLS
//! - PLAIN, LOGIN and CRAM-MD5 authentication
//! - RFC 5322 / MIME message construction with attachments
//! - Configuration from `SMTP_*` environment variables
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use report_mailer::{Attachment, ContentTypePolicy, Email, SmtpClient, SmtpConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Host, port and credentials come from SMTP_HOST, SMTP_USERNAME, SMTP_PASSWORD...
//!     let client = SmtpClient::new(SmtpConfig::from_env()?)?;
//!
//!     let email = Email::builder()
//!         .from("bench@example.com")?
//!         .to("team@example.com")?
//!         .subject("GPU Benchmark Report")
//!         .text("Benchmark Report attached")
//!         .attachment(Attachment::from_path("benchmark_report.txt", ContentTypePolicy::Binary).await?)
//!         .build()?;
//!
//!     let result = client.send(&email).await?;
//!     println!("Message sent with ID: {}", result.message_id);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod types;

// Protocol layer
pub mod protocol;

// Transport layer
pub mod transport;

// Authentication
pub mod auth;

// MIME encoding
pub mod mime;

// Observability
pub mod observability;

// Client
pub mod client;

// Command line
pub mod cli;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use client::SmtpClient;
pub use config::{SmtpConfig, SmtpConfigBuilder, TlsConfig, TlsMode, TlsVersion};
pub use errors::{SmtpError, SmtpErrorKind, SmtpResult, Stage};
pub use types::{
    Address, Attachment, ConnectionInfo, ContentTypePolicy, Email, EmailBuilder, IntoAddress,
    RejectedRecipient, SendResult,
};
pub use auth::{AuthMethod, CredentialProvider, Credentials, StaticCredentialProvider};
pub use protocol::{EsmtpCapabilities, SmtpCommand, SmtpResponse};
pub use transport::{SmtpTransport, TcpTransport};
pub use mime::{EncodedMessage, MimeEncoder};
pub use observability::{init_logging, LogFormat, LogLevel, LoggingConfig};
