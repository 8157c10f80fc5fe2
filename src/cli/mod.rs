//! Command line interface.
//!
//! Flags override the `SMTP_*` environment; the password is only ever read
//! from `SMTP_PASSWORD`.

use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::config::{SmtpConfig, SmtpConfigBuilder, TlsMode};
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::observability::{LogFormat, LogLevel, LoggingConfig};
use crate::types::{Address, Attachment, ContentTypePolicy, Email};

/// Default subject line.
pub const DEFAULT_SUBJECT: &str = "GPU Benchmark Report";

/// Default message body.
pub const DEFAULT_BODY: &str = "Benchmark Report attached";

/// Default attachment.
pub const DEFAULT_ATTACHMENT: &str = "benchmark_report.txt";

/// What a run should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Build and submit the message.
    Send,
    /// Build the message and print it instead of sending.
    DryRun,
    /// Only verify connection, TLS and authentication.
    Check,
}

/// Email one or more files through an SMTP submission server.
#[derive(Debug, Parser)]
#[command(name = "report-mailer", author, version, about, long_about = None)]
pub struct Cli {
    /// Sender address
    #[arg(long, env = "MAIL_FROM", value_name = "ADDR", required_unless_present = "check")]
    pub from: Option<String>,

    /// Recipient address or comma separated list (repeatable)
    #[arg(long, env = "MAIL_TO", value_name = "ADDR", required_unless_present = "check")]
    pub to: Vec<String>,

    /// Carbon copy recipient or list (repeatable)
    #[arg(long, value_name = "ADDR")]
    pub cc: Vec<String>,

    /// Blind carbon copy recipient or list (repeatable)
    #[arg(long, value_name = "ADDR")]
    pub bcc: Vec<String>,

    /// Subject line
    #[arg(long, short, default_value = DEFAULT_SUBJECT)]
    pub subject: String,

    /// Message body
    #[arg(long, short, default_value = DEFAULT_BODY, conflicts_with = "body_file")]
    pub body: String,

    /// Read the message body from a file
    #[arg(long, value_name = "PATH")]
    pub body_file: Option<PathBuf>,

    /// Files to attach, in order
    #[arg(value_name = "ATTACHMENT", default_value = DEFAULT_ATTACHMENT)]
    pub attachments: Vec<PathBuf>,

    /// Send without attachments
    #[arg(long, conflicts_with = "attachments")]
    pub no_attachments: bool,

    /// Guess attachment content types from file extensions
    #[arg(long)]
    pub guess_content_type: bool,

    /// SMTP server host [env: SMTP_HOST]
    #[arg(long, value_name = "HOST")]
    pub host: Option<String>,

    /// SMTP server port [env: SMTP_PORT]
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Login name [env: SMTP_USERNAME]
    #[arg(long, value_name = "USER")]
    pub username: Option<String>,

    /// TLS mode: none, start_tls, start_tls_required or implicit [env: SMTP_TLS_MODE]
    #[arg(long, value_name = "MODE")]
    pub tls: Option<TlsMode>,

    /// Print the encoded message instead of sending it
    #[arg(long, conflicts_with = "check")]
    pub dry_run: bool,

    /// Only check that the server accepts the connection and credentials
    #[arg(long)]
    pub check: bool,

    /// Print results as JSON
    #[arg(long)]
    pub json: bool,

    /// More log output (repeatable)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Less log output (repeatable)
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "verbose")]
    pub quiet: u8,

    /// Log format: pretty, json or compact
    #[arg(long, value_name = "FORMAT", default_value = "pretty")]
    pub log_format: LogFormat,
}

impl Cli {
    /// Returns what this run should do.
    pub fn mode(&self) -> Mode {
        if self.check {
            Mode::Check
        } else if self.dry_run {
            Mode::DryRun
        } else {
            Mode::Send
        }
    }

    /// Returns the logging configuration selected by `-v`, `-q` and `--log-format`.
    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig::new()
            .with_level(LogLevel::Info.adjust(self.verbose, self.quiet))
            .with_format(self.log_format)
    }

    /// Returns the attachment paths, in order.
    pub fn attachment_paths(&self) -> &[PathBuf] {
        if self.no_attachments {
            &[]
        } else {
            &self.attachments
        }
    }

    /// Builds the SMTP configuration from the process environment and flags.
    pub fn smtp_config(&self) -> SmtpResult<SmtpConfig> {
        self.apply_overrides(SmtpConfigBuilder::from_env()?)
    }

    /// Applies command line overrides on top of a configuration builder.
    pub fn apply_overrides(&self, mut builder: SmtpConfigBuilder) -> SmtpResult<SmtpConfig> {
        if let Some(host) = &self.host {
            builder = builder.host(host.clone());
        }
        if let Some(port) = self.port {
            builder = builder.port(port);
        }
        if let Some(username) = &self.username {
            builder = builder.username(username.clone());
        }
        if let Some(mode) = self.tls {
            builder = builder.tls_mode(mode);
        }
        builder.build()
    }

    /// Reads the body and attachments and builds the message.
    ///
    /// Every attachment is read before anything touches the network; the first
    /// missing or unreadable file fails the whole run.
    pub async fn build_email(&self) -> SmtpResult<Email> {
        let from = self.from.as_deref().ok_or_else(|| {
            SmtpError::message_error(SmtpErrorKind::InvalidFromAddress, "A sender address is required")
        })?;

        let text = match &self.body_file {
            Some(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                SmtpError::new(
                    SmtpErrorKind::AttachmentError,
                    format!("Cannot read body file {}", path.display()),
                )
                .with_cause(e)
            })?,
            None => self.body.clone(),
        };

        let policy = if self.guess_content_type {
            ContentTypePolicy::Guess
        } else {
            ContentTypePolicy::Binary
        };

        let mut attachments = Vec::with_capacity(self.attachment_paths().len());
        for path in self.attachment_paths() {
            attachments.push(Attachment::from_path(path, policy).await?);
        }

        let mut builder = Email::builder()
            .from(from)?
            .to_many(Self::address_lists(&self.to)?)?
            .subject(self.subject.clone())
            .text(text)
            .attachments(attachments);

        for cc in Self::address_lists(&self.cc)? {
            builder = builder.cc(cc)?;
        }
        for bcc in Self::address_lists(&self.bcc)? {
            builder = builder.bcc(bcc)?;
        }

        let email = builder.build()?;
        tracing::debug!(
            recipients = email.recipient_count(),
            attachments = email.attachments.len(),
            attachment_bytes = email.attachment_bytes(),
            "Message assembled"
        );
        Ok(email)
    }

    fn address_lists(values: &[String]) -> SmtpResult<Vec<Address>> {
        let mut addresses = Vec::new();
        for value in values {
            addresses.extend(Address::parse_list(value)?);
        }
        Ok(addresses)
    }
}
