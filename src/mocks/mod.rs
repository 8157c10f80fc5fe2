//! Mock implementations for testing.
//!
//! [`MockTransport`] replays queued server replies and records everything
//! the client sends, so whole sessions can be checked without a network.

use async_trait::async_trait;
use std::collections::VecDeque;

use crate::config::TlsConfig;
use crate::errors::{SmtpError, SmtpResult};
use crate::protocol::{EsmtpCapabilities, SmtpCommand, SmtpResponse, TransactionState, codes};
use crate::transport::SmtpTransport;
use crate::types::{Attachment, Email};

/// Mock SMTP transport for testing.
#[derive(Debug)]
pub struct MockTransport {
    /// Recorded commands.
    commands: Vec<SmtpCommand>,
    /// Queued responses.
    responses: VecDeque<SmtpResponse>,
    /// Response used when the queue is empty.
    default_response: SmtpResponse,
    /// Current state.
    state: TransactionState,
    /// Server capabilities.
    capabilities: Option<EsmtpCapabilities>,
    /// TLS enabled.
    tls_enabled: bool,
    /// Number of TLS upgrades performed.
    tls_upgrades: usize,
    /// Data received.
    data_received: Vec<u8>,
    /// Simulated failure for the next call.
    fail_next: Option<SmtpError>,
}

impl MockTransport {
    /// Creates a new mock transport in the connected state.
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
            responses: VecDeque::new(),
            default_response: SmtpResponse::new(codes::OK, "OK"),
            state: TransactionState::Connected,
            capabilities: None,
            tls_enabled: false,
            tls_upgrades: 0,
            data_received: Vec::new(),
            fail_next: None,
        }
    }

    /// Creates a mock whose connection is already encrypted (implicit TLS).
    pub fn with_tls() -> Self {
        Self {
            tls_enabled: true,
            ..Self::new()
        }
    }

    /// Queues a response.
    pub fn queue_response(&mut self, response: SmtpResponse) -> &mut Self {
        self.responses.push_back(response);
        self
    }

    /// Queues several responses in order.
    pub fn queue_responses(&mut self, responses: impl IntoIterator<Item = SmtpResponse>) -> &mut Self {
        self.responses.extend(responses);
        self
    }

    /// Queues an OK response.
    pub fn queue_ok(&mut self) -> &mut Self {
        self.queue_response(SmtpResponse::new(codes::OK, "OK"))
    }

    /// Queues an error response.
    pub fn queue_error(&mut self, code: u16, message: &str) -> &mut Self {
        self.queue_response(SmtpResponse::new(code, message))
    }

    /// Makes the next transport call fail.
    pub fn fail_next_with(&mut self, error: SmtpError) -> &mut Self {
        self.fail_next = Some(error);
        self
    }

    /// Returns recorded commands.
    pub fn recorded_commands(&self) -> &[SmtpCommand] {
        &self.commands
    }

    /// Returns recorded commands in their log-safe form.
    pub fn commands_sent(&self) -> Vec<String> {
        self.commands.iter().map(|c| c.to_string()).collect()
    }

    /// Returns recorded commands exactly as they would go on the wire.
    pub fn wire_commands(&self) -> Vec<String> {
        self.commands.iter().map(|c| c.to_smtp_string()).collect()
    }

    /// Returns all message data received.
    pub fn data_received(&self) -> &[u8] {
        &self.data_received
    }

    /// Returns how many times the connection was upgraded to TLS.
    pub fn tls_upgrades(&self) -> usize {
        self.tls_upgrades
    }

    /// Returns the number of queued responses not yet consumed.
    pub fn pending_responses(&self) -> usize {
        self.responses.len()
    }

    fn next_response(&mut self) -> SmtpResponse {
        self.responses
            .pop_front()
            .unwrap_or_else(|| self.default_response.clone())
    }

    fn take_failure(&mut self) -> SmtpResult<()> {
        match self.fail_next.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SmtpTransport for MockTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse> {
        self.take_failure()?;

        self.commands.push(command.clone());
        let response = self.next_response();
        self.state = self.state.after(command, response.code);
        Ok(response)
    }

    async fn send_data(&mut self, data: &[u8]) -> SmtpResult<()> {
        self.take_failure()?;

        self.data_received.extend_from_slice(data);
        Ok(())
    }

    async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        self.take_failure()?;

        Ok(self.next_response())
    }

    async fn upgrade_tls(&mut self, _config: &TlsConfig, _host: &str) -> SmtpResult<()> {
        self.take_failure()?;

        self.tls_enabled = true;
        self.tls_upgrades += 1;
        self.capabilities = None;
        self.state = TransactionState::TlsEstablished;
        Ok(())
    }

    fn is_tls(&self) -> bool {
        self.tls_enabled
    }

    async fn close(&mut self) -> SmtpResult<()> {
        if self.state != TransactionState::Closed {
            self.commands.push(SmtpCommand::Quit);
            let _ = self.next_response();
            self.state = TransactionState::Closed;
        }
        Ok(())
    }

    fn state(&self) -> TransactionState {
        self.state
    }

    fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    fn capabilities(&self) -> Option<&EsmtpCapabilities> {
        self.capabilities.as_ref()
    }

    fn set_capabilities(&mut self, caps: Option<EsmtpCapabilities>) {
        self.capabilities = caps;
    }
}

/// Creates a test email.
pub fn test_email() -> SmtpResult<Email> {
    Email::builder()
        .from("sender@example.com")?
        .to("recipient@example.com")?
        .subject("Test Subject")
        .text("Test body")
        .build()
}

/// Creates a test email with two attachments.
pub fn test_email_with_attachments() -> SmtpResult<Email> {
    Email::builder()
        .from("sender@example.com")?
        .to("recipient@example.com")?
        .subject("GPU Benchmark Report")
        .text("Benchmark Report attached")
        .attachment(Attachment::binary("benchmark_report.txt", b"fps=144\n".to_vec()))
        .attachment(Attachment::binary("trace.bin", vec![0x00, 0x2e, 0x0d, 0x0a, 0xff]))
        .build()
}

/// Creates an EHLO response advertising the given extensions.
pub fn ehlo_response(extensions: &[&str]) -> SmtpResponse {
    let mut message = vec!["smtp.example.com at your service".to_string()];
    message.extend(extensions.iter().map(|e| e.to_string()));
    SmtpResponse {
        code: codes::OK,
        enhanced_code: None,
        is_multiline: message.len() > 1,
        message,
    }
}

/// Creates an EHLO response like a typical submission server before STARTTLS.
pub fn ehlo_before_tls() -> SmtpResponse {
    ehlo_response(&["SIZE 35882577", "8BITMIME", "STARTTLS", "ENHANCEDSTATUSCODES", "PIPELINING"])
}

/// Creates an EHLO response like a typical submission server after STARTTLS.
pub fn ehlo_after_tls() -> SmtpResponse {
    ehlo_response(&[
        "SIZE 35882577",
        "8BITMIME",
        "AUTH LOGIN PLAIN",
        "ENHANCEDSTATUSCODES",
        "PIPELINING",
    ])
}

/// Creates a greeting response.
pub fn greeting_response() -> SmtpResponse {
    SmtpResponse::new(codes::SERVICE_READY, "smtp.example.com ESMTP ready")
}

/// Creates a STARTTLS go-ahead response.
pub fn starttls_ready_response() -> SmtpResponse {
    SmtpResponse::new(codes::SERVICE_READY, "2.0.0 Ready to start TLS")
}

/// Creates an authentication success response.
pub fn auth_success_response() -> SmtpResponse {
    SmtpResponse::new(codes::AUTH_SUCCESS, "2.7.0 Accepted")
}

/// Creates an AUTH continue response.
pub fn auth_continue_response(challenge: &str) -> SmtpResponse {
    SmtpResponse::new(codes::AUTH_CONTINUE, challenge)
}

/// Creates a DATA ready response.
pub fn data_ready_response() -> SmtpResponse {
    SmtpResponse::new(codes::START_MAIL_INPUT, "Go ahead")
}

impl MockTransport {
    /// Creates an EHLO response advertising the given extensions.
    pub fn ehlo_response(extensions: &[&str]) -> SmtpResponse {
        ehlo_response(extensions)
    }
}
