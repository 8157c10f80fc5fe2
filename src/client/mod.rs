//! Main SMTP client implementation.
//!
//! Provides a high-level interface for submitting one message:
//! - EHLO with HELO fallback
//! - STARTTLS negotiation
//! - Authentication
//! - The mail transaction itself
//!
//! The session logic is generic over [`SmtpTransport`] so it can run
//! against a real TCP connection or a scripted transport.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::Instrument;

use crate::auth::{AuthMethod, Authenticator, CredentialProvider, Credentials, StaticCredentialProvider};
use crate::config::{SmtpConfig, TlsMode};
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::mime::{EncodedMessage, MimeEncoder};
use crate::observability::Timer;
use crate::protocol::{EsmtpCapabilities, SmtpCommand, SmtpResponse, TransactionState, codes};
use crate::transport::{SmtpTransport, TcpTransport};
use crate::types::{Address, ConnectionInfo, Email, RejectedRecipient, SendResult};

/// Outcome of session setup.
#[derive(Debug)]
struct Session {
    /// First line of the final EHLO/HELO reply.
    banner: String,
    /// User the session authenticated as.
    authenticated_user: Option<String>,
}

/// High-level SMTP client.
#[derive(Debug)]
pub struct SmtpClient {
    /// Configuration.
    config: Arc<SmtpConfig>,
    /// Credential provider.
    credential_provider: Option<Arc<dyn CredentialProvider>>,
    /// MIME encoder.
    encoder: MimeEncoder,
}

impl SmtpClient {
    /// Creates a new SMTP client.
    ///
    /// Credentials in the configuration become a static credential provider.
    pub fn new(config: SmtpConfig) -> SmtpResult<Self> {
        config.validate()?;

        if !config.tls.is_enabled() {
            tracing::warn!(host = %config.host, "TLS disabled, the session will not be encrypted");
        }

        let credential_provider: Option<Arc<dyn CredentialProvider>> = Credentials::from_config(&config)
            .map(|c| Arc::new(StaticCredentialProvider::new(c)) as Arc<dyn CredentialProvider>);

        Ok(Self {
            config: Arc::new(config),
            credential_provider,
            encoder: MimeEncoder::new(),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }

    /// Encodes an email without sending it.
    pub fn encode(&self, email: &Email) -> SmtpResult<EncodedMessage> {
        let encoded = self.encoder.encode(email)?;

        if encoded.size() > self.config.max_message_size {
            return Err(SmtpError::message_error(
                SmtpErrorKind::MessageTooLarge,
                format!(
                    "Message is {} bytes, limit is {} bytes",
                    encoded.size(),
                    self.config.max_message_size
                ),
            ));
        }

        Ok(encoded)
    }

    /// Sends an email over a new connection.
    pub async fn send(&self, email: &Email) -> SmtpResult<SendResult> {
        let timer = Timer::start("send");
        let encoded = self.encode(email)?;

        let span = tracing::info_span!(
            "send",
            message_id = %encoded.message_id,
            host = %self.config.host,
            recipients = email.recipient_count(),
        );

        async {
            let mut transport = TcpTransport::connect(&self.config).await?;
            self.deliver(&mut transport, email, &encoded).await
        }
        .instrument(span)
        .await
        .map(|mut result| {
            result.duration = timer.stop();
            result
        })
    }

    /// Sends an email over an already connected transport.
    ///
    /// The transport is closed afterwards whether or not the send succeeded.
    pub async fn send_via<T>(&self, transport: &mut T, email: &Email) -> SmtpResult<SendResult>
    where
        T: SmtpTransport + ?Sized,
    {
        let timer = Timer::start("send");
        let encoded = match self.encode(email) {
            Ok(encoded) => encoded,
            Err(e) => {
                Self::finish(transport).await;
                return Err(e);
            }
        };

        let mut result = self.deliver(transport, email, &encoded).await?;
        result.duration = timer.stop();
        Ok(result)
    }

    /// Connects, negotiates TLS and authenticates, then disconnects.
    pub async fn verify(&self) -> SmtpResult<ConnectionInfo> {
        let span = tracing::info_span!(
            "verify",
            host = %self.config.host,
            port = self.config.port,
            auth = self.config.has_auth(),
        );

        async {
            let mut transport = TcpTransport::connect(&self.config).await?;
            self.verify_via(&mut transport).await
        }
        .instrument(span)
        .await
    }

    /// Runs the connection check over an already connected transport.
    pub async fn verify_via<T>(&self, transport: &mut T) -> SmtpResult<ConnectionInfo>
    where
        T: SmtpTransport + ?Sized,
    {
        let result = self.establish(transport).await;
        let info = result.map(|session| ConnectionInfo {
            host: self.config.host.clone(),
            port: self.config.port,
            tls_enabled: transport.is_tls(),
            capabilities: transport
                .capabilities()
                .map(|c| c.raw.clone())
                .unwrap_or_default(),
            banner: session.banner,
            authenticated_user: session.authenticated_user,
        });

        Self::finish(transport).await;
        info
    }

    /// Runs session setup and the mail transaction, then closes the transport.
    async fn deliver<T>(
        &self,
        transport: &mut T,
        email: &Email,
        encoded: &EncodedMessage,
    ) -> SmtpResult<SendResult>
    where
        T: SmtpTransport + ?Sized,
    {
        let result = async {
            self.establish(transport).await?;
            self.perform_transaction(transport, email, encoded).await
        }
        .await;

        Self::finish(transport).await;

        match &result {
            Ok(r) => tracing::info!(
                message_id = %r.message_id,
                accepted = r.accepted.len(),
                rejected = r.rejected.len(),
                "Message accepted by server"
            ),
            Err(e) => tracing::debug!(error = %e, "Send failed"),
        }

        result
    }

    /// Closes the transport, ignoring errors.
    async fn finish<T>(transport: &mut T)
    where
        T: SmtpTransport + ?Sized,
    {
        if let Err(e) = transport.close().await {
            tracing::debug!(error = %e, "Error while closing connection");
        }
    }

    /// Greets the server, negotiates TLS and authenticates.
    async fn establish<T>(&self, transport: &mut T) -> SmtpResult<Session>
    where
        T: SmtpTransport + ?Sized,
    {
        let mut banner = self.greet(transport).await?;

        if !transport.is_tls() {
            match self.config.tls.mode {
                TlsMode::None => {}
                TlsMode::Implicit => {
                    return Err(SmtpError::tls("Implicit TLS requested but connection is not encrypted"));
                }
                TlsMode::StartTls | TlsMode::StartTlsRequired => {
                    if self.start_tls(transport).await? {
                        banner = self.greet(transport).await?;
                    }
                }
            }
        }

        let mut authenticated_user = None;
        if let Some(provider) = &self.credential_provider {
            if transport.state() != TransactionState::Authenticated {
                Self::require_state(transport, TransactionState::can_authenticate, "AUTH")?;
                let credentials = provider.get_credentials().await?;
                self.authenticate(transport, &credentials).await?;
                authenticated_user = Some(credentials.username().to_string());
            }
        }

        Ok(Session {
            banner,
            authenticated_user,
        })
    }

    /// Sends EHLO, falling back to HELO, and records capabilities.
    async fn greet<T>(&self, transport: &mut T) -> SmtpResult<String>
    where
        T: SmtpTransport + ?Sized,
    {
        let client_id = self.config.client_id().to_string();
        let response = transport.send_command(&SmtpCommand::Ehlo(client_id.clone())).await?;

        if response.is_success() {
            let capabilities = EsmtpCapabilities::from_ehlo_response(&response);
            tracing::debug!(capabilities = ?capabilities.raw, "EHLO accepted");
            transport.set_capabilities(Some(capabilities));
            return Ok(response.first_message().to_string());
        }

        if !response.is_permanent_failure() {
            return Err(response.to_error());
        }

        tracing::debug!(response = %response, "EHLO rejected, falling back to HELO");
        let response = transport.send_command(&SmtpCommand::Helo(client_id)).await?;
        if !response.is_success() {
            return Err(response.to_error());
        }

        transport.set_capabilities(Some(EsmtpCapabilities::default()));
        Ok(response.first_message().to_string())
    }

    /// Negotiates STARTTLS. Returns true if the connection was upgraded.
    async fn start_tls<T>(&self, transport: &mut T) -> SmtpResult<bool>
    where
        T: SmtpTransport + ?Sized,
    {
        let required = self.config.tls.mode == TlsMode::StartTlsRequired;
        let advertised = transport.capabilities().map(|c| c.starttls).unwrap_or(false);

        if !advertised {
            if required {
                return Err(SmtpError::new(
                    SmtpErrorKind::StarttlsNotSupported,
                    format!("{} does not advertise STARTTLS", self.config.host),
                ));
            }
            tracing::warn!(host = %self.config.host, "STARTTLS not offered, continuing unencrypted");
            return Ok(false);
        }

        let response = transport.send_command(&SmtpCommand::StartTls).await?;
        if response.code != codes::SERVICE_READY {
            if required {
                return Err(SmtpError::new(
                    SmtpErrorKind::StarttlsNotSupported,
                    format!("STARTTLS refused: {}", response),
                )
                .with_smtp_code(response.code));
            }
            tracing::warn!(response = %response, "STARTTLS refused, continuing unencrypted");
            return Ok(false);
        }

        transport.upgrade_tls(&self.config.tls, &self.config.host).await?;
        transport.set_capabilities(None);
        tracing::debug!("Connection upgraded to TLS");
        Ok(true)
    }

    /// Performs authentication.
    async fn authenticate<T>(&self, transport: &mut T, credentials: &Credentials) -> SmtpResult<()>
    where
        T: SmtpTransport + ?Sized,
    {
        let mut available: Vec<AuthMethod> = transport
            .capabilities()
            .map(|c| c.auth_mechanisms.iter().copied().collect())
            .unwrap_or_default();

        if available.is_empty() {
            return Err(SmtpError::new(
                SmtpErrorKind::AuthMethodNotSupported,
                format!("{} does not advertise AUTH", self.config.host),
            ));
        }
        available.sort_by_key(|m| std::cmp::Reverse(m.priority()));

        let method = Authenticator::select_method(
            &available,
            credentials,
            self.config.auth_method,
            transport.is_tls(),
        )?;

        tracing::debug!(method = %method, username = credentials.username(), "Authenticating");

        let Credentials::Plain { username, password } = credentials;
        match method {
            AuthMethod::Plain => {
                let command = SmtpCommand::Auth {
                    mechanism: method.mechanism_name().to_string(),
                    initial_response: Some(Authenticator::plain_initial_response(username, password)),
                };
                Self::expect(transport, &command, codes::AUTH_SUCCESS).await?;
            }
            AuthMethod::Login => {
                let command = SmtpCommand::Auth {
                    mechanism: method.mechanism_name().to_string(),
                    initial_response: None,
                };
                Self::expect(transport, &command, codes::AUTH_CONTINUE).await?;

                let command = SmtpCommand::AuthResponse(Authenticator::login_username(username));
                Self::expect(transport, &command, codes::AUTH_CONTINUE).await?;

                let command = SmtpCommand::AuthResponse(Authenticator::login_password(password));
                Self::expect(transport, &command, codes::AUTH_SUCCESS).await?;
            }
            AuthMethod::CramMd5 => {
                let command = SmtpCommand::Auth {
                    mechanism: method.mechanism_name().to_string(),
                    initial_response: None,
                };
                let challenge = Self::expect(transport, &command, codes::AUTH_CONTINUE).await?;

                let answer =
                    Authenticator::cram_md5_response(challenge.first_message(), username, password)?;
                Self::expect(transport, &SmtpCommand::AuthResponse(answer), codes::AUTH_SUCCESS)
                    .await?;
            }
        }

        transport.set_state(TransactionState::Authenticated);
        tracing::info!(method = %method, username = %username, "Authenticated");
        Ok(())
    }

    /// Fails unless the session is in a state where `command` is allowed.
    fn require_state<T>(
        transport: &T,
        allowed: fn(&TransactionState) -> bool,
        command: &str,
    ) -> SmtpResult<()>
    where
        T: SmtpTransport + ?Sized,
    {
        let state = transport.state();
        if allowed(&state) {
            Ok(())
        } else {
            Err(SmtpError::new(
                SmtpErrorKind::UnexpectedResponse,
                format!("{} not allowed in state {:?}", command, state),
            ))
        }
    }

    /// Sends a command and requires a specific reply code.
    async fn expect<T>(transport: &mut T, command: &SmtpCommand, code: u16) -> SmtpResult<SmtpResponse>
    where
        T: SmtpTransport + ?Sized,
    {
        let response = transport.send_command(command).await?;
        if response.code == codes::AUTH_CONTINUE && code != codes::AUTH_CONTINUE {
            return Err(SmtpError::new(
                SmtpErrorKind::UnexpectedResponse,
                format!("Unexpected continuation after {}", command),
            )
            .with_smtp_code(response.code));
        }
        response.expect_code(code)
    }

    /// Performs the SMTP transaction.
    async fn perform_transaction<T>(
        &self,
        transport: &mut T,
        email: &Email,
        encoded: &EncodedMessage,
    ) -> SmtpResult<SendResult>
    where
        T: SmtpTransport + ?Sized,
    {
        let data = MimeEncoder::prepare_data_content(&encoded.bytes);
        let capabilities = transport.capabilities().cloned().unwrap_or_default();

        if let Some(limit) = capabilities.size_limit() {
            if data.len() > limit {
                return Err(SmtpError::message_error(
                    SmtpErrorKind::MessageTooLarge,
                    format!("Message is {} bytes, server accepts at most {}", data.len(), limit),
                ));
            }
        }

        Self::require_state(transport, TransactionState::can_start_mail, "MAIL FROM")?;
        let mail_from = SmtpCommand::MailFrom {
            address: email.from.to_smtp(),
            size: capabilities.size.map(|_| data.len()),
            body_8bit: capabilities.eight_bit_mime,
        };

        let response = transport.send_command(&mail_from).await?;
        if !response.is_success() {
            let mut err = response.to_error();
            if err.kind() == SmtpErrorKind::InvalidRecipientAddress {
                err = SmtpError::message_error(SmtpErrorKind::InvalidFromAddress, err.message())
                    .with_smtp_code(response.code);
            }
            return Err(err);
        }

        Self::require_state(transport, TransactionState::can_add_recipient, "RCPT TO")?;
        let mut accepted: Vec<Address> = Vec::new();
        let mut rejected = Vec::new();
        let mut seen = HashSet::new();

        for recipient in email.all_recipients() {
            if !seen.insert(recipient.email().to_ascii_lowercase()) {
                continue;
            }

            let rcpt_to = SmtpCommand::RcptTo {
                address: recipient.to_smtp(),
            };

            let response = transport.send_command(&rcpt_to).await?;
            if response.is_success() {
                accepted.push(recipient.clone());
            } else if response.code == codes::SERVICE_UNAVAILABLE {
                return Err(response.to_error());
            } else {
                tracing::warn!(recipient = %recipient.email(), response = %response, "Recipient rejected");
                rejected.push(RejectedRecipient {
                    address: recipient.clone(),
                    code: response.code,
                    message: response.full_message(),
                });
            }
        }

        if accepted.is_empty() {
            if let Err(e) = transport.send_command(&SmtpCommand::Rset).await {
                tracing::debug!(error = %e, "RSET failed");
            }
            let mut err = SmtpError::message_error(
                SmtpErrorKind::InvalidRecipientAddress,
                "All recipients were rejected",
            );
            if let Some(last) = rejected.last() {
                err = err.with_smtp_code(last.code);
            }
            return Err(err);
        }

        Self::require_state(transport, TransactionState::can_send_data, "DATA")?;
        let response = transport.send_command(&SmtpCommand::Data).await?;
        if response.code != codes::START_MAIL_INPUT {
            return Err(response.to_error());
        }
        transport.set_state(TransactionState::SendingData);

        transport.send_data(&data).await?;

        let response = transport.read_response().await?;
        if !response.is_success() {
            return Err(response.to_error());
        }
        transport.set_state(TransactionState::Complete);

        Ok(SendResult {
            message_id: encoded.message_id.clone(),
            accepted,
            rejected,
            response: response.full_message(),
            duration: std::time::Duration::ZERO,
        })
    }
}
