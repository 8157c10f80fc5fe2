//! Transport layer for SMTP connections.
//!
//! Provides the [`SmtpTransport`] abstraction and a TCP implementation
//! with STARTTLS or implicit TLS.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::{SmtpConfig, TlsConfig, TlsMode};
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult, Stage};
use crate::protocol::{codes, EsmtpCapabilities, SmtpCommand, SmtpResponse, TransactionState};

/// Longest reply line accepted from a server.
const MAX_LINE_LENGTH: usize = 4096;

/// Trait for SMTP transport abstraction.
#[async_trait]
pub trait SmtpTransport: Send + Sync + fmt::Debug {
    /// Sends a command and receives a response.
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse>;

    /// Sends raw data (for DATA command body).
    async fn send_data(&mut self, data: &[u8]) -> SmtpResult<()>;

    /// Reads a response from the server.
    async fn read_response(&mut self) -> SmtpResult<SmtpResponse>;

    /// Upgrades the connection to TLS.
    async fn upgrade_tls(&mut self, config: &TlsConfig, host: &str) -> SmtpResult<()>;

    /// Returns true if TLS is enabled.
    fn is_tls(&self) -> bool;

    /// Sends QUIT (best effort) and closes the connection.
    async fn close(&mut self) -> SmtpResult<()>;

    /// Returns the current transaction state.
    fn state(&self) -> TransactionState;

    /// Sets the transaction state.
    fn set_state(&mut self, state: TransactionState);

    /// Returns the server capabilities.
    fn capabilities(&self) -> Option<&EsmtpCapabilities>;

    /// Sets the server capabilities.
    fn set_capabilities(&mut self, caps: Option<EsmtpCapabilities>);
}

/// Byte stream an SMTP session runs over.
trait SessionStream: AsyncBufRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncBufRead + AsyncWrite + Unpin + Send> SessionStream for T {}

/// Stream type that can be plain TCP or TLS.
enum TransportStream {
    Plain(BufReader<TcpStream>),
    #[cfg(feature = "rustls-tls")]
    Tls(BufReader<tokio_rustls::client::TlsStream<TcpStream>>),
    #[cfg(feature = "native-tls")]
    NativeTls(BufReader<tokio_native_tls::TlsStream<TcpStream>>),
    /// No usable stream: closed, or a TLS handshake failed midway.
    Closed,
}

/// TCP connection with optional TLS.
pub struct TcpTransport {
    /// Read/write stream.
    stream: TransportStream,
    /// Command timeout.
    command_timeout: Duration,
    /// TLS handshake timeout.
    handshake_timeout: Duration,
    /// Transaction state.
    state: TransactionState,
    /// Server capabilities.
    capabilities: Option<EsmtpCapabilities>,
    /// TLS enabled flag.
    tls_enabled: bool,
    /// Server host.
    host: String,
    /// Server greeting.
    greeting: Option<SmtpResponse>,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("host", &self.host)
            .field("tls_enabled", &self.tls_enabled)
            .field("state", &self.state)
            .finish()
    }
}

impl TcpTransport {
    /// Connects to an SMTP server and reads its greeting.
    ///
    /// With [`TlsMode::Implicit`] the TLS handshake happens before the greeting.
    pub async fn connect(config: &SmtpConfig) -> SmtpResult<Self> {
        let address = config.address();
        tracing::debug!(%address, tls_mode = ?config.tls.mode, "Connecting to SMTP server");

        let stream = timeout(config.connect_timeout, Self::open(&config.host, config.port))
            .await
            .map_err(|_| {
                SmtpError::new(
                    SmtpErrorKind::ConnectTimeout,
                    format!("Connect to {} timed out after {:?}", address, config.connect_timeout),
                )
            })??;

        // Replies are small; latency matters more than batching.
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Could not set TCP_NODELAY");
        }

        let mut transport = Self {
            stream: TransportStream::Plain(BufReader::new(stream)),
            command_timeout: config.command_timeout,
            handshake_timeout: config.connect_timeout,
            state: TransactionState::Initial,
            capabilities: None,
            tls_enabled: false,
            host: config.host.clone(),
            greeting: None,
        };

        if config.tls.mode == TlsMode::Implicit {
            transport.upgrade_tls(&config.tls, &config.host).await?;
        }

        let greeting = transport
            .read_response()
            .await
            .map_err(|e| e.in_stage(Stage::Connect))?;
        if greeting.code != codes::SERVICE_READY {
            return Err(greeting.to_error().in_stage(Stage::Connect));
        }

        tracing::info!(%address, greeting = %greeting, "Connected to SMTP server");
        transport.greeting = Some(greeting);
        if transport.state == TransactionState::Initial {
            transport.state = TransactionState::Connected;
        }

        Ok(transport)
    }

    /// Returns the server greeting.
    pub fn greeting(&self) -> Option<&SmtpResponse> {
        self.greeting.as_ref()
    }

    /// Resolves the host and connects to the first reachable address.
    async fn open(host: &str, port: u16) -> SmtpResult<TcpStream> {
        let addresses: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| {
                SmtpError::new(
                    SmtpErrorKind::DnsResolution,
                    format!("Failed to resolve {}", host),
                )
                .with_cause(e)
            })?
            .collect();

        if addresses.is_empty() {
            return Err(SmtpError::new(
                SmtpErrorKind::DnsResolution,
                format!("No addresses found for {}", host),
            ));
        }

        let mut last_error = None;
        for address in addresses {
            match TcpStream::connect(address).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!(%address, error = %e, "Connect attempt failed");
                    last_error = Some(Self::map_io_error(e, &address.to_string()));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| SmtpError::connection(format!("Could not connect to {}", host))))
    }

    /// Maps IO errors to SMTP errors.
    fn map_io_error(error: io::Error, address: &str) -> SmtpError {
        let err = match error.kind() {
            io::ErrorKind::ConnectionRefused => SmtpError::new(
                SmtpErrorKind::ConnectionRefused,
                format!("Connection refused to {}", address),
            ),
            io::ErrorKind::TimedOut => {
                SmtpError::new(SmtpErrorKind::ConnectTimeout, format!("Connect to {} timed out", address))
            }
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                SmtpError::new(SmtpErrorKind::ConnectionReset, "Connection reset by server")
            }
            _ => SmtpError::connection(format!("Connection error to {}", address)),
        };
        err.with_cause(error)
    }

    /// Returns the live stream.
    fn stream(&mut self) -> SmtpResult<&mut dyn SessionStream> {
        match &mut self.stream {
            TransportStream::Plain(stream) => Ok(stream),
            #[cfg(feature = "rustls-tls")]
            TransportStream::Tls(stream) => Ok(stream),
            #[cfg(feature = "native-tls")]
            TransportStream::NativeTls(stream) => Ok(stream),
            TransportStream::Closed => Err(SmtpError::new(
                SmtpErrorKind::ConnectionReset,
                "Connection is closed",
            )),
        }
    }

    /// Takes the plain TCP stream out for a TLS handshake.
    fn take_plain_stream(&mut self) -> SmtpResult<TcpStream> {
        match std::mem::replace(&mut self.stream, TransportStream::Closed) {
            TransportStream::Plain(reader) => {
                // Anything already buffered arrived before the handshake and cannot be trusted.
                if !reader.buffer().is_empty() {
                    return Err(SmtpError::protocol(
                        "Server sent data before the TLS handshake started",
                    ));
                }
                Ok(reader.into_inner())
            }
            TransportStream::Closed => Err(SmtpError::new(
                SmtpErrorKind::ConnectionReset,
                "Connection is closed",
            )),
            other => {
                self.stream = other;
                Err(SmtpError::tls("Already using TLS"))
            }
        }
    }

    /// Reads lines until we have a complete response.
    async fn read_response_inner<R: AsyncBufRead + Unpin + ?Sized>(
        reader: &mut R,
        timeout_duration: Duration,
    ) -> SmtpResult<SmtpResponse> {
        let mut lines = Vec::new();

        loop {
            let mut buf = Vec::new();
            let mut line_reader = (&mut *reader).take(MAX_LINE_LENGTH as u64 + 1);

            let read = timeout(timeout_duration, line_reader.read_until(b'\n', &mut buf))
                .await
                .map_err(|_| SmtpError::new(SmtpErrorKind::ReadTimeout, "Read timed out"))?
                .map_err(|e| {
                    SmtpError::new(SmtpErrorKind::ConnectionReset, "Read error").with_cause(e)
                })?;

            if read == 0 {
                return Err(SmtpError::new(
                    SmtpErrorKind::ConnectionReset,
                    "Server closed connection",
                ));
            }

            if buf.len() > MAX_LINE_LENGTH {
                return Err(SmtpError::protocol("Response line too long"));
            }

            let line = String::from_utf8_lossy(&buf).trim_end().to_string();

            // Check for continuation (code-hyphen)
            let is_continuation = line.as_bytes().get(3) == Some(&b'-');
            lines.push(line);

            if !is_continuation {
                break;
            }
        }

        SmtpResponse::parse(&lines)
    }

    /// Writes data to the stream.
    async fn write_all<W: AsyncWrite + Unpin + ?Sized>(
        writer: &mut W,
        data: &[u8],
        timeout_duration: Duration,
    ) -> SmtpResult<()> {
        timeout(timeout_duration, writer.write_all(data))
            .await
            .map_err(|_| SmtpError::new(SmtpErrorKind::WriteTimeout, "Write timed out"))?
            .map_err(|e| SmtpError::new(SmtpErrorKind::ConnectionReset, "Write error").with_cause(e))?;

        timeout(timeout_duration, writer.flush())
            .await
            .map_err(|_| SmtpError::new(SmtpErrorKind::WriteTimeout, "Flush timed out"))?
            .map_err(|e| SmtpError::new(SmtpErrorKind::ConnectionReset, "Flush error").with_cause(e))?;

        Ok(())
    }

    #[cfg(feature = "rustls-tls")]
    async fn handshake(&mut self, config: &TlsConfig, host: &str) -> SmtpResult<()> {
        use crate::config::TlsVersion;
        use rustls::pki_types::ServerName;
        use std::sync::Arc;

        if config.accept_invalid_certs {
            return Err(SmtpError::configuration(
                "accept_invalid_certs requires the native-tls backend",
            ));
        }

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(path) = &config.ca_cert_path {
            let file = std::fs::File::open(path).map_err(|e| {
                SmtpError::configuration(format!("Cannot open CA file {}", path.display()))
                    .with_cause(e)
            })?;
            let mut reader = io::BufReader::new(file);
            let mut added = 0usize;
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert.map_err(|e| {
                    SmtpError::configuration(format!("Invalid PEM in {}", path.display()))
                        .with_cause(e)
                })?;
                root_store.add(cert).map_err(|e| {
                    SmtpError::new(SmtpErrorKind::CertificateInvalid, format!("Rejected CA certificate: {}", e))
                })?;
                added += 1;
            }
            tracing::debug!(path = %path.display(), added, "Loaded extra CA certificates");
        }

        let versions: &[&'static rustls::SupportedProtocolVersion] = match config.min_version {
            TlsVersion::Tls12 => &[&rustls::version::TLS13, &rustls::version::TLS12],
            TlsVersion::Tls13 => &[&rustls::version::TLS13],
        };

        let tls_config = rustls::ClientConfig::builder_with_protocol_versions(versions)
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| SmtpError::tls(format!("Invalid server name: {}", host)))?;

        let tcp_stream = self.take_plain_stream()?;

        let tls_stream = timeout(self.handshake_timeout, connector.connect(server_name, tcp_stream))
            .await
            .map_err(|_| SmtpError::new(SmtpErrorKind::ConnectTimeout, "TLS handshake timed out"))?
            .map_err(Self::map_tls_error)?;

        self.stream = TransportStream::Tls(BufReader::new(tls_stream));
        Ok(())
    }

    #[cfg(feature = "rustls-tls")]
    fn map_tls_error(error: io::Error) -> SmtpError {
        let certificate_problem = error
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
            .map(|e| matches!(e, rustls::Error::InvalidCertificate(_)))
            .unwrap_or(false);

        let kind = if certificate_problem {
            SmtpErrorKind::CertificateInvalid
        } else {
            SmtpErrorKind::TlsHandshakeFailed
        };
        SmtpError::new(kind, "TLS handshake failed").with_cause(error)
    }

    #[cfg(all(feature = "native-tls", not(feature = "rustls-tls")))]
    async fn handshake(&mut self, config: &TlsConfig, host: &str) -> SmtpResult<()> {
        use native_tls::{Certificate, Protocol, TlsConnector};

        let mut builder = TlsConnector::builder();
        builder.min_protocol_version(Some(Protocol::Tlsv12));

        if config.accept_invalid_certs {
            builder.danger_accept_invalid_certs(true);
        }

        if let Some(path) = &config.ca_cert_path {
            let pem = tokio::fs::read(path).await.map_err(|e| {
                SmtpError::configuration(format!("Cannot read CA file {}", path.display()))
                    .with_cause(e)
            })?;
            let cert = Certificate::from_pem(&pem).map_err(|e| {
                SmtpError::new(SmtpErrorKind::CertificateInvalid, "Invalid CA certificate").with_cause(e)
            })?;
            builder.add_root_certificate(cert);
        }

        let connector = builder
            .build()
            .map_err(|e| SmtpError::tls("Failed to build TLS connector").with_cause(e))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);

        let tcp_stream = self.take_plain_stream()?;

        let tls_stream = timeout(self.handshake_timeout, connector.connect(host, tcp_stream))
            .await
            .map_err(|_| SmtpError::new(SmtpErrorKind::ConnectTimeout, "TLS handshake timed out"))?
            .map_err(|e| SmtpError::new(SmtpErrorKind::TlsHandshakeFailed, "TLS handshake failed").with_cause(e))?;

        self.stream = TransportStream::NativeTls(BufReader::new(tls_stream));
        Ok(())
    }

    #[cfg(not(any(feature = "rustls-tls", feature = "native-tls")))]
    async fn handshake(&mut self, _config: &TlsConfig, _host: &str) -> SmtpResult<()> {
        Err(SmtpError::configuration("No TLS implementation available"))
    }
}

#[async_trait]
impl SmtpTransport for TcpTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse> {
        let cmd_str = format!("{}\r\n", command.to_smtp_string());
        tracing::debug!(command = %command, "Sending SMTP command");

        let command_timeout = self.command_timeout;
        Self::write_all(self.stream()?, cmd_str.as_bytes(), command_timeout).await?;

        let response = self.read_response().await?;
        self.state = self.state.after(command, response.code);
        Ok(response)
    }

    async fn send_data(&mut self, data: &[u8]) -> SmtpResult<()> {
        tracing::debug!(bytes = data.len(), "Sending message data");
        let command_timeout = self.command_timeout;
        Self::write_all(self.stream()?, data, command_timeout).await
    }

    async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        let command_timeout = self.command_timeout;
        let response = Self::read_response_inner(self.stream()?, command_timeout).await?;
        tracing::debug!(code = response.code, message = %response.first_message(), "Received SMTP response");
        Ok(response)
    }

    async fn upgrade_tls(&mut self, config: &TlsConfig, host: &str) -> SmtpResult<()> {
        if self.tls_enabled {
            return Ok(());
        }

        self.handshake(config, host).await?;

        self.tls_enabled = true;
        self.capabilities = None;
        self.state = TransactionState::TlsEstablished;
        tracing::debug!(host, "TLS established");
        Ok(())
    }

    fn is_tls(&self) -> bool {
        self.tls_enabled
    }

    async fn close(&mut self) -> SmtpResult<()> {
        if matches!(self.stream, TransportStream::Closed) {
            self.state = TransactionState::Closed;
            return Ok(());
        }

        if self.state != TransactionState::Closed {
            if let Err(e) = self.send_command(&SmtpCommand::Quit).await {
                tracing::debug!(error = %e, "QUIT failed");
            }
            self.state = TransactionState::Closed;
        }

        if let Ok(stream) = self.stream() {
            let _ = stream.shutdown().await;
        }
        self.stream = TransportStream::Closed;
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
