//! Configuration types for the mailer.
//!
//! Provides configuration with builder pattern for:
//! - Server connection settings
//! - TLS configuration
//! - Authentication credentials
//! - Timeouts and size limits
//!
//! Configuration can be assembled in code or loaded from `SMTP_*`
//! environment variables with [`SmtpConfigBuilder::from_env`].

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::auth::AuthMethod;
use crate::errors::{SmtpError, SmtpResult};

/// Default SMTP server.
pub const DEFAULT_HOST: &str = "smtp.gmail.com";

/// Default SMTP port (submission with STARTTLS).
pub const DEFAULT_PORT: u16 = 587;

/// Default timeout for connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Default maximum message size (10 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Default EHLO identity.
pub const DEFAULT_CLIENT_ID: &str = "localhost";

/// Environment variable names.
pub mod env {
    /// Server hostname.
    pub const HOST: &str = "SMTP_HOST";
    /// Server port.
    pub const PORT: &str = "SMTP_PORT";
    /// Login name.
    pub const USERNAME: &str = "SMTP_USERNAME";
    /// Login password.
    pub const PASSWORD: &str = "SMTP_PASSWORD";
    /// TLS mode.
    pub const TLS_MODE: &str = "SMTP_TLS_MODE";
    /// Authentication mechanism.
    pub const AUTH_METHOD: &str = "SMTP_AUTH_METHOD";
    /// Connect timeout.
    pub const CONNECT_TIMEOUT: &str = "SMTP_CONNECT_TIMEOUT";
    /// Command timeout.
    pub const COMMAND_TIMEOUT: &str = "SMTP_COMMAND_TIMEOUT";
    /// EHLO identity.
    pub const CLIENT_ID: &str = "SMTP_CLIENT_ID";
    /// Extra CA certificate bundle (PEM).
    pub const CA_CERT: &str = "SMTP_CA_CERT";
}

/// TLS mode for SMTP connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// No TLS (insecure, testing only).
    None,
    /// Opportunistic STARTTLS.
    StartTls,
    /// Required STARTTLS (fail if not supported).
    #[default]
    StartTlsRequired,
    /// Implicit TLS (port 465).
    Implicit,
}

impl FromStr for TlsMode {
    type Err = SmtpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(TlsMode::None),
            "start_tls" | "starttls" => Ok(TlsMode::StartTls),
            "start_tls_required" => Ok(TlsMode::StartTlsRequired),
            "implicit" => Ok(TlsMode::Implicit),
            other => Err(SmtpError::configuration(format!(
                "Unknown TLS mode {:?} (expected none, start_tls, start_tls_required or implicit)",
                other
            ))),
        }
    }
}

/// Minimum TLS version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsVersion {
    /// TLS 1.2 (default).
    #[default]
    Tls12,
    /// TLS 1.3.
    Tls13,
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// TLS mode.
    #[serde(default)]
    pub mode: TlsMode,
    /// Minimum TLS version.
    #[serde(default)]
    pub min_version: TlsVersion,
    /// Accept invalid certificates (never in production).
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Additional CA certificates to trust (PEM file).
    pub ca_cert_path: Option<PathBuf>,
}

impl TlsConfig {
    /// Creates a new TLS config builder.
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::default()
    }

    /// Validates the TLS configuration.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.accept_invalid_certs && !cfg!(debug_assertions) {
            return Err(SmtpError::configuration(
                "accept_invalid_certs is not allowed in release builds",
            ));
        }

        if self.accept_invalid_certs {
            tracing::warn!("certificate verification disabled");
        }

        Ok(())
    }

    /// Returns true if the session ends up encrypted when the server cooperates.
    pub fn is_enabled(&self) -> bool {
        self.mode != TlsMode::None
    }
}

/// Builder for TLS configuration.
#[derive(Debug, Default)]
pub struct TlsConfigBuilder {
    config: TlsConfig,
}

impl TlsConfigBuilder {
    /// Sets the TLS mode.
    pub fn mode(mut self, mode: TlsMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Sets the minimum TLS version.
    pub fn min_version(mut self, version: TlsVersion) -> Self {
        self.config.min_version = version;
        self
    }

    /// Sets whether to accept invalid certificates (testing only).
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.config.accept_invalid_certs = accept;
        self
    }

    /// Sets the CA certificate path.
    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ca_cert_path = Some(path.into());
        self
    }

    /// Builds the TLS configuration.
    pub fn build(self) -> SmtpResult<TlsConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// SMTP client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// SMTP server hostname.
    #[serde(default = "default_host")]
    pub host: String,
    /// SMTP server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// TLS configuration.
    #[serde(default)]
    pub tls: TlsConfig,
    /// Authentication username.
    pub username: Option<String>,
    /// Authentication password (never serialized).
    #[serde(skip)]
    pub password: Option<SecretString>,
    /// Preferred authentication method.
    pub auth_method: Option<AuthMethod>,
    /// Connect timeout.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Command timeout.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Maximum message size.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Client identifier for EHLO.
    pub client_id: Option<String>,
}

fn default_host() -> String { DEFAULT_HOST.to_string() }
fn default_port() -> u16 { DEFAULT_PORT }
fn default_connect_timeout() -> Duration { DEFAULT_CONNECT_TIMEOUT }
fn default_command_timeout() -> Duration { DEFAULT_COMMAND_TIMEOUT }
fn default_max_message_size() -> usize { DEFAULT_MAX_MESSAGE_SIZE }

impl SmtpConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> SmtpConfigBuilder {
        SmtpConfigBuilder::default()
    }

    /// Loads configuration from `SMTP_*` environment variables.
    pub fn from_env() -> SmtpResult<Self> {
        SmtpConfigBuilder::from_env()?.build()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.host.trim().is_empty() {
            return Err(SmtpError::configuration("Host is required"));
        }

        if self.port == 0 {
            return Err(SmtpError::configuration("Port must be non-zero"));
        }

        if self.username.is_some() && self.password.is_none() {
            return Err(SmtpError::configuration(format!(
                "A username is configured but no password; set {}",
                env::PASSWORD
            )));
        }

        if self.password.is_some() && self.username.is_none() {
            return Err(SmtpError::configuration("A password is configured but no username"));
        }

        self.tls.validate()?;

        Ok(())
    }

    /// Returns the full server address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns true if authentication is configured.
    pub fn has_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Returns the client identifier for EHLO.
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or(DEFAULT_CLIENT_ID)
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: DEFAULT_PORT,
            tls: TlsConfig::default(),
            username: None,
            password: None,
            auth_method: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            client_id: None,
        }
    }
}

/// Builder for SMTP configuration.
#[derive(Debug, Default)]
pub struct SmtpConfigBuilder {
    host: Option<String>,
    port: Option<u16>,
    tls: TlsConfig,
    username: Option<String>,
    password: Option<SecretString>,
    auth_method: Option<AuthMethod>,
    connect_timeout: Option<Duration>,
    command_timeout: Option<Duration>,
    max_message_size: Option<usize>,
    client_id: Option<String>,
}

impl SmtpConfigBuilder {
    /// Creates a builder seeded from the process environment.
    pub fn from_env() -> SmtpResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates a builder seeded from a variable lookup function.
    ///
    /// Unset and empty variables leave the default in place.
    pub fn from_lookup<F>(lookup: F) -> SmtpResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut builder = Self::default();

        if let Some(host) = get(env::HOST) {
            builder = builder.host(host.trim());
        }

        if let Some(port) = get(env::PORT) {
            let port = port.trim().parse::<u16>().map_err(|e| {
                SmtpError::configuration(format!("Invalid {} {:?}: {}", env::PORT, port, e))
            })?;
            builder = builder.port(port);
        }

        if let Some(username) = get(env::USERNAME) {
            builder = builder.username(username);
        }

        if let Some(password) = lookup(env::PASSWORD).filter(|v| !v.is_empty()) {
            builder = builder.password(password);
        }

        if let Some(mode) = get(env::TLS_MODE) {
            builder = builder.tls_mode(mode.parse()?);
        }

        if let Some(method) = get(env::AUTH_METHOD) {
            builder = builder.auth_method(method.parse()?);
        }

        if let Some(timeout) = get(env::CONNECT_TIMEOUT) {
            builder = builder.connect_timeout(parse_duration(env::CONNECT_TIMEOUT, &timeout)?);
        }

        if let Some(timeout) = get(env::COMMAND_TIMEOUT) {
            builder = builder.command_timeout(parse_duration(env::COMMAND_TIMEOUT, &timeout)?);
        }

        if let Some(client_id) = get(env::CLIENT_ID) {
            builder = builder.client_id(client_id.trim());
        }

        if let Some(path) = get(env::CA_CERT) {
            builder.tls.ca_cert_path = Some(PathBuf::from(path));
        }

        Ok(builder)
    }

    /// Sets the SMTP server host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the SMTP server port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets plain credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Sets the username.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Sets the authentication method.
    pub fn auth_method(mut self, method: AuthMethod) -> Self {
        self.auth_method = Some(method);
        self
    }

    /// Sets the TLS mode.
    pub fn tls_mode(mut self, mode: TlsMode) -> Self {
        self.tls.mode = mode;
        self
    }

    /// Sets the TLS configuration.
    pub fn tls(mut self, config: TlsConfig) -> Self {
        self.tls = config;
        self
    }

    /// Disables TLS (insecure).
    pub fn no_tls(mut self) -> Self {
        self.tls.mode = TlsMode::None;
        self
    }

    /// Sets connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Sets maximum message size.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = Some(size);
        self
    }

    /// Sets the client identifier for EHLO.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> SmtpResult<SmtpConfig> {
        let non_zero = |d: Option<Duration>, default: Duration| match d {
            Some(d) if !d.is_zero() => d,
            _ => default,
        };

        let config = SmtpConfig {
            host: self.host.unwrap_or_else(default_host),
            port: self.port.unwrap_or(DEFAULT_PORT),
            tls: self.tls,
            username: self.username,
            password: self.password,
            auth_method: self.auth_method,
            connect_timeout: non_zero(self.connect_timeout, DEFAULT_CONNECT_TIMEOUT),
            command_timeout: non_zero(self.command_timeout, DEFAULT_COMMAND_TIMEOUT),
            max_message_size: match self.max_message_size {
                Some(size) if size > 0 => size,
                _ => DEFAULT_MAX_MESSAGE_SIZE,
            },
            client_id: self.client_id,
        };

        config.validate()?;
        Ok(config)
    }
}

fn parse_duration(key: &str, value: &str) -> SmtpResult<Duration> {
    humantime::parse_duration(value.trim()).map_err(|e| {
        SmtpError::configuration(format!("Invalid {} {:?}: {}", key, value, e))
    })
}

// Humantime serde support
pub(crate) mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SmtpErrorKind;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_builder() {
        let config = SmtpConfig::builder()
            .host("smtp.example.com")
            .port(2525)
            .credentials("user", "pass")
            .build()
            .unwrap();

        assert_eq!(config.host, "smtp.example.com");
        assert_eq!(config.port, 2525);
        assert_eq!(config.username, Some("user".to_string()));
        assert!(config.has_auth());
    }

    #[test]
    fn test_config_defaults() {
        let config = SmtpConfig::builder().build().unwrap();

        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.command_timeout, DEFAULT_COMMAND_TIMEOUT);
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert_eq!(config.tls.mode, TlsMode::StartTlsRequired);
        assert_eq!(config.client_id(), "localhost");
        assert!(!config.has_auth());
    }

    #[test]
    fn test_username_requires_password() {
        let err = SmtpConfig::builder().username("user").build().unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::ConfigurationInvalid);

        let err = SmtpConfig::builder().password("pass").build().unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::ConfigurationInvalid);
    }

    #[test]
    fn test_config_validation() {
        assert!(SmtpConfig::builder().host("  ").build().is_err());
        assert!(SmtpConfig::builder().port(0).build().is_err());
    }

    #[test]
    fn test_from_lookup() {
        let builder = SmtpConfigBuilder::from_lookup(lookup(&[
            ("SMTP_HOST", "mail.example.org"),
            ("SMTP_PORT", "2587"),
            ("SMTP_USERNAME", "bench@example.org"),
            ("SMTP_PASSWORD", "app-password"),
            ("SMTP_TLS_MODE", "implicit"),
            ("SMTP_AUTH_METHOD", "login"),
            ("SMTP_CONNECT_TIMEOUT", "5s"),
            ("SMTP_COMMAND_TIMEOUT", "2m"),
            ("SMTP_CLIENT_ID", "bench-host"),
            ("SMTP_CA_CERT", "/etc/ssl/extra.pem"),
        ]))
        .unwrap();
        let config = builder.build().unwrap();

        assert_eq!(config.host, "mail.example.org");
        assert_eq!(config.port, 2587);
        assert_eq!(config.username.as_deref(), Some("bench@example.org"));
        assert_eq!(
            config.password.as_ref().map(|p| p.expose_secret().as_str()),
            Some("app-password")
        );
        assert_eq!(config.tls.mode, TlsMode::Implicit);
        assert_eq!(config.auth_method, Some(AuthMethod::Login));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.command_timeout, Duration::from_secs(120));
        assert_eq!(config.client_id(), "bench-host");
        assert_eq!(config.tls.ca_cert_path, Some(PathBuf::from("/etc/ssl/extra.pem")));
    }

    #[test]
    fn test_from_lookup_empty_uses_defaults() {
        let config = SmtpConfigBuilder::from_lookup(lookup(&[("SMTP_HOST", "")]))
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn test_from_lookup_invalid_values() {
        for vars in [
            [("SMTP_PORT", "smtp")],
            [("SMTP_TLS_MODE", "sometimes")],
            [("SMTP_AUTH_METHOD", "xoauth2")],
            [("SMTP_CONNECT_TIMEOUT", "soon")],
        ] {
            let err = SmtpConfigBuilder::from_lookup(lookup(&vars)).unwrap_err();
            assert_eq!(err.kind(), SmtpErrorKind::ConfigurationInvalid);
        }
    }

    #[test]
    fn test_password_not_serialized() {
        let config = SmtpConfig::builder()
            .credentials("user", "hunter2")
            .build()
            .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(json.contains("\"connect_timeout\":\"30s\""));
        assert!(!format!("{:?}", config).contains("hunter2"));
    }

    #[test]
    fn test_tls_config() {
        let tls = TlsConfig::builder()
            .mode(TlsMode::StartTls)
            .min_version(TlsVersion::Tls13)
            .build()
            .unwrap();

        assert_eq!(tls.mode, TlsMode::StartTls);
        assert_eq!(tls.min_version, TlsVersion::Tls13);
        assert!(!tls.accept_invalid_certs);
        assert!(tls.is_enabled());
    }
}
