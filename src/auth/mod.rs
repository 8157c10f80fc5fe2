//! Authentication mechanisms for SMTP.
//!
//! Supports username/password authentication methods:
//! - PLAIN (RFC 4616)
//! - LOGIN (obsolete but widely used)
//! - CRAM-MD5 (RFC 2195)

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use md5::Md5;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::SmtpConfig;
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};

/// Authentication methods supported by the SMTP client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// PLAIN authentication (RFC 4616).
    Plain,
    /// LOGIN authentication (obsolete).
    Login,
    /// CRAM-MD5 challenge-response.
    CramMd5,
}

impl AuthMethod {
    /// Returns the SMTP AUTH mechanism name.
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            AuthMethod::Plain => "PLAIN",
            AuthMethod::Login => "LOGIN",
            AuthMethod::CramMd5 => "CRAM-MD5",
        }
    }

    /// Returns the priority for auto-selection (higher is better).
    pub fn priority(&self) -> u8 {
        match self {
            AuthMethod::CramMd5 => 3,
            AuthMethod::Plain => 2,
            AuthMethod::Login => 1,
        }
    }

    /// Parses from SMTP capability string.
    pub fn from_capability(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(AuthMethod::Plain),
            "LOGIN" => Some(AuthMethod::Login),
            "CRAM-MD5" => Some(AuthMethod::CramMd5),
            _ => None,
        }
    }

    /// Returns true if this method sends the password in the clear.
    pub fn requires_tls(&self) -> bool {
        matches!(self, AuthMethod::Plain | AuthMethod::Login)
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mechanism_name())
    }
}

impl FromStr for AuthMethod {
    type Err = SmtpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" => Ok(AuthMethod::Plain),
            "login" => Ok(AuthMethod::Login),
            "cram_md5" | "cram-md5" => Ok(AuthMethod::CramMd5),
            other => Err(SmtpError::configuration(format!(
                "Unknown auth method {:?} (expected plain, login or cram_md5)",
                other
            ))),
        }
    }
}

/// Credential types for authentication.
#[derive(Clone)]
pub enum Credentials {
    /// Plain username and password.
    Plain {
        /// Username.
        username: String,
        /// Password (protected).
        password: SecretString,
    },
}

impl Credentials {
    /// Creates plain credentials.
    pub fn plain(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Plain {
            username: username.into(),
            password: SecretString::new(password.into()),
        }
    }

    /// Returns the credentials held by a configuration, if any.
    pub fn from_config(config: &SmtpConfig) -> Option<Self> {
        match (&config.username, &config.password) {
            (Some(username), Some(password)) => Some(Self::Plain {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    /// Returns the username.
    pub fn username(&self) -> &str {
        match self {
            Credentials::Plain { username, .. } => username,
        }
    }

    /// Returns the compatible authentication methods.
    pub fn compatible_methods(&self) -> &'static [AuthMethod] {
        match self {
            Credentials::Plain { .. } => &[AuthMethod::Plain, AuthMethod::Login, AuthMethod::CramMd5],
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Plain { username, .. } => f
                .debug_struct("Plain")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
        }
    }
}

/// Source of credentials for a session.
#[async_trait]
pub trait CredentialProvider: Send + Sync + fmt::Debug {
    /// Returns the current credentials.
    async fn get_credentials(&self) -> SmtpResult<Credentials>;
}

/// Static credential provider.
#[derive(Debug, Clone)]
pub struct StaticCredentialProvider {
    credentials: Credentials,
}

impl StaticCredentialProvider {
    /// Creates a new static provider.
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    /// Creates a provider with plain credentials.
    pub fn plain(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new(Credentials::plain(username, password))
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn get_credentials(&self) -> SmtpResult<Credentials> {
        Ok(self.credentials.clone())
    }
}

/// Authentication mechanism implementation.
pub struct Authenticator;

impl Authenticator {
    /// Generates the initial response for PLAIN authentication.
    pub fn plain_initial_response(username: &str, password: &SecretString) -> String {
        // Format: \0username\0password
        let response = format!("\0{}\0{}", username, password.expose_secret());
        BASE64.encode(response)
    }

    /// Generates LOGIN username response.
    pub fn login_username(username: &str) -> String {
        BASE64.encode(username)
    }

    /// Generates LOGIN password response.
    pub fn login_password(password: &SecretString) -> String {
        BASE64.encode(password.expose_secret())
    }

    /// Generates CRAM-MD5 response.
    pub fn cram_md5_response(
        challenge: &str,
        username: &str,
        password: &SecretString,
    ) -> SmtpResult<String> {
        let challenge_bytes = BASE64
            .decode(challenge.trim())
            .map_err(|e| SmtpError::authentication(format!("Invalid CRAM-MD5 challenge: {}", e)))?;

        type HmacMd5 = Hmac<Md5>;
        let mut mac = HmacMd5::new_from_slice(password.expose_secret().as_bytes())
            .map_err(|e| SmtpError::authentication(format!("HMAC error: {}", e)))?;
        mac.update(&challenge_bytes);
        let digest = mac.finalize().into_bytes();

        // Format: username space hex-digest
        let hex_digest: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        let response = format!("{} {}", username, hex_digest);
        Ok(BASE64.encode(response))
    }

    /// Selects the authentication method to use.
    ///
    /// A `preferred` method must be advertised and allowed on the current
    /// connection. Otherwise the highest priority usable method wins.
    pub fn select_method(
        available: &[AuthMethod],
        credentials: &Credentials,
        preferred: Option<AuthMethod>,
        tls_enabled: bool,
    ) -> SmtpResult<AuthMethod> {
        let compatible = credentials.compatible_methods();
        let usable = |m: &AuthMethod| compatible.contains(m) && (!m.requires_tls() || tls_enabled);

        if let Some(method) = preferred {
            if !available.contains(&method) {
                return Err(SmtpError::new(
                    SmtpErrorKind::AuthMethodNotSupported,
                    format!("Server does not advertise AUTH {}", method),
                ));
            }
            if !usable(&method) {
                return Err(SmtpError::new(
                    SmtpErrorKind::AuthMethodNotSupported,
                    format!("AUTH {} requires an encrypted connection", method),
                ));
            }
            return Ok(method);
        }

        available
            .iter()
            .filter(|m| usable(m))
            .max_by_key(|m| m.priority())
            .copied()
            .ok_or_else(|| {
                SmtpError::new(
                    SmtpErrorKind::AuthMethodNotSupported,
                    "No compatible authentication method available",
                )
            })
    }
}
