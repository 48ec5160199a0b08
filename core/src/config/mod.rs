//! Data source configuration: SSH credential, authentication method and the
//! database target reached through the tunnel.
//!
//! A complete [`DataSourceConfig`] can be loaded from a JSON file with
//! [`DataSourceConfig::load`]; the individual pieces are also usable on their
//! own when building a data source programmatically.

pub mod expand;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::EngineKind;
use crate::errors::{CoreError, SessionError};
use crate::port::DEFAULT_PORT_ATTEMPTS;

/// SSH login parsed from a `user@host` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub host: String,
}

impl Credential {
    /// Split `user@host` into its two parts.
    ///
    /// Exactly one `@` with non-empty text on both sides is accepted.
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let parts: Vec<&str> = input.split('@').collect();
        match parts.as_slice() {
            [user, host] if !user.is_empty() && !host.is_empty() => Ok(Self {
                username: (*user).to_string(),
                host: (*host).to_string(),
            }),
            _ => Err(CoreError::InvalidCredential(format!(
                "expected 'user@host', got '{input}'"
            ))),
        }
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.username, self.host)
    }
}

/// How to authenticate against the SSH server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum SshAuth {
    Password {
        password: String,
    },
    #[serde(rename_all = "camelCase")]
    PrivateKey {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
}

impl SshAuth {
    pub fn password(password: impl Into<String>) -> Self {
        SshAuth::Password {
            password: password.into(),
        }
    }

    pub fn private_key(path: impl Into<PathBuf>) -> Self {
        SshAuth::PrivateKey {
            path: path.into(),
            passphrase: None,
        }
    }

    /// Expand `~` in the key path and check that the file exists.
    ///
    /// Password auth passes through unchanged.
    pub fn resolve(self) -> Result<Self, SessionError> {
        match self {
            SshAuth::PrivateKey { path, passphrase } => {
                let path = expand::expand_tilde(&path);
                if !path.is_file() {
                    return Err(SessionError::KeyNotFound(path));
                }
                Ok(SshAuth::PrivateKey { path, passphrase })
            }
            other => Ok(other),
        }
    }

    pub fn method_name(&self) -> &'static str {
        match self {
            SshAuth::Password { .. } => "password",
            SshAuth::PrivateKey { .. } => "privateKey",
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshAuth::Password { .. } => f
                .debug_struct("Password")
                .field("password", &"<redacted>")
                .finish(),
            SshAuth::PrivateKey { path, passphrase } => f
                .debug_struct("PrivateKey")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

/// Reject SSH port 0. Anything above 65535 cannot be represented in `u16`.
pub fn validate_ssh_port(port: u16) -> Result<u16, CoreError> {
    if port == 0 {
        return Err(CoreError::InvalidPort(
            "SSH port must be between 1 and 65535".to_string(),
        ));
    }
    Ok(port)
}

/// The database as seen from the SSH server's network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseTarget {
    pub engine: EngineKind,
    /// Database host relative to the SSH server; `localhost` means co-located.
    #[serde(default = "default_remote_host")]
    pub remote_host: String,
    pub remote_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

/// SSH half of a [`DataSourceConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshSettings {
    /// Login in `user@host` form.
    pub target: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub auth: SshAuth,
}

/// Everything needed to open a tunnelled data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceConfig {
    pub ssh: SshSettings,
    pub database: DatabaseTarget,
    /// Retry budget for picking a free local port.
    #[serde(default = "default_port_attempts")]
    pub port_attempts: u32,
}

impl DataSourceConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(data: &str) -> Result<Self, CoreError> {
        let config: Self = serde_json::from_str(data)
            .map_err(|e| CoreError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let data = fs::read_to_string(path).map_err(|e| {
            CoreError::Config(format!("Failed to read '{}': {e}", path.display()))
        })?;
        Self::from_json(&data)
    }

    /// Check the values serde cannot: credential shape and port ranges.
    pub fn validate(&self) -> Result<(), CoreError> {
        Credential::parse(&self.ssh.target)?;
        validate_ssh_port(self.ssh.port)?;
        if self.database.remote_port == 0 {
            return Err(CoreError::InvalidPort(
                "database port must be between 1 and 65535".to_string(),
            ));
        }
        if self.port_attempts == 0 {
            return Err(CoreError::Config(
                "portAttempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// --- Default value functions ---

pub(crate) fn default_remote_host() -> String {
    "localhost".to_string()
}

pub(crate) fn default_ssh_port() -> u16 {
    22
}

fn default_port_attempts() -> u32 {
    DEFAULT_PORT_ATTEMPTS
}
