//! Manager configuration: TOML file + CLI overrides.
//!
//! All persisted state lives under a single home directory, by default
//! `~/.switchboard` (override with the `SWITCHBOARD_HOME` environment
//! variable): `certs/` for certificates, `keys/` for private keys, and
//! `manager.sqlite3` for the credential store.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use switchboard_core::constants::{
    DEFAULT_READ_LIMIT, HANDSHAKE_TIMEOUT, PORT, SHUTDOWN_GRACE,
};
use switchboard_core::{SwitchboardError, SwitchboardResult};
use tracing::info;

/// Which authentication mode the manager enforces after the handshake.
///
/// At most one mode is active per manager instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthPolicy {
    /// Everyone who completes the handshake is admitted.
    #[default]
    None,
    /// The TLS peer certificate fingerprint must be in the allow-list.
    Certificate,
    /// The peer address must resolve to a trusted hostname.
    Hostname,
    /// The peer must present a username and password.
    Login,
}

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub manager: ManagerSection,
    #[serde(default)]
    pub auth: AuthSection,
}

/// `[manager]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerSection {
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    #[serde(default)]
    pub disable_tls: bool,
    pub database: Option<String>,
    #[serde(default = "default_read_limit")]
    pub read_limit: usize,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            cert_file: None,
            key_file: None,
            disable_tls: false,
            database: None,
            read_limit: default_read_limit(),
            handshake_timeout_secs: default_handshake_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    /// One of "none", "certificate", "hostname", "login".
    pub mode: Option<String>,
}

fn default_port() -> u16 {
    PORT
}
fn default_read_limit() -> usize {
    DEFAULT_READ_LIMIT
}
fn default_handshake_timeout() -> u64 {
    HANDSHAKE_TIMEOUT.as_secs()
}
fn default_shutdown_grace() -> u64 {
    SHUTDOWN_GRACE.as_secs()
}

/// Resolved manager configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Host to bind; `None` binds the wildcard address.
    pub host: Option<String>,
    /// Port to bind (0 asks the OS for an ephemeral port).
    pub port: u16,
    /// TLS certificate PEM path.
    pub cert_file: PathBuf,
    /// TLS private key PEM path.
    pub key_file: PathBuf,
    /// Passphrase for the private key, when one was set.
    pub key_file_password: Option<String>,
    /// Serve plain TCP instead of TLS.
    pub disable_tls: bool,
    /// Authentication mode enforced after the handshake.
    pub auth: AuthPolicy,
    /// Path of the credential store (`:memory:` for an in-memory store).
    pub database: PathBuf,
    /// Per-session frame size limit in bytes.
    pub read_limit: usize,
    /// Deadline for a connecting peer to finish the handshake.
    pub handshake_timeout: Duration,
    /// How long a draining manager waits for in-flight requests.
    pub shutdown_grace: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: PORT,
            cert_file: default_cert_file(),
            key_file: default_key_file(),
            key_file_password: None,
            disable_tls: false,
            auth: AuthPolicy::None,
            database: default_database(),
            read_limit: DEFAULT_READ_LIMIT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }
}

/// CLI overrides for the `start` command, merged over the config file.
#[derive(Debug, Clone, Default)]
pub struct StartOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub key_file_password: Option<String>,
    pub disable_tls: bool,
    pub auth: Option<AuthPolicy>,
    pub database: Option<String>,
}

impl ManagerConfig {
    /// Load configuration from a TOML file, then apply CLI overrides.
    ///
    /// A missing config file silently falls back to defaults; a file that
    /// exists but does not parse is an error.
    pub fn load(config_path: Option<&Path>, cli: StartOverrides) -> SwitchboardResult<Self> {
        let file = match config_path {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(path)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| SwitchboardError::Config(format!("config parse error: {e}")))?
            }
            _ => ConfigFile::default(),
        };

        let auth = match cli.auth {
            Some(mode) => mode,
            None => match file.auth.mode.as_deref() {
                None | Some("none") => AuthPolicy::None,
                Some("certificate") => AuthPolicy::Certificate,
                Some("hostname") => AuthPolicy::Hostname,
                Some("login") => AuthPolicy::Login,
                Some(other) => {
                    return Err(SwitchboardError::Config(format!(
                        "unknown auth mode {other:?} in config file"
                    )))
                }
            },
        };

        let disable_tls = cli.disable_tls || file.manager.disable_tls;
        let config = Self {
            host: cli.host.or(file.manager.host),
            port: cli.port.unwrap_or(file.manager.port),
            cert_file: cli
                .cert_file
                .or(file.manager.cert_file)
                .map(|s| expand_tilde(&s))
                .unwrap_or_else(default_cert_file),
            key_file: cli
                .key_file
                .or(file.manager.key_file)
                .map(|s| expand_tilde(&s))
                .unwrap_or_else(default_key_file),
            key_file_password: cli.key_file_password,
            disable_tls,
            auth,
            database: cli
                .database
                .or(file.manager.database)
                .map(|s| expand_tilde(&s))
                .unwrap_or_else(default_database),
            read_limit: file.manager.read_limit,
            handshake_timeout: Duration::from_secs(file.manager.handshake_timeout_secs),
            shutdown_grace: Duration::from_secs(file.manager.shutdown_grace_secs),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject impossible combinations before binding anything.
    pub fn validate(&self) -> SwitchboardResult<()> {
        if self.auth == AuthPolicy::Certificate && self.disable_tls {
            return Err(SwitchboardError::Config(
                "certificate authentication requires TLS to be enabled".into(),
            ));
        }
        Ok(())
    }
}

/// The directory holding all persisted manager state.
pub fn home_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SWITCHBOARD_HOME") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".switchboard")
}

/// Default directory for PEM certificates.
pub fn cert_dir() -> PathBuf {
    home_dir().join("certs")
}

/// Default directory for private keys.
pub fn key_dir() -> PathBuf {
    home_dir().join("keys")
}

/// Default path of the credential store.
pub fn default_database() -> PathBuf {
    home_dir().join("manager.sqlite3")
}

fn default_cert_file() -> PathBuf {
    cert_dir().join(format!("{}.pem", local_hostname()))
}

fn default_key_file() -> PathBuf {
    key_dir().join(format!("{}.pem", local_hostname()))
}

/// The hostname this machine identifies itself with.
pub fn local_hostname() -> String {
    whoami::fallible::hostname().unwrap_or_else(|_| "localhost".into())
}

fn expand_tilde(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
