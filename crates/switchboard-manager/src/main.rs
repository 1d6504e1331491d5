//! switchboard — the manager CLI.
//!
//! `start` runs a manager; the other subcommands maintain the persisted
//! state it relies on: TLS certificates and keys, trusted hostnames, login
//! users, and the credential store itself.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use switchboard_core::constants::PORT;
use switchboard_core::SwitchboardResult;
use switchboard_manager::config::{self, AuthPolicy, StartOverrides};
use switchboard_manager::{telemetry, Manager, ManagerConfig};
use tracing::error;

/// switchboard — JSON-over-TLS request router
#[derive(Parser)]
#[command(name = "switchboard", version, about = "JSON-over-TLS request router")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a manager
    Start {
        /// Host to bind (default: all interfaces)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(long, default_value_t = PORT)]
        port: u16,

        /// TLS certificate PEM file
        #[arg(long)]
        cert_file: Option<String>,

        /// TLS private key PEM file
        #[arg(long)]
        key_file: Option<String>,

        /// Passphrase of the private key
        #[arg(long)]
        key_file_password: Option<String>,

        /// Serve plain TCP instead of TLS
        #[arg(long)]
        disable_tls: bool,

        /// Only admit peers from trusted hostnames
        #[arg(long)]
        auth_hostname: bool,

        /// Require a username/password login
        #[arg(long)]
        auth_login: bool,

        /// Only admit peers with an allow-listed certificate
        #[arg(long)]
        auth_cert: bool,

        /// Credential store path
        #[arg(long)]
        database: Option<String>,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Generate a self-signed TLS certificate
    Certgen {
        /// Common name of the certificate (default: this hostname)
        name: Option<String>,

        /// Where to write the certificate PEM
        #[arg(long)]
        out: Option<PathBuf>,

        /// Sign with an existing private key instead of a new one
        #[arg(long)]
        key_file: Option<PathBuf>,

        /// Certificate lifetime in years
        #[arg(long, default_value_t = 100)]
        years_valid: u32,
    },

    /// Generate a private key
    Keygen {
        /// Where to write the key PEM
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Print the fingerprints of the certificates in a PEM file
    Certdump {
        /// Certificate PEM file
        file: PathBuf,
    },

    /// Manage the trusted hostname allow-list
    Hostname {
        #[command(subcommand)]
        action: commands::hostname::HostnameAction,

        /// Credential store path
        #[arg(long, global = true)]
        database: Option<PathBuf>,
    },

    /// Manage login users
    User {
        #[command(subcommand)]
        action: commands::user::UserAction,

        /// Credential store path
        #[arg(long, global = true)]
        database: Option<PathBuf>,
    },

    /// Delete persisted state
    Delete {
        /// What to delete
        #[arg(value_enum)]
        target: commands::delete::DeleteTarget,

        /// Credential store path
        #[arg(long)]
        database: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _telemetry = match telemetry::init(&cli.log_level, cli.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("switchboard: cannot initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = dispatch(cli.command).await;
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("switchboard: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(command: Command) -> SwitchboardResult<()> {
    match command {
        Command::Start {
            host,
            port,
            cert_file,
            key_file,
            key_file_password,
            disable_tls,
            auth_hostname,
            auth_login,
            auth_cert,
            database,
            config,
        } => {
            let auth = auth_policy(auth_hostname, auth_login, auth_cert)?;
            let overrides = StartOverrides {
                host,
                port: Some(port),
                cert_file,
                key_file,
                key_file_password,
                disable_tls,
                auth,
                database,
            };
            let config = ManagerConfig::load(config.as_deref(), overrides)?;
            let manager = Manager::bind(config).await?;
            manager.run().await
        }
        Command::Certgen {
            name,
            out,
            key_file,
            years_valid,
        } => commands::certgen::run(name, out, key_file, years_valid),
        Command::Keygen { out } => commands::keygen::run(out),
        Command::Certdump { file } => commands::certdump::run(&file),
        Command::Hostname { action, database } => commands::hostname::run(action, database),
        Command::User { action, database } => commands::user::run(action, database),
        Command::Delete { target, database } => commands::delete::run(target, database),
    }
}

/// At most one authentication mode may be selected.
fn auth_policy(
    hostname: bool,
    login: bool,
    cert: bool,
) -> SwitchboardResult<Option<AuthPolicy>> {
    match (hostname, login, cert) {
        (false, false, false) => Ok(None),
        (true, false, false) => Ok(Some(AuthPolicy::Hostname)),
        (false, true, false) => Ok(Some(AuthPolicy::Login)),
        (false, false, true) => Ok(Some(AuthPolicy::Certificate)),
        _ => Err(switchboard_core::SwitchboardError::Config(
            "choose at most one of --auth-hostname, --auth-login, --auth-cert".into(),
        )),
    }
}

// Keep the default paths in one place for the subcommands.
pub(crate) fn database_path(database: Option<PathBuf>) -> PathBuf {
    database.unwrap_or_else(config::default_database)
}
