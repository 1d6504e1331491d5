//! `switchboard delete` — remove persisted state.

use clap::ValueEnum;
use std::path::PathBuf;
use switchboard_core::SwitchboardResult;
use switchboard_manager::config::{cert_dir, key_dir};

#[derive(Clone, Copy, ValueEnum)]
pub enum DeleteTarget {
    /// The certificate directory
    Certs,
    /// The private key directory
    Keys,
    /// The credential store
    Database,
    /// Everything above
    All,
}

pub fn run(target: DeleteTarget, database: Option<PathBuf>) -> SwitchboardResult<()> {
    let database = crate::database_path(database);
    match target {
        DeleteTarget::Certs => remove_dir(&cert_dir())?,
        DeleteTarget::Keys => remove_dir(&key_dir())?,
        DeleteTarget::Database => remove_file(&database)?,
        DeleteTarget::All => {
            remove_dir(&cert_dir())?;
            remove_dir(&key_dir())?;
            remove_file(&database)?;
        }
    }
    Ok(())
}

fn remove_dir(path: &std::path::Path) -> SwitchboardResult<()> {
    if path.exists() {
        std::fs::remove_dir_all(path)?;
        println!("deleted {}", path.display());
    }
    Ok(())
}

fn remove_file(path: &std::path::Path) -> SwitchboardResult<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
        println!("deleted {}", path.display());
    }
    Ok(())
}
