//! `switchboard keygen` — create a private key.

use std::path::PathBuf;
use switchboard_core::SwitchboardResult;
use switchboard_manager::config::{key_dir, local_hostname};
use switchboard_manager::tls;

pub fn run(out: Option<PathBuf>) -> SwitchboardResult<()> {
    let key_pem = tls::generate_key_pem()?;
    let path = out.unwrap_or_else(|| key_dir().join(format!("{}.pem", local_hostname())));
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(&path, key_pem)?;
    println!("created private key {}", path.display());
    Ok(())
}
