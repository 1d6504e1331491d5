//! `switchboard certgen` — create a self-signed certificate.

use std::path::PathBuf;
use switchboard_core::SwitchboardResult;
use switchboard_manager::config::{cert_dir, key_dir, local_hostname};
use switchboard_manager::tls;

pub fn run(
    name: Option<String>,
    out: Option<PathBuf>,
    key_file: Option<PathBuf>,
    years_valid: u32,
) -> SwitchboardResult<()> {
    let common_name = name.unwrap_or_else(local_hostname);
    let existing_key = key_file
        .as_deref()
        .map(std::fs::read_to_string)
        .transpose()?;

    let (cert_pem, key_pem) =
        tls::generate_certificate(&common_name, existing_key.as_deref(), years_valid)?;

    let cert_path = out.unwrap_or_else(|| cert_dir().join(format!("{common_name}.pem")));
    write_creating_dirs(&cert_path, &cert_pem)?;
    println!("created certificate {}", cert_path.display());

    // A fresh key is only written when no existing one was supplied.
    if key_file.is_none() {
        let key_path = key_dir().join(format!("{common_name}.pem"));
        write_creating_dirs(&key_path, &key_pem)?;
        println!("created private key {}", key_path.display());
    }
    Ok(())
}

fn write_creating_dirs(path: &std::path::Path, content: &str) -> SwitchboardResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, content)?;
    Ok(())
}
