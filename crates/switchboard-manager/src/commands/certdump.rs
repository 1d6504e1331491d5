//! `switchboard certdump` — print certificate fingerprints.

use std::path::Path;
use switchboard_core::SwitchboardResult;
use switchboard_manager::tls;

pub fn run(file: &Path) -> SwitchboardResult<()> {
    let fingerprints = tls::certificate_fingerprints(file)?;
    println!("{}", file.display());
    for (index, (fingerprint, der_len)) in fingerprints.iter().enumerate() {
        println!("  certificate {index}: {der_len} bytes DER");
        println!("  sha256 fingerprint: {fingerprint}");
    }
    Ok(())
}
