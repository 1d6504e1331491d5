//! `switchboard hostname` — manage the trusted hostname allow-list.

use clap::Subcommand;
use std::path::PathBuf;
use switchboard_core::SwitchboardResult;
use switchboard_manager::Store;

#[derive(Subcommand)]
pub enum HostnameAction {
    /// Add trusted hostnames
    Add { names: Vec<String> },
    /// Remove trusted hostnames
    Remove { names: Vec<String> },
    /// List the trusted hostnames
    List,
}

pub fn run(action: HostnameAction, database: Option<PathBuf>) -> SwitchboardResult<()> {
    let store = Store::open(&crate::database_path(database))?;
    match action {
        HostnameAction::Add { names } => {
            for name in names {
                store.insert_hostname(&name)?;
                println!("added {name}");
            }
        }
        HostnameAction::Remove { names } => {
            for name in names {
                store.delete_hostname(&name)?;
                println!("removed {name}");
            }
        }
        HostnameAction::List => {
            for name in store.hostnames()? {
                println!("{name}");
            }
        }
    }
    Ok(())
}
