//! `switchboard user` — manage login users.

use clap::Subcommand;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use switchboard_core::SwitchboardResult;
use switchboard_manager::Store;

#[derive(Subcommand)]
pub enum UserAction {
    /// Register a user (prompts for the password when omitted)
    Add {
        username: String,
        password: Option<String>,
        /// Grant admin rights
        #[arg(long)]
        admin: bool,
    },
    /// Remove a user
    Remove { username: String },
    /// List the registered users
    List,
}

pub fn run(action: UserAction, database: Option<PathBuf>) -> SwitchboardResult<()> {
    let store = Store::open(&crate::database_path(database))?;
    match action {
        UserAction::Add {
            username,
            password,
            admin,
        } => {
            let password = match password {
                Some(password) => password,
                None => prompt_password(&username)?,
            };
            store.insert_user(&username, &password, admin)?;
            println!("added {username}{}", if admin { " (admin)" } else { "" });
        }
        UserAction::Remove { username } => {
            store.delete_user(&username)?;
            println!("removed {username}");
        }
        UserAction::List => {
            for (username, admin) in store.users()? {
                println!("{username}{}", if admin { " (admin)" } else { "" });
            }
        }
    }
    Ok(())
}

fn prompt_password(username: &str) -> SwitchboardResult<String> {
    eprint!("password for {username}: ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
