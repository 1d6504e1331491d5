//! Maintenance subcommands of the switchboard CLI.

pub mod certdump;
pub mod certgen;
pub mod delete;
pub mod hostname;
pub mod keygen;
pub mod user;
