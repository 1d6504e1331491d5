//! The credential store: an embedded SQLite database.
//!
//! Four tables back the manager:
//!
//! - `users` — login records: username, 16-byte salt, salted SHA-256
//!   password hash, admin flag.
//! - `hostnames` — trusted hostnames for hostname authentication, seeded
//!   with the localhost aliases on first creation.
//! - `certificates` — allow-listed peer-certificate SHA-256 fingerprints.
//! - `connections` — an audit log of connection events.
//!
//! The connection lives behind a `Mutex`; callers on the event loop wrap
//! store calls in `spawn_blocking` so disk stalls never block routing.

use crate::config::local_hostname;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use switchboard_core::{SwitchboardError, SwitchboardResult};
use tracing::debug;

const SALT_LEN: usize = 16;

pub struct Store {
    conn: Mutex<Connection>,
    path: String,
}

impl Store {
    /// Open (creating if necessary) the store at `path`.
    ///
    /// The literal path `:memory:` opens a connection to a database held in
    /// RAM, which is what the tests use.
    pub fn open(path: &Path) -> SwitchboardResult<Self> {
        let display = path.display().to_string();
        if display != ":memory:" {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| SwitchboardError::Database(format!("cannot open {display}: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
            path: display,
        };
        store.init_schema()?;
        store.seed_localhost_aliases()?;
        debug!(path = %store.path, "credential store ready");
        Ok(store)
    }

    /// Path this store was opened with.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn init_schema(&self) -> SwitchboardResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                pid INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                key BLOB NOT NULL,
                salt BLOB NOT NULL,
                is_admin BOOLEAN NOT NULL,
                UNIQUE(username)
            );

            CREATE TABLE IF NOT EXISTS hostnames (
                hostname TEXT NOT NULL,
                UNIQUE(hostname)
            );

            CREATE TABLE IF NOT EXISTS certificates (
                fingerprint TEXT NOT NULL,
                UNIQUE(fingerprint)
            );

            CREATE TABLE IF NOT EXISTS connections (
                pid INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                address TEXT NOT NULL,
                name TEXT NOT NULL,
                port INTEGER NOT NULL,
                message TEXT NOT NULL
            );
            "#,
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// First-run seeding so a localhost manager accepts local peers in
    /// hostname mode without any setup.
    fn seed_localhost_aliases(&self) -> SwitchboardResult<()> {
        if self.hostnames()?.is_empty() {
            for alias in localhost_aliases() {
                self.insert_hostname(&alias)?;
            }
        }
        Ok(())
    }

    fn lock(&self) -> SwitchboardResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SwitchboardError::Database(format!("store lock poisoned: {e}")))
    }

    // ── users ───────────────────────────────────────────────────────

    /// Insert a new user; the password is stored as a salted SHA-256 hash.
    pub fn insert_user(
        &self,
        username: &str,
        password: &str,
        is_admin: bool,
    ) -> SwitchboardResult<()> {
        if password.is_empty() {
            return Err(SwitchboardError::Database(
                "the password cannot be an empty string".into(),
            ));
        }
        if username.is_empty() {
            return Err(SwitchboardError::Database(
                "the username cannot be an empty string".into(),
            ));
        }
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let key = hash_password(&salt, password);
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO users VALUES(NULL, ?1, ?2, ?3, ?4);",
            params![username, key, salt.as_slice(), is_admin],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                SwitchboardError::Database(format!(
                    "a user with the name {username:?} already exists"
                ))
            }
            other => db_err(other),
        })?;
        Ok(())
    }

    /// Delete a user; unknown usernames are an error.
    pub fn delete_user(&self, username: &str) -> SwitchboardResult<()> {
        let conn = self.lock()?;
        let deleted = conn
            .execute("DELETE FROM users WHERE username = ?1;", params![username])
            .map_err(db_err)?;
        if deleted == 0 {
            return Err(SwitchboardError::Database(format!(
                "no user named {username:?} is registered"
            )));
        }
        Ok(())
    }

    /// All `(username, is_admin)` pairs.
    pub fn users(&self) -> SwitchboardResult<Vec<(String, bool)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT username, is_admin FROM users ORDER BY username;")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    /// Whether a user with this name exists.
    pub fn is_user_registered(&self, username: &str) -> SwitchboardResult<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT pid FROM users WHERE username = ?1;",
                params![username],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(found.is_some())
    }

    /// Check a plain-text password against the stored salted hash.
    pub fn is_password_valid(&self, username: &str, password: &str) -> SwitchboardResult<bool> {
        let conn = self.lock()?;
        let record: Option<(Vec<u8>, Vec<u8>)> = conn
            .query_row(
                "SELECT key, salt FROM users WHERE username = ?1;",
                params![username],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;
        match record {
            Some((key, salt)) => Ok(hash_password(&salt, password) == key),
            None => Ok(false),
        }
    }

    /// Whether the user has admin rights.
    pub fn is_admin(&self, username: &str) -> SwitchboardResult<bool> {
        let conn = self.lock()?;
        let admin: Option<bool> = conn
            .query_row(
                "SELECT is_admin FROM users WHERE username = ?1;",
                params![username],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(admin.unwrap_or(false))
    }

    // ── hostnames ───────────────────────────────────────────────────

    /// Insert a trusted hostname (idempotent).
    pub fn insert_hostname(&self, hostname: &str) -> SwitchboardResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO hostnames VALUES(?1);",
            params![hostname],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Delete a trusted hostname; unknown names are an error.
    pub fn delete_hostname(&self, hostname: &str) -> SwitchboardResult<()> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM hostnames WHERE hostname = ?1;",
                params![hostname],
            )
            .map_err(db_err)?;
        if deleted == 0 {
            return Err(SwitchboardError::Database(format!(
                "{hostname:?} is not a trusted hostname"
            )));
        }
        Ok(())
    }

    /// All trusted hostnames.
    pub fn hostnames(&self) -> SwitchboardResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT hostname FROM hostnames ORDER BY hostname;")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    // ── certificates ────────────────────────────────────────────────

    /// Allow-list a peer-certificate fingerprint (idempotent).
    pub fn insert_certificate(&self, fingerprint: &str) -> SwitchboardResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO certificates VALUES(?1);",
            params![fingerprint.to_ascii_lowercase()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Remove a fingerprint from the allow-list.
    pub fn delete_certificate(&self, fingerprint: &str) -> SwitchboardResult<()> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM certificates WHERE fingerprint = ?1;",
                params![fingerprint.to_ascii_lowercase()],
            )
            .map_err(db_err)?;
        if deleted == 0 {
            return Err(SwitchboardError::Database(format!(
                "{fingerprint:?} is not an allow-listed fingerprint"
            )));
        }
        Ok(())
    }

    /// Whether this fingerprint is allow-listed.
    pub fn is_certificate_trusted(&self, fingerprint: &str) -> SwitchboardResult<bool> {
        let conn = self.lock()?;
        let found: Option<String> = conn
            .query_row(
                "SELECT fingerprint FROM certificates WHERE fingerprint = ?1;",
                params![fingerprint.to_ascii_lowercase()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(found.is_some())
    }

    // ── connections log ─────────────────────────────────────────────

    /// Append an audit record about a connection event.
    ///
    /// `address` is the peer's `host:port`; host and port land in their
    /// own columns.
    pub fn log_connection(&self, address: &str, name: &str, message: &str) -> SwitchboardResult<()> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs().to_string())
            .unwrap_or_default();
        let (host, port) = split_address(address);
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO connections VALUES(NULL, ?1, ?2, ?3, ?4, ?5);",
            params![timestamp, host, name, port, message],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// All audit records, as `(address, name, port, message)` rows.
    pub fn connections(&self) -> SwitchboardResult<Vec<(String, String, i64, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT address, name, port, message FROM connections ORDER BY pid;")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }
}

/// Split a `host:port` peer address; IPv6 hosts arrive bracketed. An
/// address with no parseable port records port 0.
fn split_address(address: &str) -> (String, i64) {
    match address.rsplit_once(':') {
        Some((host, port)) => match port.parse::<i64>() {
            Ok(port) => (
                host.trim_start_matches('[').trim_end_matches(']').to_string(),
                port,
            ),
            Err(_) => (address.to_string(), 0),
        },
        None => (address.to_string(), 0),
    }
}

/// Salted SHA-256: hash over salt ‖ password.
fn hash_password(salt: &[u8], password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

fn db_err(e: rusqlite::Error) -> SwitchboardError {
    SwitchboardError::Database(e.to_string())
}

/// Aliases a localhost peer may appear as.
pub fn localhost_aliases() -> Vec<String> {
    vec![
        local_hostname(),
        "localhost".into(),
        "127.0.0.1".into(),
        "::1".into(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn memory_store() -> Store {
        Store::open(&PathBuf::from(":memory:")).unwrap()
    }

    #[test]
    fn password_round_trip() {
        let store = memory_store();
        store.insert_user("alice", "hunter2", false).unwrap();
        assert!(store.is_password_valid("alice", "hunter2").unwrap());
        assert!(!store.is_password_valid("alice", "hunter3").unwrap());
        assert!(!store.is_password_valid("bob", "hunter2").unwrap());
    }

    #[test]
    fn duplicate_user_is_rejected() {
        let store = memory_store();
        store.insert_user("alice", "a", false).unwrap();
        assert!(store.insert_user("alice", "b", false).is_err());
    }

    #[test]
    fn empty_password_is_rejected() {
        let store = memory_store();
        assert!(store.insert_user("alice", "", false).is_err());
    }

    #[test]
    fn admin_flag_is_persisted() {
        let store = memory_store();
        store.insert_user("root", "toor", true).unwrap();
        store.insert_user("alice", "a", false).unwrap();
        assert!(store.is_admin("root").unwrap());
        assert!(!store.is_admin("alice").unwrap());
        assert!(!store.is_admin("nobody").unwrap());
    }

    #[test]
    fn delete_user() {
        let store = memory_store();
        store.insert_user("alice", "a", false).unwrap();
        store.delete_user("alice").unwrap();
        assert!(!store.is_user_registered("alice").unwrap());
        assert!(store.delete_user("alice").is_err());
    }

    #[test]
    fn hostnames_are_seeded_with_localhost_aliases() {
        let store = memory_store();
        let hostnames = store.hostnames().unwrap();
        assert!(hostnames.contains(&"localhost".to_string()));
        assert!(hostnames.contains(&"127.0.0.1".to_string()));
    }

    #[test]
    fn hostname_insert_is_idempotent() {
        let store = memory_store();
        store.insert_hostname("lab-pc").unwrap();
        store.insert_hostname("lab-pc").unwrap();
        let count = store
            .hostnames()
            .unwrap()
            .iter()
            .filter(|h| *h == "lab-pc")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn certificate_allow_list() {
        let store = memory_store();
        let fp = "AB".repeat(32);
        store.insert_certificate(&fp).unwrap();
        assert!(store.is_certificate_trusted(&fp).unwrap());
        assert!(store.is_certificate_trusted(&fp.to_ascii_lowercase()).unwrap());
        store.delete_certificate(&fp).unwrap();
        assert!(!store.is_certificate_trusted(&fp).unwrap());
    }

    #[test]
    fn connection_log_splits_host_and_port() {
        let store = memory_store();
        store
            .log_connection("127.0.0.1:50000", "Echo", "connected")
            .unwrap();
        store
            .log_connection("[::1]:50001", "probe", "disconnected")
            .unwrap();
        let records = store.connections().unwrap();
        assert_eq!(
            records[0],
            (
                "127.0.0.1".to_string(),
                "Echo".to_string(),
                50000,
                "connected".to_string()
            )
        );
        assert_eq!(records[1].0, "::1");
        assert_eq!(records[1].2, 50001);
    }

    #[test]
    fn split_address_handles_odd_inputs() {
        assert_eq!(split_address("10.0.0.5:1875"), ("10.0.0.5".into(), 1875));
        assert_eq!(split_address("[::1]:1875"), ("::1".into(), 1875));
        assert_eq!(split_address("lab-pc"), ("lab-pc".into(), 0));
        assert_eq!(split_address("lab-pc:http"), ("lab-pc:http".into(), 0));
    }
}
