//! Settings queries: persistent key/value pairs.
//!
//! Holds the server's network identity key and other values that must
//! survive restarts outside the config file.

use rusqlite::{params, Connection, OptionalExtension};

use crate::Result;

/// Key under which the server's Ed25519 network private key is stored
/// (hex-encoded).
pub const NETWORK_PRIVATE_KEY: &str = "network_private_key";

/// Fetch a setting.
pub fn get(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(value)
}

/// Insert or overwrite a setting.
pub fn set(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        crate::open_memory().expect("open test db")
    }

    #[test]
    fn test_get_missing() {
        let conn = test_db();
        assert!(get(&conn, "nope").expect("get").is_none());
    }

    #[test]
    fn test_set_and_get() {
        let conn = test_db();
        set(&conn, NETWORK_PRIVATE_KEY, "deadbeef").expect("set");
        assert_eq!(
            get(&conn, NETWORK_PRIVATE_KEY).expect("get").as_deref(),
            Some("deadbeef")
        );
    }

    #[test]
    fn test_overwrite() {
        let conn = test_db();
        set(&conn, "k", "v1").expect("set");
        set(&conn, "k", "v2").expect("set");
        assert_eq!(get(&conn, "k").expect("get").as_deref(), Some("v2"));
    }
}
