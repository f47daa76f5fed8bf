use crate::models::{AccountRow, NodeRow};
use crate::Database;
use anyhow::Result;
use rusqlite::Connection;

impl Database {
    // -- Accounts --

    /// Returns false if the email is already taken.
    pub fn create_account(&self, id: &str, email: &str, password_hash: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO accounts (id, email, password) VALUES (?1, ?2, ?3)",
                (id, email, password_hash),
            );
            match inserted {
                Ok(_) => Ok(true),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
                {
                    Ok(false)
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn get_account_by_email(&self, email: &str) -> Result<Option<AccountRow>> {
        self.with_conn(|conn| query_account(conn, "email", email))
    }

    pub fn get_account_by_id(&self, id: &str) -> Result<Option<AccountRow>> {
        self.with_conn(|conn| query_account(conn, "id", id))
    }

    /// Returns true if an account was deleted.
    pub fn delete_account(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM accounts WHERE id = ?1", [id])?;
            Ok(n > 0)
        })
    }

    // -- Nodes --

    pub fn load_nodes(&self) -> Result<Vec<NodeRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key, value, revision FROM nodes ORDER BY key")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(NodeRow {
                        key: row.get(0)?,
                        value: row.get(1)?,
                        revision: row.get::<_, i64>(2)? as u64,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Insert or replace the subtree stored under a top-level key.
    pub fn put_node(&self, key: &str, value_json: &str, revision: u64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO nodes (key, value, revision) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    revision = excluded.revision,
                    updated_at = datetime('now')",
                rusqlite::params![key, value_json, revision as i64],
            )?;
            Ok(())
        })
    }

    /// Remove a top-level subtree, remembering the revision of the removal.
    pub fn delete_node(&self, key: &str, revision: u64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM nodes WHERE key = ?1", [key])?;
            conn.execute(
                "INSERT INTO meta (key, value) VALUES ('revision', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)",
                [revision as i64],
            )?;
            Ok(())
        })
    }

    /// Highest revision ever persisted, 0 for a fresh database.
    pub fn max_revision(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let rev: Option<i64> = conn.query_row(
                "SELECT MAX(r) FROM (
                    SELECT MAX(revision) AS r FROM nodes
                    UNION ALL
                    SELECT value FROM meta WHERE key = 'revision'
                 )",
                [],
                |row| row.get(0),
            )?;
            Ok(rev.unwrap_or(0) as u64)
        })
    }
}

fn query_account(conn: &Connection, column: &str, needle: &str) -> Result<Option<AccountRow>> {
    let sql = format!(
        "SELECT id, email, password, created_at FROM accounts WHERE {} = ?1",
        column
    );
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt
        .query_row([needle], |row| {
            Ok(AccountRow {
                id: row.get(0)?,
                email: row.get(1)?,
                password: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.create_account("u1", "ada@example.com", "hash").unwrap());

        // emails are unique regardless of case
        assert!(!db.create_account("u2", "ADA@example.com", "hash").unwrap());
        // a reused id is not an email clash
        assert!(db.create_account("u1", "bob@example.com", "hash").is_err());

        let by_email = db.get_account_by_email("Ada@Example.com").unwrap().unwrap();
        assert_eq!(by_email.id, "u1");
        assert!(db.get_account_by_id("u1").unwrap().is_some());

        assert!(db.delete_account("u1").unwrap());
        assert!(!db.delete_account("u1").unwrap());
        assert!(db.get_account_by_id("u1").unwrap().is_none());
    }

    #[test]
    fn node_upsert_and_delete() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.max_revision().unwrap(), 0);

        db.put_node("chirppad", r#"{"text":"a"}"#, 1).unwrap();
        db.put_node("chirppad", r#"{"text":"ab"}"#, 2).unwrap();
        db.put_node("chirps", r#"{}"#, 3).unwrap();

        let rows = db.load_nodes().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, "chirppad");
        assert_eq!(rows[0].value, r#"{"text":"ab"}"#);
        assert_eq!(db.max_revision().unwrap(), 3);

        db.delete_node("chirps", 4).unwrap();
        assert_eq!(db.load_nodes().unwrap().len(), 1);
        assert_eq!(db.max_revision().unwrap(), 4);
    }
}
