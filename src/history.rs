use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("tale id required")]
    TaleIdRequired,
}

/// Local record of which tales this client has already reported as viewed.
/// Exactly-once reporting survives restarts by consulting this store before
/// re-reporting.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone)]
pub struct ViewedEntry {
    pub tale_id: String,
    pub viewed_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        let path = if let Some(path) = opts.path {
            path
        } else {
            default_path().context("history: resolve default path")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("history: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("history: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", &"WAL")
            .context("history: set WAL")?;
        conn.pragma_update(None, "busy_timeout", &5000)
            .context("history: set busy timeout")?;
        migrate(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| anyhow!("history: connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| err)
            .context("history: close connection")
    }

    /// Records a tale as viewed. Idempotent: re-marking keeps the original
    /// timestamp.
    pub fn mark_viewed(&self, tale_id: &str) -> Result<()> {
        if tale_id.trim().is_empty() {
            bail!(HistoryError::TaleIdRequired);
        }
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO viewed_tales (tale_id, viewed_at)
VALUES (?1, ?2)
ON CONFLICT(tale_id) DO NOTHING
"#,
            params![tale_id, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn is_viewed(&self, tale_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM viewed_tales WHERE tale_id = ?1",
                params![tale_id],
                |row| row.get(0),
            )
            .optional()
            .context("history: query viewed tale")?;
        Ok(found.is_some())
    }

    pub fn viewed_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM viewed_tales", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<ViewedEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
SELECT tale_id, viewed_at
FROM viewed_tales
ORDER BY viewed_at DESC
LIMIT ?1
"#,
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let viewed: i64 = row.get(1)?;
                Ok(ViewedEntry {
                    tale_id: row.get(0)?,
                    viewed_at: Utc
                        .timestamp_opt(viewed, 0)
                        .single()
                        .unwrap_or_else(Utc::now),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Drops viewed records older than the cutoff. Returns how many rows
    /// were removed.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM viewed_tales WHERE viewed_at < ?1",
            params![cutoff.timestamp()],
        )?;
        Ok(removed)
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
)
"#,
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    let migrations = migrations();
    for (idx, sql) in migrations.iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![
                version,
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::from_secs(0))
                    .as_secs() as i64,
            ],
        )?;
    }
    Ok(())
}

fn migrations() -> Vec<&'static str> {
    vec![
        r#"
CREATE TABLE IF NOT EXISTS viewed_tales (
  tale_id TEXT PRIMARY KEY,
  viewed_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_viewed_tales_viewed_at ON viewed_tales(viewed_at);
"#,
    ]
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tales-tui").join("history.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(dir: &tempfile::TempDir) -> Store {
        Store::open(Options {
            path: Some(dir.path().join("history.db")),
        })
        .unwrap()
    }

    #[test]
    fn open_creates_database() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        assert!(dir.path().join("history.db").exists());
        store.close().unwrap();
    }

    #[test]
    fn mark_viewed_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.mark_viewed("t1").unwrap();
        store.mark_viewed("t1").unwrap();
        assert!(store.is_viewed("t1").unwrap());
        assert!(!store.is_viewed("t2").unwrap());
        assert_eq!(store.viewed_count().unwrap(), 1);
    }

    #[test]
    fn mark_viewed_requires_id() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        assert!(store.mark_viewed("  ").is_err());
    }

    #[test]
    fn prune_removes_old_entries() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.mark_viewed("old").unwrap();
        let removed = store
            .prune_older_than(Utc::now() + chrono::Duration::seconds(60))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.viewed_count().unwrap(), 0);
    }
}
