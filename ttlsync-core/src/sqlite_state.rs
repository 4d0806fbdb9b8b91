//! SQLite-backed sync-state store
//!
//! One database file per environment. Tables:
//! - `fingerprints(dataset_id, model, fingerprint, updated_at)`
//! - `id_map(ttl_id, platform_id)`, unique in both columns

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::state::{StateEntry, SyncStateStore};

pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS fingerprints (
            dataset_id TEXT NOT NULL,
            model TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (dataset_id, model)
        ) WITHOUT ROWID;
        CREATE TABLE IF NOT EXISTS id_map (
            ttl_id TEXT PRIMARY KEY,
            platform_id TEXT NOT NULL
        ) WITHOUT ROWID;
        CREATE UNIQUE INDEX IF NOT EXISTS id_map_platform ON id_map(platform_id);",
    )?;
    Ok(())
}

impl SqliteStateStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::Store(format!("Failed to open {}: {}", path.display(), e)))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        init_schema(&conn)?;
        tracing::debug!("Opened state store {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Store("connection lock poisoned".to_string()))
    }
}

fn parse_fingerprint(hex_str: &str) -> Result<Fingerprint> {
    Fingerprint::from_hex(hex_str)
        .map_err(|e| Error::Store(format!("Corrupt fingerprint {:?}: {}", hex_str, e)))
}

#[async_trait]
impl SyncStateStore for SqliteStateStore {
    async fn get(&self, dataset_id: &str, model: &str) -> Result<Option<Fingerprint>> {
        let conn = self.conn()?;
        let hex_str: Option<String> = conn
            .query_row(
                "SELECT fingerprint FROM fingerprints WHERE dataset_id=?1 AND model=?2",
                rusqlite::params![dataset_id, model],
                |row| row.get(0),
            )
            .optional()?;
        hex_str.as_deref().map(parse_fingerprint).transpose()
    }

    async fn put(&self, dataset_id: &str, model: &str, fingerprint: &Fingerprint) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO fingerprints (dataset_id,model,fingerprint,updated_at) VALUES (?1,?2,?3,?4) \
             ON CONFLICT(dataset_id,model) DO UPDATE SET fingerprint=excluded.fingerprint,updated_at=excluded.updated_at",
            rusqlite::params![
                dataset_id,
                model,
                fingerprint.to_hex(),
                chrono::Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }

    async fn get_identifier_mapping(&self, ttl_id: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT platform_id FROM id_map WHERE ttl_id=?1",
                rusqlite::params![ttl_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    async fn get_source_identifier(&self, platform_id: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT ttl_id FROM id_map WHERE platform_id=?1",
                rusqlite::params![platform_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    async fn put_identifier_mapping(&self, ttl_id: &str, platform_id: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM id_map WHERE platform_id=?1 AND ttl_id<>?2",
            rusqlite::params![platform_id, ttl_id],
        )?;
        tx.execute(
            "INSERT INTO id_map (ttl_id,platform_id) VALUES (?1,?2) \
             ON CONFLICT(ttl_id) DO UPDATE SET platform_id=excluded.platform_id",
            rusqlite::params![ttl_id, platform_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn entries(&self, dataset_id: Option<&str>) -> Result<Vec<StateEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT dataset_id,model,fingerprint,updated_at FROM fingerprints \
             WHERE ?1 IS NULL OR dataset_id=?1 ORDER BY dataset_id,model",
        )?;
        let mut rows = stmt.query(rusqlite::params![dataset_id])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let hex_str: String = row.get(2)?;
            entries.push(StateEntry {
                dataset_id: row.get(0)?,
                model: row.get(1)?,
                fingerprint: parse_fingerprint(&hex_str)?,
                updated_at: row.get(3)?,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_get_put() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        assert_eq!(store.get("D1", "sample").await.unwrap(), None);

        let fp = Fingerprint::new([9u8; 32]);
        store.put("D1", "sample", &fp).await.unwrap();
        assert_eq!(store.get("D1", "sample").await.unwrap(), Some(fp));

        store.put("D1", "sample", &Fingerprint::empty()).await.unwrap();
        assert_eq!(store.get("D1", "sample").await.unwrap(), Some(Fingerprint::empty()));
    }

    #[tokio::test]
    async fn test_persists_across_open() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state").join("prod.sqlite");
        let fp = Fingerprint::new([4u8; 32]);
        {
            let store = SqliteStateStore::open(&path).unwrap();
            store.put("D1", "subject", &fp).await.unwrap();
            store.put_identifier_mapping("dataset|D1", "N:dataset:42").await.unwrap();
        }
        let store = SqliteStateStore::open(&path).unwrap();
        assert_eq!(store.get("D1", "subject").await.unwrap(), Some(fp));
        assert_eq!(
            store.get_identifier_mapping("dataset|D1").await.unwrap().as_deref(),
            Some("N:dataset:42")
        );
    }

    #[tokio::test]
    async fn test_identifier_mapping_bidirectional() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        store.put_identifier_mapping("D1|sample|id:1", "P-1").await.unwrap();
        assert_eq!(
            store.get_source_identifier("P-1").await.unwrap().as_deref(),
            Some("D1|sample|id:1")
        );

        // Re-pointing a platform id moves it to the new graph id
        store.put_identifier_mapping("D1|sample|id:2", "P-1").await.unwrap();
        assert_eq!(store.get_identifier_mapping("D1|sample|id:1").await.unwrap(), None);
        assert_eq!(
            store.get_source_identifier("P-1").await.unwrap().as_deref(),
            Some("D1|sample|id:2")
        );

        store.put_identifier_mapping("D1|sample|id:2", "P-7").await.unwrap();
        assert_eq!(store.get_source_identifier("P-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entries() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let fp = Fingerprint::new([5u8; 32]);
        store.put("D2", "award", &fp).await.unwrap();
        store.put("D1", "sample", &fp).await.unwrap();

        let all = store.entries(None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].dataset_id, "D1");
        assert_eq!(all[0].fingerprint, fp);
        assert!(all[0].updated_at > 0);

        let only = store.entries(Some("D2")).await.unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].model, "award");
    }

    #[tokio::test]
    async fn test_corrupt_fingerprint_is_store_error() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        store
            .conn()
            .unwrap()
            .execute(
                "INSERT INTO fingerprints VALUES ('D1','sample','zz',0)",
                [],
            )
            .unwrap();
        assert!(matches!(store.get("D1", "sample").await, Err(Error::Store(_))));
    }
}
