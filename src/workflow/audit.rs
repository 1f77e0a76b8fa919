//! Append-only audit store
//!
//! Every calendar change driven by the delay workflow lands here, plus the
//! customer's eventual response. Insert-and-select only; nothing in this
//! module updates or deletes a row.

use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A delay applied by a teammate
#[derive(Debug, Clone)]
pub struct DelayAuditEntry {
    pub appointment_id: String,
    pub old_time: String,
    pub new_time: String,
    pub teammate_name: String,
    pub teammate_phone: String,
    pub reason: String,
    pub status: String,
}

/// The customer's answer on the outbound leg
#[derive(Debug, Clone)]
pub struct CustomerResponseEntry {
    pub appointment_id: String,
    pub response: String,
    pub new_time: Option<String>,
    pub status: String,
}

/// SQLite-backed append-only log
pub struct AuditStore {
    conn: Arc<Mutex<Connection>>,
}

impl AuditStore {
    /// Open (or create) the store at the given path
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS delay_audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                appointment_id TEXT NOT NULL,
                old_time TEXT NOT NULL,
                new_time TEXT NOT NULL,
                teammate_name TEXT NOT NULL,
                teammate_phone TEXT NOT NULL,
                reason TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS customer_response (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                appointment_id TEXT NOT NULL,
                response TEXT NOT NULL,
                new_time TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_delay_audit_appt
                ON delay_audit(appointment_id);
            CREATE INDEX IF NOT EXISTS idx_customer_response_appt
                ON customer_response(appointment_id);
        "#,
        )?;
        Ok(())
    }

    /// Append one delay record
    pub async fn record_delay(&self, entry: &DelayAuditEntry) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO delay_audit
             (appointment_id, old_time, new_time, teammate_name, teammate_phone,
              reason, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.appointment_id,
                entry.old_time,
                entry.new_time,
                entry.teammate_name,
                entry.teammate_phone,
                entry.reason,
                entry.status,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Append one customer response record
    pub async fn record_customer_response(&self, entry: &CustomerResponseEntry) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO customer_response
             (appointment_id, response, new_time, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.appointment_id,
                entry.response,
                entry.new_time,
                entry.status,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Count delay rows for an appointment (observability and tests)
    pub async fn delay_count(&self, appointment_id: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM delay_audit WHERE appointment_id = ?1",
            params![appointment_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Count customer responses for an appointment
    pub async fn response_count(&self, appointment_id: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM customer_response WHERE appointment_id = ?1",
            params![appointment_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delay_entry() -> DelayAuditEntry {
        DelayAuditEntry {
            appointment_id: "appt-1".to_string(),
            old_time: "2025-09-01T15:00:00Z".to_string(),
            new_time: "2025-09-01T15:15:00Z".to_string(),
            teammate_name: "Asha".to_string(),
            teammate_phone: "+15550001111".to_string(),
            reason: "running late".to_string(),
            status: "applied".to_string(),
        }
    }

    #[tokio::test]
    async fn test_delay_rows_accumulate() {
        let store = AuditStore::open_in_memory().await.unwrap();
        store.record_delay(&delay_entry()).await.unwrap();
        store.record_delay(&delay_entry()).await.unwrap();
        assert_eq!(store.delay_count("appt-1").await.unwrap(), 2);
        assert_eq!(store.delay_count("other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_customer_response_recorded() {
        let store = AuditStore::open_in_memory().await.unwrap();
        store
            .record_customer_response(&CustomerResponseEntry {
                appointment_id: "appt-1".to_string(),
                response: "WAIT".to_string(),
                new_time: Some("2025-09-01T15:15:00Z".to_string()),
                status: "confirmed".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(store.response_count("appt-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        {
            let store = AuditStore::open(&path).await.unwrap();
            store.record_delay(&delay_entry()).await.unwrap();
        }
        let store = AuditStore::open(&path).await.unwrap();
        assert_eq!(store.delay_count("appt-1").await.unwrap(), 1);
    }
}
