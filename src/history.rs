use std::path::Path;

use anyhow::Result;
use rusqlite::{params, Connection};

use crate::config::Config;

#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct RunRecord {
    pub id: i64,
    pub session_id: String,
    pub topic: String,
    pub document: String,
    pub created_at: i64,
}

/// Completed runs, persisted per session so past documents survive a
/// restart.
pub struct HistoryStore {
    conn: Connection,
}

impl HistoryStore {
    pub fn open_default() -> Result<Self> {
        let dir = Config::get_config_dir();
        std::fs::create_dir_all(&dir)?;
        Self::open(&dir.join("history.sqlite"))
    }

    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                document TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(HistoryStore { conn })
    }

    pub fn add_run(&self, session_id: &str, topic: &str, document: &str) -> Result<i64> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        self.conn.execute(
            "INSERT INTO runs (session_id, topic, document, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, topic, document, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    #[allow(dead_code)]
    pub fn list_runs(&self, session_id: Option<&str>, limit: usize) -> Result<Vec<RunRecord>> {
        match session_id {
            Some(session) => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, session_id, topic, document, created_at
                     FROM runs WHERE session_id = ?1
                     ORDER BY created_at DESC LIMIT ?2",
                )?;
                let runs = collect_runs(stmt.query(params![session, limit as i64])?);
                runs
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, session_id, topic, document, created_at
                     FROM runs ORDER BY created_at DESC LIMIT ?1",
                )?;
                let runs = collect_runs(stmt.query([limit as i64])?);
                runs
            }
        }
    }

    #[allow(dead_code)]
    pub fn delete_run(&self, id: i64) -> Result<()> {
        self.conn.execute("DELETE FROM runs WHERE id = ?1", params![id])?;
        Ok(())
    }
}

fn collect_runs(mut rows: rusqlite::Rows) -> Result<Vec<RunRecord>> {
    let mut runs = Vec::new();
    while let Some(row) = rows.next()? {
        runs.push(RunRecord {
            id: row.get(0)?,
            session_id: row.get(1)?,
            topic: row.get(2)?,
            document: row.get(3)?,
            created_at: row.get(4)?,
        });
    }
    Ok(runs)
}
