//! SQLite-backed coordination state: port locks and build wait lists.
//!
//! These are the two records concurrent workers race on, so they live in a
//! store shared across processes.

#![cfg(feature = "sqlite-persistence")]

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode};

use flock_kernel::{BuildId, FlockError};

use crate::models::PortLockRecord;
use crate::repository::{BuildWaitRepository, PortLockRepository};

#[derive(Clone)]
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    pub fn new(db_path: &str) -> Result<Self, FlockError> {
        let conn = Connection::open(db_path)
            .map_err(|e| FlockError::Store(format!("open sqlite flock repo: {}", e)))?;
        let repo = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        repo.ensure_schema()?;
        Ok(repo)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, FlockError> {
        self.conn
            .lock()
            .map_err(|_| FlockError::Store("sqlite flock repo lock poisoned".to_string()))
    }

    fn ensure_schema(&self) -> Result<(), FlockError> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS flock_port_locks (
              host TEXT NOT NULL,
              port INTEGER NOT NULL,
              created_at_ms INTEGER NOT NULL,
              PRIMARY KEY (host, port)
            );
            CREATE TABLE IF NOT EXISTS flock_build_waiters (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              build_id INTEGER NOT NULL,
              value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS flock_build_wait_expiry (
              build_id INTEGER PRIMARY KEY,
              expires_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_flock_port_locks_created
                ON flock_port_locks(created_at_ms);
            CREATE INDEX IF NOT EXISTS idx_flock_build_waiters_build
                ON flock_build_waiters(build_id, seq);
            "#,
        )
        .map_err(|e| FlockError::Store(format!("init sqlite flock schema: {}", e)))?;
        Ok(())
    }
}

fn dt_from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

impl PortLockRepository for SqliteRepository {
    fn insert_lock(
        &self,
        host: &str,
        port: u16,
        now: DateTime<Utc>,
    ) -> Result<PortLockRecord, FlockError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO flock_port_locks (host, port, created_at_ms) VALUES (?1, ?2, ?3)",
            params![host, port, now.timestamp_millis()],
        );
        match inserted {
            Ok(_) => Ok(PortLockRecord {
                host: host.to_string(),
                port,
                created_at: dt_from_ms(now.timestamp_millis()),
            }),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(FlockError::DuplicateLock {
                    host: host.to_string(),
                    port,
                })
            }
            Err(e) => Err(FlockError::Store(format!("insert port lock: {}", e))),
        }
    }

    fn delete_lock(&self, host: &str, port: u16) -> Result<bool, FlockError> {
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM flock_port_locks WHERE host = ?1 AND port = ?2",
                params![host, port],
            )
            .map_err(|e| FlockError::Store(format!("delete port lock: {}", e)))?;
        Ok(removed > 0)
    }

    fn delete_locks_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, FlockError> {
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM flock_port_locks WHERE created_at_ms < ?1",
                params![cutoff.timestamp_millis()],
            )
            .map_err(|e| FlockError::Store(format!("sweep port locks: {}", e)))?;
        Ok(removed as u64)
    }

    fn list_locks(&self, host: Option<&str>) -> Result<Vec<PortLockRecord>, FlockError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT host, port, created_at_ms FROM flock_port_locks
                 WHERE ?1 IS NULL OR host = ?1 ORDER BY host, port",
            )
            .map_err(|e| FlockError::Store(format!("prepare list port locks: {}", e)))?;
        let rows = stmt
            .query_map(params![host], |row| {
                Ok(PortLockRecord {
                    host: row.get(0)?,
                    port: row.get(1)?,
                    created_at: dt_from_ms(row.get(2)?),
                })
            })
            .map_err(|e| FlockError::Store(format!("query list port locks: {}", e)))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| FlockError::Store(format!("read port lock row: {}", e)))
    }
}

impl BuildWaitRepository for SqliteRepository {
    fn push_waiter(
        &self,
        build_id: BuildId,
        value: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), FlockError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| FlockError::Store(format!("begin push waiter: {}", e)))?;
        tx.execute(
            "INSERT INTO flock_build_waiters (build_id, value) VALUES (?1, ?2)",
            params![build_id, value],
        )
        .map_err(|e| FlockError::Store(format!("push waiter: {}", e)))?;
        tx.execute(
            "INSERT INTO flock_build_wait_expiry (build_id, expires_at_ms) VALUES (?1, ?2)
             ON CONFLICT(build_id) DO UPDATE SET expires_at_ms = excluded.expires_at_ms",
            params![build_id, expires_at.timestamp_millis()],
        )
        .map_err(|e| FlockError::Store(format!("set waiter expiry: {}", e)))?;
        tx.commit()
            .map_err(|e| FlockError::Store(format!("commit push waiter: {}", e)))
    }

    fn pop_waiter(
        &self,
        build_id: BuildId,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, FlockError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| FlockError::Store(format!("begin pop waiter: {}", e)))?;
        let expires_at: Option<i64> = tx
            .query_row(
                "SELECT expires_at_ms FROM flock_build_wait_expiry WHERE build_id = ?1",
                params![build_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .map_err(|e| FlockError::Store(format!("read waiter expiry: {}", e)))?;

        let live = expires_at.is_some_and(|ms| ms > now.timestamp_millis());
        let popped = if live {
            let head: Option<(i64, String)> = tx
                .query_row(
                    "SELECT seq, value FROM flock_build_waiters WHERE build_id = ?1
                     ORDER BY seq ASC LIMIT 1",
                    params![build_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })
                .map_err(|e| FlockError::Store(format!("read waiter: {}", e)))?;
            if let Some((seq, _)) = &head {
                tx.execute("DELETE FROM flock_build_waiters WHERE seq = ?1", params![seq])
                    .map_err(|e| FlockError::Store(format!("pop waiter: {}", e)))?;
            }
            head.map(|(_, value)| value)
        } else {
            tx.execute(
                "DELETE FROM flock_build_waiters WHERE build_id = ?1",
                params![build_id],
            )
            .map_err(|e| FlockError::Store(format!("drop expired waiters: {}", e)))?;
            tx.execute(
                "DELETE FROM flock_build_wait_expiry WHERE build_id = ?1",
                params![build_id],
            )
            .map_err(|e| FlockError::Store(format!("drop waiter expiry: {}", e)))?;
            None
        };
        tx.commit()
            .map_err(|e| FlockError::Store(format!("commit pop waiter: {}", e)))?;
        Ok(popped)
    }
}
