//! `SQLite`-backed implementation of the persistence traits.
//!
//! `rusqlite` is synchronous, so every call checks out a pooled connection on
//! a blocking worker via [`tokio::task::spawn_blocking`].

use async_trait::async_trait;
use helm_core::events::iso_now;
use helm_core::{
    ActionLog, ActionLogEntry, ActionStatus, ApprovalQueue, ApprovalRequest, ApprovalStatus,
    KeyValueStore, StoreError,
};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::connection::{self, ConnectionPool, PoolConfig};
use crate::errors::Result;
use crate::migrations;

/// Persistent store over a pooled `SQLite` database file.
#[derive(Clone)]
pub struct SqliteStore {
    pool: ConnectionPool,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &str) -> Result<Self> {
        Self::open_with(path, &PoolConfig::default())
    }

    /// Open with explicit pool configuration.
    pub fn open_with(path: &str, config: &PoolConfig) -> Result<Self> {
        let pool = connection::open_pool(path, config)?;
        {
            let conn = pool.get()?;
            let applied = migrations::run_migrations(&conn)?;
            debug!(path, applied, "sqlite store opened");
        }
        Ok(Self { pool })
    }

    async fn with_conn<T, F>(&self, f: F) -> std::result::Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        let out = tokio::task::spawn_blocking(move || -> Result<T> {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(crate::errors::SqliteStoreError::from)?;
        out.map_err(StoreError::from)
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> std::result::Result<Option<Value>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                    row.get(0)
                })
                .optional()?;
            match raw {
                Some(text) => Ok(Some(serde_json::from_str(&text)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn set(&self, key: &str, value: Value) -> std::result::Result<(), StoreError> {
        let key = key.to_string();
        let text = serde_json::to_string(&value)?;
        self.with_conn(move |conn| {
            let _ = conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, text, iso_now()],
            )?;
            Ok(())
        })
        .await
    }
}

fn action_row(row: &Row<'_>) -> rusqlite::Result<ActionLogEntry> {
    let status: String = row.get("status")?;
    let duration: Option<i64> = row.get("duration_ms")?;
    let details: Option<String> = row.get("details")?;
    Ok(ActionLogEntry {
        module: row.get("module")?,
        action: row.get("action")?,
        status: ActionStatus::parse(&status).unwrap_or(ActionStatus::Error),
        duration_ms: duration.map(|d| d.max(0) as u64),
        error: row.get("error")?,
        details: details.and_then(|d| serde_json::from_str(&d).ok()),
        created_at: row.get("created_at")?,
    })
}

#[async_trait]
impl ActionLog for SqliteStore {
    async fn record(&self, entry: ActionLogEntry) -> std::result::Result<(), StoreError> {
        let details = entry
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.with_conn(move |conn| {
            let _ = conn.execute(
                "INSERT INTO action_log (module, action, status, duration_ms, error, details, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.module,
                    entry.action,
                    entry.status.as_str(),
                    entry.duration_ms.map(|d| d as i64),
                    entry.error,
                    details,
                    entry.created_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn recent(&self, limit: usize) -> std::result::Result<Vec<ActionLogEntry>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT module, action, status, duration_ms, error, details, created_at
                 FROM action_log ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], action_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }
}

fn approval_row(row: &Row<'_>) -> rusqlite::Result<(ApprovalRequest, String)> {
    let status: String = row.get("status")?;
    let data: String = row.get("action_data")?;
    Ok((
        ApprovalRequest {
            id: row.get("id")?,
            action_type: row.get("action_type")?,
            action_data: Value::Null,
            status: ApprovalStatus::parse(&status).unwrap_or(ApprovalStatus::Pending),
            created_at: row.get("created_at")?,
            resolved_at: row.get("resolved_at")?,
        },
        data,
    ))
}

fn decode_approval((mut req, data): (ApprovalRequest, String)) -> Result<ApprovalRequest> {
    req.action_data = serde_json::from_str(&data)?;
    Ok(req)
}

fn select_approval(conn: &Connection, id: &str) -> Result<Option<ApprovalRequest>> {
    conn.query_row(
        "SELECT id, action_type, action_data, status, created_at, resolved_at
         FROM approvals WHERE id = ?1",
        params![id],
        approval_row,
    )
    .optional()?
    .map(decode_approval)
    .transpose()
}

impl SqliteStore {
    /// Move request `id` from `from` to `to` in one conditional update.
    async fn transition(
        &self,
        id: &str,
        from: ApprovalStatus,
        to: ApprovalStatus,
    ) -> std::result::Result<ApprovalRequest, StoreError> {
        let id = id.to_string();
        let lookup = id.clone();
        let (changed, row) = self
            .with_conn(move |conn| {
                let changed = conn.execute(
                    "UPDATE approvals SET status = ?1, resolved_at = COALESCE(resolved_at, ?2)
                     WHERE id = ?3 AND status = ?4",
                    params![to.as_str(), iso_now(), id, from.as_str()],
                )?;
                Ok((changed, select_approval(conn, &id)?))
            })
            .await?;
        match row {
            None => Err(StoreError::NotFound(lookup)),
            Some(req) if changed == 0 => Err(StoreError::Conflict {
                id: lookup,
                status: req.status.as_str().to_string(),
            }),
            Some(req) => Ok(req),
        }
    }
}

#[async_trait]
impl ApprovalQueue for SqliteStore {
    async fn enqueue(
        &self,
        action_type: &str,
        action_data: Value,
    ) -> std::result::Result<ApprovalRequest, StoreError> {
        let request = ApprovalRequest {
            id: Uuid::now_v7().to_string(),
            action_type: action_type.to_string(),
            action_data,
            status: ApprovalStatus::Pending,
            created_at: iso_now(),
            resolved_at: None,
        };
        let data = serde_json::to_string(&request.action_data)?;
        let row = request.clone();
        self.with_conn(move |conn| {
            let _ = conn.execute(
                "INSERT INTO approvals (id, action_type, action_data, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    row.id,
                    row.action_type,
                    data,
                    row.status.as_str(),
                    row.created_at
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(request)
    }

    async fn get(&self, id: &str) -> std::result::Result<Option<ApprovalRequest>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| select_approval(conn, &id)).await
    }

    async fn resolve(
        &self,
        id: &str,
        status: ApprovalStatus,
    ) -> std::result::Result<ApprovalRequest, StoreError> {
        self.transition(id, ApprovalStatus::Pending, status).await
    }

    async fn mark_executed(&self, id: &str) -> std::result::Result<ApprovalRequest, StoreError> {
        self.transition(id, ApprovalStatus::Approved, ApprovalStatus::Executed)
            .await
    }

    async fn pending(&self) -> std::result::Result<Vec<ApprovalRequest>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, action_type, action_data, status, created_at, resolved_at
                 FROM approvals WHERE status = 'pending' ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt
                .query_map([], approval_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(decode_approval).collect()
        })
        .await
    }
}
