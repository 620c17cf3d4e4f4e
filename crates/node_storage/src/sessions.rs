//! Session CRUD for sessions hosted by this device.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use node_proto::Session;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::debug;

use crate::schema::{create_schema, open_db};
use crate::{Result, StoreError};

pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    /// Open or create the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_db(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        create_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create a session owned by `host_id`.
    pub fn create(&self, name: &str, host_id: &str) -> Result<Session> {
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            host_id: host_id.to_string(),
            created_at: Utc::now(),
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (id, name, host_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                session.id,
                session.name,
                session.host_id,
                session.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
            ],
        )?;

        debug!(id = %session.id, name, "session created");
        Ok(session)
    }

    /// All stored sessions, oldest first.
    pub fn list(&self) -> Result<Vec<Session>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, host_id, created_at FROM sessions ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            let (id, name, host_id, created_at) = row?;
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map_err(|_| StoreError::Timestamp {
                    id: id.clone(),
                    value: created_at.clone(),
                })?
                .with_timezone(&Utc);
            sessions.push(Session {
                id,
                name,
                host_id,
                created_at,
            });
        }
        Ok(sessions)
    }

    /// Delete a session. Returns false when no session had that id.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        if rows > 0 {
            debug!(id, "session deleted");
        }
        Ok(rows > 0)
    }
}
