//! SQLite-backed stores and catalog.

use super::{ChannelStore, ShareStore, StoreError};
use crate::catalog::{CatalogError, CatalogObject, ObjectCatalog};
use crate::channel::{Channel, ChannelDraft, ChannelRuntime, ListenerCount};
use crate::object::ObjectRef;
use crate::share::{Share, ShareDraft};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS channel (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    url TEXT NOT NULL DEFAULT '',
    object_type TEXT NOT NULL,
    object_id INTEGER NOT NULL,
    interface TEXT NOT NULL DEFAULT '',
    port INTEGER NOT NULL DEFAULT 0,
    fixed_endpoint INTEGER NOT NULL DEFAULT 0,
    admin_password TEXT NOT NULL DEFAULT '',
    is_private INTEGER NOT NULL DEFAULT 0,
    max_listeners INTEGER NOT NULL DEFAULT 0,
    "random" INTEGER NOT NULL DEFAULT 0,
    "loop" INTEGER NOT NULL DEFAULT 0,
    stream_type TEXT NOT NULL DEFAULT 'mp3',
    bitrate INTEGER NOT NULL DEFAULT 128,
    pid INTEGER NOT NULL DEFAULT 0,
    listeners INTEGER NOT NULL DEFAULT 0,
    peak_listeners INTEGER NOT NULL DEFAULT 0,
    start_date INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS share (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    secret TEXT NOT NULL,
    object_type TEXT NOT NULL,
    object_id INTEGER NOT NULL,
    allow_stream INTEGER NOT NULL DEFAULT 0,
    allow_download INTEGER NOT NULL DEFAULT 0,
    expire_days INTEGER NOT NULL DEFAULT 0,
    max_counter INTEGER NOT NULL DEFAULT 0,
    counter INTEGER NOT NULL DEFAULT 0,
    creation_date INTEGER NOT NULL,
    lastvisit_date INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS catalog_object (
    object_type TEXT NOT NULL,
    object_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    file_path TEXT,
    PRIMARY KEY (object_type, object_id)
);

CREATE TABLE IF NOT EXISTS catalog_child (
    parent_type TEXT NOT NULL,
    parent_id INTEGER NOT NULL,
    position INTEGER NOT NULL,
    child_type TEXT NOT NULL,
    child_id INTEGER NOT NULL,
    PRIMARY KEY (parent_type, parent_id, position)
);
"#;

const CHANNEL_COLUMNS: &str = r#"id, name, description, url, object_type, object_id, interface, port,
    fixed_endpoint, admin_password, is_private, max_listeners, "random", "loop", stream_type,
    bitrate, pid, listeners, peak_listeners, start_date"#;

const SHARE_COLUMNS: &str = "id, secret, object_type, object_id, allow_stream, allow_download, \
    expire_days, max_counter, counter, creation_date, lastvisit_date";

/// Channels, shares and the media catalog in one SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (and migrate) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        // Other processes may share the file; wait for their writes.
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        debug!(path = ?path, "store schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Database file, if not in memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Add or replace a catalog object.
    pub fn add_object(&self, object: &CatalogObject) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO catalog_object (object_type, object_id, title, file_path)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                object.object.object_type.as_str(),
                object.object.object_id,
                object.title,
                object.path.as_ref().map(|p| p.to_string_lossy().into_owned()),
            ],
        )?;
        Ok(())
    }

    /// Place `child` at `position` inside container `parent`.
    pub fn add_child(
        &self,
        parent: &ObjectRef,
        position: u32,
        child: &ObjectRef,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO catalog_child (parent_type, parent_id, position, child_type, child_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                parent.object_type.as_str(),
                parent.object_id,
                position,
                child.object_type.as_str(),
                child.object_id,
            ],
        )?;
        Ok(())
    }
}

/// Read a text column and parse it into a typed value.
fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn channel_from_row(row: &Row<'_>) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        url: row.get(3)?,
        target: ObjectRef::new(parse_column(row, 4)?, row.get(5)?),
        interface: row.get(6)?,
        port: row.get(7)?,
        fixed_endpoint: row.get(8)?,
        admin_password: row.get(9)?,
        is_private: row.get(10)?,
        max_listeners: row.get(11)?,
        random: row.get(12)?,
        looping: row.get(13)?,
        stream_type: parse_column(row, 14)?,
        bitrate: row.get(15)?,
        runtime: ChannelRuntime {
            pid: row.get(16)?,
            listeners: row.get(17)?,
            peak_listeners: row.get(18)?,
            start_date: row.get(19)?,
        },
    })
}

fn share_from_row(row: &Row<'_>) -> rusqlite::Result<Share> {
    Ok(Share {
        id: row.get(0)?,
        secret: row.get(1)?,
        object: ObjectRef::new(parse_column(row, 2)?, row.get(3)?),
        allow_stream: row.get(4)?,
        allow_download: row.get(5)?,
        expire_days: row.get(6)?,
        max_counter: row.get(7)?,
        counter: row.get(8)?,
        creation_date: row.get(9)?,
        lastvisit_date: row.get(10)?,
    })
}

fn catalog_object_from_row(row: &Row<'_>) -> rusqlite::Result<CatalogObject> {
    let path: Option<String> = row.get(3)?;
    Ok(CatalogObject {
        object: ObjectRef::new(parse_column(row, 0)?, row.get(1)?),
        title: row.get(2)?,
        path: path.map(PathBuf::from),
    })
}

fn select_channel(conn: &Connection, id: i64) -> Result<Option<Channel>, StoreError> {
    let sql = format!("SELECT {} FROM channel WHERE id = ?1", CHANNEL_COLUMNS);
    Ok(conn
        .query_row(&sql, params![id], channel_from_row)
        .optional()?)
}

impl ChannelStore for SqliteStore {
    fn insert_channel(&self, draft: &ChannelDraft) -> Result<Channel, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO channel (name, description, url, object_type, object_id, interface, port,
                fixed_endpoint, admin_password, is_private, max_listeners, "random", "loop",
                stream_type, bitrate)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"#,
            params![
                draft.name.trim(),
                draft.description,
                draft.url,
                draft.target.object_type.as_str(),
                draft.target.object_id,
                draft.interface.trim(),
                draft.port,
                draft.fixed_endpoint(),
                draft.admin_password,
                draft.is_private,
                draft.max_listeners,
                draft.random,
                draft.looping,
                draft.stream_type.extension(),
                draft.bitrate,
            ],
        )?;

        let id = conn.last_insert_rowid();
        select_channel(&conn, id)?.ok_or(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
    }

    fn channel(&self, id: i64) -> Result<Option<Channel>, StoreError> {
        let conn = self.conn()?;
        select_channel(&conn, id)
    }

    fn channels(&self) -> Result<Vec<Channel>, StoreError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM channel ORDER BY id", CHANNEL_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], channel_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn update_channel(&self, id: i64, draft: &ChannelDraft) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"UPDATE channel SET name = ?2, description = ?3, url = ?4, object_type = ?5,
                object_id = ?6, interface = ?7, port = ?8, fixed_endpoint = ?9,
                admin_password = ?10, is_private = ?11, max_listeners = ?12, "random" = ?13,
                "loop" = ?14, stream_type = ?15, bitrate = ?16
               WHERE id = ?1"#,
            params![
                id,
                draft.name.trim(),
                draft.description,
                draft.url,
                draft.target.object_type.as_str(),
                draft.target.object_id,
                draft.interface.trim(),
                draft.port,
                draft.fixed_endpoint(),
                draft.admin_password,
                draft.is_private,
                draft.max_listeners,
                draft.random,
                draft.looping,
                draft.stream_type.extension(),
                draft.bitrate,
            ],
        )?;
        Ok(changed == 1)
    }

    fn delete_channel(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM channel WHERE id = ?1", params![id])? == 1)
    }

    fn set_process(&self, id: i64, pid: u32, start_date: i64) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE channel SET pid = ?2, start_date = ?3 WHERE id = ?1",
            params![id, pid, start_date],
        )?;
        Ok(())
    }

    fn clear_process(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE channel SET pid = 0, start_date = 0, listeners = 0 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    fn set_endpoint(&self, id: i64, interface: &str, port: u16) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE channel SET interface = ?2, port = ?3 WHERE id = ?1",
            params![id, interface, port],
        )?;
        Ok(())
    }

    fn apply_listener_delta(
        &self,
        id: i64,
        delta: i32,
    ) -> Result<Option<ListenerCount>, StoreError> {
        let conn = self.conn()?;
        // Both assignments see the pre-update row, so the peak is raised from
        // the same listener value that is being written.
        let count = conn
            .query_row(
                "UPDATE channel
                 SET listeners = MAX(listeners + ?2, 0),
                     peak_listeners = MAX(peak_listeners, listeners + ?2)
                 WHERE id = ?1
                 RETURNING listeners, peak_listeners",
                params![id, delta],
                |row| {
                    Ok(ListenerCount {
                        listeners: row.get(0)?,
                        peak_listeners: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(count)
    }
}

impl ShareStore for SqliteStore {
    fn insert_share(&self, draft: &ShareDraft, now: i64) -> Result<Share, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO share (secret, object_type, object_id, allow_stream, allow_download,
                expire_days, max_counter, counter, creation_date, lastvisit_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, 0)",
            params![
                draft.secret,
                draft.object.object_type.as_str(),
                draft.object.object_id,
                draft.allow_stream,
                draft.allow_download,
                draft.expire_days,
                draft.max_counter,
                now,
            ],
        )?;

        let id = conn.last_insert_rowid();
        let sql = format!("SELECT {} FROM share WHERE id = ?1", SHARE_COLUMNS);
        Ok(conn.query_row(&sql, params![id], share_from_row)?)
    }

    fn share(&self, id: i64) -> Result<Option<Share>, StoreError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM share WHERE id = ?1", SHARE_COLUMNS);
        Ok(conn.query_row(&sql, params![id], share_from_row).optional()?)
    }

    fn delete_share(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM share WHERE id = ?1", params![id])? == 1)
    }

    fn save_access(&self, id: i64, now: i64) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE share SET counter = counter + 1, lastvisit_date = ?2
             WHERE id = ?1 AND (max_counter = 0 OR counter < max_counter)",
            params![id, now],
        )?;
        Ok(changed == 1)
    }
}

fn backend(e: impl std::fmt::Display) -> CatalogError {
    CatalogError::Backend(e.to_string())
}

impl ObjectCatalog for SqliteStore {
    fn lookup(&self, object: &ObjectRef) -> Result<Option<CatalogObject>, CatalogError> {
        let conn = self.conn().map_err(backend)?;
        conn.query_row(
            "SELECT object_type, object_id, title, file_path FROM catalog_object
             WHERE object_type = ?1 AND object_id = ?2",
            params![object.object_type.as_str(), object.object_id],
            catalog_object_from_row,
        )
        .optional()
        .map_err(backend)
    }

    fn children(&self, object: &ObjectRef) -> Result<Vec<CatalogObject>, CatalogError> {
        let conn = self.conn().map_err(backend)?;
        let mut stmt = conn
            .prepare(
                "SELECT o.object_type, o.object_id, o.title, o.file_path
                 FROM catalog_child c
                 JOIN catalog_object o ON o.object_type = c.child_type AND o.object_id = c.child_id
                 WHERE c.parent_type = ?1 AND c.parent_id = ?2
                 ORDER BY c.position",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map(
                params![object.object_type.as_str(), object.object_id],
                catalog_object_from_row,
            )
            .map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
    }
}
