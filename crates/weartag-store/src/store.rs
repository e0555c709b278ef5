//! Main store implementation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, OptionalExtension, Row};
use time::OffsetDateTime;
use tracing::{debug, info};

use weartag_core::protocol::DeviceInfo;
use weartag_core::registry::TagRegistry;
use weartag_types::TagIdentity;

use crate::error::{Error, Result};
use crate::models::StoredTag;
use crate::schema;

const SELECT_TAG: &str =
    "SELECT id, display_name, serial, firmware, first_seen, last_seen FROM tags";

/// SQLite-based registry of known tags.
///
/// The connection is guarded by a mutex, so one `Store` can be shared by
/// every tag of a [`TagManager`](weartag_core::TagManager).
pub struct Store {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening registry at {}", path.display());
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        schema::initialize(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or refresh a tag.
    ///
    /// The newest display name wins unless it is empty.
    pub fn upsert_tag(&self, identity: &TagIdentity) -> Result<StoredTag> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.conn().execute(
            "INSERT INTO tags (id, display_name, first_seen, last_seen) VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(id) DO UPDATE SET
                display_name = COALESCE(NULLIF(?2, ''), display_name),
                last_seen = ?3",
            rusqlite::params![identity.identifier(), identity.display_name(), now],
        )?;
        debug!(tag = %identity.identifier(), "Registry updated");

        self.get_tag(identity.identifier())?
            .ok_or_else(|| Error::TagNotFound(identity.identifier().to_string()))
    }

    /// Record what the tag reported about itself.
    pub fn update_device_info(&self, identifier: &str, info: &DeviceInfo) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE tags SET
                display_name = COALESCE(NULLIF(?2, ''), display_name),
                serial = COALESCE(NULLIF(?3, ''), serial),
                firmware = COALESCE(NULLIF(?4, ''), firmware),
                last_seen = ?5
             WHERE id = ?1",
            rusqlite::params![
                identifier,
                &info.display_name,
                &info.serial,
                &info.firmware_version,
                OffsetDateTime::now_utc().unix_timestamp()
            ],
        )?;
        if updated == 0 {
            return Err(Error::TagNotFound(identifier.to_string()));
        }
        Ok(())
    }

    /// Get a tag by identifier.
    pub fn get_tag(&self, identifier: &str) -> Result<Option<StoredTag>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{SELECT_TAG} WHERE id = ?"))?;
        let tag = stmt.query_row([identifier], stored_tag).optional()?;
        Ok(tag)
    }

    /// List all tags, ordered by identifier.
    pub fn list_tags(&self) -> Result<Vec<StoredTag>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{SELECT_TAG} ORDER BY id"))?;
        let tags = stmt
            .query_map([], stored_tag)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tags)
    }

    /// Forget a tag. Returns whether it was known.
    pub fn remove_tag(&self, identifier: &str) -> Result<bool> {
        let removed = self
            .conn()
            .execute("DELETE FROM tags WHERE id = ?", [identifier])?;
        Ok(removed > 0)
    }
}

fn stored_tag(row: &Row<'_>) -> rusqlite::Result<StoredTag> {
    Ok(StoredTag {
        identifier: row.get(0)?,
        display_name: row.get(1)?,
        serial: row.get(2)?,
        firmware: row.get(3)?,
        first_seen: timestamp(row, 4)?,
        last_seen: timestamp(row, 5)?,
    })
}

fn timestamp(row: &Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    let seconds: i64 = row.get(index)?;
    OffsetDateTime::from_unix_timestamp(seconds)
        .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(index, seconds))
}

impl TagRegistry for Store {
    fn upsert(&self, identity: &TagIdentity) -> weartag_core::Result<()> {
        self.upsert_tag(identity)?;
        Ok(())
    }

    fn get(&self, identifier: &str) -> weartag_core::Result<Option<TagIdentity>> {
        match self.get_tag(identifier)? {
            Some(tag) => Ok(Some(tag.identity().map_err(Error::from)?)),
            None => Ok(None),
        }
    }

    fn remove(&self, identifier: &str) -> weartag_core::Result<bool> {
        Ok(self.remove_tag(identifier)?)
    }

    fn all(&self) -> weartag_core::Result<Vec<TagIdentity>> {
        let tags = self.list_tags()?;
        tags.iter()
            .map(|tag| {
                tag.identity()
                    .map_err(|e| weartag_core::Error::from(Error::from(e)))
            })
            .collect()
    }
}
