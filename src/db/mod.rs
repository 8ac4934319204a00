pub mod images;
pub mod passes;
pub mod schema;

use rusqlite::Connection;
use std::path::Path;

use crate::error::{IngestError, Result};

pub use images::{Image, NewImage, ThumbnailJob};
pub use passes::{ExistingPass, Pass, PassRecord};

/// Placeholder stored for a raw-data path or downlink the pass type leaves unset.
pub const NOT_CONFIGURED: &str = "NOT_CONFIGURED";

/// The pass/image catalog.
pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA busy_timeout = 5000; PRAGMA journal_mode = WAL;")?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    pub fn initialize(&mut self) -> Result<()> {
        schema::apply_migrations(&mut self.conn, schema::CATALOG_MIGRATIONS)
            .map_err(|e| IngestError::persistence("init schema", e))
    }

    /// Wipe every pass and image and reset their id sequences.
    pub fn clear_tables(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
                DELETE FROM images;
                DELETE FROM passes;
                DELETE FROM sqlite_sequence WHERE name IN ('images', 'passes');
                "#,
            )
            .map_err(|e| IngestError::persistence("clear tables", e))
    }

    pub fn pass_count(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM passes", [], |row| row.get(0))
            .map_err(|e| IngestError::persistence("count passes", e))
    }

    pub fn image_count(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))
            .map_err(|e| IngestError::persistence("count images", e))
    }
}

pub(crate) fn bool_to_int(b: bool) -> i64 {
    if b {
        1
    } else {
        0
    }
}
