//! Pass rows: upsert by folder name, with their images in one transaction.

use rusqlite::{params, OptionalExtension};
use std::collections::{HashMap, HashSet};

use super::images::NewImage;
use super::{bool_to_int, Database};
use crate::error::{IngestError, Result};

/// A stored pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pass {
    pub id: i64,
    pub name: String,
    pub satellite: String,
    pub timestamp: Option<i64>,
    pub raw_data_path: String,
    pub downlink: String,
    pub needs_rescan: bool,
}

/// Values written for a pass on every reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassRecord {
    pub name: String,
    pub satellite: String,
    pub timestamp: Option<i64>,
    pub raw_data_path: String,
    pub downlink: String,
    pub needs_rescan: bool,
}

/// What an incremental run needs to know about a pass already in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistingPass {
    pub id: i64,
    pub needs_rescan: bool,
}

impl Database {
    /// All stored passes keyed by name.
    pub fn existing_passes(&self) -> Result<HashMap<String, ExistingPass>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, COALESCE(needsRescan, 1) FROM passes")
            .map_err(|e| IngestError::persistence("load existing passes", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(1)?,
                    ExistingPass {
                        id: row.get(0)?,
                        needs_rescan: row.get::<_, i64>(2)? != 0,
                    },
                ))
            })
            .and_then(|rows| rows.collect::<rusqlite::Result<HashMap<_, _>>>())
            .map_err(|e| IngestError::persistence("load existing passes", e))?;
        Ok(rows)
    }

    pub fn get_pass(&self, name: &str) -> Result<Option<Pass>> {
        self.conn
            .query_row(
                r#"
                SELECT id, name, satellite, timestamp, rawDataPath, downlink, needsRescan
                FROM passes WHERE name = ?
                "#,
                [name],
                |row| {
                    Ok(Pass {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        satellite: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        timestamp: row.get(3)?,
                        raw_data_path: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                        downlink: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                        needs_rescan: row.get::<_, i64>(6)? != 0,
                    })
                },
            )
            .optional()
            .map_err(|e| IngestError::persistence(format!("load pass {}", name), e))
    }

    /// Upsert `pass` and insert those of `images` whose path is not yet stored
    /// for it, all inside one transaction. Returns the pass id and the number
    /// of images inserted.
    ///
    /// `existing_id` is the id already known for this pass name; the row is
    /// updated in place so the id stays stable.
    pub fn save_pass(
        &self,
        pass: &PassRecord,
        existing_id: Option<i64>,
        images: &[NewImage],
    ) -> Result<(i64, usize)> {
        let ctx = |what: &str| format!("{} for pass {}", what, pass.name);

        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| IngestError::persistence(ctx("begin transaction"), e))?;

        let pass_id = match existing_id {
            Some(id) => {
                tx.execute(
                    r#"
                    UPDATE passes
                    SET satellite = ?, timestamp = ?, rawDataPath = ?, downlink = ?, needsRescan = ?
                    WHERE id = ?
                    "#,
                    params![
                        pass.satellite,
                        pass.timestamp,
                        pass.raw_data_path,
                        pass.downlink,
                        bool_to_int(pass.needs_rescan),
                        id,
                    ],
                )
                .map_err(|e| IngestError::persistence(ctx("update pass"), e))?;
                id
            }
            None => tx
                .query_row(
                    r#"
                    INSERT INTO passes (name, satellite, timestamp, rawDataPath, downlink, needsRescan)
                    VALUES (?, ?, ?, ?, ?, ?)
                    ON CONFLICT(name) DO UPDATE SET
                        satellite = excluded.satellite,
                        timestamp = excluded.timestamp,
                        rawDataPath = excluded.rawDataPath,
                        downlink = excluded.downlink,
                        needsRescan = excluded.needsRescan
                    RETURNING id
                    "#,
                    params![
                        pass.name,
                        pass.satellite,
                        pass.timestamp,
                        pass.raw_data_path,
                        pass.downlink,
                        bool_to_int(pass.needs_rescan),
                    ],
                    |row| row.get(0),
                )
                .map_err(|e| IngestError::persistence(ctx("insert pass"), e))?,
        };

        let inserted = if images.is_empty() {
            0
        } else {
            let known: HashSet<String> = {
                let mut stmt = tx
                    .prepare("SELECT path FROM images WHERE passId = ?")
                    .map_err(|e| IngestError::persistence(ctx("query image paths"), e))?;
                let paths = stmt
                    .query_map([pass_id], |row| row.get::<_, String>(0))
                    .and_then(|rows| rows.collect::<rusqlite::Result<HashSet<_>>>())
                    .map_err(|e| IngestError::persistence(ctx("query image paths"), e))?;
                paths
            };

            let fresh: Vec<&NewImage> = images
                .iter()
                .filter(|img| !known.contains(&img.path))
                .collect();

            let mut stmt = tx
                .prepare(
                    r#"
                    INSERT OR IGNORE INTO images
                        (path, composite, sensor, mapOverlay, corrected, filled, vPixels, passId, needsThumb)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1)
                    "#,
                )
                .map_err(|e| IngestError::persistence(ctx("prepare image insert"), e))?;

            let mut count = 0;
            for img in fresh {
                count += stmt
                    .execute(params![
                        img.path,
                        img.composite,
                        img.sensor,
                        bool_to_int(img.map_overlay),
                        bool_to_int(img.corrected),
                        bool_to_int(img.filled),
                        img.v_pixels,
                        pass_id,
                    ])
                    .map_err(|e| IngestError::persistence(ctx("insert image"), e))?;
            }
            count
        };

        tx.commit()
            .map_err(|e| IngestError::persistence(ctx("commit"), e))?;

        Ok((pass_id, inserted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        let mut db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn record(name: &str) -> PassRecord {
        PassRecord {
            name: name.to_string(),
            satellite: "NOAA 19".to_string(),
            timestamp: Some(1_714_566_600),
            raw_data_path: "NOT_CONFIGURED".to_string(),
            downlink: "APT".to_string(),
            needs_rescan: true,
        }
    }

    fn image(path: &str) -> NewImage {
        NewImage {
            path: path.to_string(),
            composite: "Other".to_string(),
            sensor: "AVHRR".to_string(),
            map_overlay: false,
            corrected: false,
            filled: false,
            v_pixels: Some(1040),
        }
    }

    #[test]
    fn test_save_pass_skips_known_images() {
        let db = db();
        let pass = record("2024-05-01_12-30_NOAA19");

        let (id, inserted) = db
            .save_pass(&pass, None, &[image("p/a.png"), image("p/b.png")])
            .unwrap();
        assert_eq!(inserted, 2);

        let (again, inserted) = db
            .save_pass(&pass, Some(id), &[image("p/a.png"), image("p/b.png"), image("p/c.png")])
            .unwrap();
        assert_eq!(again, id);
        assert_eq!(inserted, 1);
        assert_eq!(db.image_count().unwrap(), 3);
    }

    #[test]
    fn test_upsert_keeps_pass_id() {
        let db = db();
        let mut pass = record("2024-05-01_12-30_NOAA19");
        let (id, _) = db.save_pass(&pass, None, &[]).unwrap();

        pass.satellite = "NOAA 18".to_string();
        pass.needs_rescan = false;
        // Unknown id but same name: still an update of the same row.
        let (second, _) = db.save_pass(&pass, None, &[]).unwrap();
        assert_eq!(second, id);

        let stored = db.get_pass(&pass.name).unwrap().unwrap();
        assert_eq!(stored.satellite, "NOAA 18");
        assert!(!stored.needs_rescan);
        assert_eq!(db.pass_count().unwrap(), 1);

        let existing = db.existing_passes().unwrap();
        assert_eq!(existing[&pass.name], ExistingPass { id, needs_rescan: false });
    }

    #[test]
    fn test_clear_tables_resets_ids() {
        let db = db();
        db.save_pass(&record("a"), None, &[image("a/x.png")]).unwrap();
        db.save_pass(&record("b"), None, &[]).unwrap();
        db.clear_tables().unwrap();

        assert_eq!(db.pass_count().unwrap(), 0);
        assert_eq!(db.image_count().unwrap(), 0);
        let (id, _) = db.save_pass(&record("c"), None, &[]).unwrap();
        assert_eq!(id, 1);
    }
}
