use rusqlite::params;

use super::{bool_to_int, Database};
use crate::error::{IngestError, Result};

/// A classified image ready to be stored under a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewImage {
    /// Relative to the ingestion root, forward slashes, first segment is the pass folder.
    pub path: String,
    pub composite: String,
    pub sensor: String,
    pub map_overlay: bool,
    pub corrected: bool,
    pub filled: bool,
    pub v_pixels: Option<u32>,
}

/// A stored image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub id: i64,
    pub path: String,
    pub composite: String,
    pub sensor: String,
    pub map_overlay: bool,
    pub corrected: bool,
    pub filled: bool,
    pub v_pixels: Option<u32>,
    pub pass_id: i64,
    pub needs_thumb: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailJob {
    pub image_id: i64,
    pub path: String,
}

impl Database {
    pub fn images_for_pass(&self, pass_id: i64) -> Result<Vec<Image>> {
        let ctx = || format!("load images for pass {}", pass_id);
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, path, composite, sensor, mapOverlay, corrected, filled, vPixels, passId, needsThumb
                FROM images
                WHERE passId = ?
                ORDER BY id
                "#,
            )
            .map_err(|e| IngestError::persistence(ctx(), e))?;
        let images = stmt
            .query_map([pass_id], |row| {
                Ok(Image {
                    id: row.get(0)?,
                    path: row.get(1)?,
                    composite: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    sensor: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    map_overlay: row.get::<_, i64>(4)? != 0,
                    corrected: row.get::<_, i64>(5)? != 0,
                    filled: row.get::<_, i64>(6)? != 0,
                    v_pixels: row.get::<_, Option<i64>>(7)?.map(|v| v.max(0) as u32),
                    pass_id: row.get(8)?,
                    needs_thumb: row.get::<_, i64>(9)? != 0,
                })
            })
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| IngestError::persistence(ctx(), e))?;
        Ok(images)
    }

    /// Rewrite the rule-derived columns of one image. Path, overlay flag,
    /// height and thumbnail state are left alone.
    pub fn update_image_metadata(
        &self,
        image_id: i64,
        composite: &str,
        sensor: &str,
        corrected: bool,
        filled: bool,
    ) -> Result<()> {
        self.conn
            .execute(
                r#"
                UPDATE images
                SET composite = ?, sensor = ?, corrected = ?, filled = ?
                WHERE id = ?
                "#,
                params![
                    composite,
                    sensor,
                    bool_to_int(corrected),
                    bool_to_int(filled),
                    image_id
                ],
            )
            .map_err(|e| IngestError::persistence(format!("update image {}", image_id), e))?;
        Ok(())
    }

    pub fn images_needing_thumbnails(&self) -> Result<Vec<ThumbnailJob>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, path FROM images WHERE needsThumb = 1 ORDER BY id")
            .map_err(|e| IngestError::persistence("load thumbnail queue", e))?;
        let jobs = stmt
            .query_map([], |row| {
                Ok(ThumbnailJob {
                    image_id: row.get(0)?,
                    path: row.get(1)?,
                })
            })
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| IngestError::persistence("load thumbnail queue", e))?;
        Ok(jobs)
    }

    pub fn mark_thumbnails_done(&self, image_ids: &[i64]) -> Result<()> {
        if image_ids.is_empty() {
            return Ok(());
        }
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| IngestError::persistence("begin thumbnail update", e))?;
        {
            let mut stmt = tx
                .prepare("UPDATE images SET needsThumb = 0 WHERE id = ?")
                .map_err(|e| IngestError::persistence("prepare thumbnail update", e))?;
            for id in image_ids {
                stmt.execute([id])
                    .map_err(|e| IngestError::persistence("mark thumbnail done", e))?;
            }
        }
        tx.commit()
            .map_err(|e| IngestError::persistence("commit thumbnail update", e))?;
        Ok(())
    }
}
