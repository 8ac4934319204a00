use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use crate::config::{Config, ThumbnailConfig};
use crate::db::Database;
use crate::error::{IngestError, Result};

/// Renders catalog images into a thumbnail tree mirroring the ingestion root.
pub struct ThumbnailManager {
    source_root: PathBuf,
    cache_dir: PathBuf,
    size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThumbnailSummary {
    pub generated: usize,
    pub failed: usize,
}

impl ThumbnailManager {
    pub fn new(source_root: &Path, cache_dir: &Path, config: &ThumbnailConfig) -> Self {
        Self {
            source_root: source_root.to_path_buf(),
            cache_dir: cache_dir.to_path_buf(),
            size: config.size,
        }
    }

    /// `None` when no thumbnail directory is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        let cache_dir = config.paths.thumbnail_dir.as_ref()?;
        Some(Self::new(&config.paths.live_output_dir, cache_dir, &config.thumbnails))
    }

    /// Thumbnails keep the image's catalog path, so the format follows the
    /// source extension.
    pub fn thumbnail_path(&self, image_path: &str) -> PathBuf {
        self.cache_dir.join(image_path)
    }

    /// Generate the thumbnail for one catalog image path, unless it exists.
    pub fn generate(&self, image_path: &str) -> Result<PathBuf> {
        let dest = self.thumbnail_path(image_path);
        if dest.exists() {
            return Ok(dest);
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let img = image::open(self.source_root.join(image_path))?;
        img.thumbnail(self.size, self.size).save(&dest)?;

        Ok(dest)
    }

    /// Render every image flagged `needsThumb`. Failures are logged and the
    /// image stays flagged for the next run.
    pub fn generate_pending(&self, db: &Database, cancel: &AtomicBool) -> Result<ThumbnailSummary> {
        let jobs = db.images_needing_thumbnails()?;
        if jobs.is_empty() {
            return Ok(ThumbnailSummary::default());
        }
        info!("Generating {} thumbnails", jobs.len());

        let results: Vec<(i64, Option<Result<PathBuf>>)> = jobs
            .par_iter()
            .map(|job| {
                if cancel.load(Ordering::Relaxed) {
                    return (job.image_id, None);
                }
                (job.image_id, Some(self.generate(&job.path)))
            })
            .collect();

        let mut done = Vec::new();
        let mut summary = ThumbnailSummary::default();
        for ((image_id, result), job) in results.into_iter().zip(&jobs) {
            match result {
                Some(Ok(_)) => done.push(image_id),
                Some(Err(e)) => {
                    warn!("Thumbnail failed for {}: {}", job.path, e);
                    summary.failed += 1;
                }
                None => {}
            }
        }
        summary.generated = done.len();
        db.mark_thumbnails_done(&done)?;

        if cancel.load(Ordering::Relaxed) {
            return Err(IngestError::Cancelled);
        }
        Ok(summary)
    }
}

/// Second stage of a catalog run. Skipped when no thumbnail directory is set.
pub fn run_thumbnail_stage(config: &Config, cancel: &AtomicBool) -> Result<ThumbnailSummary> {
    let Some(manager) = ThumbnailManager::from_config(config) else {
        info!("No thumbnail directory configured, skipping thumbnails");
        return Ok(ThumbnailSummary::default());
    };

    let mut db = Database::open(&config.catalog_db_path())?;
    db.initialize()?;
    let summary = manager.generate_pending(&db, cancel)?;
    info!(
        "Thumbnails: {} generated, {} failed",
        summary.generated, summary.failed
    );
    Ok(summary)
}
