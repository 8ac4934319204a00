//! Pass ingestion: folder classification, metadata extraction, image
//! classification and reconciliation against the catalog.

pub mod change_detection;
pub mod folders;
pub mod images;
pub mod metadata;
pub mod thumbnails;

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Component, Path};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::{Database, NewImage, PassRecord};
use crate::error::{IngestError, Result};
use crate::prefs::{ImageDirRule, PassConfig, PassTypeConfig, PrefsStore};

pub use change_detection::{folder_needs_rescan, needs_rescan};
pub use folders::{classify_folders, PassCandidate};
pub use images::ImageClassifier;
pub use metadata::{extract_pass_metadata, PassMetadata};
pub use thumbnails::{run_thumbnail_stage, ThumbnailManager, ThumbnailSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Rebuild everything; callers wipe the catalog first.
    Populate,
    /// Only passes that are new or still flagged for rescan.
    Incremental,
    /// Re-derive stored image labels from the current rules without listing files.
    MetadataOnly,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Populate => "populate",
            RunMode::Incremental => "incremental",
            RunMode::MetadataOnly => "metadata-only",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    /// Passes written (or remapped) during the run.
    pub processed: usize,
    /// Passes left alone: settled, or without a usable pass type.
    pub skipped: usize,
    pub images_inserted: usize,
    pub images_remapped: usize,
}

pub struct Scanner<'a> {
    root: &'a Path,
    config: &'a PassConfig,
    classifier: ImageClassifier<'a>,
}

impl<'a> Scanner<'a> {
    pub fn new(root: &'a Path, config: &'a PassConfig, extensions: &'a [String]) -> Self {
        Self {
            root,
            config,
            classifier: ImageClassifier::new(config, extensions),
        }
    }

    /// Reconcile the catalog with the ingestion root. `cancel` is checked
    /// between passes; a set flag aborts with [`IngestError::Cancelled`].
    pub fn run(&self, db: &Database, mode: RunMode, cancel: &AtomicBool) -> Result<ScanSummary> {
        info!("Catalog run started (mode {})", mode.as_str());
        let summary = match mode {
            RunMode::MetadataOnly => self.remap_metadata(db, cancel)?,
            RunMode::Populate | RunMode::Incremental => self.reconcile(db, mode, cancel)?,
        };
        info!(
            "Catalog run finished: {} processed, {} skipped, {} images inserted, {} remapped",
            summary.processed, summary.skipped, summary.images_inserted, summary.images_remapped
        );
        Ok(summary)
    }

    fn reconcile(&self, db: &Database, mode: RunMode, cancel: &AtomicBool) -> Result<ScanSummary> {
        let existing = match mode {
            RunMode::Incremental => db.existing_passes()?,
            _ => HashMap::new(),
        };

        let candidates = classify_folders(self.root, &self.config.folder_includes);
        debug!("{} candidate pass folders", candidates.len());

        let mut summary = ScanSummary::default();
        for candidate in &candidates {
            check_cancelled(cancel)?;

            let known = existing.get(&candidate.folder);
            if known.is_some_and(|p| !p.needs_rescan) {
                summary.skipped += 1;
                continue;
            }

            let Some(pass_type) = self.config.pass_type(&candidate.pass_type) else {
                warn!(
                    "Folder {} maps to unknown pass type {}",
                    candidate.folder, candidate.pass_type
                );
                summary.skipped += 1;
                continue;
            };

            let (record, images) = self.ingest_pass(candidate, pass_type);
            let (pass_id, inserted) = db.save_pass(&record, known.map(|p| p.id), &images)?;
            debug!(
                "Pass {} (id {}): {} images found, {} new, rescan={}",
                record.name,
                pass_id,
                images.len(),
                inserted,
                record.needs_rescan
            );

            summary.processed += 1;
            summary.images_inserted += inserted;
        }

        Ok(summary)
    }

    /// Everything the catalog stores for one candidate folder, read from disk.
    pub fn ingest_pass(
        &self,
        candidate: &PassCandidate,
        pass_type: &PassTypeConfig,
    ) -> (PassRecord, Vec<NewImage>) {
        let meta = extract_pass_metadata(self.root, &candidate.folder, &candidate.pass_type, pass_type);
        let images = self.classifier.classify_pass(self.root, &candidate.folder, pass_type);
        let needs_rescan = folder_needs_rescan(&self.root.join(&candidate.folder));

        let record = PassRecord {
            name: candidate.folder.clone(),
            satellite: meta.satellite,
            timestamp: meta.timestamp,
            raw_data_path: meta.raw_data_path,
            downlink: meta.downlink,
            needs_rescan,
        };
        (record, images)
    }

    fn remap_metadata(&self, db: &Database, cancel: &AtomicBool) -> Result<ScanSummary> {
        let mut passes: Vec<_> = db.existing_passes()?.into_iter().collect();
        passes.sort_by_key(|(_, p)| p.id);

        let mut summary = ScanSummary::default();
        for (name, pass) in passes {
            check_cancelled(cancel)?;

            let pass_type = folders::resolve_pass_type(&name, &self.config.folder_includes)
                .and_then(|code| self.config.pass_type(code));
            let Some(pass_type) = pass_type else {
                debug!("No pass type for stored pass {}", name);
                summary.skipped += 1;
                continue;
            };

            let prefix = format!("{}/", name);
            for image in db.images_for_pass(pass.id)? {
                let inner = image.path.strip_prefix(&prefix).unwrap_or(&image.path);
                let (dir, file_name) = inner.rsplit_once('/').unwrap_or((".", inner));

                let Some(rule) = find_dir_rule(pass_type, dir) else {
                    continue;
                };

                let stem = Path::new(file_name)
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                let composite = self.classifier.resolve_composite(&stem, rule);
                let corrected = images::is_corrected(rule, file_name);

                if composite == image.composite
                    && rule.sensor == image.sensor
                    && corrected == image.corrected
                    && rule.is_filled == image.filled
                {
                    continue;
                }

                db.update_image_metadata(image.id, &composite, &rule.sensor, corrected, rule.is_filled)?;
                summary.images_remapped += 1;
            }
            summary.processed += 1;
        }

        Ok(summary)
    }
}

/// Image directory rule for a directory inside a pass: exact key, then a
/// case-insensitive key, then a glob key.
fn find_dir_rule<'c>(pass_type: &'c PassTypeConfig, dir: &str) -> Option<&'c ImageDirRule> {
    pass_type
        .image_dirs
        .get(dir)
        .or_else(|| {
            pass_type
                .image_dirs
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(dir))
                .map(|(_, rule)| rule)
        })
        .or_else(|| {
            pass_type
                .image_dirs
                .iter()
                .filter(|(key, _)| key.contains('*'))
                .find(|(key, _)| folders::glob_matches_path(key, dir))
                .map(|(_, rule)| rule)
        })
}

fn check_cancelled(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::Relaxed) {
        Err(IngestError::Cancelled)
    } else {
        Ok(())
    }
}

/// `path` relative to `base` with forward slashes. `None` when `path` is not
/// inside `base` or the remainder climbs out of it.
pub(crate) fn relative_slash_path(base: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Open both stores, load the rules and run one reconciliation. A populate
/// run wipes the catalog first.
pub fn run_catalog_update(config: &Config, mode: RunMode, cancel: &AtomicBool) -> Result<ScanSummary> {
    config
        .check_paths()
        .map_err(|e| IngestError::Config(e.to_string()))?;
    let root = &config.paths.live_output_dir;
    if !root.is_dir() {
        return Err(IngestError::Config(format!(
            "ingestion root {} is not a directory",
            root.display()
        )));
    }

    let mut prefs = PrefsStore::open(&config.prefs_db_path())?;
    prefs.initialize()?;
    let pass_config = prefs.load_pass_config()?;

    let mut db = Database::open(&config.catalog_db_path())?;
    db.initialize()?;
    if mode == RunMode::Populate {
        info!("Clearing catalog before populate");
        db.clear_tables()?;
    }

    Scanner::new(root, &pass_config, &config.scanner.image_extensions).run(&db, mode, cancel)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs::{self, File};
    use std::time::{Duration, SystemTime};
    use walkdir::WalkDir;

    pub fn write_png(path: &Path, width: u32, height: u32) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        image::RgbImage::new(width, height).save(path).unwrap();
    }

    /// Push every file under `dir` back by `age`.
    pub fn backdate_tree(dir: &Path, age: Duration) {
        let when = SystemTime::now() - age;
        for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                File::options()
                    .write(true)
                    .open(entry.path())
                    .unwrap()
                    .set_modified(when)
                    .unwrap();
            }
        }
    }

    pub fn sample_config() -> PassConfig {
        let mut image_dirs = BTreeMap::new();
        image_dirs.insert(
            "MSU-MR".to_string(),
            ImageDirRule {
                sensor: "MSU-MR".to_string(),
                ..Default::default()
            },
        );
        let mut pass_types = BTreeMap::new();
        pass_types.insert(
            "meteor_lrpt".to_string(),
            PassTypeConfig {
                dataset_file: "dataset.json".to_string(),
                downlink: "LRPT".to_string(),
                image_dirs,
                ..Default::default()
            },
        );

        PassConfig {
            composites: vec![crate::prefs::CompositeRule {
                key: "rgb".to_string(),
                label: "RGB".to_string(),
            }],
            pass_types,
            folder_includes: vec![crate::prefs::FolderInclude {
                pattern: "METEOR".to_string(),
                pass_type: "meteor_lrpt".to_string(),
            }],
        }
    }

    /// Two METEOR passes, one settled and one still being written.
    pub fn sample_root(root: &Path) {
        for folder in ["2024-05-01_12-30_METEOR", "2024-05-02_09-15_METEOR"] {
            let pass = root.join(folder);
            write_png(&pass.join("MSU-MR/msu_rgb_123.png"), 4, 6);
            write_png(&pass.join("MSU-MR/msu_thermal_map.png"), 4, 6);
            fs::write(
                pass.join("dataset.json"),
                r#"{"satellite": "METEOR-M2 3", "timestamp": 0}"#,
            )
            .unwrap();
        }
        backdate_tree(&root.join("2024-05-01_12-30_METEOR"), Duration::from_secs(3600));
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::collections::HashSet;
    use tempfile::tempdir;

    const SETTLED: &str = "2024-05-01_12-30_METEOR";
    const ACTIVE: &str = "2024-05-02_09-15_METEOR";

    fn catalog() -> Database {
        let mut db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn test_incremental_run_is_idempotent() {
        let dir = tempdir().unwrap();
        sample_root(dir.path());
        let config = sample_config();
        let exts = vec!["png".to_string()];
        let scanner = Scanner::new(dir.path(), &config, &exts);
        let db = catalog();
        let cancel = AtomicBool::new(false);

        let first = scanner.run(&db, RunMode::Incremental, &cancel).unwrap();
        assert_eq!(first.processed, 2);
        assert_eq!(first.images_inserted, 4);

        let second = scanner.run(&db, RunMode::Incremental, &cancel).unwrap();
        assert_eq!(second.images_inserted, 0);
        // The settled pass is skipped, the active one is re-read.
        assert_eq!(second.skipped, 1);
        assert_eq!(second.processed, 1);
        assert_eq!(db.image_count().unwrap(), 4);
        assert_eq!(db.pass_count().unwrap(), 2);

        for name in [SETTLED, ACTIVE] {
            let pass = db.get_pass(name).unwrap().unwrap();
            let paths: Vec<String> = db
                .images_for_pass(pass.id)
                .unwrap()
                .into_iter()
                .map(|i| i.path)
                .collect();
            let unique: HashSet<&String> = paths.iter().collect();
            assert_eq!(unique.len(), paths.len());
        }
    }

    #[test]
    fn test_rescan_flag_follows_folder_age() {
        let dir = tempdir().unwrap();
        sample_root(dir.path());
        let config = sample_config();
        let exts = vec!["png".to_string()];
        let db = catalog();

        Scanner::new(dir.path(), &config, &exts)
            .run(&db, RunMode::Populate, &AtomicBool::new(false))
            .unwrap();

        let settled = db.get_pass(SETTLED).unwrap().unwrap();
        let active = db.get_pass(ACTIVE).unwrap().unwrap();
        assert!(!settled.needs_rescan);
        assert!(active.needs_rescan);
        assert_eq!(settled.satellite, "METEOR-M2 3");
        assert_eq!(settled.timestamp, Some(1_714_566_600));
        assert_eq!(settled.downlink, "LRPT");
        assert_eq!(settled.raw_data_path, crate::db::NOT_CONFIGURED);
    }

    #[test]
    fn test_metadata_only_remap_keeps_paths() {
        let dir = tempdir().unwrap();
        sample_root(dir.path());
        let mut config = sample_config();
        let exts = vec!["png".to_string()];
        let db = catalog();
        let cancel = AtomicBool::new(false);

        Scanner::new(dir.path(), &config, &exts)
            .run(&db, RunMode::Populate, &cancel)
            .unwrap();
        let pass = db.get_pass(SETTLED).unwrap().unwrap();
        let before = db.images_for_pass(pass.id).unwrap();

        let rule = config
            .pass_types
            .get_mut("meteor_lrpt")
            .unwrap()
            .image_dirs
            .get_mut("MSU-MR")
            .unwrap();
        rule.sensor = "MSU-MR (Filled)".to_string();
        rule.is_filled = true;
        config.composites[0].label = "Natural Color".to_string();

        // Files vanishing from disk must not matter for a remap.
        std::fs::remove_dir_all(dir.path().join(SETTLED)).unwrap();

        let summary = Scanner::new(dir.path(), &config, &exts)
            .run(&db, RunMode::MetadataOnly, &cancel)
            .unwrap();
        assert_eq!(summary.images_remapped, 4);
        assert_eq!(summary.images_inserted, 0);

        let after = db.images_for_pass(pass.id).unwrap();
        assert_eq!(after.len(), before.len());
        for (old, new) in before.iter().zip(&after) {
            assert_eq!(old.path, new.path);
            assert_eq!(old.map_overlay, new.map_overlay);
            assert_eq!(new.sensor, "MSU-MR (Filled)");
            assert!(new.filled);
        }
        assert_eq!(after[0].composite, "Natural Color");
        assert_eq!(after[1].composite, images::DEFAULT_COMPOSITE);
        assert_eq!(db.image_count().unwrap(), 4);
    }

    #[test]
    fn test_cancelled_run_stops() {
        let dir = tempdir().unwrap();
        sample_root(dir.path());
        let config = sample_config();
        let exts = vec!["png".to_string()];
        let db = catalog();

        let result = Scanner::new(dir.path(), &config, &exts).run(
            &db,
            RunMode::Incremental,
            &AtomicBool::new(true),
        );
        assert!(matches!(result, Err(IngestError::Cancelled)));
        assert_eq!(db.pass_count().unwrap(), 0);
    }

    #[test]
    fn test_run_catalog_update_needs_rules() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.paths.data_dir = dir.path().join("data");
        config.paths.live_output_dir = dir.path().join("live");
        std::fs::create_dir_all(&config.paths.live_output_dir).unwrap();

        let result = run_catalog_update(&config, RunMode::Incremental, &AtomicBool::new(false));
        assert!(matches!(result, Err(IngestError::NoPassConfig)));
    }

    #[test]
    fn test_run_catalog_update_populate_rebuilds() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.paths.data_dir = dir.path().join("data");
        config.paths.live_output_dir = dir.path().join("live");
        sample_root(&config.paths.live_output_dir);

        let mut prefs = PrefsStore::open(&config.prefs_db_path()).unwrap();
        prefs.initialize().unwrap();
        prefs.seed_from_pass_config(&sample_config()).unwrap();
        drop(prefs);

        let cancel = AtomicBool::new(false);
        let first = run_catalog_update(&config, RunMode::Populate, &cancel).unwrap();
        assert_eq!(first.images_inserted, 4);

        let again = run_catalog_update(&config, RunMode::Populate, &cancel).unwrap();
        assert_eq!(again.images_inserted, 4);

        let db = Database::open(&config.catalog_db_path()).unwrap();
        assert_eq!(db.image_count().unwrap(), 4);
        assert_eq!(db.get_pass(SETTLED).unwrap().unwrap().id, 1);
    }

    #[test]
    fn test_missing_root_is_config_error() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.paths.data_dir = dir.path().join("data");
        config.paths.live_output_dir = dir.path().join("nope");

        let result = run_catalog_update(&config, RunMode::Populate, &AtomicBool::new(false));
        assert!(matches!(result, Err(IngestError::Config(_))));
    }

    #[test]
    fn test_run_mode_labels() {
        assert_eq!(RunMode::Populate.as_str(), "populate");
        assert_eq!(RunMode::MetadataOnly.as_str(), "metadata-only");
        assert_eq!(
            serde_json::to_string(&RunMode::MetadataOnly).unwrap(),
            "\"metadata_only\""
        );
    }

    #[test]
    fn test_find_dir_rule_fallbacks() {
        let config = sample_config();
        let pass_type = config.pass_type("meteor_lrpt").unwrap();
        assert!(find_dir_rule(pass_type, "MSU-MR").is_some());
        assert!(find_dir_rule(pass_type, "msu-mr").is_some());
        assert!(find_dir_rule(pass_type, "AVHRR").is_none());

        let mut globbed = pass_type.clone();
        globbed.image_dirs.insert("ch*".to_string(), ImageDirRule::default());
        assert!(find_dir_rule(&globbed, "ch1").is_some());
        assert!(find_dir_rule(&globbed, "ch1/raw").is_none());
    }

    #[test]
    fn test_store_error_aborts_run() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("live");
        sample_root(&root);
        let config = sample_config();
        let exts = vec!["png".to_string()];

        let db_path = dir.path().join("catalog.db");
        let mut db = Database::open(&db_path).unwrap();
        db.initialize().unwrap();

        // Only the first pass is rejected; the second would store fine.
        let other = rusqlite::Connection::open(&db_path).unwrap();
        other
            .execute_batch(&format!(
                r#"
                CREATE TRIGGER reject_pass BEFORE INSERT ON passes
                WHEN NEW.name = '{}'
                BEGIN SELECT RAISE(ABORT, 'disk full'); END;
                "#,
                SETTLED
            ))
            .unwrap();
        drop(other);

        let result = Scanner::new(&root, &config, &exts).run(
            &db,
            RunMode::Populate,
            &AtomicBool::new(false),
        );
        match result {
            Err(IngestError::Persistence { context, .. }) => {
                assert!(context.contains(SETTLED), "context: {}", context)
            }
            unexpected => panic!("expected persistence error, got {:?}", unexpected),
        }
        assert_eq!(db.pass_count().unwrap(), 0);
        assert_eq!(db.image_count().unwrap(), 0);
    }
}
