//! SQLite-backed preference store holding the classification rules.

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;
use std::time::Duration;

use super::{CompositeRule, FolderInclude, ImageDirRule, PassConfig, PassTypeConfig};
use crate::db::schema::{apply_migrations, PREFS_MIGRATIONS};
use crate::error::{IngestError, Result};

/// Settings key holding the update cooldown in whole seconds.
pub const UPDATE_COOLDOWN_KEY: &str = "update_cd";

pub struct PrefsStore {
    conn: Connection,
}

impl PrefsStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn })
    }

    /// Open an existing store for reads. Nothing is created or migrated.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn })
    }

    pub fn initialize(&mut self) -> Result<()> {
        apply_migrations(&mut self.conn, PREFS_MIGRATIONS)?;
        Ok(())
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM app_settings WHERE key = ?",
                [key.trim()],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let key = key.trim();
        if key.is_empty() {
            return Err(IngestError::Config("setting key required".to_string()));
        }
        self.conn.execute(
            r#"
            INSERT INTO app_settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    /// Cooldown between successful update runs, falling back to `default`.
    pub fn update_cooldown(&self, default: Duration) -> Result<Duration> {
        let value = self.get_setting(UPDATE_COOLDOWN_KEY)?;
        Ok(cooldown_from_setting(value.as_deref(), default))
    }

    // ========================================================================
    // Classification rules
    // ========================================================================

    pub fn upsert_composite(&self, key: &str, label: &str, enabled: bool) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO composites (key, label, enabled) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET label = excluded.label, enabled = excluded.enabled
            "#,
            params![key.trim(), label.trim(), enabled as i64],
        )?;
        Ok(())
    }

    pub fn upsert_pass_type(
        &self,
        code: &str,
        dataset_file: &str,
        rawdata_file: &str,
        downlink: &str,
    ) -> Result<i64> {
        let code = code.trim();
        if code.is_empty() {
            return Err(IngestError::Config("pass type code required".to_string()));
        }
        self.conn.execute(
            r#"
            INSERT INTO pass_types (code, dataset_file, rawdata_file, downlink) VALUES (?, ?, ?, ?)
            ON CONFLICT(code) DO UPDATE SET
                dataset_file = excluded.dataset_file,
                rawdata_file = excluded.rawdata_file,
                downlink = excluded.downlink
            "#,
            params![code, dataset_file.trim(), rawdata_file.trim(), downlink.trim()],
        )?;
        self.pass_type_id(code)?
            .ok_or_else(|| IngestError::Config(format!("pass type not found: {}", code)))
    }

    fn pass_type_id(&self, code: &str) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row("SELECT id FROM pass_types WHERE code = ?", [code.trim()], |row| {
                row.get(0)
            })
            .optional()?)
    }

    pub fn upsert_image_dir_rule(
        &self,
        pass_type_code: &str,
        dir_name: &str,
        rule: &ImageDirRule,
    ) -> Result<()> {
        let pass_type_id = self.pass_type_id(pass_type_code)?.ok_or_else(|| {
            IngestError::Config(format!("pass type not found: {}", pass_type_code))
        })?;
        self.conn.execute(
            r#"
            INSERT INTO image_dir_rules
                (pass_type_id, dir_name, sensor, is_filled, v_pix, is_corrected, composite)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(pass_type_id, dir_name) DO UPDATE SET
                sensor = excluded.sensor,
                is_filled = excluded.is_filled,
                v_pix = excluded.v_pix,
                is_corrected = excluded.is_corrected,
                composite = excluded.composite
            "#,
            params![
                pass_type_id,
                dir_name.trim(),
                rule.sensor,
                rule.is_filled as i64,
                rule.v_pix,
                rule.is_corrected as i64,
                rule.composite.trim(),
            ],
        )?;
        Ok(())
    }

    /// Re-pointing an existing pattern keeps its position in evaluation order.
    pub fn upsert_folder_include(&self, pattern: &str, pass_type_code: &str) -> Result<()> {
        let pass_type_id = self.pass_type_id(pass_type_code)?.ok_or_else(|| {
            IngestError::Config(format!("pass type not found: {}", pass_type_code))
        })?;
        self.conn.execute(
            r#"
            INSERT INTO folder_includes (prefix, pass_type_id) VALUES (?, ?)
            ON CONFLICT(prefix) DO UPDATE SET pass_type_id = excluded.pass_type_id
            "#,
            params![pattern.trim(), pass_type_id],
        )?;
        Ok(())
    }

    /// Write every rule of `config` into the store, pass types first so the
    /// dependent rows can reference them.
    pub fn seed_from_pass_config(&self, config: &PassConfig) -> Result<()> {
        for composite in &config.composites {
            self.upsert_composite(&composite.key, &composite.label, true)?;
        }
        for (code, pass_type) in &config.pass_types {
            self.upsert_pass_type(
                code,
                &pass_type.dataset_file,
                &pass_type.rawdata_file,
                &pass_type.downlink,
            )?;
            for (dir, rule) in &pass_type.image_dirs {
                self.upsert_image_dir_rule(code, dir, rule)?;
            }
        }
        for include in &config.folder_includes {
            self.upsert_folder_include(&include.pattern, &include.pass_type)?;
        }
        Ok(())
    }

    /// Load the full classification model. Fails with
    /// [`IngestError::NoPassConfig`] when the store holds no rules at all.
    pub fn load_pass_config(&self) -> Result<PassConfig> {
        let mut out = PassConfig::default();

        {
            let mut stmt = self
                .conn
                .prepare("SELECT key, label FROM composites WHERE enabled = 1 ORDER BY rowid")?;
            out.composites = stmt
                .query_map([], |row| {
                    Ok(CompositeRule {
                        key: row.get(0)?,
                        label: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
        }

        let pass_rows: Vec<(i64, String, PassTypeConfig)> = {
            let mut stmt = self.conn.prepare(
                "SELECT id, code, dataset_file, rawdata_file, downlink FROM pass_types ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        PassTypeConfig {
                            dataset_file: trimmed(row.get(2)?),
                            rawdata_file: trimmed(row.get(3)?),
                            downlink: trimmed(row.get(4)?),
                            image_dirs: Default::default(),
                        },
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut rules_stmt = self.conn.prepare(
            r#"
            SELECT dir_name, sensor, is_filled, v_pix, is_corrected, composite
            FROM image_dir_rules
            WHERE pass_type_id = ?
            "#,
        )?;
        for (id, code, mut pass_type) in pass_rows {
            let rules = rules_stmt
                .query_map([id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        ImageDirRule {
                            sensor: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                            is_filled: row.get::<_, i64>(2)? != 0,
                            v_pix: row.get::<_, i64>(3)?.max(0) as u32,
                            is_corrected: row.get::<_, i64>(4)? != 0,
                            composite: trimmed(row.get(5)?),
                        },
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            pass_type.image_dirs.extend(rules);
            out.pass_types.insert(code, pass_type);
        }

        {
            let mut stmt = self.conn.prepare(
                r#"
                SELECT f.prefix, p.code
                FROM folder_includes f
                JOIN pass_types p ON p.id = f.pass_type_id
                ORDER BY f.id
                "#,
            )?;
            out.folder_includes = stmt
                .query_map([], |row| {
                    Ok(FolderInclude {
                        pattern: row.get(0)?,
                        pass_type: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
        }

        if out.is_empty() {
            return Err(IngestError::NoPassConfig);
        }
        Ok(out)
    }
}

fn trimmed(value: Option<String>) -> String {
    value.map(|v| v.trim().to_string()).unwrap_or_default()
}

/// Parse a string-encoded number of seconds. Anything non-numeric or not
/// positive yields `default`.
pub fn cooldown_from_setting(value: Option<&str>, default: Duration) -> Duration {
    match value.map(str::trim).and_then(|v| v.parse::<i64>().ok()) {
        Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PrefsStore {
        let mut store = PrefsStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        store
    }

    #[test]
    fn test_empty_store_has_no_pass_config() {
        let store = store();
        assert!(matches!(
            store.load_pass_config(),
            Err(IngestError::NoPassConfig)
        ));
    }

    #[test]
    fn test_seed_and_load_round_trip_keeps_order() {
        let store = store();
        let mut config = PassConfig::default();
        config.composites.push(CompositeRule { key: "msa".into(), label: "MSA".into() });
        config.composites.push(CompositeRule { key: "221".into(), label: "RGB 221".into() });
        let mut pass_type = PassTypeConfig {
            dataset_file: "dataset.json".into(),
            downlink: "HRPT".into(),
            ..Default::default()
        };
        pass_type.image_dirs.insert(
            "MSU-MR".into(),
            ImageDirRule { sensor: "MSU-MR".into(), v_pix: 1024, ..Default::default() },
        );
        config.pass_types.insert("meteor_hrpt".into(), pass_type);
        config.folder_includes.push(FolderInclude {
            pattern: "METEOR".into(),
            pass_type: "meteor_hrpt".into(),
        });
        config.folder_includes.push(FolderInclude {
            pattern: "archive/*".into(),
            pass_type: "meteor_hrpt".into(),
        });

        store.seed_from_pass_config(&config).unwrap();
        let loaded = store.load_pass_config().unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_disabled_composites_are_not_loaded() {
        let store = store();
        store.upsert_composite("rgb", "RGB", true).unwrap();
        store.upsert_composite("ir", "Infrared", false).unwrap();

        let loaded = store.load_pass_config().unwrap();
        assert_eq!(loaded.composites.len(), 1);
        assert_eq!(loaded.composites[0].label, "RGB");
    }

    #[test]
    fn test_rule_for_unknown_pass_type_is_rejected() {
        let store = store();
        let err = store
            .upsert_image_dir_rule("missing", "rgb", &ImageDirRule::default())
            .unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
        assert!(store.upsert_folder_include("NOAA", "missing").is_err());
    }

    #[test]
    fn test_update_cooldown_setting() {
        let store = store();
        let default = Duration::from_secs(60);
        assert_eq!(store.update_cooldown(default).unwrap(), default);

        store.set_setting(UPDATE_COOLDOWN_KEY, " 300 ").unwrap();
        assert_eq!(store.update_cooldown(default).unwrap(), Duration::from_secs(300));

        store.set_setting(UPDATE_COOLDOWN_KEY, "soon").unwrap();
        assert_eq!(store.update_cooldown(default).unwrap(), default);
    }

    #[test]
    fn test_cooldown_from_setting_rejects_non_positive() {
        let default = Duration::from_secs(60);
        assert_eq!(cooldown_from_setting(Some("0"), default), default);
        assert_eq!(cooldown_from_setting(Some("-5"), default), default);
        assert_eq!(cooldown_from_setting(None, default), default);
        assert_eq!(cooldown_from_setting(Some("15"), default), Duration::from_secs(15));
    }
}
