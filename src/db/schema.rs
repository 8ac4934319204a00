//! Versioned schema migrations, tracked with `PRAGMA user_version`.

use rusqlite::Connection;

pub struct Migration {
    /// Schema version after this migration is applied.
    pub version: i32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// Catalog schema. Column names match what the gallery reader queries.
pub const CATALOG_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "passes and images",
        sql: r#"
        CREATE TABLE IF NOT EXISTS passes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            satellite TEXT,
            timestamp INTEGER,
            rawDataPath TEXT,
            downlink TEXT,
            needsRescan INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS images (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            path TEXT NOT NULL,
            composite TEXT,
            sensor TEXT,
            mapOverlay INTEGER NOT NULL DEFAULT 0,
            corrected INTEGER NOT NULL DEFAULT 0,
            filled INTEGER NOT NULL DEFAULT 0,
            vPixels INTEGER,
            passId INTEGER NOT NULL,
            needsThumb INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY (passId) REFERENCES passes(id)
        );
        "#,
    },
    Migration {
        version: 2,
        description: "unique image path per pass",
        sql: r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_images_pass_path ON images(passId, path);
        CREATE INDEX IF NOT EXISTS idx_images_needs_thumb ON images(needsThumb);
        "#,
    },
];

/// Preference store schema (classification rules and app settings).
pub const PREFS_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "pass classification rules and settings",
    sql: r#"
    CREATE TABLE IF NOT EXISTS app_settings (
        key TEXT PRIMARY KEY,
        value TEXT
    );

    CREATE TABLE IF NOT EXISTS composites (
        key TEXT PRIMARY KEY,
        label TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE IF NOT EXISTS pass_types (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        code TEXT NOT NULL UNIQUE,
        dataset_file TEXT,
        rawdata_file TEXT,
        downlink TEXT
    );

    CREATE TABLE IF NOT EXISTS image_dir_rules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        pass_type_id INTEGER NOT NULL REFERENCES pass_types(id) ON DELETE CASCADE,
        dir_name TEXT NOT NULL,
        sensor TEXT,
        is_filled INTEGER NOT NULL DEFAULT 0,
        v_pix INTEGER NOT NULL DEFAULT 0,
        is_corrected INTEGER NOT NULL DEFAULT 0,
        composite TEXT,
        UNIQUE(pass_type_id, dir_name)
    );

    CREATE TABLE IF NOT EXISTS folder_includes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        prefix TEXT NOT NULL UNIQUE,
        pass_type_id INTEGER NOT NULL REFERENCES pass_types(id) ON DELETE CASCADE
    );
    "#,
}];

pub fn user_version(conn: &Connection) -> rusqlite::Result<i32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

/// Apply every migration newer than the database's current version, each in
/// its own transaction together with the version bump.
pub fn apply_migrations(conn: &mut Connection, migrations: &[Migration]) -> rusqlite::Result<()> {
    let current = user_version(conn)?;

    for migration in migrations.iter().filter(|m| m.version > current) {
        tracing::debug!(
            "Applying schema migration v{}: {}",
            migration.version,
            migration.description
        );
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        // PRAGMA takes no bound parameters; version is an integer constant.
        tx.execute_batch(&format!("PRAGMA user_version = {}", migration.version))?;
        tx.commit()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered() {
        for set in [CATALOG_MIGRATIONS, PREFS_MIGRATIONS] {
            let versions: Vec<i32> = set.iter().map(|m| m.version).collect();
            let mut sorted = versions.clone();
            sorted.sort();
            sorted.dedup();
            assert_eq!(versions, sorted);
        }
    }

    #[test]
    fn test_apply_migrations_is_repeatable() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn, CATALOG_MIGRATIONS).unwrap();
        assert_eq!(user_version(&conn).unwrap(), 2);

        apply_migrations(&mut conn, CATALOG_MIGRATIONS).unwrap();
        assert_eq!(user_version(&conn).unwrap(), 2);
    }
}
