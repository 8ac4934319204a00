//! Satellite name and capture time for a pass folder.

use chrono::NaiveDateTime;
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

use crate::db::NOT_CONFIGURED;
use crate::prefs::PassTypeConfig;

/// Dataset timestamps above this are treated as garbage from a bad decode.
pub const FUTURE_TIMESTAMP_CUTOFF: i64 = 1_735_756_467_000;

/// The subset of the decoder's dataset file we read.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub satellite: Option<String>,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassMetadata {
    pub satellite: String,
    pub timestamp: Option<i64>,
    pub downlink: String,
    pub raw_data_path: String,
}

/// Read a dataset file. Missing or undecodable files yield `None`.
pub fn read_dataset(path: &Path) -> Option<Dataset> {
    let data = std::fs::read(path).ok()?;
    match serde_json::from_slice(&data) {
        Ok(dataset) => Some(dataset),
        Err(e) => {
            debug!("Ignoring undecodable dataset {}: {}", path.display(), e);
            None
        }
    }
}

/// Build the pass-level metadata for `folder` (relative to `root`).
pub fn extract_pass_metadata(
    root: &Path,
    folder: &str,
    pass_type_code: &str,
    pass_type: &PassTypeConfig,
) -> PassMetadata {
    let dataset_file = pass_type.dataset_file.trim();
    let dataset = if dataset_file.is_empty() {
        None
    } else {
        read_dataset(&root.join(folder).join(dataset_file))
    };
    let dataset = dataset.unwrap_or_default();

    let satellite = dataset
        .satellite
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| pass_type_code.to_string());

    PassMetadata {
        satellite,
        timestamp: resolve_timestamp(dataset.timestamp, folder),
        downlink: or_not_configured(&pass_type.downlink),
        raw_data_path: or_not_configured(&pass_type.rawdata_file),
    }
}

/// Prefer the dataset timestamp unless it is missing, not positive, or past
/// the sanity cutoff; then fall back to the folder name.
pub fn resolve_timestamp(dataset_timestamp: Option<f64>, folder: &str) -> Option<i64> {
    let from_dataset = dataset_timestamp
        .filter(|t| t.is_finite())
        .map(|t| t as i64)
        .filter(|&t| t >= 1 && t <= FUTURE_TIMESTAMP_CUTOFF);

    from_dataset.or_else(|| timestamp_from_folder_name(folder))
}

/// Parse a leading `YYYY-MM-DD_HH-MM` (UTC) from the folder's base name.
pub fn timestamp_from_folder_name(folder: &str) -> Option<i64> {
    let base = folder
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()?;
    let prefix = base.get(..16)?;

    let shape_ok = prefix.bytes().enumerate().all(|(i, b)| match i {
        4 | 7 | 13 => b == b'-',
        10 => b == b'_',
        _ => b.is_ascii_digit(),
    });
    if !shape_ok {
        return None;
    }

    NaiveDateTime::parse_from_str(prefix, "%Y-%m-%d_%H-%M")
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

fn or_not_configured(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        NOT_CONFIGURED.to_string()
    } else {
        value.to_string()
    }
}
