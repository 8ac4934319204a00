//! Pass classification rules: pass types, image directory rules, composite
//! labels and folder include patterns.
//!
//! A [`PassConfig`] is loaded once per run from the preference store and is
//! read-only while the run is in progress.

pub mod store;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;

pub use store::PrefsStore;

/// How images found in one subdirectory of a pass are labelled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDirRule {
    #[serde(default)]
    pub sensor: String,
    #[serde(default)]
    pub is_filled: bool,
    /// Fixed pixel height; 0 means probe the image header.
    #[serde(default)]
    pub v_pix: u32,
    #[serde(default)]
    pub is_corrected: bool,
    /// When non-empty, replaces composite resolution for every image in the dir.
    #[serde(default)]
    pub composite: String,
}

/// Template describing one class of pass folders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassTypeConfig {
    #[serde(default)]
    pub dataset_file: String,
    #[serde(default)]
    pub rawdata_file: String,
    #[serde(default)]
    pub downlink: String,
    /// Subdirectory name or glob, relative to the pass folder.
    #[serde(default)]
    pub image_dirs: BTreeMap<String, ImageDirRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeRule {
    pub key: String,
    pub label: String,
}

/// Maps a folder pattern (substring or glob) to a pass type code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderInclude {
    pub pattern: String,
    pub pass_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassConfig {
    /// Kept in insertion order; ties in key length resolve to the earlier entry.
    #[serde(default)]
    pub composites: Vec<CompositeRule>,

    #[serde(default)]
    pub pass_types: BTreeMap<String, PassTypeConfig>,

    /// Evaluated in order, first match wins.
    #[serde(default)]
    pub folder_includes: Vec<FolderInclude>,
}

impl PassConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn is_empty(&self) -> bool {
        self.composites.is_empty() && self.pass_types.is_empty() && self.folder_includes.is_empty()
    }

    pub fn pass_type(&self, code: &str) -> Option<&PassTypeConfig> {
        self.pass_types.get(code)
    }

    /// Composite rules ordered by descending key length. The sort is stable,
    /// so equal-length keys keep their configured order.
    pub fn composites_longest_first(&self) -> Vec<&CompositeRule> {
        let mut rules: Vec<&CompositeRule> = self.composites.iter().collect();
        rules.sort_by(|a, b| b.key.len().cmp(&a.key.len()));
        rules
    }
}
