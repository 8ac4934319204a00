//! Image discovery and labelling inside a pass folder.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::folders::expand_glob_dirs;
use super::relative_slash_path;
use crate::db::NewImage;
use crate::prefs::{CompositeRule, ImageDirRule, PassConfig, PassTypeConfig};

/// Label used when no composite key matches a file name.
pub const DEFAULT_COMPOSITE: &str = "Other";

/// Classifies the images of a pass against a loaded [`PassConfig`].
pub struct ImageClassifier<'a> {
    composites: Vec<&'a CompositeRule>,
    extensions: &'a [String],
}

impl<'a> ImageClassifier<'a> {
    pub fn new(config: &'a PassConfig, extensions: &'a [String]) -> Self {
        Self {
            composites: config.composites_longest_first(),
            extensions,
        }
    }

    /// A non-empty rule composite wins; otherwise the longest composite key
    /// contained in the file stem (case-insensitive), else "Other".
    pub fn resolve_composite(&self, file_stem: &str, rule: &ImageDirRule) -> String {
        let fixed = rule.composite.trim();
        if !fixed.is_empty() {
            return fixed.to_string();
        }

        let stem = file_stem.to_lowercase();
        self.composites
            .iter()
            .filter(|c| !c.key.is_empty())
            .find(|c| stem.contains(&c.key.to_lowercase()))
            .map(|c| c.label.clone())
            .unwrap_or_else(|| DEFAULT_COMPOSITE.to_string())
    }

    /// Every image under the pass's configured subdirectories. Each
    /// subdirectory is listed non-recursively; a path claimed by an earlier
    /// rule is not reported again.
    pub fn classify_pass(&self, root: &Path, folder: &str, pass_type: &PassTypeConfig) -> Vec<NewImage> {
        let pass_dir = root.join(folder);
        let mut seen = HashSet::new();
        let mut images = Vec::new();

        for (subdir, rule) in &pass_type.image_dirs {
            for dir in resolve_image_dirs(&pass_dir, subdir) {
                for file in self.list_images(&dir) {
                    let Some(rel) = relative_slash_path(&pass_dir, &file) else {
                        continue;
                    };
                    let path = format!("{}/{}", folder.trim_end_matches('/'), rel);
                    if !seen.insert(path.clone()) {
                        continue;
                    }
                    images.push(self.classify_file(&file, path, rule));
                }
            }
        }

        images
    }

    fn classify_file(&self, file: &Path, path: String, rule: &ImageDirRule) -> NewImage {
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let stem = file
            .file_stem()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let v_pixels = if rule.v_pix > 0 {
            Some(rule.v_pix)
        } else {
            probe_height(file)
        };

        NewImage {
            path,
            composite: self.resolve_composite(&stem, rule),
            sensor: rule.sensor.clone(),
            map_overlay: file_name.to_lowercase().contains("map"),
            corrected: is_corrected(rule, &file_name),
            filled: rule.is_filled,
            v_pixels,
        }
    }

    fn list_images(&self, dir: &Path) -> Vec<PathBuf> {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                debug!("Skipping image dir {}: {}", dir.display(), e);
                return Vec::new();
            }
        };

        let mut files: Vec<PathBuf> = entries
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|entry| entry.path())
            .filter(|path| has_image_extension(path, self.extensions))
            .collect();
        files.sort();
        files
    }
}

pub fn is_corrected(rule: &ImageDirRule, file_name: &str) -> bool {
    rule.is_corrected || file_name.contains("_corrected")
}

pub fn has_image_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            extensions.iter().any(|e| e.to_lowercase() == ext)
        })
        .unwrap_or(false)
}

/// Pixel height from the image header, without decoding the image.
pub fn probe_height(path: &Path) -> Option<u32> {
    let reader = image::ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .ok()?;
    match reader.into_dimensions() {
        Ok((_, height)) => Some(height),
        Err(e) => {
            debug!("Cannot read dimensions of {}: {}", path.display(), e);
            None
        }
    }
}

fn resolve_image_dirs(pass_dir: &Path, subdir: &str) -> Vec<PathBuf> {
    if subdir.contains('*') {
        expand_glob_dirs(pass_dir, subdir)
            .into_iter()
            .map(|rel| pass_dir.join(rel))
            .collect()
    } else {
        vec![pass_dir.join(subdir)]
    }
}
