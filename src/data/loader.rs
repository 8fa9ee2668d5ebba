// ============================================================
// Layer 4 — Image Folder Scanner
// ============================================================
// Discovers labelled images under a dataset root. The class of
// a file is the nearest ancestor directory named `benign` or
// `malignant` (case-insensitive), so both layouts work:
//
//   root/benign/foo.png
//   root/breast/malignant/SOB/ductal_carcinoma/SOB_M_DC-…/40X/…png
//
// Files outside either class folder are ignored.
//
// After discovery an optional integrity pass fully decodes every
// image in parallel (rayon) and drops the ones that fail, so a
// single truncated PNG cannot abort an epoch halfway through.

use anyhow::Result;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::domain::{
    error::DatasetError,
    sample::{ClassCounts, Label, Sample},
    traits::SampleSource,
};

/// Extensions accepted as images (compared case-insensitively).
pub const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

/// Walks a directory tree for class-labelled images.
/// Implements the SampleSource trait from Layer 3.
pub struct ImageFolderScanner {
    root: PathBuf,
}

impl ImageFolderScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Label from the nearest class-named ancestor below the root.
    fn label_for(&self, path: &Path) -> Option<Label> {
        let relative = path.strip_prefix(&self.root).ok()?;
        relative
            .parent()?
            .components()
            .rev()
            .find_map(|c| Label::from_dir_name(&c.as_os_str().to_string_lossy()))
    }
}

impl SampleSource for ImageFolderScanner {
    fn discover(&self) -> Result<Vec<Sample>> {
        if !self.root.is_dir() {
            return Err(DatasetError::MissingRoot(self.root.clone()).into());
        }

        let mut samples = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_image(entry.path()) {
                continue;
            }
            match self.label_for(entry.path()) {
                Some(label) => samples.push(Sample::new(entry.path(), label)),
                None => tracing::debug!("No class folder above '{}'", entry.path().display()),
            }
        }

        let counts = ClassCounts::from_labels(samples.iter().map(|s| s.label));
        for label in Label::ALL {
            if counts.get(label) == 0 {
                return Err(DatasetError::EmptyClass { root: self.root.clone(), label }.into());
            }
        }

        tracing::info!(
            "Discovered {} images under '{}' ({})",
            samples.len(),
            self.root.display(),
            counts
        );
        Ok(samples)
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false)
}

/// Result of the integrity pass.
#[derive(Debug)]
pub struct IntegrityReport {
    pub valid: Vec<Sample>,
    pub corrupt: Vec<PathBuf>,
}

/// Decode every image in parallel, keeping the ones that succeed.
///
/// Order of `valid` follows the input order. Fails if a class
/// loses all of its images.
pub fn validate_images(samples: Vec<Sample>) -> Result<IntegrityReport> {
    let found = ClassCounts::from_labels(samples.iter().map(|s| s.label));

    let checked: Vec<(Sample, bool)> = samples
        .into_par_iter()
        .map(|s| {
            let ok = match image::open(&s.path) {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!("Corrupt image '{}': {}", s.path.display(), e);
                    false
                }
            };
            (s, ok)
        })
        .collect();

    let mut valid = Vec::with_capacity(checked.len());
    let mut corrupt = Vec::new();
    for (s, ok) in checked {
        if ok {
            valid.push(s);
        } else {
            corrupt.push(s.path);
        }
    }

    let kept = ClassCounts::from_labels(valid.iter().map(|s| s.label));
    for label in Label::ALL {
        if found.get(label) > 0 && kept.get(label) == 0 {
            return Err(DatasetError::NoValidImages { label, found: found.get(label) }.into());
        }
    }

    if corrupt.is_empty() {
        tracing::info!("Integrity check: all {} images decode", valid.len());
    } else {
        tracing::warn!(
            "Integrity check: {} valid, {} corrupt images skipped",
            valid.len(),
            corrupt.len()
        );
    }
    Ok(IntegrityReport { valid, corrupt })
}

/// Log class balance of the discovered dataset.
pub fn log_dataset_stats(samples: &[Sample]) {
    let counts = ClassCounts::from_labels(samples.iter().map(|s| s.label));
    let benign = counts.get(Label::Benign).max(1) as f64;
    tracing::info!(
        "Class balance: {} ({:.1}% malignant, malignant:benign = {:.2}:1)",
        counts,
        counts.fraction(Label::Malignant) * 100.0,
        counts.get(Label::Malignant) as f64 / benign,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::fs;
    use tempfile::TempDir;

    fn write_png(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(8, 8, Rgb([200, 100, 50])).save(path).unwrap();
    }

    #[test]
    fn test_discovers_nested_class_folders() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write_png(&root.join("benign/SOB/adenosis/40X/SOB_B_A-14-1-40-001.png"));
        write_png(&root.join("Malignant/SOB_M_DC-14-2-40-001.png"));
        write_png(&root.join("malignant/x/SOB_M_DC-14-2-100-001.PNG"));
        write_png(&root.join("other/ignored.png"));
        fs::write(root.join("benign/notes.txt"), "not an image").unwrap();

        let samples = ImageFolderScanner::new(root).discover().unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples.iter().filter(|s| s.label == Label::Benign).count(), 1);
        assert_eq!(samples.iter().filter(|s| s.label == Label::Malignant).count(), 2);
    }

    #[test]
    fn test_discovery_order_is_stable() {
        let dir = TempDir::new().unwrap();
        for name in ["c.png", "a.png", "b.png"] {
            write_png(&dir.path().join("benign").join(name));
            write_png(&dir.path().join("malignant").join(name));
        }
        let scanner = ImageFolderScanner::new(dir.path());
        assert_eq!(scanner.discover().unwrap(), scanner.discover().unwrap());
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let err = ImageFolderScanner::new("/definitely/not/here").discover().unwrap_err();
        assert!(matches!(err.downcast_ref::<DatasetError>(), Some(DatasetError::MissingRoot(_))));
    }

    #[test]
    fn test_empty_class_is_an_error() {
        let dir = TempDir::new().unwrap();
        write_png(&dir.path().join("benign/a.png"));
        let err = ImageFolderScanner::new(dir.path()).discover().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DatasetError>(),
            Some(DatasetError::EmptyClass { label: Label::Malignant, .. })
        ));
    }

    #[test]
    fn test_integrity_pass_drops_corrupt_files() {
        let dir = TempDir::new().unwrap();
        let good_b = dir.path().join("benign/good.png");
        let good_m = dir.path().join("malignant/good.png");
        let bad = dir.path().join("malignant/bad.png");
        write_png(&good_b);
        write_png(&good_m);
        fs::write(&bad, b"\x89PNG truncated").unwrap();

        let samples = ImageFolderScanner::new(dir.path()).discover().unwrap();
        let report = validate_images(samples).unwrap();
        assert_eq!(report.valid.len(), 2);
        assert_eq!(report.corrupt, vec![bad]);
    }

    #[test]
    fn test_class_with_only_corrupt_files_fails() {
        let dir = TempDir::new().unwrap();
        write_png(&dir.path().join("benign/good.png"));
        fs::create_dir_all(dir.path().join("malignant")).unwrap();
        fs::write(dir.path().join("malignant/bad.png"), b"nope").unwrap();

        let samples = ImageFolderScanner::new(dir.path()).discover().unwrap();
        let err = validate_images(samples).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DatasetError>(),
            Some(DatasetError::NoValidImages { label: Label::Malignant, found: 1 })
        ));
    }
}
