// ============================================================
// Layer 4 — Patient-ID Extractor
// ============================================================
// BreakHis file names encode the patient a slide came from:
//
//   SOB_B_A-14-22549AB-400-001.png
//   │   │ └──────────┘ └─┘ └─┘
//   │   │  patient id  mag  seq
//   │   └ class code (B / M)
//   └ procedure prefix
//
// Two images from the same patient must never end up on both
// sides of a train/test boundary, so the splitter groups by
// this id. A file name that does not match the pattern falls
// back to its full name, which makes it a singleton patient.
// That weakens leakage protection for that file, so every
// fallback is logged and counted.

use anyhow::{Context, Result};
use regex::Regex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::domain::{sample::Sample, traits::PatientKey};

/// Default BreakHis naming convention.
pub const DEFAULT_PATIENT_PATTERN: &str =
    r"^[^_]+_[A-Za-z]+_(?P<patient>.+?)-\d+-\d+\.[A-Za-z0-9]+$";

/// Extracts patient ids from file names with a configurable regex.
///
/// The pattern must contain a named capture group `patient`.
#[derive(Debug)]
pub struct PatientIdExtractor {
    pattern: Regex,
    fallbacks: AtomicUsize,
}

impl PatientIdExtractor {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .with_context(|| format!("Invalid patient-id pattern '{pattern}'"))?;
        if !pattern.capture_names().flatten().any(|n| n == "patient") {
            anyhow::bail!(
                "Patient-id pattern '{}' has no named group (?P<patient>...)",
                pattern.as_str()
            );
        }
        Ok(Self { pattern, fallbacks: AtomicUsize::new(0) })
    }

    /// Extract the id from a bare file name.
    pub fn extract(&self, file_name: &str) -> String {
        match self
            .pattern
            .captures(file_name)
            .and_then(|caps| caps.name("patient"))
        {
            Some(m) => m.as_str().to_string(),
            None => {
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "File name '{}' does not match the patient pattern; treating it as its own patient",
                    file_name
                );
                file_name.to_string()
            }
        }
    }

    /// How many file names have fallen back to themselves so far.
    pub fn fallback_count(&self) -> usize {
        self.fallbacks.load(Ordering::Relaxed)
    }
}

impl PatientKey for PatientIdExtractor {
    fn patient_id(&self, sample: &Sample) -> String {
        let file_name = sample
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| sample.path.to_string_lossy().into_owned());
        self.extract(&file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::sample::Label;

    fn extractor() -> PatientIdExtractor {
        PatientIdExtractor::new(DEFAULT_PATIENT_PATTERN).unwrap()
    }

    #[test]
    fn test_breakhis_benign_name() {
        let ex = extractor();
        assert_eq!(ex.extract("SOB_B_A-14-22549AB-400-001.png"), "A-14-22549AB");
        assert_eq!(ex.fallback_count(), 0);
    }

    #[test]
    fn test_breakhis_malignant_name() {
        let ex = extractor();
        assert_eq!(ex.extract("SOB_M_DC-14-2523-100-012.png"), "DC-14-2523");
    }

    #[test]
    fn test_same_patient_different_magnification() {
        let ex = extractor();
        let a = ex.extract("SOB_M_LC-14-15570-40-001.png");
        let b = ex.extract("SOB_M_LC-14-15570-400-031.png");
        assert_eq!(a, b);
    }

    #[test]
    fn test_malformed_name_falls_back_to_file_name() {
        let ex = extractor();
        assert_eq!(ex.extract("scan_0001.png"), "scan_0001.png");
        assert_eq!(ex.fallback_count(), 1);
    }

    #[test]
    fn test_patient_key_uses_basename() {
        let ex = extractor();
        let s = Sample::new("/data/breast/benign/SOB/SOB_B_F-14-9133-40-001.png", Label::Benign);
        assert_eq!(ex.patient_id(&s), "F-14-9133");
    }

    #[test]
    fn test_pattern_without_patient_group_is_rejected() {
        assert!(PatientIdExtractor::new(r"^SOB_(.+)$").is_err());
        assert!(PatientIdExtractor::new(r"(unclosed").is_err());
    }
}
