// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// The application layer depends on these traits rather than on
// the concrete directory scanner, so a different dataset layout
// (a CSV manifest, a second slide archive) can be added without
// touching the training workflow.

use anyhow::Result;

use crate::domain::sample::Sample;

// ─── SampleSource ─────────────────────────────────────────────────────────────
/// Anything that can enumerate labelled image samples.
///
/// Implementations:
///   - ImageFolderScanner → walks `benign/` and `malignant/` folders
pub trait SampleSource {
    /// Return every sample in a stable (sorted) order.
    fn discover(&self) -> Result<Vec<Sample>>;
}

// ─── PatientKey ───────────────────────────────────────────────────────────────
/// Maps a sample to the patient it was taken from.
///
/// Implementations:
///   - PatientIdExtractor → regex over the file name
pub trait PatientKey {
    fn patient_id(&self, sample: &Sample) -> String;
}
