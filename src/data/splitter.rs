// ============================================================
// Layer 4 — Patient-Level Train/Validation/Test Splitter
// ============================================================
// Splits by PATIENT, not by image.
//
// Why?
//   Each BreakHis patient contributes dozens of images at four
//   magnifications. An image-level split puts near-duplicate
//   tissue from the same patient in train and test, and the
//   model scores 99%+ by recognising patients instead of
//   pathology. Grouping by patient removes that leakage.
//
// Procedure:
//   1. Group sample indices by patient id
//   2. Give each patient the label of its first image
//   3. Stratified split of the patients: outer (train+val / test)
//   4. Stratified split of train+val: (train / val)
//   5. Map every image back to its patient's group
//
// Stratification is per class: each class is shuffled with a
// seeded RNG and `round(fraction × count)` of its patients go
// to the held-out side, clamped so both sides keep at least one
// patient of every class. A class with fewer than two patients
// cannot be stratified and the split fails.

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};

use crate::domain::{
    error::SplitError,
    sample::{ClassCounts, Label, Sample},
    split::{SplitAssignment, SplitGroup, SplitRole},
    traits::PatientKey,
};

/// Split proportions and seed.
#[derive(Debug, Clone, Copy)]
pub struct SplitPlan {
    /// Fraction of patients held out for testing.
    pub test_fraction: f64,
    /// Fraction of the remaining patients held out for validation.
    pub val_fraction: f64,
    pub seed: u64,
}

/// A patient with its label and the indices of its images.
#[derive(Debug, Clone)]
struct PatientEntry {
    id: String,
    label: Label,
    indices: Vec<usize>,
}

/// Partition `samples` into patient-disjoint train/val/test groups.
pub fn split_by_patient(
    samples: &[Sample],
    key: &dyn PatientKey,
    plan: SplitPlan,
) -> Result<SplitAssignment, SplitError> {
    let patients = group_by_patient(samples, key);

    tracing::info!(
        "Dataset: {} images, {} unique patients, {:.1} images/patient",
        samples.len(),
        patients.len(),
        samples.len() as f64 / patients.len().max(1) as f64,
    );

    let mut rng = StdRng::seed_from_u64(plan.seed);

    let (train_val, test) = stratified_partition(patients, plan.test_fraction, "test", &mut rng)?;
    let (train, val) = stratified_partition(train_val, plan.val_fraction, "validation", &mut rng)?;

    let assignment = SplitAssignment {
        train: into_group(train),
        val: into_group(val),
        test: into_group(test),
    };

    for role in [SplitRole::Train, SplitRole::Val, SplitRole::Test] {
        let group = assignment.group(role);
        let counts = ClassCounts::from_labels(group.indices.iter().map(|&i| samples[i].label));
        tracing::info!(
            "  {:<5} {:>4} patients, {:>6} images ({}, {:.1}% malignant)",
            role.to_string(),
            group.patients.len(),
            group.indices.len(),
            counts,
            counts.fraction(Label::Malignant) * 100.0,
        );
    }

    debug_assert_eq!(assignment.sample_count(), samples.len());
    Ok(assignment)
}

fn group_by_patient(samples: &[Sample], key: &dyn PatientKey) -> Vec<PatientEntry> {
    // BTreeMap keeps patients in a stable order before the seeded shuffle.
    let mut by_patient: BTreeMap<String, PatientEntry> = BTreeMap::new();

    for (index, sample) in samples.iter().enumerate() {
        let id = key.patient_id(sample);
        let entry = by_patient.entry(id.clone()).or_insert_with(|| PatientEntry {
            id,
            label: sample.label,
            indices: Vec::new(),
        });
        if entry.label != sample.label {
            tracing::warn!(
                "Patient '{}' has images labelled both {} and {}; keeping {}",
                entry.id,
                entry.label,
                sample.label,
                entry.label
            );
        }
        entry.indices.push(index);
    }

    by_patient.into_values().collect()
}

/// Split patients into (kept, held_out) with `fraction` held out per class.
fn stratified_partition(
    patients: Vec<PatientEntry>,
    fraction: f64,
    stage: &'static str,
    rng: &mut StdRng,
) -> Result<(Vec<PatientEntry>, Vec<PatientEntry>), SplitError> {
    if !(fraction > 0.0 && fraction < 1.0) {
        return Err(SplitError::InvalidFraction { stage, fraction });
    }

    let mut by_label: BTreeMap<Label, Vec<PatientEntry>> = BTreeMap::new();
    for p in patients {
        by_label.entry(p.label).or_default().push(p);
    }

    let mut kept = Vec::new();
    let mut held_out = Vec::new();

    for label in Label::ALL {
        let mut class = by_label.remove(&label).unwrap_or_default();
        let count = class.len();
        if count < 2 {
            return Err(SplitError::TooFewPatients { stage, label, count });
        }

        class.shuffle(rng);

        let n_held = ((fraction * count as f64).round() as usize).clamp(1, count - 1);
        let rest = class.split_off(n_held);
        held_out.extend(class);
        kept.extend(rest);
    }

    Ok((kept, held_out))
}

fn into_group(patients: Vec<PatientEntry>) -> SplitGroup {
    let ids: BTreeSet<String> = patients.iter().map(|p| p.id.clone()).collect();
    let mut indices: Vec<usize> = patients.into_iter().flat_map(|p| p.indices).collect();
    indices.sort_unstable();
    SplitGroup { patients: ids.into_iter().collect(), indices }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::patient::{PatientIdExtractor, DEFAULT_PATIENT_PATTERN};
    use std::collections::HashSet;

    const PLAN: SplitPlan = SplitPlan { test_fraction: 0.2, val_fraction: 0.25, seed: 42 };

    /// `benign` and `malignant` patients, `images` images each.
    fn synthetic(benign: usize, malignant: usize, images: usize) -> Vec<Sample> {
        let mut out = Vec::new();
        for (label, n, code) in [(Label::Benign, benign, "B"), (Label::Malignant, malignant, "M")] {
            for p in 0..n {
                for i in 0..images {
                    let name = format!("SOB_{code}_X-14-{code}{p:04}-{}-{i:03}.png", 40 * (i % 4 + 1));
                    out.push(Sample::new(format!("/d/{}/{name}", label.dir_name()), label));
                }
            }
        }
        out
    }

    fn key() -> PatientIdExtractor {
        PatientIdExtractor::new(DEFAULT_PATIENT_PATTERN).unwrap()
    }

    #[test]
    fn test_conflicting_labels_keep_the_first() {
        let mut samples = synthetic(10, 10, 2);
        let odd = samples.len();
        samples.push(Sample::new("/d/malignant/SOB_M_X-14-B0000-40-009.png", Label::Malignant));

        let patients = group_by_patient(&samples, &key());
        let entry = patients.iter().find(|p| p.id == "X-14-B0000").unwrap();
        assert_eq!(entry.label, Label::Benign);
        assert_eq!(entry.indices, vec![0, 1, odd]);

        // The relabelled image follows its patient into one group.
        let split = split_by_patient(&samples, &key(), PLAN).unwrap();
        let holder = [&split.train, &split.val, &split.test]
            .into_iter()
            .find(|g| g.indices.contains(&0))
            .unwrap();
        assert!(holder.indices.contains(&odd));
    }

    #[test]
    fn test_no_patient_leakage() {
        let samples = synthetic(30, 60, 5);
        let ex = key();
        let split = split_by_patient(&samples, &ex, PLAN).unwrap();

        let train: HashSet<_> = split.train.patients.iter().collect();
        let val: HashSet<_> = split.val.patients.iter().collect();
        let test: HashSet<_> = split.test.patients.iter().collect();
        assert!(train.is_disjoint(&val));
        assert!(train.is_disjoint(&test));
        assert!(val.is_disjoint(&test));

        // Index sets are disjoint and cover every sample.
        let mut all: Vec<usize> = split
            .train
            .indices
            .iter()
            .chain(&split.val.indices)
            .chain(&split.test.indices)
            .copied()
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..samples.len()).collect::<Vec<_>>());

        // Every image sits with its patient.
        for &i in &split.test.indices {
            assert!(test.contains(&ex.patient_id(&samples[i])));
        }
    }

    #[test]
    fn test_stratification_preserves_class_ratio() {
        let samples = synthetic(100, 200, 3);
        let split = split_by_patient(&samples, &key(), PLAN).unwrap();

        let overall = ClassCounts::from_labels(samples.iter().map(|s| s.label))
            .fraction(Label::Malignant);
        for group in [&split.train, &split.val, &split.test] {
            let frac = ClassCounts::from_labels(group.indices.iter().map(|&i| samples[i].label))
                .fraction(Label::Malignant);
            assert!((frac - overall).abs() < 0.05, "ratio {frac} vs {overall}");
        }
    }

    #[test]
    fn test_proportions_roughly_60_20_20() {
        let samples = synthetic(100, 200, 1);
        let split = split_by_patient(&samples, &key(), PLAN).unwrap();
        assert_eq!(split.test.patients.len(), 60);
        assert_eq!(split.val.patients.len(), 60);
        assert_eq!(split.train.patients.len(), 180);
    }

    #[test]
    fn test_split_is_deterministic_for_seed() {
        let samples = synthetic(20, 40, 2);
        let a = split_by_patient(&samples, &key(), PLAN).unwrap();
        let b = split_by_patient(&samples, &key(), PLAN).unwrap();
        assert_eq!(a, b);

        let other = SplitPlan { seed: 7, ..PLAN };
        let c = split_by_patient(&samples, &key(), other).unwrap();
        assert_ne!(a.test.patients, c.test.patients);
    }

    #[test]
    fn test_too_few_patients_fails_loudly() {
        let samples = synthetic(1, 10, 4);
        let err = split_by_patient(&samples, &key(), PLAN).unwrap_err();
        assert_eq!(
            err,
            SplitError::TooFewPatients { stage: "test", label: Label::Benign, count: 1 }
        );
    }

    #[test]
    fn test_second_stage_can_run_out_of_patients() {
        // Two benign patients: one goes to test, one left for train+val.
        let samples = synthetic(2, 10, 1);
        let err = split_by_patient(&samples, &key(), PLAN).unwrap_err();
        assert!(matches!(
            err,
            SplitError::TooFewPatients { stage: "validation", label: Label::Benign, count: 1 }
        ));
    }

    #[test]
    fn test_invalid_fraction_rejected() {
        let samples = synthetic(10, 10, 1);
        let plan = SplitPlan { test_fraction: 1.0, ..PLAN };
        assert!(matches!(
            split_by_patient(&samples, &key(), plan),
            Err(SplitError::InvalidFraction { .. })
        ));
    }
}
