// ============================================================
// Layer 3 — Sample and Label Domain Types
// ============================================================
// A Sample is one image on disk plus its ground-truth class.
// Samples are discovered once and never mutated afterwards;
// every later stage (splitting, sampling, batching) refers to
// them by index into the discovered Vec<Sample>.
//
// The positive class is always Malignant (label 1). Every metric
// in the system (sensitivity, precision, AUC) is computed with
// respect to that class, so the numeric encoding lives here and
// nowhere else.

use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};

/// Number of output classes of the classifier head.
pub const NUM_CLASSES: usize = 2;

/// Ground-truth class of a slide image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Benign,
    Malignant,
}

impl Label {
    /// Both labels in index order.
    pub const ALL: [Label; NUM_CLASSES] = [Label::Benign, Label::Malignant];

    /// Integer class index: 0 = benign, 1 = malignant.
    pub fn index(self) -> usize {
        match self {
            Label::Benign => 0,
            Label::Malignant => 1,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Label::Benign),
            1 => Some(Label::Malignant),
            _ => None,
        }
    }

    /// Name of the dataset sub-directory holding this class.
    pub fn dir_name(self) -> &'static str {
        match self {
            Label::Benign => "benign",
            Label::Malignant => "malignant",
        }
    }

    /// Match a directory name (case-insensitive) against the class folders.
    pub fn from_dir_name(name: &str) -> Option<Self> {
        Label::ALL
            .into_iter()
            .find(|l| name.eq_ignore_ascii_case(l.dir_name()))
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Benign => write!(f, "Benign"),
            Label::Malignant => write!(f, "Malignant"),
        }
    }
}

/// One image file and its class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub path: PathBuf,
    pub label: Label,
}

impl Sample {
    pub fn new(path: impl Into<PathBuf>, label: Label) -> Self {
        Self { path: path.into(), label }
    }
}

/// Per-class counts, indexed by `Label::index()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCounts(pub [usize; NUM_CLASSES]);

impl ClassCounts {
    pub fn from_labels<I: IntoIterator<Item = Label>>(labels: I) -> Self {
        let mut counts = [0usize; NUM_CLASSES];
        for label in labels {
            counts[label.index()] += 1;
        }
        Self(counts)
    }

    pub fn get(&self, label: Label) -> usize {
        self.0[label.index()]
    }

    pub fn total(&self) -> usize {
        self.0.iter().sum()
    }

    /// Fraction of the total that belongs to `label` (0 when empty).
    pub fn fraction(&self, label: Label) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.get(label) as f64 / total as f64
        }
    }
}

impl fmt::Display for ClassCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "benign={} malignant={}",
            self.get(Label::Benign),
            self.get(Label::Malignant)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_index_round_trip() {
        for label in Label::ALL {
            assert_eq!(Label::from_index(label.index()), Some(label));
        }
        assert_eq!(Label::from_index(2), None);
    }

    #[test]
    fn test_dir_name_is_case_insensitive() {
        assert_eq!(Label::from_dir_name("Malignant"), Some(Label::Malignant));
        assert_eq!(Label::from_dir_name("BENIGN"), Some(Label::Benign));
        assert_eq!(Label::from_dir_name("normal"), None);
    }

    #[test]
    fn test_class_counts_fraction() {
        let counts = ClassCounts::from_labels([Label::Benign, Label::Malignant, Label::Malignant]);
        assert_eq!(counts.total(), 3);
        assert!((counts.fraction(Label::Malignant) - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(ClassCounts::default().fraction(Label::Benign), 0.0);
    }
}
