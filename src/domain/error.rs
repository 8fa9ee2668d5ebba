use std::path::PathBuf;
use thiserror::Error;

use crate::domain::sample::Label;

/// Fatal problems with the dataset on disk.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset root '{}' does not exist or is not a directory", .0.display())]
    MissingRoot(PathBuf),

    #[error("no {label} images found under '{}' (expected a '{dir}' directory)", .root.display(), dir = .label.dir_name())]
    EmptyClass { root: PathBuf, label: Label },

    #[error("all {found} {label} images failed to decode")]
    NoValidImages { label: Label, found: usize },
}

/// Fatal problems while partitioning patients.
#[derive(Debug, Error, PartialEq)]
pub enum SplitError {
    #[error("{stage} split: class {label} has only {count} patient(s); at least 2 are needed to stratify")]
    TooFewPatients {
        stage: &'static str,
        label: Label,
        count: usize,
    },

    #[error("{stage} split: fraction {fraction} must lie strictly between 0 and 1")]
    InvalidFraction { stage: &'static str, fraction: f64 },
}
