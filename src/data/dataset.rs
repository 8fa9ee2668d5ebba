use burn::data::dataset::Dataset;
use std::path::PathBuf;

use crate::domain::sample::{Label, Sample};

/// One image to load, with its position in the epoch's draw.
///
/// `draw` seeds the item's augmentation so a given epoch and
/// position always produce the same transform.
#[derive(Debug, Clone)]
pub struct ImageItem {
    pub path: PathBuf,
    pub label: Label,
    pub draw: usize,
}

/// A view over discovered samples through a list of indices.
///
/// Indices may repeat (weighted sampling draws with replacement).
pub struct ImageDataset {
    items: Vec<ImageItem>,
}

impl ImageDataset {
    pub fn new(samples: &[Sample], indices: &[usize]) -> Self {
        let items = indices
            .iter()
            .enumerate()
            .map(|(draw, &i)| ImageItem {
                path: samples[i].path.clone(),
                label: samples[i].label,
                draw,
            })
            .collect();
        Self { items }
    }

    pub fn labels(&self) -> Vec<Label> {
        self.items.iter().map(|it| it.label).collect()
    }
}

impl Dataset<ImageItem> for ImageDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}
