// ============================================================
// Layer 4 — Image Batcher
// ============================================================
// Implements Burn's Batcher trait: loads each ImageItem from
// disk, runs it through the split's transform pipeline and
// stacks the results.
//
//   Input:  Vec of N ImageItems
//   Output: ImageBatch { images [N, 3, S, S], targets [N] }
//
// Augmentation randomness is per item: the RNG is seeded from
// (run seed, epoch, draw position), so an item's pixels do not
// depend on which batch or worker thread loads it. With
// num_workers > 0 the loader still yields batches in arrival
// order, so the gradient-step order is only fixed when
// num_workers = 0.
//
// The Batcher trait cannot return errors. A file that fails to
// decode is recorded in a shared slot and replaced by zeros;
// the trainer checks the slot after every batch and aborts the
// run, so no metric is ever computed over a bad batch.

use burn::{data::dataloader::batcher::Batcher, prelude::*};
use rand::{rngs::StdRng, SeedableRng};
use std::sync::{Arc, Mutex};

use crate::data::{augmentation::ImagePipeline, dataset::ImageItem};

/// A batch of images ready for the forward pass.
#[derive(Debug, Clone)]
pub struct ImageBatch<B: Backend> {
    /// Normalised pixels — shape: [batch_size, 3, size, size]
    pub images: Tensor<B, 4>,
    /// Class indices — shape: [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

#[derive(Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    pipeline: Arc<ImagePipeline>,
    seed: u64,
    failure: Arc<Mutex<Option<String>>>,
}

impl<B: Backend> ImageBatcher<B> {
    /// `seed` should already mix in the epoch for training batchers.
    pub fn new(device: B::Device, pipeline: Arc<ImagePipeline>, seed: u64) -> Self {
        Self {
            device,
            pipeline,
            seed,
            failure: Arc::new(Mutex::new(None)),
        }
    }

    /// First load failure since the last call, if any.
    pub fn take_failure(&self) -> Option<String> {
        self.failure.lock().ok().and_then(|mut slot| slot.take())
    }

    fn record_failure(&self, message: String) {
        if let Ok(mut slot) = self.failure.lock() {
            slot.get_or_insert(message);
        }
    }
}

impl<B: Backend> Batcher<ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>) -> ImageBatch<B> {
        let batch_size = items.len();
        let size = self.pipeline.image_size() as usize;
        let per_image = self.pipeline.output_len();

        let mut pixels: Vec<f32> = Vec::with_capacity(batch_size * per_image);
        for item in &items {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(item.draw as u64));
            match self.pipeline.load(&item.path, &mut rng) {
                Ok(chw) => pixels.extend(chw),
                Err(e) => {
                    tracing::error!("{:#}", e);
                    self.record_failure(format!("{:#}", e));
                    pixels.extend(std::iter::repeat(0.0).take(per_image));
                }
            }
        }

        let targets: Vec<i32> = items.iter().map(|it| it.label.index() as i32).collect();

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(pixels, [batch_size, 3, size, size]),
            &self.device,
        );
        let targets = Tensor::<B, 1, Int>::from_ints(targets.as_slice(), &self.device);

        ImageBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::sample::Label;
    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    type TestBackend = NdArray;

    #[test]
    fn test_batch_shapes_and_targets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.png");
        RgbImage::from_pixel(20, 20, Rgb([10, 20, 30])).save(&path).unwrap();

        let batcher = ImageBatcher::<TestBackend>::new(
            Default::default(),
            Arc::new(ImagePipeline::evaluation(16)),
            0,
        );
        let items = vec![
            ImageItem { path: path.clone(), label: Label::Benign, draw: 0 },
            ImageItem { path, label: Label::Malignant, draw: 1 },
        ];
        let batch = batcher.batch(items);
        assert_eq!(batch.images.dims(), [2, 3, 16, 16]);
        let targets: Vec<i64> = batch.targets.into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(targets, vec![0, 1]);
        assert!(batcher.take_failure().is_none());
    }

    #[test]
    fn test_item_pixels_do_not_depend_on_batch_grouping() {
        use crate::data::augmentation::AugmentationConfig;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.png");
        RgbImage::from_fn(40, 40, |x, y| Rgb([(x * 6) as u8, (y * 6) as u8, 90])).save(&path).unwrap();

        let pipeline = Arc::new(ImagePipeline::training(&AugmentationConfig::aggressive(), 32));
        let batcher = ImageBatcher::<TestBackend>::new(Default::default(), pipeline, 7);
        let item = |draw| ImageItem { path: path.clone(), label: Label::Benign, draw };

        let alone: Vec<f32> = batcher.batch(vec![item(3)]).images.into_data().to_vec().unwrap();
        let grouped: Vec<f32> = batcher
            .batch(vec![item(1), item(3), item(2)])
            .images
            .into_data()
            .to_vec()
            .unwrap();
        let per_image = alone.len();
        assert_eq!(&grouped[per_image..2 * per_image], alone.as_slice());
        assert_ne!(&grouped[..per_image], alone.as_slice());
    }

    #[test]
    fn test_unreadable_file_is_reported() {
        let batcher = ImageBatcher::<TestBackend>::new(
            Default::default(),
            Arc::new(ImagePipeline::evaluation(8)),
            0,
        );
        let items = vec![ImageItem { path: "/no/such/file.png".into(), label: Label::Benign, draw: 0 }];
        let batch = batcher.batch(items);
        assert_eq!(batch.images.dims(), [1, 3, 8, 8]);
        assert!(batcher.take_failure().unwrap().contains("file.png"));
        assert!(batcher.take_failure().is_none());
    }
}
