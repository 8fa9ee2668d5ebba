// ============================================================
// Layer 2 — PredictUseCase
// ============================================================
// Loads a run artifact and classifies image files with it.

use anyhow::Result;
use burn::prelude::*;
use std::path::PathBuf;

use crate::ml::{
    inferencer::{Inferencer, Prediction},
    InferenceBackend,
};

pub struct PredictUseCase {
    artifact: PathBuf,
    images: Vec<PathBuf>,
}

impl PredictUseCase {
    pub fn new(artifact: PathBuf, images: Vec<PathBuf>) -> Self {
        Self { artifact, images }
    }

    pub fn execute(&self) -> Result<Vec<Prediction>> {
        let device: <InferenceBackend as Backend>::Device = Default::default();
        self.execute_on::<InferenceBackend>(device)
    }

    pub fn execute_on<B: Backend>(&self, device: B::Device) -> Result<Vec<Prediction>> {
        let (inferencer, _manifest) = Inferencer::<B>::from_artifact(&self.artifact, device)?;
        let predictions = inferencer.predict(&self.images)?;
        tracing::info!("Classified {} image(s)", predictions.len());
        Ok(predictions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::train_use_case::{
        tests::{tiny_config, write_dataset},
        TrainUseCase,
    };
    use burn::backend::{Autodiff, NdArray};
    use tempfile::TempDir;

    #[test]
    fn test_predicts_with_a_trained_artifact() {
        let dir = TempDir::new().unwrap();
        let mut cfg = tiny_config(dir.path());
        cfg.epochs = 1;
        write_dataset(&cfg.data_root);
        let trained = TrainUseCase::new(cfg.clone())
            .execute_on::<Autodiff<NdArray>>(&Default::default())
            .unwrap();

        let image = cfg.data_root.join("malignant/SOB/SOB_M_X-14-10-40-001.png");
        let predictions = PredictUseCase::new(trained.artifact_path, vec![image.clone()])
            .execute_on::<NdArray>(Default::default())
            .unwrap();
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].path, image);
        assert!((0.0..=1.0).contains(&predictions[0].malignant_probability));
    }

    #[test]
    fn test_missing_artifact_is_an_error() {
        let err = PredictUseCase::new(PathBuf::from("/nope/run.mpk.gz"), vec![PathBuf::from("x.png")])
            .execute_on::<NdArray>(Default::default())
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
