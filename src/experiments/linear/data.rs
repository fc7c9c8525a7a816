use crate::config::args::RunArgs;
use crate::domain::model::{EntryPoint, Loaders, SymbolTable};
use crate::domain::ports::{DataLoader, ExperimentModule};
use anyhow::Context;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::any::Any;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataParams {
    pub n_train: usize,
    pub n_valid: usize,
    pub slope: f64,
    pub intercept: f64,
    pub noise: f64,
}

impl Default for DataParams {
    fn default() -> Self {
        Self {
            n_train: 256,
            n_valid: 64,
            slope: 3.0,
            intercept: 2.0,
            noise: 0.1,
        }
    }
}

/// `(x, y)` pairs served in fixed-size batches.
#[derive(Debug, Clone)]
pub struct SampleLoader {
    samples: Vec<(f64, f64)>,
    batch_size: usize,
}

impl SampleLoader {
    pub fn new(samples: Vec<(f64, f64)>, batch_size: usize) -> Self {
        Self {
            samples,
            batch_size: batch_size.max(1),
        }
    }

    pub fn samples(&self) -> &[(f64, f64)] {
        &self.samples
    }

    pub fn batches(&self) -> std::slice::Chunks<'_, (f64, f64)> {
        self.samples.chunks(self.batch_size)
    }
}

impl DataLoader for SampleLoader {
    fn len(&self) -> usize {
        self.samples.len().div_ceil(self.batch_size)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct LinearData;

impl LinearData {
    fn generate(params: &DataParams, count: usize, rng: &mut StdRng) -> Vec<(f64, f64)> {
        let noise = params.noise.abs();
        (0..count)
            .map(|_| {
                let x: f64 = rng.random_range(-1.0..=1.0);
                let eps: f64 = rng.random_range(-noise..=noise);
                (x, params.slope * x + params.intercept + eps)
            })
            .collect()
    }
}

impl ExperimentModule for LinearData {
    fn entry_points(&self) -> SymbolTable {
        [EntryPoint::PrepareData].into_iter().collect()
    }

    fn prepare_data(
        &self,
        args: &RunArgs,
        data_params: &serde_json::Value,
        rng: &mut StdRng,
    ) -> anyhow::Result<Loaders> {
        let params: DataParams =
            serde_json::from_value(data_params.clone()).context("invalid data_params")?;
        let batch_size = args.batch_size();

        let mut loaders = Loaders::new();
        loaders.insert(
            "train".to_string(),
            Box::new(SampleLoader::new(
                Self::generate(&params, params.n_train, rng),
                batch_size,
            )),
        );
        loaders.insert(
            "valid".to_string(),
            Box::new(SampleLoader::new(
                Self::generate(&params, params.n_valid, rng),
                batch_size,
            )),
        );
        Ok(loaders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::seed::seeded_rng;
    use serde_json::json;

    fn train_samples(loaders: &Loaders) -> Vec<(f64, f64)> {
        loaders["train"]
            .as_any()
            .downcast_ref::<SampleLoader>()
            .unwrap()
            .samples()
            .to_vec()
    }

    #[test]
    fn test_loaders_and_batches() {
        let mut args = RunArgs::new("src/experiments/linear");
        args.batch_size = Some(10);
        let params = json!({"n_train": 25, "n_valid": 5});

        let loaders = LinearData
            .prepare_data(&args, &params, &mut seeded_rng(1))
            .unwrap();
        assert_eq!(loaders.len(), 2);
        assert_eq!(loaders["train"].len(), 3);
        assert_eq!(loaders["valid"].len(), 1);
    }

    #[test]
    fn test_same_seed_same_data() {
        let args = RunArgs::new("src/experiments/linear");
        let params = json!({});

        let a = LinearData.prepare_data(&args, &params, &mut seeded_rng(7)).unwrap();
        let b = LinearData.prepare_data(&args, &params, &mut seeded_rng(7)).unwrap();
        assert_eq!(train_samples(&a), train_samples(&b));
    }

    #[test]
    fn test_noise_free_samples_lie_on_the_line() {
        let args = RunArgs::new("src/experiments/linear");
        let params = json!({"n_train": 8, "noise": 0.0, "slope": -1.5, "intercept": 0.5});

        let loaders = LinearData.prepare_data(&args, &params, &mut seeded_rng(3)).unwrap();
        for (x, y) in train_samples(&loaders) {
            assert!((y - (-1.5 * x + 0.5)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_invalid_params() {
        let args = RunArgs::new("src/experiments/linear");
        let params = json!({"n_train": "many"});
        assert!(LinearData.prepare_data(&args, &params, &mut seeded_rng(3)).is_err());
    }
}
