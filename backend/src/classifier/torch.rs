use std::path::Path;
use std::sync::{Arc, Mutex};

use ndarray::ArrayView3;
use tch::{CModule, Device, Kind, Tensor};

use super::{Classifier, ClassifierError, probability_from_outputs};

/// TorchScript classifier, loaded once and shared across workers.
#[derive(Clone)]
pub struct TorchClassifier {
    model: Arc<Mutex<CModule>>,
    device: Device,
}

impl TorchClassifier {
    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        let device = Device::cuda_if_available();
        let model = CModule::load_on_device(path, device)
            .map_err(|e| ClassifierError::ModelUnavailable(e.to_string()))?;
        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            device,
        })
    }

    fn to_tensor(&self, image: ArrayView3<f32>) -> Tensor {
        let (h, w, c) = image.dim();
        let data: Vec<f32> = image.iter().copied().collect();
        // NHWC -> NCHW
        Tensor::from_slice(&data)
            .view([1, h as i64, w as i64, c as i64])
            .permute([0, 3, 1, 2])
            .contiguous()
            .to_device(self.device)
    }
}

impl Classifier for TorchClassifier {
    fn predict(&self, image: ArrayView3<f32>) -> Result<f32, ClassifierError> {
        let input = self.to_tensor(image);
        let output = {
            let model = self
                .model
                .lock()
                .map_err(|_| ClassifierError::InferenceFailure("model lock poisoned".into()))?;
            model
                .forward_ts(&[input])
                .map_err(|e| ClassifierError::InferenceFailure(e.to_string()))?
        };
        let flat = output.to_kind(Kind::Float).to_device(Device::Cpu).view([-1]);
        let outputs = Vec::<f32>::try_from(&flat)
            .map_err(|e| ClassifierError::InferenceFailure(e.to_string()))?;
        probability_from_outputs(&outputs)
    }

    fn is_loaded(&self) -> bool {
        true
    }
}
