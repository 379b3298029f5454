//! Code for loading the trained potato disease checkpoint and running it

use crate::checkpoint;
use crate::error::{CheckpointError, LoadError, PredictError};
use crate::inference::{Prediction, NUM_CLASSES};
use crate::net::{PotatoNet, HIDDEN_WIDTH};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tch::nn::{self, ModuleT};
use tch::{Device, Kind, Tensor};
use tracing::debug;

/// Checkpoint entry holding the final linear layer of the head
const HEAD_WEIGHT: &str = "classifier.3.weight";

/// Batch norm step counters that PyTorch saves but inference never reads
const IGNORED_SUFFIX: &str = ".num_batches_tracked";

/// The loaded potato disease classifier. Always on CPU, always in evaluation
/// mode, with frozen variables.
pub struct TorchModel {
    vs: nn::VarStore,
    // tensors are Send but not Sync
    net: Mutex<PotatoNet>,
}

impl Debug for TorchModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TorchModel {{ classes: {}, variables: {}, device: {:?} }}",
            NUM_CLASSES,
            self.vs.len(),
            self.vs.device()
        )
    }
}

impl TorchModel {
    /// Build the network and apply the weights stored at `path`
    pub fn new(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let model = Self::untrained();
        load_state_dict(&model.vs, path.as_ref())?;
        Ok(model)
    }

    /// The network with its random initialization, before any checkpoint is
    /// applied
    pub(crate) fn untrained() -> Self {
        let mut vs = nn::VarStore::new(Device::Cpu);
        let net = PotatoNet::new(&vs.root(), NUM_CLASSES as i64);
        vs.freeze();
        TorchModel {
            vs,
            net: Mutex::new(net),
        }
    }

    /// Classify a preprocessed `[1, 3, 224, 224]` batch
    pub fn predict(&self, input: &Tensor) -> Result<Prediction, PredictError> {
        let probabilities = {
            // an eval-mode forward pass never leaves the network half-updated
            let net = self.net.lock().unwrap_or_else(PoisonError::into_inner);
            tch::no_grad(|| net.forward_t(input, false).softmax(-1, Some(Kind::Float)))
        };
        let probabilities = Vec::<f32>::try_from(&probabilities.f_squeeze_dim(0)?)?;
        debug!("class probabilities: {probabilities:?}");

        let (index, confidence) = top_class(&probabilities)?;
        Ok(Prediction { index, confidence })
    }

    #[cfg(test)]
    pub(crate) fn save(&self, path: impl AsRef<Path>) -> Result<(), tch::TchError> {
        self.vs.save(path)
    }
}

/// Index and value of the largest probability. The first index wins a tie.
/// NaN or infinite entries are an error rather than a candidate.
pub fn top_class(probabilities: &[f32]) -> Result<(usize, f32), PredictError> {
    if let Some(i) = probabilities.iter().position(|p| !p.is_finite()) {
        return Err(PredictError::NonFinite(i));
    }
    probabilities
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, p)| match best {
            Some((_, q)) if q >= p => best,
            _ => Some((i, p)),
        })
        .ok_or(PredictError::EmptyOutput)
}

/// Read every named tensor of a checkpoint. The format follows the extension:
/// `torch.save` archives for `.pth`, `.pt` and `.bin`, safetensors, and the
/// libtorch archive format for everything else.
fn read_checkpoint(path: &Path) -> Result<Vec<(String, Tensor)>, CheckpointError> {
    let tensors = match path.extension().and_then(|ext| ext.to_str()) {
        Some("pth") | Some("pt") | Some("bin") => return checkpoint::read_state_dict(path),
        Some("safetensors") => Tensor::read_safetensors(path)?,
        _ => Tensor::load_multi_with_device(path, Device::Cpu)?,
    };
    Ok(tensors)
}

/// Copy a checkpoint into `vs`. Every variable must be present with its exact
/// shape and every checkpoint entry must be used.
fn load_state_dict(vs: &nn::VarStore, path: &Path) -> Result<(), LoadError> {
    if !path.is_file() {
        return Err(LoadError::Missing(path.to_path_buf()));
    }
    let mut tensors: HashMap<String, Tensor> = read_checkpoint(path)
        .map_err(|source| LoadError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .into_iter()
        .filter(|(name, _)| !name.ends_with(IGNORED_SUFFIX))
        .collect();

    check_head(&tensors)?;

    let variables: BTreeMap<String, Tensor> = vs.variables().into_iter().collect();
    tch::no_grad(|| -> Result<(), LoadError> {
        for (name, mut var) in variables {
            let src = tensors
                .remove(&name)
                .ok_or_else(|| LoadError::MissingTensor(name.clone()))?;
            if src.size() != var.size() {
                return Err(LoadError::ShapeMismatch {
                    name,
                    expected: var.size(),
                    found: src.size(),
                });
            }
            var.f_copy_(&src)?;
        }
        Ok(())
    })?;

    match tensors.into_keys().min() {
        Some(name) => Err(LoadError::UnexpectedTensor(name)),
        None => Ok(()),
    }
}

/// The head's output width must match the label list before anything else is
/// compared
fn check_head(tensors: &HashMap<String, Tensor>) -> Result<(), LoadError> {
    let head = tensors
        .get(HEAD_WEIGHT)
        .ok_or_else(|| LoadError::MissingTensor(HEAD_WEIGHT.to_string()))?;
    match head.size().as_slice() {
        [classes, HIDDEN_WIDTH] if *classes == NUM_CLASSES as i64 => Ok(()),
        [classes, HIDDEN_WIDTH] => Err(LoadError::HeadMismatch {
            expected: NUM_CLASSES as i64,
            found: *classes,
        }),
        found => Err(LoadError::ShapeMismatch {
            name: HEAD_WEIGHT.to_string(),
            expected: vec![NUM_CLASSES as i64, HIDDEN_WIDTH],
            found: found.to_vec(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::preprocess;
    use crate::util::test;

    fn torch_save_fixture() -> &'static Path {
        Path::new(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/testdata/tiny_state_dict.pth"
        ))
    }

    #[test]
    fn test_top_class() {
        assert_eq!(top_class(&[0.1, 0.7, 0.2]).unwrap(), (1, 0.7));
        // first index wins a tie
        assert_eq!(top_class(&[0.4, 0.2, 0.4]).unwrap(), (0, 0.4));
    }

    #[test]
    fn test_top_class_empty() {
        assert!(matches!(top_class(&[]), Err(PredictError::EmptyOutput)));
    }

    #[test]
    fn test_top_class_non_finite() {
        for bad in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            let err = top_class(&[0.2, bad, 0.8]).unwrap_err();
            assert!(matches!(err, PredictError::NonFinite(1)));
        }
        // NaN first would otherwise win every comparison
        let err = top_class(&[f32::NAN, 0.9]).unwrap_err();
        assert!(matches!(err, PredictError::NonFinite(0)));
    }

    #[test]
    fn test_predict_rejects_nan_input() {
        let model = TorchModel::untrained();
        let input = Tensor::full([1, 3, 224, 224], f64::NAN, (Kind::Float, Device::Cpu));
        let err = model.predict(&input).unwrap_err();
        assert!(matches!(err, PredictError::NonFinite(0)));
    }

    #[test]
    fn test_predict_is_a_distribution() {
        let model = TorchModel::untrained();
        let input = preprocess(&test::png_bytes(64, 48)).unwrap();
        let prediction = model.predict(&input).unwrap();
        assert!(prediction.index < NUM_CLASSES);
        assert!(prediction.confidence >= 1.0 / NUM_CLASSES as f32 - 1e-6);
        assert!(prediction.confidence <= 1.0);
    }

    #[test]
    fn test_predict_is_deterministic() {
        let model = TorchModel::untrained();
        let input = preprocess(&test::png_bytes(120, 90)).unwrap();
        let a = model.predict(&input).unwrap();
        let b = model.predict(&input).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("potato.ot");
        let original = TorchModel::untrained();
        original.save(&path).unwrap();

        let loaded = TorchModel::new(&path).unwrap();
        let input = preprocess(&test::png_bytes(224, 224)).unwrap();
        assert_eq!(
            original.predict(&input).unwrap(),
            loaded.predict(&input).unwrap()
        );
    }

    #[test]
    fn test_safetensors_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("potato.safetensors");
        TorchModel::untrained().save(&path).unwrap();
        TorchModel::new(&path).unwrap();
    }

    #[test]
    fn test_missing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let err = TorchModel::new(dir.path().join("Potato_Model.pth")).unwrap_err();
        assert!(matches!(err, LoadError::Missing(_)));
    }

    #[test]
    fn test_read_checkpoint_torch_save() {
        let tensors = read_checkpoint(torch_save_fixture()).unwrap();
        let named: Vec<(&str, Vec<i64>)> = tensors
            .iter()
            .map(|(name, t)| (name.as_str(), t.size()))
            .collect();
        assert_eq!(
            named,
            [
                ("features.0.0.weight", vec![2, 1, 3, 3]),
                ("features.0.1.weight", vec![2]),
                ("features.0.1.bias", vec![2]),
                ("features.0.1.num_batches_tracked", vec![]),
                ("classifier.3.weight", vec![2, 3]),
            ]
        );
    }

    #[test]
    fn test_torch_save_checkpoint_is_shape_checked() {
        let err = TorchModel::new(torch_save_fixture()).unwrap_err();
        assert!(matches!(
            err,
            LoadError::ShapeMismatch { name, found, .. }
                if name == HEAD_WEIGHT && found == [2, 3]
        ));
    }

    #[test]
    fn test_corrupt_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Potato_Model.pth");
        std::fs::write(&path, b"not a zip archive").unwrap();
        let err = TorchModel::new(&path).unwrap_err();
        assert!(matches!(err, LoadError::Read { .. }));
    }

    #[test]
    fn test_nine_class_head_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nine.ot");
        let vs = nn::VarStore::new(Device::Cpu);
        let _net = PotatoNet::new(&vs.root(), 9);
        vs.save(&path).unwrap();

        let err = TorchModel::new(&path).unwrap_err();
        assert!(matches!(
            err,
            LoadError::HeadMismatch {
                expected: 10,
                found: 9
            }
        ));
    }

    #[test]
    fn test_missing_tensor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.ot");
        let model = TorchModel::untrained();
        let named: Vec<(String, Tensor)> = model
            .vs
            .variables()
            .into_iter()
            .filter(|(name, _)| name != "features.0.0.weight")
            .collect();
        Tensor::save_multi(&named, &path).unwrap();

        let err = TorchModel::new(&path).unwrap_err();
        assert!(matches!(err, LoadError::MissingTensor(name) if name == "features.0.0.weight"));
    }

    #[test]
    fn test_unexpected_tensor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extra.ot");
        let model = TorchModel::untrained();
        let mut named: Vec<(String, Tensor)> = model.vs.variables().into_iter().collect();
        named.push((
            "classifier.5.weight".to_string(),
            Tensor::zeros([1], (Kind::Float, Device::Cpu)),
        ));
        named.push((
            "features.0.1.num_batches_tracked".to_string(),
            Tensor::zeros([1], (Kind::Int64, Device::Cpu)),
        ));
        Tensor::save_multi(&named, &path).unwrap();

        let err = TorchModel::new(&path).unwrap_err();
        assert!(matches!(err, LoadError::UnexpectedTensor(name) if name == "classifier.5.weight"));
    }
}
