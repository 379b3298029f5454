//! Process-wide application state shared by every request handler: the
//! classifier and where to load it from.

use crate::config::{LoadPolicy, Settings};
use crate::error::{LoadError, PredictError};
use crate::inference::PredictionResult;
use crate::preprocess::preprocess;
use crate::torch::TorchModel;
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// A value that is built at most once. Concurrent callers of `get_or_load`
/// block until the first successful build finishes; a failed build leaves
/// the slot empty.
#[derive(Debug)]
pub struct ModelSlot<M> {
    cell: OnceCell<Arc<M>>,
}

impl<M> ModelSlot<M> {
    pub fn empty() -> Self {
        ModelSlot {
            cell: OnceCell::new(),
        }
    }

    pub fn ready(model: M) -> Self {
        ModelSlot {
            cell: OnceCell::with_value(Arc::new(model)),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }

    pub fn get_or_load<E, F>(&self, load: F) -> Result<Arc<M>, E>
    where
        F: FnOnce() -> Result<M, E>,
    {
        self.cell.get_or_try_init(|| load().map(Arc::new)).cloned()
    }
}

#[derive(Debug)]
pub struct AppState {
    model: ModelSlot<TorchModel>,
    model_path: PathBuf,

    /// Largest accepted upload, in bytes
    pub max_upload_bytes: usize,
}

impl AppState {
    /// Build the state according to `settings.load`. Under the eager policy
    /// this reads the checkpoint and fails if it cannot be loaded.
    pub fn from_settings(settings: &Settings) -> Result<Self, LoadError> {
        let state = AppState {
            model: ModelSlot::empty(),
            model_path: settings.model_path.clone(),
            max_upload_bytes: settings.max_upload_bytes,
        };
        if settings.load == LoadPolicy::Eager {
            state.model()?;
        }
        Ok(state)
    }

    /// A state around an already constructed model
    pub fn with_model(model: TorchModel, max_upload_bytes: usize) -> Self {
        AppState {
            model: ModelSlot::ready(model),
            model_path: PathBuf::new(),
            max_upload_bytes,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_loaded()
    }

    /// The classifier, loading it first if this is the first use
    pub fn model(&self) -> Result<Arc<TorchModel>, LoadError> {
        self.model.get_or_load(|| {
            info!("loading model from {}", self.model_path.display());
            let start = Instant::now();
            match TorchModel::new(&self.model_path) {
                Ok(model) => {
                    info!("model loaded in {:?}: {model:?}", start.elapsed());
                    Ok(model)
                }
                Err(e) => {
                    error!("failed to load model: {e}");
                    Err(e)
                }
            }
        })
    }

    /// Run the full pipeline on an uploaded image
    pub fn classify(&self, image: &[u8]) -> Result<PredictionResult, PredictError> {
        let model = self.model()?;
        let input = preprocess(image)?;
        let prediction = model.predict(&input)?;
        PredictionResult::try_from(prediction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_UPLOAD_BYTES;
    use crate::inference::CLASS_NAMES;
    use crate::util::test;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    fn settings(model_path: PathBuf, load: LoadPolicy) -> Settings {
        Settings {
            host: "127.0.0.1".into(),
            port: 0,
            model_path,
            load,
            max_upload_bytes: MAX_UPLOAD_BYTES,
            log: "debug".into(),
        }
    }

    #[test]
    fn test_state_is_shareable_across_workers() {
        fn shareable<T: Send + Sync>() {}
        shareable::<AppState>();
        shareable::<TorchModel>();
    }

    #[test]
    fn test_concurrent_first_use_builds_once() {
        let slot: ModelSlot<usize> = ModelSlot::empty();
        let builds = AtomicUsize::new(0);
        let barrier = Barrier::new(8);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    barrier.wait();
                    let value = slot
                        .get_or_load(|| -> Result<usize, ()> {
                            std::thread::sleep(std::time::Duration::from_millis(20));
                            Ok(builds.fetch_add(1, Ordering::SeqCst) + 41)
                        })
                        .unwrap();
                    assert_eq!(*value, 41);
                });
            }
        });

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(slot.is_loaded());
    }

    #[test]
    fn test_failed_load_leaves_slot_empty() {
        let slot: ModelSlot<u8> = ModelSlot::empty();
        assert_eq!(slot.get_or_load(|| Err("boom")).unwrap_err(), "boom");
        assert!(!slot.is_loaded());
        assert_eq!(*slot.get_or_load(|| Ok::<_, &str>(7)).unwrap(), 7);
    }

    #[test]
    fn test_eager_missing_checkpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = AppState::from_settings(&settings(
            dir.path().join("Potato_Model.pth"),
            LoadPolicy::Eager,
        ))
        .unwrap_err();
        assert!(matches!(err, LoadError::Missing(_)));
    }

    #[test]
    fn test_lazy_loads_on_first_classify() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("potato.ot");
        TorchModel::untrained().save(&path).unwrap();

        let state = AppState::from_settings(&settings(path, LoadPolicy::Lazy)).unwrap();
        assert!(!state.is_loaded());

        let image = test::png_bytes(80, 60);
        let first = state.classify(&image).unwrap();
        assert!(state.is_loaded());
        assert!(CLASS_NAMES.contains(&first.prediction.as_str()));

        // same bytes, same weights, same answer
        assert_eq!(state.classify(&image).unwrap(), first);
    }

    #[test]
    fn test_lazy_missing_checkpoint_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::from_settings(&settings(
            dir.path().join("Potato_Model.pth"),
            LoadPolicy::Lazy,
        ))
        .unwrap();
        let err = state.classify(&test::png_bytes(10, 10)).unwrap_err();
        assert!(matches!(err, PredictError::Load(LoadError::Missing(_))));
        assert!(!state.is_loaded());
    }

    #[test]
    fn test_classify_result_properties() {
        let state = AppState::with_model(TorchModel::untrained(), MAX_UPLOAD_BYTES);
        for (w, h) in [(3, 700), (256, 256)] {
            let result = state.classify(&test::png_bytes(w, h)).unwrap();
            assert!(CLASS_NAMES.contains(&result.prediction.as_str()));
            assert!((0.0..=100.0).contains(&result.confidence));
            assert_eq!(
                (result.confidence * 100.0).round() / 100.0,
                result.confidence
            );
        }
    }
}
