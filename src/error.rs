use std::path::PathBuf;
use thiserror::Error;

/// Failure to build the classifier from its checkpoint
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("checkpoint {0} does not exist")]
    Missing(PathBuf),

    #[error("failed to read checkpoint {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: CheckpointError,
    },

    #[error("checkpoint has no tensor for `{0}`")]
    MissingTensor(String),

    #[error("checkpoint has unexpected tensor `{0}`")]
    UnexpectedTensor(String),

    #[error("tensor `{name}` has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<i64>,
        found: Vec<i64>,
    },

    #[error("checkpoint head predicts {found} classes, expected {expected}")]
    HeadMismatch { expected: i64, found: i64 },

    #[error(transparent)]
    Tensor(#[from] tch::TchError),
}

/// Failure to decode the tensors stored in a checkpoint file
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid checkpoint archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("unsupported pickle: {0}")]
    Pickle(String),

    #[error("unexpected checkpoint layout: {0}")]
    Layout(String),

    #[error(transparent)]
    Tensor(#[from] tch::TchError),
}

/// Failure while turning an uploaded image into a prediction
#[derive(Debug, Error)]
pub enum PredictError {
    #[error("invalid image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("model unavailable: {0}")]
    Load(#[from] LoadError),

    #[error("inference failed: {0}")]
    Tensor(#[from] tch::TchError),

    #[error("model produced class index {0} with no label")]
    UnknownClass(usize),

    #[error("model produced no class probabilities")]
    EmptyOutput,

    #[error("model produced a non-finite probability for class {0}")]
    NonFinite(usize),
}
