//! Class labels and the JSON shape of a prediction.

use crate::error::PredictError;
use serde::Serialize;

/// Output classes of the potato disease model, in training order. The
/// network head is sized from this list.
pub const CLASS_NAMES: [&str; NUM_CLASSES] = [
    "Black Scurf",
    "Blackleg",
    "Blackspot Bruising",
    "Brown Rot",
    "Common Scab",
    "Dry Rot",
    "Healthy Potatoes",
    "Miscellaneous",
    "Pink Rot",
    "Soft Rot",
];

pub const NUM_CLASSES: usize = 10;

/// Predictions less confident than this carry `LOW_CONFIDENCE_NOTE`
pub const LOW_CONFIDENCE_THRESHOLD: f64 = 0.6;

pub const LOW_CONFIDENCE_NOTE: &str =
    "Low confidence prediction. Image quality or ambiguous symptoms may affect accuracy.";

/// The raw output of the classifier: the winning class and its softmax
/// probability
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub index: usize,
    pub confidence: f32,
}

/// What `POST /predict` returns
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    /// Human readable class label
    pub prediction: String,

    /// Softmax probability as a percentage, rounded to two decimals
    pub confidence: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

pub fn should_warn(confidence: f64) -> bool {
    confidence < LOW_CONFIDENCE_THRESHOLD
}

/// Two decimal places of `confidence * 100`, rounded from the exact decimal
/// value of the float with ties to even
fn round_percent(confidence: f64) -> f64 {
    let percent = confidence * 100.0;
    format!("{percent:.2}").parse().unwrap_or(percent)
}

impl TryFrom<Prediction> for PredictionResult {
    type Error = PredictError;

    fn try_from(p: Prediction) -> Result<Self, Self::Error> {
        let label = CLASS_NAMES
            .get(p.index)
            .ok_or(PredictError::UnknownClass(p.index))?;
        let confidence = f64::from(p.confidence);

        Ok(PredictionResult {
            prediction: label.to_string(),
            confidence: round_percent(confidence),
            note: should_warn(confidence).then(|| LOW_CONFIDENCE_NOTE.to_string()),
        })
    }
}
