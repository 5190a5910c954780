// ============================================================
// Layer 3 — Prediction Domain Type
// ============================================================
// The result of classifying one image. Probabilities are kept
// as a list sorted from most to least likely so clients get a
// stable, ranked view:
//
//   predicted_class:   "cat"
//   confidence:        0.81
//   all_probabilities: [cat 0.81, dog 0.12, ..., truck 0.0004]
//
// Reference: Rust Book §5 (Structs), §8 (Vectors)

use serde::{Deserialize, Serialize};

/// Probability assigned to a single class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassProbability {
    #[serde(rename = "class")]
    pub class_name:  String,
    pub probability: f32,
}

/// Classification result for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub predicted_class:   String,
    pub class_index:       usize,
    pub confidence:        f32,
    pub all_probabilities: Vec<ClassProbability>,
}

impl Prediction {
    /// Build a prediction from a softmax output row.
    ///
    /// Returns None when the row is empty or its length does not
    /// match the class list.
    pub fn from_probabilities(probs: &[f32], classes: &[String]) -> Option<Self> {
        if probs.is_empty() || probs.len() != classes.len() {
            return None;
        }

        let mut ranked: Vec<ClassProbability> = classes
            .iter()
            .zip(probs)
            .map(|(name, &p)| ClassProbability { class_name: name.clone(), probability: p })
            .collect();
        // Stable sort keeps class order among ties
        ranked.sort_by(|a, b| b.probability.total_cmp(&a.probability));

        let (class_index, confidence) = probs
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, p)| if p > best.1 { (i, p) } else { best });

        Some(Self {
            predicted_class:   classes[class_index].clone(),
            class_index,
            confidence,
            all_probabilities: ranked,
        })
    }
}

/// Description of a loaded model, as reported by `/model-info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_name:     String,
    pub dataset:        String,
    pub classes:        Vec<String>,
    pub num_classes:    usize,
    pub input_channels: usize,
    pub image_size:     usize,
    pub num_params:     usize,
    pub device:         String,
    pub epoch:          usize,
    pub val_acc:        f64,
}
