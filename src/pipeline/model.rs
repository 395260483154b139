//! Bag-of-words dense network loaded from a JSON artifact
//!
//! Artifact layout:
//!
//! ```json
//! {
//!   "max_words": 10000,
//!   "dictionary": { "dolore": 17, "febbre": 42 },
//!   "layers": [
//!     { "name": "dense_1", "activation": "relu", "weights": [[...]], "biases": [...] },
//!     { "name": "out_pred", "activation": "softmax", "weights": [[...]], "biases": [...] }
//!   ]
//! }
//! ```
//!
//! `weights` is `[inputs][outputs]`. The first layer takes `max_words` inputs.
//! A final layer with several outputs is read as attention classes and the
//! score is `argmax + 1` (1 = least attention); a single output is returned
//! as-is.

use super::error::InferenceError;
use super::inference::{InferenceEngine, ModelLoader};
use super::types::WorkItem;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Sigmoid,
    Softmax,
    Linear,
}

impl Activation {
    fn apply(self, values: &mut [f64]) {
        match self {
            Activation::Relu => values.iter_mut().for_each(|v| *v = v.max(0.0)),
            Activation::Sigmoid => values.iter_mut().for_each(|v| *v = 1.0 / (1.0 + (-*v).exp())),
            Activation::Softmax => {
                let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                let mut sum = 0.0;
                for v in values.iter_mut() {
                    *v = (*v - max).exp();
                    sum += *v;
                }
                if sum > 0.0 {
                    values.iter_mut().for_each(|v| *v /= sum);
                }
            }
            Activation::Linear => {}
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseLayer {
    #[serde(default)]
    pub name: String,
    pub activation: Activation,
    pub weights: Vec<Vec<f64>>,
    pub biases: Vec<f64>,
}

impl DenseLayer {
    fn inputs(&self) -> usize {
        self.weights.len()
    }

    fn outputs(&self) -> usize {
        self.biases.len()
    }

    fn forward(&self, input: &[f64]) -> Vec<f64> {
        let mut out = self.biases.clone();
        for (x, row) in input.iter().zip(&self.weights) {
            if *x == 0.0 {
                continue;
            }
            for (o, w) in out.iter_mut().zip(row) {
                *o += x * w;
            }
        }
        self.activation.apply(&mut out);
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseTextModel {
    pub max_words: usize,
    pub dictionary: HashMap<String, usize>,
    pub layers: Vec<DenseLayer>,
}

impl DenseTextModel {
    /// Read and shape-check an artifact
    pub fn from_path(path: &Path) -> Result<Self, InferenceError> {
        let load_err = |reason: String| InferenceError::Load {
            path: path.to_path_buf(),
            reason,
        };

        let file = File::open(path).map_err(|e| load_err(e.to_string()))?;
        let model: DenseTextModel =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| load_err(e.to_string()))?;
        model.check_shapes().map_err(load_err)?;
        Ok(model)
    }

    fn check_shapes(&self) -> Result<(), String> {
        if self.max_words == 0 {
            return Err("max_words must be > 0".to_string());
        }
        if self.layers.is_empty() {
            return Err("model has no layers".to_string());
        }

        let mut expected_inputs = self.max_words;
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.inputs() != expected_inputs {
                return Err(format!(
                    "layer {} '{}' expects {} inputs, previous layer gives {}",
                    i,
                    layer.name,
                    layer.inputs(),
                    expected_inputs
                ));
            }
            if layer.outputs() == 0 {
                return Err(format!("layer {} '{}' has no outputs", i, layer.name));
            }
            if let Some(row) = layer.weights.iter().position(|r| r.len() != layer.outputs()) {
                return Err(format!(
                    "layer {} '{}' weight row {} does not match {} biases",
                    i,
                    layer.name,
                    row,
                    layer.outputs()
                ));
            }
            expected_inputs = layer.outputs();
        }
        Ok(())
    }

    /// Dictionary index for each word of `text`
    pub fn word_indices(&self, text: &str) -> Vec<usize> {
        normalize(text)
            .split_whitespace()
            .map(|word| self.lookup(word))
            .collect()
    }

    fn lookup(&self, word: &str) -> usize {
        if let Some(&index) = self.dictionary.get(word) {
            return index;
        }

        let mut chars = word.chars();
        chars.next_back();
        let stem = chars.as_str();
        if stem.is_empty() {
            return 0;
        }
        self.dictionary.get(stem).copied().unwrap_or(0)
    }

    /// Multi-hot encoding of one message; out-of-range indices are dropped
    pub fn vectorize(&self, text: &str) -> Vec<f64> {
        let mut input = vec![0.0; self.max_words];
        for index in self.word_indices(text) {
            if index < self.max_words {
                input[index] = 1.0;
            }
        }
        input
    }

    fn score_text(&self, text: &str) -> f64 {
        let output = self
            .layers
            .iter()
            .fold(self.vectorize(text), |data, layer| layer.forward(&data));

        if output.len() == 1 {
            return output[0];
        }

        let best = output
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
        (best.0 + 1) as f64
    }
}

impl InferenceEngine for DenseTextModel {
    fn score(&self, batch: &[WorkItem]) -> Result<Vec<f64>, InferenceError> {
        // Bio snapshots travel with the batch but this network is text-only
        Ok(batch.iter().map(|item| self.score_text(&item.text)).collect())
    }

    fn describe(&self) -> String {
        let shape: Vec<String> = self.layers.iter().map(|l| l.outputs().to_string()).collect();
        format!(
            "dense text model ({} words → {})",
            self.max_words,
            shape.join(" → ")
        )
    }
}

/// Lowercase and blank out ASCII punctuation
/// Lowercase, blank ASCII punctuation, fold accents ("perché" → "perche")
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_punctuation() { ' ' } else { c })
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect()
}

/// Loads `DenseTextModel` artifacts
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseModelLoader;

impl ModelLoader for DenseModelLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn InferenceEngine>, InferenceError> {
        let model = DenseTextModel::from_path(path)?;
        log::info!("🧠 Loaded {} from {}", model.describe(), path.display());
        Ok(Arc::new(model))
    }
}
