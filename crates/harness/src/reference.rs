//! Recorded reference traces and similarity checks

use std::path::Path;

use lorastage_model::GenerationOutput;
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};

/// Tokens and per-step hidden states of one recorded generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceTrace {
    pub name: String,
    pub token_ids: Vec<u32>,
    pub hidden: Vec<Vec<f32>>,
}

impl ReferenceTrace {
    pub fn from_output(name: impl Into<String>, output: &GenerationOutput) -> Result<Self> {
        let hidden = output.hidden_trace.clone().ok_or_else(|| {
            HarnessError::InvalidInput("runtime did not dump hidden states".to_string())
        })?;
        Ok(Self {
            name: name.into(),
            token_ids: output.token_ids.clone(),
            hidden,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Similarity of the flattened hidden states.
    ///
    /// Both traces must be non-empty with the same number of steps and the
    /// same width at every step; anything else is `InvalidInput`.
    pub fn similarity(&self, other: &ReferenceTrace) -> Result<f64> {
        if self.hidden.is_empty() || other.hidden.is_empty() {
            return Err(HarnessError::InvalidInput(format!(
                "{}: empty hidden trace ({} vs {} steps)",
                self.name,
                self.hidden.len(),
                other.hidden.len()
            )));
        }
        if self.hidden.len() != other.hidden.len() {
            return Err(HarnessError::InvalidInput(format!(
                "{}: {} steps recorded, {} produced",
                self.name,
                self.hidden.len(),
                other.hidden.len()
            )));
        }
        for (step, (a, b)) in self.hidden.iter().zip(&other.hidden).enumerate() {
            if a.is_empty() || a.len() != b.len() {
                return Err(HarnessError::InvalidInput(format!(
                    "{}: step {} has width {} recorded, {} produced",
                    self.name,
                    step,
                    a.len(),
                    b.len()
                )));
            }
        }

        let a: Vec<f32> = self.hidden.iter().flatten().copied().collect();
        let b: Vec<f32> = other.hidden.iter().flatten().copied().collect();
        Ok(cosine_similarity(&a, &b))
    }

    /// Fail with `SimilarityBelowThreshold` unless `actual` tracks this trace
    pub fn check(&self, actual: &ReferenceTrace, threshold: f64) -> Result<f64> {
        let similarity = self.similarity(actual)?;
        if similarity.is_nan() || similarity < threshold {
            return Err(HarnessError::SimilarityBelowThreshold {
                case: self.name.clone(),
                similarity,
                threshold,
            });
        }
        Ok(similarity)
    }
}

/// Cosine similarity of two vectors of equal length.
///
/// Vectors of different length, or empty ones, give NaN so that any
/// threshold check fails. Zero vectors compare as 1.0 against each other
/// and 0.0 otherwise.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return f64::NAN;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    match (norm_a == 0.0, norm_b == 0.0) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.0,
        (false, false) => dot / (norm_a.sqrt() * norm_b.sqrt()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(name: &str, hidden: Vec<Vec<f32>>) -> ReferenceTrace {
        ReferenceTrace {
            name: name.to_string(),
            token_ids: vec![1, 2],
            hidden,
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]), 1.0);
        assert_eq!(cosine_similarity(&[0.0], &[3.0]), 0.0);
        assert!(cosine_similarity(&[], &[]).is_nan());
        assert!(cosine_similarity(&[1.0, 2.0], &[1.0]).is_nan());
    }

    #[test]
    fn test_check_fails_loudly() {
        let reference = trace("scale0.01", vec![vec![1.0, 0.0], vec![1.0, 0.0]]);
        let close = trace("run", vec![vec![1.0, 0.1], vec![1.0, 0.1]]);
        let far = trace("run", vec![vec![0.0, 1.0], vec![0.0, 1.0]]);

        assert!(reference.check(&close, 0.8).unwrap() > 0.99);

        match reference.check(&far, 0.8) {
            Err(HarnessError::SimilarityBelowThreshold { case, similarity, .. }) => {
                assert_eq!(case, "scale0.01");
                assert!(similarity < 0.8);
            }
            other => panic!("expected similarity failure, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_check_rejects_empty_trace() {
        let reference = trace("scale0.01", vec![vec![1.0, 0.0]; 21]);
        let empty = trace("run", vec![]);

        assert!(matches!(
            reference.check(&empty, 0.8),
            Err(HarnessError::InvalidInput(_))
        ));
        assert!(matches!(
            empty.check(&empty, 0.8),
            Err(HarnessError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_check_rejects_truncated_trace() {
        let reference = trace("scale0.01", vec![vec![1.0, 0.0]; 21]);
        let truncated = trace("run", vec![vec![1.0, 0.0]; 5]);
        let longer = trace("run", vec![vec![1.0, 0.0]; 22]);

        assert!(matches!(
            reference.check(&truncated, 0.8),
            Err(HarnessError::InvalidInput(_))
        ));
        assert!(matches!(
            reference.check(&longer, 0.8),
            Err(HarnessError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_check_rejects_width_mismatch() {
        // same flattened length, different per-step widths
        let reference = trace("scale0.01", vec![vec![1.0, 0.0], vec![1.0, 0.0]]);
        let reshaped = trace("run", vec![vec![1.0], vec![0.0, 1.0, 0.0]]);
        let narrow = trace("run", vec![vec![1.0], vec![1.0]]);

        assert!(matches!(
            reference.check(&reshaped, 0.8),
            Err(HarnessError::InvalidInput(_))
        ));
        assert!(matches!(
            reference.check(&narrow, 0.8),
            Err(HarnessError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.json");
        let original = trace("base", vec![vec![0.5, -0.25]]);
        original.save(&path).unwrap();
        assert_eq!(ReferenceTrace::load(&path).unwrap(), original);
    }
}
