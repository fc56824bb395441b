//! Hybrid score combination: normalised BM25 blended with vector similarity.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RetrievalError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    #[default]
    MinMax,
    ZScore,
    Softmax,
}

impl Normalization {
    pub fn parse(name: &str) -> Normalization {
        match name {
            "z_score" => Normalization::ZScore,
            "softmax" => Normalization::Softmax,
            // Unknown names fall back to min_max.
            _ => Normalization::MinMax,
        }
    }
}

/// Combines vector and BM25 scores with configurable weights.
#[derive(Debug, Clone)]
pub struct HybridScorer {
    vector_weight: f64,
    bm25_weight: f64,
    normalization: Normalization,
}

impl HybridScorer {
    pub fn new(vector_weight: f64, bm25_weight: f64, normalization: Normalization) -> Self {
        Self {
            vector_weight,
            bm25_weight,
            normalization,
        }
    }

    /// Combine cosine scores (already in [0, 1]) with raw BM25 scores.
    /// BM25 is normalised to [0, 1] first; the result is the weighted sum.
    pub fn combine(&self, vector_scores: &[f64], bm25_scores: &[f64]) -> Result<Vec<f64>> {
        if vector_scores.len() != bm25_scores.len() {
            return Err(RetrievalError::ScoreListMismatch(
                vector_scores.len(),
                bm25_scores.len(),
            ));
        }
        if vector_scores.is_empty() {
            return Ok(Vec::new());
        }

        let norm_bm25 = self.normalize(bm25_scores);
        Ok(vector_scores
            .iter()
            .zip(norm_bm25)
            .map(|(v, b)| v * self.vector_weight + b * self.bm25_weight)
            .collect())
    }

    fn normalize(&self, scores: &[f64]) -> Vec<f64> {
        match self.normalization {
            Normalization::MinMax => min_max(scores),
            Normalization::ZScore => z_score(scores),
            Normalization::Softmax => softmax(scores),
        }
    }
}

fn min_max(scores: &[f64]) -> Vec<f64> {
    let min = scores.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max == min {
        // All scores identical.
        return vec![1.0; scores.len()];
    }
    scores.iter().map(|s| (s - min) / (max - min)).collect()
}

fn z_score(scores: &[f64]) -> Vec<f64> {
    let n = scores.len() as f64;
    let mean = scores.iter().sum::<f64>() / n;
    let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt();
    if std == 0.0 {
        return vec![0.5; scores.len()];
    }
    // tanh maps the z-score into (-1, 1), then scaled to (0, 1).
    scores
        .iter()
        .map(|s| ((s - mean) / std).tanh() / 2.0 + 0.5)
        .collect()
}

fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    if sum == 0.0 {
        return vec![1.0 / scores.len() as f64; scores.len()];
    }
    exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_bm25_weight_equals_vector_only() {
        let scorer = HybridScorer::new(1.0, 0.0, Normalization::MinMax);
        let vector = vec![0.9, 0.4, 0.1];
        let bm25 = vec![3.0, 7.0, 1.0];
        let combined = scorer.combine(&vector, &bm25).unwrap();
        for (c, v) in combined.iter().zip(&vector) {
            assert!((c - v).abs() < 1e-9);
        }
    }

    #[test]
    fn all_equal_bm25_normalises_to_ones() {
        let scorer = HybridScorer::new(0.5, 0.5, Normalization::MinMax);
        let combined = scorer.combine(&[0.2, 0.8], &[4.0, 4.0]).unwrap();
        // bm25 contributes 0.5 to both; vector distinguishes.
        assert!((combined[0] - (0.1 + 0.5)).abs() < 1e-9);
        assert!((combined[1] - (0.4 + 0.5)).abs() < 1e-9);
    }

    #[test]
    fn z_score_all_equal_gives_half() {
        let scorer = HybridScorer::new(0.0, 1.0, Normalization::ZScore);
        let combined = scorer.combine(&[0.0, 0.0, 0.0], &[2.0, 2.0, 2.0]).unwrap();
        assert!(combined.iter().all(|c| (c - 0.5).abs() < 1e-9));
    }

    #[test]
    fn softmax_sums_to_one() {
        let scorer = HybridScorer::new(0.0, 1.0, Normalization::Softmax);
        let combined = scorer.combine(&[0.0, 0.0, 0.0], &[1.0, 2.0, 3.0]).unwrap();
        let sum: f64 = combined.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!(combined[2] > combined[1] && combined[1] > combined[0]);
    }

    #[test]
    fn mismatched_lengths_error() {
        let scorer = HybridScorer::new(0.7, 0.3, Normalization::MinMax);
        assert!(scorer.combine(&[0.1], &[0.1, 0.2]).is_err());
    }

    #[test]
    fn empty_lists_combine_to_empty() {
        let scorer = HybridScorer::new(0.7, 0.3, Normalization::MinMax);
        assert!(scorer.combine(&[], &[]).unwrap().is_empty());
    }
}
