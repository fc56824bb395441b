use crate::error::{Result, RetrievalError};

/// Cosine similarity between two vectors, in [-1, 1].
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(RetrievalError::LengthMismatch(a.len(), b.len()));
    }
    if a.is_empty() {
        return Err(RetrievalError::EmptyVector);
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// Cosine similarity clamped to [0, 1] for use as a retrieval score.
pub fn clamped_similarity(a: &[f32], b: &[f32]) -> Result<f64> {
    Ok(cosine_similarity(a, b)?.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_score_one() {
        let v = vec![0.5, 0.5, 0.5];
        assert!((cosine_similarity(&v, &v).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn opposite_vectors_score_negative_one_and_clamp_to_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b).unwrap() + 1.0).abs() < 1e-9);
        assert_eq!(clamped_similarity(&a, &b).unwrap(), 0.0);
    }

    #[test]
    fn zero_vector_scores_zero() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 1.0];
        assert_eq!(cosine_similarity(&a, &b).unwrap(), 0.0);
    }

    #[test]
    fn length_mismatch_and_empty_are_errors() {
        assert_eq!(
            cosine_similarity(&[1.0], &[1.0, 2.0]).unwrap_err(),
            RetrievalError::LengthMismatch(1, 2)
        );
        assert_eq!(
            cosine_similarity(&[], &[]).unwrap_err(),
            RetrievalError::EmptyVector
        );
    }
}
