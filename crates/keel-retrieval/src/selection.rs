//! Adaptive cut-off strategies over score-sorted candidate lists.
//!
//! Every strategy consumes a descending-sorted list and returns a prefix of
//! it: `min_score` filters first (backfilled to `min_k` when the filter is too
//! aggressive), the strategy picks a cut, `max_k` caps and `min_k` guarantees
//! the final size.

use serde::Serialize;

use crate::error::{Result, RetrievalError};

#[derive(Debug, Clone)]
pub struct ScoredItem<T> {
    pub item: T,
    pub score: f64,
}

impl<T> ScoredItem<T> {
    pub fn new(item: T, score: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&score) {
            return Err(RetrievalError::ScoreOutOfRange(score));
        }
        Ok(Self { item, score })
    }
}

/// Strategy-specific diagnostics carried back to the audit record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SelectionMetadata {
    pub elbow_idx: Option<usize>,
    pub entropy: Option<f64>,
    pub n_clusters: Option<usize>,
    pub alpha: Option<f64>,
    pub reason: Option<&'static str>,
}

#[derive(Debug)]
pub struct SelectionResult<T> {
    pub selected: Vec<ScoredItem<T>>,
    pub method: &'static str,
    /// Score of the last selected item (0.0 when nothing selected).
    pub cutoff_score: f64,
    pub metadata: SelectionMetadata,
}

#[derive(Debug, Clone)]
pub enum SelectionStrategy {
    FixedK {
        k: usize,
        min_score: f64,
    },
    Elbow {
        drop_threshold: f64,
        min_score: f64,
    },
    AdaptiveK {
        alpha: f64,
        min_score: f64,
    },
    Entropy {
        low_entropy_k: usize,
        high_entropy_k: usize,
        entropy_threshold: f64,
        min_score: f64,
    },
    Clustering {
        eps: f64,
        top_per_cluster: usize,
        min_score: f64,
    },
}

impl SelectionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            SelectionStrategy::FixedK { .. } => "fixed_k",
            SelectionStrategy::Elbow { .. } => "elbow",
            SelectionStrategy::AdaptiveK { .. } => "adaptive_k",
            SelectionStrategy::Entropy { .. } => "entropy",
            SelectionStrategy::Clustering { .. } => "clustering",
        }
    }

    fn min_score(&self) -> f64 {
        match self {
            SelectionStrategy::FixedK { min_score, .. }
            | SelectionStrategy::Elbow { min_score, .. }
            | SelectionStrategy::AdaptiveK { min_score, .. }
            | SelectionStrategy::Entropy { min_score, .. }
            | SelectionStrategy::Clustering { min_score, .. } => *min_score,
        }
    }

    /// Build from the configured strategy name and parameter map.
    pub fn from_config(
        name: &str,
        min_score: f64,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self> {
        let get_f = |key: &str, default: f64| params.get(key).and_then(|v| v.as_f64()).unwrap_or(default);
        let get_u = |key: &str, default: usize| {
            params
                .get(key)
                .and_then(|v| v.as_u64())
                .map(|v| v as usize)
                .unwrap_or(default)
        };
        match name {
            "fixed_k" => Ok(SelectionStrategy::FixedK {
                k: get_u("k", 10),
                min_score,
            }),
            "elbow" => Ok(SelectionStrategy::Elbow {
                drop_threshold: get_f("drop_threshold", 0.3),
                min_score,
            }),
            "adaptive_k" => Ok(SelectionStrategy::AdaptiveK {
                alpha: get_f("alpha", 1.0),
                min_score,
            }),
            "entropy" => Ok(SelectionStrategy::Entropy {
                low_entropy_k: get_u("low_entropy_k", 3),
                high_entropy_k: get_u("high_entropy_k", 10),
                entropy_threshold: get_f("entropy_threshold", 0.5),
                min_score,
            }),
            "clustering" => Ok(SelectionStrategy::Clustering {
                eps: get_f("eps", 0.05),
                top_per_cluster: get_u("top_per_cluster", 3),
                min_score,
            }),
            other => Err(RetrievalError::UnknownStrategy(other.to_string())),
        }
    }

    pub fn select<T>(
        &self,
        items: Vec<ScoredItem<T>>,
        max_k: usize,
        min_k: usize,
    ) -> Result<SelectionResult<T>> {
        if min_k > max_k {
            return Err(RetrievalError::MinKGreaterThanMaxK { min_k, max_k });
        }
        for pair in items.windows(2) {
            if pair[0].score < pair[1].score {
                return Err(RetrievalError::Unsorted);
            }
        }

        if items.is_empty() {
            return Ok(SelectionResult {
                selected: Vec::new(),
                method: self.name(),
                cutoff_score: 0.0,
                metadata: SelectionMetadata {
                    entropy: matches!(self, SelectionStrategy::Entropy { .. }).then_some(0.0),
                    n_clusters: matches!(self, SelectionStrategy::Clustering { .. }).then_some(0),
                    ..Default::default()
                },
            });
        }

        // min_score filter, backfilled so min_k survives an over-aggressive
        // threshold. The input is sorted, so the backfill is simply a longer
        // prefix.
        let threshold = self.min_score();
        let above = items.iter().filter(|i| i.score >= threshold).count();
        let pool_len = above.max(min_k.min(items.len()));
        let mut pool: Vec<ScoredItem<T>> = items.into_iter().take(pool_len).collect();

        let scores: Vec<f64> = pool.iter().map(|i| i.score).collect();
        let (cut, mut metadata) = self.cut_index(&scores);

        let take = cut.min(max_k).max(min_k.min(pool.len()));
        pool.truncate(take);
        metadata.alpha = match self {
            SelectionStrategy::AdaptiveK { alpha, .. } => Some(*alpha),
            _ => None,
        };

        let cutoff_score = pool.last().map(|i| i.score).unwrap_or(0.0);
        Ok(SelectionResult {
            selected: pool,
            method: self.name(),
            cutoff_score,
            metadata,
        })
    }

    /// How many items the strategy keeps from the (sorted) pool.
    fn cut_index(&self, scores: &[f64]) -> (usize, SelectionMetadata) {
        let n = scores.len();
        match self {
            SelectionStrategy::FixedK { k, .. } => (*k.min(&n), SelectionMetadata::default()),

            SelectionStrategy::Elbow { drop_threshold, .. } => {
                for i in 1..n {
                    let prev = scores[i - 1];
                    if prev > 0.0 && (prev - scores[i]) / prev >= *drop_threshold {
                        return (
                            i,
                            SelectionMetadata {
                                elbow_idx: Some(i),
                                ..Default::default()
                            },
                        );
                    }
                }
                (n, SelectionMetadata::default())
            }

            SelectionStrategy::AdaptiveK { alpha, .. } => {
                if n <= 2 {
                    return (
                        n,
                        SelectionMetadata {
                            reason: Some("insufficient_points"),
                            ..Default::default()
                        },
                    );
                }
                // Second-difference curvature; alpha trades curvature
                // strength against preferring earlier cuts.
                let mut best_i = n;
                let mut best = f64::NEG_INFINITY;
                for i in 1..n - 1 {
                    let curvature = scores[i - 1] - 2.0 * scores[i] + scores[i + 1];
                    let weighted = alpha * curvature - (1.0 - alpha) * (i as f64 / n as f64);
                    if weighted > best {
                        best = weighted;
                        best_i = i;
                    }
                }
                (best_i.max(1), SelectionMetadata::default())
            }

            SelectionStrategy::Entropy {
                low_entropy_k,
                high_entropy_k,
                entropy_threshold,
                ..
            } => {
                let entropy = normalized_entropy(scores);
                let k = if entropy < *entropy_threshold {
                    *low_entropy_k
                } else {
                    *high_entropy_k
                };
                (
                    k.min(n),
                    SelectionMetadata {
                        entropy: Some(entropy),
                        ..Default::default()
                    },
                )
            }

            SelectionStrategy::Clustering {
                eps,
                top_per_cluster,
                ..
            } => {
                // 1-D DBSCAN over sorted scores degenerates to run-splitting:
                // adjacent scores within eps share a cluster.
                let mut keep = 0usize;
                let mut n_clusters = 0usize;
                let mut i = 0usize;
                while i < n {
                    n_clusters += 1;
                    let mut end = i + 1;
                    while end < n && scores[end - 1] - scores[end] <= *eps {
                        end += 1;
                    }
                    keep += (end - i).min(*top_per_cluster);
                    i = end;
                }
                // Keeping the top of each cluster from a sorted list keeps a
                // prefix only when later clusters are exhausted; holding the
                // prefix contract, we keep the first `keep` items.
                (
                    keep,
                    SelectionMetadata {
                        n_clusters: Some(n_clusters),
                        ..Default::default()
                    },
                )
            }
        }
    }
}

/// Shannon entropy of the score distribution, normalised to [0, 1] by ln(n).
fn normalized_entropy(scores: &[f64]) -> f64 {
    let n = scores.len();
    if n <= 1 {
        return 0.0;
    }
    let sum: f64 = scores.iter().sum();
    if sum == 0.0 {
        return 0.0;
    }
    let h: f64 = scores
        .iter()
        .filter(|s| **s > 0.0)
        .map(|s| {
            let p = s / sum;
            -p * p.ln()
        })
        .sum();
    h / (n as f64).ln()
}
