//! Okapi BM25 over a small in-memory corpus.
//!
//! The corpus here is the handful of rules eligible for a scope, not a search
//! index, so the whole structure is rebuilt per query. Default Okapi
//! parameters (k1 = 1.5, b = 0.75).

use std::collections::HashMap;

const K1: f64 = 1.5;
const B: f64 = 0.75;

pub struct Bm25 {
    doc_term_freqs: Vec<HashMap<String, usize>>,
    doc_lens: Vec<usize>,
    avg_doc_len: f64,
    doc_freqs: HashMap<String, usize>,
    n_docs: usize,
}

pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|t| t.to_lowercase())
        .collect()
}

impl Bm25 {
    pub fn new(corpus: &[Vec<String>]) -> Self {
        let n_docs = corpus.len();
        let mut doc_term_freqs = Vec::with_capacity(n_docs);
        let mut doc_lens = Vec::with_capacity(n_docs);
        let mut doc_freqs: HashMap<String, usize> = HashMap::new();

        for doc in corpus {
            let mut freqs: HashMap<String, usize> = HashMap::new();
            for term in doc {
                *freqs.entry(term.clone()).or_insert(0) += 1;
            }
            for term in freqs.keys() {
                *doc_freqs.entry(term.clone()).or_insert(0) += 1;
            }
            doc_lens.push(doc.len());
            doc_term_freqs.push(freqs);
        }

        let avg_doc_len = if n_docs == 0 {
            0.0
        } else {
            doc_lens.iter().sum::<usize>() as f64 / n_docs as f64
        };

        Self {
            doc_term_freqs,
            doc_lens,
            avg_doc_len,
            doc_freqs,
            n_docs,
        }
    }

    /// BM25 score of the query against every document, in corpus order.
    pub fn scores(&self, query: &[String]) -> Vec<f64> {
        let mut out = vec![0.0; self.n_docs];
        if self.n_docs == 0 || self.avg_doc_len == 0.0 {
            return out;
        }
        for term in query {
            let df = match self.doc_freqs.get(term) {
                Some(df) => *df as f64,
                None => continue,
            };
            let idf = (((self.n_docs as f64 - df + 0.5) / (df + 0.5)) + 1.0).ln();
            for (i, freqs) in self.doc_term_freqs.iter().enumerate() {
                let tf = *freqs.get(term).unwrap_or(&0) as f64;
                if tf == 0.0 {
                    continue;
                }
                let norm = K1 * (1.0 - B + B * self.doc_lens[i] as f64 / self.avg_doc_len);
                out[i] += idf * tf * (K1 + 1.0) / (tf + norm);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Vec<Vec<String>> {
        vec![
            tokenize("user asks about their account balance"),
            tokenize("user wants to transfer money to another account"),
            tokenize("user reports a lost card"),
        ]
    }

    #[test]
    fn matching_terms_score_highest() {
        let bm25 = Bm25::new(&corpus());
        let scores = bm25.scores(&tokenize("check my balance"));
        assert!(scores[0] > scores[1]);
        assert!(scores[0] > scores[2]);
    }

    #[test]
    fn unknown_terms_score_zero_everywhere() {
        let bm25 = Bm25::new(&corpus());
        let scores = bm25.scores(&tokenize("xylophone"));
        assert!(scores.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn empty_corpus_is_fine() {
        let bm25 = Bm25::new(&[]);
        assert!(bm25.scores(&tokenize("anything")).is_empty());
    }

    #[test]
    fn tokenizer_lowercases() {
        assert_eq!(tokenize("Check BALANCE"), vec!["check", "balance"]);
    }
}
