//! 学習済みモデル向けの特徴抽出（TF-IDF, unigram + bigram）。
use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use unicode_segmentation::UnicodeSegmentation;

static NOISE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:https?://|www\.)\S+|@\w+").expect("compile feature noise regex")
});

/// 小文字化したトークン列。URL とメンションは除外する。
pub(super) fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase().replace('\u{2019}', "'");
    let cleaned = NOISE_RE.replace_all(&lowered, " ");
    cleaned.unicode_words().map(str::to_string).collect()
}

/// unigram と隣接 bigram（空白区切り）を返す。
pub(super) fn terms(text: &str) -> Vec<String> {
    let tokens = tokenize(text);
    let bigrams: Vec<String> = tokens
        .windows(2)
        .map(|pair| format!("{} {}", pair[0], pair[1]))
        .collect();
    let mut terms = tokens;
    terms.extend(bigrams);
    terms
}

/// 語彙と IDF を持つベクトライザ。
#[derive(Debug, Clone)]
pub(super) struct TfidfVectorizer {
    vocabulary: HashMap<String, usize>,
    idf: Vec<f64>,
}

impl TfidfVectorizer {
    pub(super) fn new(vocabulary: HashMap<String, usize>, idf: Vec<f64>) -> Self {
        Self { vocabulary, idf }
    }

    pub(super) fn dimension(&self) -> usize {
        self.idf.len()
    }

    /// L2 正規化済みの疎ベクトル `(index, weight)` を返す。語彙外の語は無視する。
    pub(super) fn transform(&self, text: &str) -> Vec<(usize, f64)> {
        let mut counts: HashMap<usize, f64> = HashMap::new();
        for term in terms(text) {
            if let Some(&index) = self.vocabulary.get(&term) {
                *counts.entry(index).or_insert(0.0) += 1.0;
            }
        }

        let mut weights: Vec<(usize, f64)> = counts
            .into_iter()
            .filter_map(|(index, tf)| self.idf.get(index).map(|idf| (index, tf * idf)))
            .collect();
        let norm = weights.iter().map(|(_, w)| w * w).sum::<f64>().sqrt();
        if norm > 0.0 {
            for (_, weight) in &mut weights {
                *weight /= norm;
            }
        }
        weights.sort_unstable_by_key(|(index, _)| *index);
        weights
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terms_include_bigrams() {
        assert_eq!(
            terms("Not GOOD at all"),
            vec!["not", "good", "at", "all", "not good", "good at", "at all"]
        );
    }

    #[test]
    fn tokenize_drops_urls_and_mentions() {
        assert_eq!(
            tokenize("@someone check https://t.co/abc it\u{2019}s fine"),
            vec!["check", "it's", "fine"]
        );
    }

    #[test]
    fn transform_is_l2_normalized() {
        let vocabulary = HashMap::from([
            ("good".to_string(), 0),
            ("day".to_string(), 1),
            ("good day".to_string(), 2),
        ]);
        let vectorizer = TfidfVectorizer::new(vocabulary, vec![1.0, 2.0, 3.0]);

        let vector = vectorizer.transform("good day, good");
        let norm: f64 = vector.iter().map(|(_, w)| w * w).sum();
        assert!((norm - 1.0).abs() < 1e-9);
        assert_eq!(
            vector.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn transform_of_unknown_terms_is_empty() {
        let vectorizer = TfidfVectorizer::new(HashMap::new(), Vec::new());
        assert!(vectorizer.transform("nothing known here").is_empty());
        assert_eq!(vectorizer.dimension(), 0);
    }
}
