//! Term extraction: tokenizing, class-based TF-IDF and a hashed text vectorizer.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

use themewatch_common::TopTerm;

use crate::similarity::normalize;

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-z0-9]+").expect("valid regex"));

static STOPWORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "a", "about", "above", "after", "again", "against", "all", "also", "am", "an", "and",
        "any", "are", "as", "at", "be", "because", "been", "before", "being", "below", "between",
        "both", "but", "by", "can", "could", "did", "do", "does", "doing", "down", "during",
        "each", "even", "few", "for", "from", "further", "get", "had", "has", "have", "having",
        "he", "her", "here", "hers", "him", "his", "how", "however", "i", "if", "in", "into",
        "is", "it", "its", "itself", "just", "like", "made", "make", "many", "may", "me", "might",
        "more", "most", "much", "must", "my", "new", "no", "nor", "not", "now", "of", "off", "on",
        "once", "one", "only", "or", "other", "our", "ours", "out", "over", "own", "said", "same",
        "say", "says", "she", "should", "so", "some", "such", "than", "that", "the", "their",
        "theirs", "them", "then", "there", "these", "they", "this", "those", "through", "to",
        "too", "two", "under", "until", "up", "us", "use", "used", "very", "was", "way", "we",
        "well", "were", "what", "when", "where", "which", "while", "who", "whom", "why", "will",
        "with", "would", "year", "years", "yet", "you", "your", "yours",
    ]
    .into_iter()
    .collect()
});

/// Lowercased alphanumeric tokens, in order.
pub fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    TOKEN_RE
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .collect()
}

pub fn is_stopword(term: &str) -> bool {
    STOPWORDS.contains(term)
}

/// Usable in a human label: not a stopword, longer than two characters.
pub fn is_label_term(term: &str) -> bool {
    term.chars().count() > 2 && !is_stopword(term)
}

/// Distinctive terms per class using class-based TF-IDF:
///
/// `W(t, c) = tf(t, c) * ln(1 + A / f(t))`
///
/// where `tf` is the L1-normalized term frequency inside class `c`, `f(t)` the
/// frequency of `t` over the whole corpus and `A` the average word count per class.
/// Documents outside every class still count toward `f(t)` and `A`, so terms common
/// to the whole corpus are pushed down. Terms tie-break alphabetically.
pub fn class_tfidf(
    texts: &[String],
    classes: &[Vec<usize>],
    top_n: usize,
) -> Vec<Vec<TopTerm>> {
    let tokens: Vec<Vec<String>> = texts.iter().map(|t| tokenize(t)).collect();

    let mut corpus_freq: HashMap<&str, f64> = HashMap::new();
    let mut total_words = 0usize;
    for doc in &tokens {
        for tok in doc {
            *corpus_freq.entry(tok.as_str()).or_default() += 1.0;
        }
        total_words += doc.len();
    }

    let covered: HashSet<usize> = classes.iter().flatten().copied().collect();
    let class_count = classes.len() + usize::from(covered.len() < texts.len());
    if class_count == 0 || total_words == 0 {
        return vec![Vec::new(); classes.len()];
    }
    let avg_words = total_words as f64 / class_count as f64;

    classes
        .iter()
        .map(|members| {
            let mut counts: BTreeMap<&str, f64> = BTreeMap::new();
            let mut class_words = 0.0;
            for &i in members {
                for tok in &tokens[i] {
                    *counts.entry(tok.as_str()).or_default() += 1.0;
                    class_words += 1.0;
                }
            }
            if class_words == 0.0 {
                return Vec::new();
            }

            let mut weighted: Vec<TopTerm> = counts
                .into_iter()
                .map(|(term, count)| {
                    let f = corpus_freq.get(term).copied().unwrap_or(count);
                    TopTerm {
                        term: term.to_string(),
                        weight: (count / class_words) * (1.0 + avg_words / f).ln(),
                    }
                })
                .collect();
            weighted.sort_by(|a, b| {
                b.weight
                    .partial_cmp(&a.weight)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.term.cmp(&b.term))
            });
            weighted.truncate(top_n);
            weighted
        })
        .collect()
}

/// Deterministic bag-of-words embedding for text-only clustering. Stopwords are
/// dropped, counts are log-scaled, and each vector is unit length.
pub fn hashed_vectors(texts: &[String], dims: usize) -> Vec<Vec<f32>> {
    texts
        .iter()
        .map(|text| {
            let mut v = vec![0.0f32; dims];
            for tok in tokenize(text).iter().filter(|t| !is_stopword(t)) {
                v[(fnv1a(tok.as_bytes()) % dims as u64) as usize] += 1.0;
            }
            for x in v.iter_mut() {
                if *x > 0.0 {
                    *x = 1.0 + x.ln();
                }
            }
            normalize(&mut v);
            v
        })
        .collect()
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn tokenize_lowercases_and_splits_punctuation() {
        assert_eq!(tokenize("Solar-Panel ROI, 2024!"), vec!["solar", "panel", "roi", "2024"]);
    }

    #[test]
    fn label_terms_skip_short_words_and_stopwords() {
        assert!(is_label_term("solar"));
        assert!(!is_label_term("the"));
        assert!(!is_label_term("ev"));
        assert!(!is_label_term("which"));
    }

    #[test]
    fn class_terms_prefer_distinctive_over_frequent() {
        let texts = docs(&[
            "battery storage battery grid report",
            "battery storage grid report",
            "recipe pasta sauce report",
            "recipe pasta basil report",
        ]);
        let terms = class_tfidf(&texts, &[vec![0, 1], vec![2, 3]], 3);

        assert_eq!(terms[0][0].term, "battery");
        assert!(terms[0].iter().all(|t| t.term != "report"));
        assert!(terms[1].iter().any(|t| t.term == "pasta" || t.term == "recipe"));
    }

    #[test]
    fn class_terms_respect_top_n() {
        let texts = docs(&["alpha beta gamma delta", "alpha beta gamma delta"]);
        let terms = class_tfidf(&texts, &[vec![0, 1]], 2);
        assert_eq!(terms[0].len(), 2);
    }

    #[test]
    fn class_terms_of_empty_text_are_empty() {
        let texts = docs(&["", ""]);
        let terms = class_tfidf(&texts, &[vec![0, 1]], 5);
        assert!(terms[0].is_empty());
    }

    #[test]
    fn hashed_vectors_are_deterministic_and_unit_length() {
        let texts = docs(&["grid battery storage", "grid battery storage", "the of and"]);
        let a = hashed_vectors(&texts, 64);
        let b = hashed_vectors(&texts, 64);
        assert_eq!(a, b);
        assert_eq!(a[0], a[1]);

        let norm: f32 = a[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(a[2].iter().all(|x| *x == 0.0));
    }
}
