//! Term extraction for overlap scoring.

use std::collections::BTreeSet;

const STOPWORDS: &[&str] = &[
    "and", "are", "for", "from", "has", "have", "into", "its", "must", "not", "one", "our", "should",
    "that", "the", "this", "with", "was", "were", "will", "you", "your", "may", "all", "any", "can",
];

/// Lowercased alphanumeric words of three or more characters, minus stopwords.
pub fn terms(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3)
        .map(str::to_lowercase)
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Fraction of `needle` terms that also appear in `haystack`, in [0, 1].
pub fn overlap(needle: &BTreeSet<String>, haystack: &BTreeSet<String>) -> f32 {
    if needle.is_empty() {
        return 0.0;
    }
    let shared = needle.intersection(haystack).count();
    shared as f32 / needle.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_lowercase_terms_without_stopwords() {
        let t = terms("Search the Vendor-Policy for DATA retention");
        assert!(t.contains("search"));
        assert!(t.contains("vendor"));
        assert!(t.contains("policy"));
        assert!(t.contains("data"));
        assert!(!t.contains("the"));
        assert!(!t.contains("for"));
    }

    #[test]
    fn overlap_is_fraction_of_needle() {
        let needle = terms("vendor policy search");
        let hay = terms("search policies and vendor records");
        assert!((overlap(&needle, &hay) - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(overlap(&terms(""), &hay), 0.0);
    }
}
