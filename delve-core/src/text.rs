//! Text and URL normalization used for deduplication

use std::collections::BTreeSet;

/// Lowercase, replace punctuation with spaces and collapse whitespace
pub fn normalize_text(text: &str) -> String {
    let mapped: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Distinct normalized tokens of a text
pub fn tokenize(text: &str) -> BTreeSet<String> {
    normalize_text(text)
        .split(' ')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Jaccard similarity of two token sets. Two empty sets are identical.
pub fn jaccard_similarity(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Token Jaccard similarity of two raw texts
pub fn text_similarity(a: &str, b: &str) -> f64 {
    jaccard_similarity(&tokenize(a), &tokenize(b))
}

/// Canonical form of a URL for deduplication.
///
/// Scheme and host are lowercased by the parser, the fragment is dropped and a
/// trailing slash on the path is removed. Unparseable input is trimmed and
/// lowercased.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    match url::Url::parse(trimmed) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            let mut normalized = parsed.to_string();
            if normalized.ends_with('/') && parsed.query().is_none() {
                normalized.pop();
            }
            normalized
        }
        Err(_) => trimmed.trim_end_matches('/').to_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Rust is FAST!  "), "rust is fast");
        assert_eq!(normalize_text("a,b;c"), "a b c");
        assert_eq!(normalize_text(""), "");
    }

    #[test]
    fn test_jaccard() {
        assert_eq!(text_similarity("rust async runtime", "Rust async runtime!"), 1.0);
        assert!(text_similarity("rust async runtime", "python web framework") < 0.1);
        let sim = text_similarity("tokio async runtime", "tokio runtime");
        assert!((sim - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(
            normalize_url("HTTPS://Example.com/docs/#intro"),
            "https://example.com/docs"
        );
        assert_eq!(
            normalize_url("https://example.com/docs"),
            normalize_url("https://example.com/docs/")
        );
        assert_eq!(
            normalize_url("https://example.com/?q=1"),
            "https://example.com/?q=1"
        );
        assert_eq!(normalize_url(" not a url/ "), "not a url");
    }
}
