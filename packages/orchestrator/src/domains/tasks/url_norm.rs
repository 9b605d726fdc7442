//! URL normalization and fingerprinting.
//!
//! The fingerprint of the normalized URL is the sole deduplication key for
//! crawl tasks. Two submissions that differ only in query-parameter order,
//! fragment, or percent-encoding case must collide.

use sha2::{Digest, Sha256};
use url::Url;

use crate::common::OrchestratorError;
use crate::config::UrlNormalizeSettings;

/// Normalize a URL for fingerprinting.
///
/// - scheme and authority are lowercased (the parser does this)
/// - percent-encoding is re-serialized canonically
/// - the fragment is dropped
/// - query parameters are sorted by (key, value), exact duplicates removed
/// - parameters with an empty value are dropped
///
/// Only `http` and `https` URLs are accepted.
pub fn normalize_url(
    raw: &str,
    settings: &UrlNormalizeSettings,
) -> Result<String, OrchestratorError> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| OrchestratorError::Validation(format!("invalid url {raw:?}: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(OrchestratorError::Validation(format!(
            "unsupported scheme {:?}",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(OrchestratorError::Validation(format!(
            "url {raw:?} has no host"
        )));
    }

    if settings.strip_fragment {
        url.set_fragment(None);
    }

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if settings.drop_empty_params {
        pairs.retain(|(_, v)| !v.is_empty());
    }
    if settings.sort_query {
        pairs.sort();
        pairs.dedup();
    }

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    Ok(url.to_string())
}

/// Fixed-width hex digest of the normalized URL.
pub fn fingerprint(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> UrlNormalizeSettings {
        UrlNormalizeSettings::default()
    }

    #[test]
    fn scheme_and_host_are_lowercased() {
        let normalized = normalize_url("HTTPS://A.Example/X", &settings()).unwrap();
        assert_eq!(normalized, "https://a.example/X");
    }

    #[test]
    fn fragment_is_dropped() {
        let normalized = normalize_url("https://a.example/x#section-2", &settings()).unwrap();
        assert_eq!(normalized, "https://a.example/x");
    }

    #[test]
    fn query_parameters_sort_to_the_same_fingerprint() {
        let a = normalize_url("https://a.example/x?b=2&a=1", &settings()).unwrap();
        let b = normalize_url("https://a.example/x?a=1&b=2", &settings()).unwrap();
        assert_eq!(a, b);
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn empty_valued_parameters_are_dropped() {
        let a = normalize_url("https://a.example/x?a=1&utm=", &settings()).unwrap();
        let b = normalize_url("https://a.example/x?a=1", &settings()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn exact_duplicate_parameters_collapse() {
        let a = normalize_url("https://a.example/x?a=1&a=1", &settings()).unwrap();
        let b = normalize_url("https://a.example/x?a=1", &settings()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn repeated_keys_with_distinct_values_survive() {
        let normalized = normalize_url("https://a.example/x?a=2&a=1", &settings()).unwrap();
        assert_eq!(normalized, "https://a.example/x?a=1&a=2");
    }

    #[test]
    fn different_paths_get_different_fingerprints() {
        let a = normalize_url("https://a.example/x", &settings()).unwrap();
        let b = normalize_url("https://a.example/y", &settings()).unwrap();
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fingerprint_is_64_hex_chars() {
        let fp = fingerprint("https://a.example/x");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn non_http_schemes_are_rejected() {
        let err = normalize_url("ftp://a.example/x", &settings()).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn garbage_is_a_validation_error() {
        let err = normalize_url("not a url", &settings()).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn toggles_can_preserve_the_raw_shape() {
        let keep_everything = UrlNormalizeSettings {
            sort_query: false,
            strip_fragment: false,
            drop_empty_params: false,
        };
        let normalized =
            normalize_url("https://a.example/x?b=2&a=1#frag", &keep_everything).unwrap();
        assert_eq!(normalized, "https://a.example/x?b=2&a=1#frag");
    }
}
