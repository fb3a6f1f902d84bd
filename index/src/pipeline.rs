//! Derivation of stored fields from raw page data
//!
//! Normalized URLs are the identity of a page: scheme, `www.` prefix,
//! fragment and trailing slash are dropped so that trivially different
//! spellings of one address land on the same record.

use crate::errors::{IndexError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::BTreeSet;
use unicode_segmentation::UnicodeSegmentation;
use url::Url;

/// Terms shorter than this are not indexed
const MIN_TERM_LEN: usize = 2;

/// Terms longer than this are almost always tokens or hashes
const MAX_TERM_LEN: usize = 64;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "that", "the", "this", "to", "was", "with",
];

/// Parsed URL components used by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformedUrl {
    pub normalized: String,
    pub hostname: String,
}

fn parse_lenient(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(IndexError::validation("empty url"));
    }

    match Url::parse(trimmed) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(&format!("http://{trimmed}"))
            .map_err(|e| IndexError::validation(format!("invalid url {trimmed}: {e}"))),
        Err(e) => Err(IndexError::validation(format!("invalid url {trimmed}: {e}"))),
    }
}

fn strip_www(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

/// Normalize a URL and derive its hostname
pub fn transform_url(raw: &str) -> Result<TransformedUrl> {
    let url = parse_lenient(raw)?;
    let host = url
        .host_str()
        .ok_or_else(|| IndexError::validation(format!("url has no host: {raw}")))?;
    let hostname = strip_www(host).to_string();

    let mut normalized = hostname.clone();
    if let Some(port) = url.port() {
        normalized.push_str(&format!(":{port}"));
    }
    normalized.push_str(url.path().trim_end_matches('/'));
    if let Some(query) = url.query().filter(|q| !q.is_empty()) {
        normalized.push('?');
        normalized.push_str(query);
    }

    Ok(TransformedUrl {
        normalized,
        hostname,
    })
}

/// Normalized page identity for a raw URL
pub fn normalize_url(raw: &str) -> Result<String> {
    transform_url(raw).map(|t| t.normalized)
}

/// URL scheme, lowercased; `None` when the URL cannot be parsed
pub fn url_scheme(raw: &str) -> Option<String> {
    Url::parse(raw.trim()).ok().map(|u| u.scheme().to_string())
}

/// Split text into a sorted, de-duplicated set of lowercase search terms
pub fn extract_terms(text: &str) -> Vec<String> {
    let terms: BTreeSet<String> = text
        .unicode_words()
        .map(str::to_lowercase)
        .filter(|w| {
            let len = w.chars().count();
            (MIN_TERM_LEN..=MAX_TERM_LEN).contains(&len)
        })
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .collect();
    terms.into_iter().collect()
}

/// Decoded `data:` URI payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUri {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Decode a base64 `data:` URI such as `data:image/png;base64,iVBOR...`
pub fn decode_data_uri(uri: &str) -> Result<DataUri> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| IndexError::transient_fetch("favicon is not a data uri"))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| IndexError::transient_fetch("favicon data uri has no payload"))?;
    let mime_type = meta
        .strip_suffix(";base64")
        .ok_or_else(|| IndexError::transient_fetch("favicon data uri is not base64"))?;
    let mime_type = if mime_type.is_empty() {
        "application/octet-stream"
    } else {
        mime_type
    };

    let data = STANDARD
        .decode(payload.trim())
        .map_err(|e| IndexError::transient_fetch_with_source("invalid favicon payload", e))?;
    if data.is_empty() {
        return Err(IndexError::transient_fetch("favicon payload is empty"));
    }

    Ok(DataUri {
        mime_type: mime_type.to_string(),
        data,
    })
}

/// Encode raw image bytes as a `data:` URI
pub fn encode_data_uri(mime_type: &str, data: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", STANDARD.encode(data))
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ErrorCategory;

    #[test]
    fn normalization_drops_scheme_www_fragment_and_trailing_slash() {
        let t = transform_url("https://www.Example.com/docs/#intro").expect("valid");
        assert_eq!(t.normalized, "example.com/docs");
        assert_eq!(t.hostname, "example.com");

        assert_eq!(
            normalize_url("http://example.com/docs/").expect("valid"),
            normalize_url("https://example.com/docs").expect("valid"),
        );
    }

    #[test]
    fn normalization_keeps_query_and_port() {
        assert_eq!(
            normalize_url("http://localhost:8080/search?q=rust").expect("valid"),
            "localhost:8080/search?q=rust"
        );
    }

    #[test]
    fn bare_host_is_accepted() {
        assert_eq!(normalize_url("x.test").expect("valid"), "x.test");
    }

    #[test]
    fn invalid_urls_are_validation_errors() {
        let err = normalize_url("").expect_err("empty");
        assert_eq!(err.category(), ErrorCategory::ValidationError);

        let err = normalize_url("mailto:someone@example.com").expect_err("no host");
        assert_eq!(err.category(), ErrorCategory::ValidationError);
    }

    #[test]
    fn terms_are_lowercased_deduplicated_and_filtered() {
        let terms = extract_terms("The Rust book: Rust is a systems language. x");
        assert_eq!(terms, vec!["book", "language", "rust", "systems"]);
    }

    #[test]
    fn data_uri_decodes() {
        let uri = encode_data_uri("image/png", &[1, 2, 3]);
        let decoded = decode_data_uri(&uri).expect("valid");
        assert_eq!(decoded.mime_type, "image/png");
        assert_eq!(decoded.data, vec![1, 2, 3]);
    }

    #[test]
    fn malformed_data_uri_is_transient_fetch_error() {
        for bad in ["http://x.test/icon.png", "data:image/png,raw", "data:image/png;base64,%%%"] {
            let err = decode_data_uri(bad).expect_err("malformed");
            assert_eq!(err.category(), ErrorCategory::TransientFetchError, "{bad}");
        }
    }
}
