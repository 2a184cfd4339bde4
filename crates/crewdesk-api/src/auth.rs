//! ---
//! cd_section: "05-networking-external-interfaces"
//! cd_subsection: "module"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Scheduled trigger endpoints for external schedulers."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
use axum::http::{header, HeaderMap, Uri};
use sha2::{Digest, Sha256};

/// Header carrying the trigger secret.
pub const SECRET_HEADER: &str = "x-cron-secret";

/// Query parameter carrying the trigger secret.
pub const SECRET_QUERY: &str = "secret";

/// Secret presented by the caller: query parameter, then `x-cron-secret`, then
/// `Authorization: Bearer`.
pub fn presented_secret(uri: &Uri, headers: &HeaderMap) -> Option<String> {
    let from_query = uri.query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == SECRET_QUERY)
            .map(|(_, value)| value.into_owned())
    });
    let from_header = || {
        headers
            .get(SECRET_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    };
    let from_bearer = || {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().strip_prefix("Bearer "))
            .map(str::to_owned)
    };
    from_query
        .or_else(from_header)
        .or_else(from_bearer)
        .map(|secret| secret.trim().to_owned())
        .filter(|secret| !secret.is_empty())
}

/// Compare secrets through their SHA-256 digests so the comparison time does
/// not depend on where the inputs differ.
pub fn secrets_match(expected: &str, presented: &str) -> bool {
    let expected = Sha256::digest(expected.as_bytes());
    let presented = Sha256::digest(presented.as_bytes());
    expected
        .iter()
        .zip(presented.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Short, non-reversible fingerprint for logging which secret is loaded.
pub fn secret_fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn secret_sources_in_order() {
        let mut headers = HeaderMap::new();
        headers.insert(SECRET_HEADER, HeaderValue::from_static("from-header"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer from-bearer"));

        let uri: Uri = "/api/cron/job?secret=from%20query".parse().unwrap();
        assert_eq!(presented_secret(&uri, &headers).as_deref(), Some("from query"));

        let uri: Uri = "/api/cron/job".parse().unwrap();
        assert_eq!(presented_secret(&uri, &headers).as_deref(), Some("from-header"));

        headers.remove(SECRET_HEADER);
        assert_eq!(presented_secret(&uri, &headers).as_deref(), Some("from-bearer"));

        headers.remove(header::AUTHORIZATION);
        assert_eq!(presented_secret(&uri, &headers), None);
    }

    #[test]
    fn blank_secret_counts_as_missing() {
        let uri: Uri = "/api/cron/job?secret=%20%20".parse().unwrap();
        assert_eq!(presented_secret(&uri, &HeaderMap::new()), None);
    }

    #[test]
    fn comparison_and_fingerprint() {
        assert!(secrets_match("s3cret", "s3cret"));
        assert!(!secrets_match("s3cret", "s3cret "));
        assert!(!secrets_match("s3cret", ""));
        assert_eq!(secret_fingerprint("s3cret").len(), 8);
        assert_ne!(secret_fingerprint("a"), secret_fingerprint("b"));
    }
}
