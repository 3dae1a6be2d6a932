//! Secret handling utilities.
//!
//! Re-exports secrecy types and provides a log-safe rendering of
//! connection strings.

pub use secrecy::{ExposeSecret, SecretString};

/// Redacted form for logs: keeps the scheme and host of a URL-like secret.
pub fn redact_url(secret: &SecretString) -> String {
    let raw = secret.expose_secret();
    match raw.split_once("://") {
        Some((scheme, rest)) => {
            let host = rest.rsplit('@').next().unwrap_or(rest);
            let host = host.split('/').next().unwrap_or(host);
            format!("{scheme}://***@{host}")
        }
        None => "***".to_string(),
    }
}
