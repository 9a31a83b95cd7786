//! Secret handling utilities.
//!
//! Re-exports the secrecy types used for connection strings, and keeps
//! credentials out of anything that gets logged.

pub use secrecy::{ExposeSecret, SecretString};

/// `url` with any password replaced by `***`, safe to log.
pub fn redact_database_url(url: &SecretString) -> String {
    match reqwest::Url::parse(url.expose_secret()) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<unparsable database url>".to_string(),
    }
}
