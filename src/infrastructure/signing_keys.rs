//! PPA signing keys from the Launchpad API

use crate::executor::SigningKeySource;
use crate::pipeline::{PpaReference, RunError};
use std::time::Duration;
use url::Url;

/// Root of the Launchpad web service
pub const LAUNCHPAD_API_BASE_URL: &str = "https://api.launchpad.net/devel";

/// Fetches armored keys with the `getSigningKeyData` operation
#[derive(Debug, Clone)]
pub struct LaunchpadKeySource {
    base_url: String,
    timeout: Duration,
}

impl Default for LaunchpadKeySource {
    fn default() -> Self {
        Self::new(LAUNCHPAD_API_BASE_URL)
    }
}

impl LaunchpadKeySource {
    /// Creates a source against `base_url`
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(60),
        }
    }

    /// URL of the signing key of `ppa`
    pub fn key_url(&self, ppa: &PpaReference) -> Result<Url, url::ParseError> {
        Url::parse_with_params(
            &format!(
                "{}/~{}/+archive/{}/{}",
                self.base_url.trim_end_matches('/'),
                ppa.owner,
                ppa.distribution,
                ppa.name
            ),
            &[("ws.op", "getSigningKeyData")],
        )
    }
}

impl SigningKeySource for LaunchpadKeySource {
    fn signing_key(&self, ppa: &PpaReference) -> Result<String, RunError> {
        let not_found = || RunError::SigningKey {
            ppa: ppa.to_string(),
        };
        let url = self.key_url(ppa).map_err(|_| not_found())?;
        tracing::debug!(url = %url, "Fetching signing key");

        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|_| not_found())?;
        let response = client
            .get(url)
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .map_err(|err| {
                tracing::warn!(ppa = %ppa, error = %err, "Signing key request failed");
                not_found()
            })?;
        // The operation returns the key as a JSON string.
        let key: Option<String> = response.json().map_err(|_| not_found())?;
        key.filter(|k| !k.is_empty()).ok_or_else(not_found)
    }
}
