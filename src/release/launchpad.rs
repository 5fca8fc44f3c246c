//! `BuildArchive` over the Launchpad REST API

use super::{BuildArchive, CiBuild, ReleaseError, ReleaseTarget};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Environment variable holding the OAuth access token
pub const TOKEN_VARIABLE: &str = "STAGECRAFT_LAUNCHPAD_TOKEN";
/// Environment variable holding the OAuth access token secret
pub const SECRET_VARIABLE: &str = "STAGECRAFT_LAUNCHPAD_SECRET";

const CONSUMER_KEY: &str = "stagecraft";

/// Launchpad deployment to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaunchpadInstance {
    /// launchpad.net
    #[default]
    Production,
    /// staging.launchpad.net
    Staging,
    /// qastaging.launchpad.net
    Qastaging,
}

impl LaunchpadInstance {
    /// Root of the `devel` web service
    #[must_use]
    pub fn api_root(self) -> &'static str {
        match self {
            Self::Production => "https://api.launchpad.net/devel/",
            Self::Staging => "https://api.staging.launchpad.net/devel/",
            Self::Qastaging => "https://api.qastaging.launchpad.net/devel/",
        }
    }
}

impl FromStr for LaunchpadInstance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "production" => Ok(Self::Production),
            "staging" => Ok(Self::Staging),
            "qastaging" => Ok(Self::Qastaging),
            other => Err(format!(
                "unknown Launchpad instance '{other}' (expected production, staging or qastaging)"
            )),
        }
    }
}

impl fmt::Display for LaunchpadInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Production => "production",
            Self::Staging => "staging",
            Self::Qastaging => "qastaging",
        })
    }
}

/// OAuth access token for authenticated calls
#[derive(Clone, PartialEq, Eq)]
pub struct LaunchpadCredentials {
    token: String,
    secret: String,
}

impl fmt::Debug for LaunchpadCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchpadCredentials")
            .field("token", &self.token)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl LaunchpadCredentials {
    /// Creates credentials from a token and its secret
    #[must_use]
    pub fn new(token: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            secret: secret.into(),
        }
    }

    /// Reads the token from the environment; `None` when unset
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let token = std::env::var(TOKEN_VARIABLE).ok()?;
        let secret = std::env::var(SECRET_VARIABLE).ok()?;
        Some(Self::new(token, secret))
    }

    /// `Authorization` header value using the PLAINTEXT signature method
    #[must_use]
    pub fn authorization_header(&self, realm: &str) -> String {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let timestamp = Utc::now().timestamp();
        format!(
            "OAuth realm=\"{realm}\", oauth_consumer_key=\"{CONSUMER_KEY}\", \
             oauth_token=\"{}\", oauth_signature_method=\"PLAINTEXT\", \
             oauth_signature=\"&{}\", oauth_timestamp=\"{timestamp}\", \
             oauth_nonce=\"{nonce}\", oauth_version=\"1.0\"",
            self.token, self.secret
        )
    }
}

#[derive(Debug, Deserialize)]
struct Entry {
    self_link: String,
}

#[derive(Debug, Deserialize)]
struct GitRef {
    commit_sha1: String,
}

#[derive(Debug, Deserialize)]
struct Collection<T> {
    entries: Vec<T>,
    next_collection_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusReport {
    self_link: String,
    ci_build_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BuildEntry {
    self_link: String,
    arch_tag: String,
    buildstate: String,
    datebuilt: Option<DateTime<Utc>>,
}

/// Launchpad client implementing [`BuildArchive`]
#[derive(Debug)]
pub struct LaunchpadArchive {
    api_root: Url,
    credentials: Option<LaunchpadCredentials>,
    client: reqwest::blocking::Client,
}

impl LaunchpadArchive {
    /// Creates a client for `instance`
    pub fn new(
        instance: LaunchpadInstance,
        credentials: Option<LaunchpadCredentials>,
    ) -> Result<Self, ReleaseError> {
        Self::with_api_root(instance.api_root(), credentials)
    }

    /// Creates a client against an explicit web service root
    pub fn with_api_root(
        api_root: &str,
        credentials: Option<LaunchpadCredentials>,
    ) -> Result<Self, ReleaseError> {
        let api_root = Url::parse(api_root).map_err(|err| ReleaseError::Api(err.to_string()))?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| ReleaseError::Api(err.to_string()))?;
        Ok(Self {
            api_root,
            credentials,
            client,
        })
    }

    /// URL of a named operation, relative to the service root
    pub fn operation_url(
        &self,
        resource: &str,
        operation: &str,
        params: &[(&str, &str)],
    ) -> Result<Url, ReleaseError> {
        let mut url = if resource.starts_with("http") {
            Url::parse(resource)
        } else {
            self.api_root.join(resource)
        }
        .map_err(|err| ReleaseError::Api(err.to_string()))?;
        url.query_pairs_mut()
            .append_pair("ws.op", operation)
            .extend_pairs(params);
        Ok(url)
    }

    fn realm(&self) -> String {
        format!(
            "{}://{}/",
            self.api_root.scheme(),
            self.api_root.host_str().unwrap_or_default()
        )
    }

    fn authorize(
        &self,
        request: reqwest::blocking::RequestBuilder,
    ) -> reqwest::blocking::RequestBuilder {
        match &self.credentials {
            Some(credentials) => request.header(
                reqwest::header::AUTHORIZATION,
                credentials.authorization_header(&self.realm()),
            ),
            None => request,
        }
    }

    fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T, ReleaseError> {
        tracing::debug!(url = %url, "GET");
        self.authorize(self.client.get(url))
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .and_then(reqwest::blocking::Response::json)
            .map_err(|err| ReleaseError::Api(err.to_string()))
    }

    fn collection<T: DeserializeOwned>(&self, url: Url) -> Result<Vec<T>, ReleaseError> {
        let mut entries = Vec::new();
        let mut next = Some(url);
        while let Some(url) = next.take() {
            let page: Collection<T> = self.get(url)?;
            entries.extend(page.entries);
            next = page
                .next_collection_link
                .map(|link| Url::parse(&link).map_err(|err| ReleaseError::Api(err.to_string())))
                .transpose()?;
        }
        Ok(entries)
    }

    fn has_binaries(&self, report: &StatusReport) -> Result<bool, ReleaseError> {
        let url = self.operation_url(
            &report.self_link,
            "getArtifactURLs",
            &[("artifact_type", "Binary")],
        )?;
        let urls: Vec<String> = self.get(url)?;
        Ok(!urls.is_empty())
    }
}

impl BuildArchive for LaunchpadArchive {
    fn find_repository(&self, path: &str) -> Result<Option<String>, ReleaseError> {
        let url = self.operation_url("+git", "getByPath", &[("path", path)])?;
        let entry: Option<Entry> = self.get(url)?;
        Ok(entry.map(|entry| entry.self_link))
    }

    fn resolve_ref(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<Option<String>, ReleaseError> {
        let url = self.operation_url(repository, "getRefByPath", &[("path", reference)])?;
        let git_ref: Option<GitRef> = self.get(url)?;
        Ok(git_ref.map(|r| r.commit_sha1))
    }

    fn ci_builds(&self, repository: &str, commit: &str) -> Result<Vec<CiBuild>, ReleaseError> {
        let url = self.operation_url(repository, "getStatusReports", &[("commit_sha1", commit)])?;
        let mut builds = Vec::new();
        for report in self.collection::<StatusReport>(url)? {
            let Some(build_link) = &report.ci_build_link else {
                continue;
            };
            let link = Url::parse(build_link).map_err(|err| ReleaseError::Api(err.to_string()))?;
            let entry: BuildEntry = self.get(link)?;
            let has_binaries = self.has_binaries(&report)?;
            builds.push(CiBuild {
                link: entry.self_link,
                arch_tag: entry.arch_tag,
                state: entry.buildstate,
                date_built: entry.datebuilt,
                has_binaries,
            });
        }
        Ok(builds)
    }

    fn upload_build(&self, build: &CiBuild, target: &ReleaseTarget) -> Result<(), ReleaseError> {
        let url = self.operation_url(
            "archives",
            "getByReference",
            &[("reference", target.archive.as_str())],
        )?;
        let archive: Option<Entry> = self.get(url)?;
        let archive = archive.ok_or_else(|| {
            ReleaseError::Api(format!("Archive {} does not exist.", target.archive))
        })?;
        let url = Url::parse(&archive.self_link).map_err(|err| ReleaseError::Api(err.to_string()))?;
        let form = [
            ("ws.op", "uploadCIBuild"),
            ("ci_build", build.link.as_str()),
            ("to_series", target.suite.as_str()),
            ("to_pocket", "Release"),
            ("to_channel", target.channel.as_str()),
        ];
        tracing::debug!(url = %url, build = %build.link, "POST uploadCIBuild");
        self.authorize(self.client.post(url).form(&form))
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .map_err(|err| ReleaseError::Api(err.to_string()))?;
        Ok(())
    }
}
