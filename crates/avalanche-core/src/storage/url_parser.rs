//! URL parsing for storage backends.
//!
//! Extracts backend configuration from S3, GCS and local filesystem URLs.

use object_store::path::Path;
use regex::{Captures, Regex};
use std::sync::LazyLock;

use crate::error::{InvalidUrlSnafu, StorageError};

use super::{GcsConfig, LocalConfig, S3Config};

const S3_PATH: &str =
    r"^https://s3\.(?P<region>[\w\-]+)\.amazonaws\.com/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-\.]+)\.s3\.(?P<region>[\w\-]+)\.amazonaws\.com(/(?P<key>.+))?$";
const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_ENDPOINT_URL: &str = r"^[sS]3[aA]?::(?<protocol>https?)://(?P<endpoint>[^:/]+):(?<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";

const GCS_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-_\.]+)\.storage\.googleapis\.com(/(?P<key>.+))?$";
const GCS_PATH: &str =
    r"^https://storage\.googleapis\.com/(?P<bucket>[a-z0-9\-_\.]+)(/(?P<key>.+))?$";
const GCS_URL: &str = r"^[gG][sS]://(?P<bucket>[a-z0-9\-\._]+)(/(?P<key>.+))?$";

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_URL: &str = r"^file:(?P<path>.*)$";
const FILE_PATH: &str = r"^/(?P<path>.*)$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    S3,
    Gcs,
    Local,
}

/// Matchers in evaluation order. `file://` must be tried before `file:`.
static MATCHERS: LazyLock<Vec<(Backend, Regex)>> = LazyLock::new(|| {
    [
        (Backend::S3, S3_PATH),
        (Backend::S3, S3_VIRTUAL),
        (Backend::S3, S3_ENDPOINT_URL),
        (Backend::S3, S3_URL),
        (Backend::Gcs, GCS_PATH),
        (Backend::Gcs, GCS_VIRTUAL),
        (Backend::Gcs, GCS_URL),
        (Backend::Local, FILE_URI),
        (Backend::Local, FILE_URL),
        (Backend::Local, FILE_PATH),
    ]
    .into_iter()
    .map(|(backend, pattern)| (backend, Regex::new(pattern).expect("static pattern")))
    .collect()
});

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Gcs(GcsConfig),
    Local(LocalConfig),
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        let Some((backend, matches)) = MATCHERS
            .iter()
            .find_map(|(backend, regex)| regex.captures(url).map(|m| (*backend, m)))
        else {
            return InvalidUrlSnafu { url }.fail();
        };

        let parsed = match backend {
            Backend::S3 => Self::parse_s3(&matches),
            Backend::Gcs => Self::parse_gcs(&matches),
            Backend::Local => Self::parse_local(&matches),
        };
        parsed.ok_or_else(|| InvalidUrlSnafu { url }.build())
    }

    fn parse_s3(matches: &Captures) -> Option<Self> {
        let bucket = matches.name("bucket")?.as_str().to_string();

        let region = std::env::var("AWS_DEFAULT_REGION")
            .ok()
            .or_else(|| matches.name("region").map(|m| m.as_str().to_string()));

        let endpoint = std::env::var("AWS_ENDPOINT").ok().or_else(|| {
            matches.name("endpoint").map(|endpoint| {
                let port = matches
                    .name("port")
                    .and_then(|p| p.as_str().parse::<u16>().ok())
                    .unwrap_or(443);
                let protocol = matches
                    .name("protocol")
                    .map(|p| p.as_str())
                    .unwrap_or("https");
                format!("{protocol}://{}:{port}", endpoint.as_str())
            })
        });

        let key = matches.name("key").map(|m| m.as_str().into());

        Some(BackendConfig::S3(S3Config {
            endpoint,
            region,
            bucket,
            key,
        }))
    }

    fn parse_gcs(matches: &Captures) -> Option<Self> {
        let bucket = matches.name("bucket")?.as_str().to_string();
        let key = matches.name("key").map(|r| r.as_str().into());
        Some(BackendConfig::Gcs(GcsConfig { bucket, key }))
    }

    fn parse_local(matches: &Captures) -> Option<Self> {
        let path = matches.name("path")?.as_str().trim_end_matches('/');
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Some(BackendConfig::Local(LocalConfig { path }))
    }

    pub(crate) fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Gcs(gcs) => gcs.key.as_ref(),
            BackendConfig::Local(_) => None,
        }
    }
}
