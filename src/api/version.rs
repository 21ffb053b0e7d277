//! API version negotiation
//!
//! Resolution order: explicit path prefix (`/api/v1/...`, `/api/v2/...`),
//! then the `Accept-Version` / `X-API-Version` header, then the configured
//! default. Unknown versions fall back to the default.

use hyper::Request;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Headers a client can use to ask for a version
pub const VERSION_HEADERS: [&str; 2] = ["accept-version", "x-api-version"];

/// Supported API versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiVersion {
    #[default]
    V1,
    V2,
}

impl ApiVersion {
    pub const ALL: [ApiVersion; 2] = [ApiVersion::V1, ApiVersion::V2];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiVersion::V1 => "v1",
            ApiVersion::V2 => "v2",
        }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported API version: {0}")]
pub struct UnknownVersion(pub String);

impl FromStr for ApiVersion {
    type Err = UnknownVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.trim_start_matches('v') {
            "1" | "1.0" => Ok(ApiVersion::V1),
            "2" | "2.0" => Ok(ApiVersion::V2),
            _ => Err(UnknownVersion(s.to_string())),
        }
    }
}

/// Where the negotiated version came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionSource {
    Path,
    Header,
    Default,
}

/// Per-request version, carried in the handler's `RequestContext`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionContext {
    /// Raw version string the client asked for, if any
    pub requested: Option<String>,
    pub negotiated: ApiVersion,
    pub source: VersionSource,
}

/// Resolves the target API version of a request
#[derive(Debug, Clone)]
pub struct VersionNegotiator {
    default_version: ApiVersion,
}

impl VersionNegotiator {
    pub fn new(default_version: ApiVersion) -> Self {
        Self { default_version }
    }

    pub fn default_version(&self) -> ApiVersion {
        self.default_version
    }

    pub fn negotiate<B>(&self, req: &Request<B>) -> VersionContext {
        let mut requested = None;

        if let Some(segment) = path_version_segment(req.uri().path()) {
            match segment.parse::<ApiVersion>() {
                Ok(version) => {
                    return VersionContext {
                        requested: Some(segment.to_string()),
                        negotiated: version,
                        source: VersionSource::Path,
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Ignoring unknown version in path");
                    requested = Some(segment.to_string());
                }
            }
        }

        for name in VERSION_HEADERS {
            let Some(value) = req.headers().get(name).and_then(|v| v.to_str().ok()) else {
                continue;
            };
            match value.parse::<ApiVersion>() {
                Ok(version) => {
                    return VersionContext {
                        requested: Some(value.to_string()),
                        negotiated: version,
                        source: VersionSource::Header,
                    }
                }
                Err(e) => {
                    debug!(error = %e, header = name, "Ignoring unknown version in header");
                    requested.get_or_insert_with(|| value.to_string());
                }
            }
        }

        if let Some(raw) = &requested {
            debug!(requested = %raw, default = %self.default_version, "Falling back to default API version");
        }

        VersionContext {
            requested,
            negotiated: self.default_version,
            source: VersionSource::Default,
        }
    }
}

impl Default for VersionNegotiator {
    fn default() -> Self {
        Self::new(ApiVersion::default())
    }
}

/// The `vN` segment right after `/api`, if the path has one
fn path_version_segment(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/api/")?;
    let segment = rest.split('/').next()?;
    let is_version = segment.len() > 1
        && segment.starts_with(|c: char| c == 'v' || c == 'V')
        && segment[1..].chars().next().is_some_and(|c| c.is_ascii_digit());
    is_version.then_some(segment)
}
