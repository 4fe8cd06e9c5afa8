use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Path of each server operation, relative to the base URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub init: String,
    pub upload_chunk: String,
    pub check_exists: String,
    pub merge: String,
    /// The slice id is appended as the last path segment.
    pub status: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            init: "/chunk/init".into(),
            upload_chunk: "/chunk/upload".into(),
            check_exists: "/chunk/check".into(),
            merge: "/chunk/merge".into(),
            status: "/chunk/status".into(),
        }
    }
}

/// Settings for [`HttpUploadServer`](crate::HttpUploadServer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    /// e.g. `https://files.example.com/v1/filesystem`
    pub base_url: String,
    pub endpoints: Endpoints,
    /// Applies to JSON requests; chunk uploads are bounded by the engine's
    /// chunk timeout instead.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Sent with every request, e.g. an `Authorization` header.
    pub headers: BTreeMap<String, String>,
}

impl HttpConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            endpoints: Endpoints::default(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Joins the base URL and an endpoint path without doubling slashes.
    pub(crate) fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}
