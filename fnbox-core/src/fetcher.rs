// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Artifact retrieval boundary.
//!
//! The code store is an external collaborator. The engine only needs
//! `fetch(key) -> bytes`. Two adapters ship with the engine: a local
//! directory and an HTTP object store.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::CodeSource;
use crate::error::FetchError;
use crate::types::StorageKey;

/// Retrieves the artifact stored under a key.
#[async_trait]
pub trait CodeFetcher: Send + Sync {
    async fn fetch(&self, key: &StorageKey) -> Result<Bytes, FetchError>;
}

/// Build the fetcher described by the configuration.
pub fn from_source(source: &CodeSource) -> Result<Arc<dyn CodeFetcher>, FetchError> {
    Ok(match source {
        CodeSource::Directory(root) => Arc::new(DirectoryFetcher::new(root.clone())),
        CodeSource::Http(base_url) => Arc::new(HttpFetcher::new(base_url.clone())?),
    })
}

/// Reads artifacts from `<root>/<storage_key>`.
#[derive(Debug, Clone)]
pub struct DirectoryFetcher {
    root: PathBuf,
}

impl DirectoryFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl CodeFetcher for DirectoryFetcher {
    async fn fetch(&self, key: &StorageKey) -> Result<Bytes, FetchError> {
        let path = self.root.join(key.as_str());
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FetchError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(FetchError::Io {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Downloads artifacts with `GET <base_url>/<storage_key>`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    base_url: String,
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(base_url: impl Into<String>) -> Result<Self, FetchError> {
        let base_url = base_url.into();
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| FetchError::Http {
                key: String::new(),
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url_for(&self, key: &StorageKey) -> String {
        format!("{}/{}", self.base_url, key)
    }
}

#[async_trait]
impl CodeFetcher for HttpFetcher {
    async fn fetch(&self, key: &StorageKey) -> Result<Bytes, FetchError> {
        let http_err = |reason: String| FetchError::Http {
            key: key.to_string(),
            reason,
        };

        let resp = self
            .client
            .get(self.url_for(key))
            .send()
            .await
            .map_err(|e| http_err(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                key: key.to_string(),
            });
        }
        if !status.is_success() {
            return Err(http_err(format!("object store answered {}", status)));
        }

        resp.bytes().await.map_err(|e| http_err(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_directory_fetch() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("u1")).unwrap();
        std::fs::write(dir.path().join("u1/main.py"), b"def run(e, c): return {}").unwrap();

        let fetcher = DirectoryFetcher::new(dir.path());
        let bytes = fetcher
            .fetch(&StorageKey::new("u1/main.py").unwrap())
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"def run(e, c): return {}");
    }

    #[tokio::test]
    async fn test_directory_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let fetcher = DirectoryFetcher::new(dir.path());
        let err = fetcher
            .fetch(&StorageKey::new("nope.py").unwrap())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FetchError::NotFound {
                key: "nope.py".to_string()
            }
        );
    }

    #[test]
    fn test_http_url() {
        let fetcher = HttpFetcher::new("http://store.local/bucket/").unwrap();
        assert_eq!(
            fetcher.url_for(&StorageKey::new("u1/calc.py").unwrap()),
            "http://store.local/bucket/u1/calc.py"
        );
    }
}
