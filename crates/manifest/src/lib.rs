//! Rollway manifest sources – where raw manifests come from and how a
//! multi-document stream is cut into single documents.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("parsing manifest stream: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Split a multi-document YAML stream into single-document YAML blocks, in order.
///
/// Empty documents (a leading `---`, blank sections) are dropped. Each block is
/// re-emitted from the parsed value, so comments and anchors do not survive.
pub fn split_documents(raw: &[u8]) -> Result<Vec<Vec<u8>>, ManifestError> {
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_slice(raw) {
        let value = serde_yaml::Value::deserialize(doc)?;
        if value.is_null() {
            continue;
        }
        out.push(serde_yaml::to_string(&value)?.into_bytes());
    }
    debug!(documents = out.len(), "split manifest stream");
    Ok(out)
}

/// GET `url` and return the body as text.
pub async fn download_string(url: &str) -> Result<String, ManifestError> {
    let fetch = |source| ManifestError::Fetch { url: url.to_string(), source };
    let resp = reqwest::get(url).await.map_err(fetch)?;
    let resp = resp.error_for_status().map_err(fetch)?;
    resp.text().await.map_err(fetch)
}

/// Where a manifest argument points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    Url(String),
    File(PathBuf),
    Stdin,
}

impl ManifestSource {
    pub fn parse(arg: &str) -> Self {
        if arg == "-" {
            ManifestSource::Stdin
        } else if arg.starts_with("http://") || arg.starts_with("https://") {
            ManifestSource::Url(arg.to_string())
        } else {
            ManifestSource::File(PathBuf::from(arg))
        }
    }

    pub async fn load(&self) -> Result<Vec<u8>, ManifestError> {
        match self {
            ManifestSource::Url(url) => Ok(download_string(url).await?.into_bytes()),
            ManifestSource::File(path) => tokio::fs::read(path)
                .await
                .map_err(|source| ManifestError::Read { path: path.display().to_string(), source }),
            ManifestSource::Stdin => {
                let mut buf = Vec::new();
                tokio::io::stdin()
                    .read_to_end(&mut buf)
                    .await
                    .map_err(|source| ManifestError::Read { path: "<stdin>".into(), source })?;
                Ok(buf)
            }
        }
    }
}

impl std::fmt::Display for ManifestSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManifestSource::Url(u) => f.write_str(u),
            ManifestSource::File(p) => write!(f, "{}", p.display()),
            ManifestSource::Stdin => f.write_str("<stdin>"),
        }
    }
}
