//! Filesystem blob store.
//!
//! Blobs live under `<dir>/<first two chars>/<multihash>`, where the multihash
//! is the hex SHA-1 of the content. Missing blobs are pulled from peer
//! gateways through `GET /blobs/:multihash` and verified before they land.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use sha1::{Digest, Sha1};

use super::BlobStore;
use crate::error::{Error, Result};

const BLOB_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

pub struct FsBlobStore {
    dir: PathBuf,
    http: reqwest::Client,
}

/// Hex SHA-1 multihash of some content
pub fn content_multihash(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn validate_multihash(multihash: &str) -> Result<()> {
    let valid = (2..=128).contains(&multihash.len()) && multihash.chars().all(|c| c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid multihash: {}", multihash)))
    }
}

impl FsBlobStore {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let http = reqwest::Client::builder().timeout(BLOB_FETCH_TIMEOUT).build()?;
        Ok(Self {
            dir: dir.to_path_buf(),
            http,
        })
    }

    fn path_for(&self, multihash: &str) -> Result<PathBuf> {
        validate_multihash(multihash)?;
        Ok(self.dir.join(&multihash[..2]).join(multihash))
    }

    async fn write(&self, multihash: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(multihash)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn fetch_from(&self, gateway: &str, multihash: &str) -> Result<Vec<u8>> {
        let url = format!("{}/blobs/{}", gateway.trim_end_matches('/'), multihash);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(super::peer_error(gateway, response).await);
        }
        let bytes = response.bytes().await?.to_vec();
        let actual = content_multihash(&bytes);
        if actual != multihash {
            return Err(Error::InvalidInput(format!(
                "blob from {} hashed to {} instead of {}",
                gateway, actual, multihash
            )));
        }
        Ok(bytes)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn fetch_and_save(&self, multihash: &str, gateways: &[String]) -> Result<()> {
        if self.contains(multihash).await? {
            return Ok(());
        }

        let mut last_error = None;
        for gateway in gateways {
            match self.fetch_from(gateway, multihash).await {
                Ok(bytes) => {
                    self.write(multihash, &bytes).await?;
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!("Blob {} not fetched from {}: {}", multihash, gateway, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::NotFound(format!("blob {} (no gateways)", multihash))))
    }

    async fn contains(&self, multihash: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(multihash)?).await?)
    }

    async fn read(&self, multihash: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(multihash)?).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, bytes: &[u8]) -> Result<String> {
        let multihash = content_multihash(bytes);
        self.write(&multihash, bytes).await?;
        Ok(multihash)
    }

    async fn delete(&self, multihashes: &[String]) -> Result<()> {
        for multihash in multihashes {
            match tokio::fs::remove_file(self.path_for(multihash)?).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
