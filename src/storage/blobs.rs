use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::fs;
use tracing::{error, warn};

/// Fixed scheme prefix carried by remote location refs. Callers distinguish
/// the two ref kinds by this prefix alone, never by consulting configuration.
pub const REMOTE_REF_SCHEME: &str = "s3://";

pub fn is_remote_ref(location: &str) -> bool {
    location.starts_with(REMOTE_REF_SCHEME)
}

/// Public mount point the router serves local images under.
pub const LOCAL_IMAGES_MOUNT: &str = "/images";

fn local_path_url(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{LOCAL_IMAGES_MOUNT}/{path}")
    }
}

/// Local backend: processed JPEGs under the user-data tree, served by the
/// router's static mount.
#[derive(Clone, Debug)]
pub struct LocalBlobStore {
    root: PathBuf,
    images_subdir: String,
    per_user_subdirs: bool,
}

impl LocalBlobStore {
    pub fn new(root: PathBuf, images_subdir: String, per_user_subdirs: bool) -> Self {
        Self {
            root,
            images_subdir,
            per_user_subdirs,
        }
    }

    fn processed_dir(&self, owner: &str) -> PathBuf {
        if self.per_user_subdirs {
            self.root.join(owner).join(&self.images_subdir).join("processed")
        } else {
            self.root.join(&self.images_subdir).join("processed")
        }
    }

    pub async fn store(&self, bytes: &[u8], file_stem: &str, owner: &str) -> Result<String> {
        let dir = self.processed_dir(owner);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{file_stem}_processed.jpg"));
        fs::write(&path, bytes).await?;
        Ok(path.display().to_string())
    }

    pub async fn retrieve(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn delete(&self, path: &str) -> Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn list(&self, owner: &str) -> Result<Vec<String>> {
        let dir = self.processed_dir(owner);
        let mut entries = Vec::new();
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("jpg") {
                entries.push(path.display().to_string());
            }
        }
        entries.sort();
        Ok(entries)
    }

    /// Path under the static `/images` mount for a stored blob.
    pub fn download_url(&self, path: &str) -> String {
        match Path::new(path).strip_prefix(&self.root) {
            Ok(relative) => format!(
                "{LOCAL_IMAGES_MOUNT}/{}",
                relative.to_string_lossy().replace('\\', "/")
            ),
            Err(_) => local_path_url(path),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListObjectsResponse {
    keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    signed_url: String,
}

/// Remote backend: object-storage gateway speaking a small REST API over
/// reqwest, including server-side signed-URL minting.
#[derive(Clone, Debug)]
pub struct BlobGatewayClient {
    client: Client,
    base_url: String,
    bucket: String,
    token: Option<String>,
    signed_url_expiry_secs: u64,
    per_user_subdirs: bool,
}

impl BlobGatewayClient {
    pub fn new(
        client: Client,
        base_url: String,
        bucket: String,
        token: Option<String>,
        signed_url_expiry_secs: u64,
        per_user_subdirs: bool,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bucket,
            token,
            signed_url_expiry_secs,
            per_user_subdirs,
        }
    }

    fn with_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn object_key(&self, file_stem: &str, owner: &str) -> String {
        if self.per_user_subdirs {
            format!("{owner}/processed/{file_stem}_processed.jpg")
        } else {
            format!("processed/{file_stem}_processed.jpg")
        }
    }

    fn ref_for_key(&self, key: &str) -> String {
        format!("{REMOTE_REF_SCHEME}{}/{key}", self.bucket)
    }

    /// Backend-relative key carried inside a remote ref.
    pub fn key_from_ref(location: &str) -> Option<&str> {
        location
            .strip_prefix(REMOTE_REF_SCHEME)
            .and_then(|rest| rest.split_once('/'))
            .map(|(_bucket, key)| key)
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/v1/object/{}/{key}", self.base_url, self.bucket)
    }

    pub async fn healthcheck(&self) -> Result<()> {
        let response = self
            .with_auth(self.client.get(format!("{}/v1/healthz", self.base_url)))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "blob gateway health check failed: {}",
                response.status()
            ));
        }
        Ok(())
    }

    pub async fn store(&self, bytes: &[u8], file_stem: &str, owner: &str) -> Result<String> {
        let key = self.object_key(file_stem, owner);
        let response = self
            .with_auth(self.client.post(self.object_url(&key)))
            .header("content-type", "image/jpeg")
            .body(bytes.to_vec())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!("blob upload failed: {}", response.status()));
        }
        Ok(self.ref_for_key(&key))
    }

    pub async fn retrieve(&self, location: &str) -> Result<Option<Vec<u8>>> {
        let key = Self::key_from_ref(location)
            .ok_or_else(|| anyhow!("not a remote blob ref: {location}"))?;
        let response = self
            .with_auth(self.client.get(self.object_url(key)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(anyhow!("blob download failed: {}", response.status()));
        }
        Ok(Some(response.bytes().await?.to_vec()))
    }

    pub async fn delete(&self, location: &str) -> Result<bool> {
        let key = Self::key_from_ref(location)
            .ok_or_else(|| anyhow!("not a remote blob ref: {location}"))?;
        let response = self
            .with_auth(self.client.delete(self.object_url(key)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(anyhow!("blob delete failed: {}", response.status()));
        }
        Ok(true)
    }

    pub async fn list(&self, owner: &str) -> Result<Vec<String>> {
        let prefix = if self.per_user_subdirs {
            format!("{owner}/processed/")
        } else {
            "processed/".to_string()
        };
        let response = self
            .with_auth(
                self.client
                    .get(format!("{}/v1/list/{}", self.base_url, self.bucket))
                    .query(&[("prefix", prefix.as_str())]),
            )
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!("blob list failed: {}", response.status()));
        }
        let payload: ListObjectsResponse = response.json().await?;
        Ok(payload
            .keys
            .into_iter()
            .map(|key| self.ref_for_key(&key))
            .collect())
    }

    /// Time-limited signed URL minted by the gateway.
    pub async fn signed_url(&self, location: &str) -> Result<String> {
        let key = Self::key_from_ref(location)
            .ok_or_else(|| anyhow!("not a remote blob ref: {location}"))?;
        let response = self
            .with_auth(
                self.client
                    .post(format!("{}/v1/sign/{}/{key}", self.base_url, self.bucket)),
            )
            .json(&json!({ "expires_in_secs": self.signed_url_expiry_secs }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!("signed url request failed: {}", response.status()));
        }
        let payload: SignResponse = response.json().await?;
        Ok(payload.signed_url)
    }
}

/// Backend-agnostic image-bytes persistence; failures are logged and
/// surfaced as absent/false, never as panics.
#[derive(Clone, Debug)]
pub enum BlobStore {
    Local(LocalBlobStore),
    Remote(BlobGatewayClient),
}

impl BlobStore {
    pub fn backend_name(&self) -> &'static str {
        match self {
            BlobStore::Local(_) => "local",
            BlobStore::Remote(_) => "remote",
        }
    }

    pub async fn store(&self, bytes: &[u8], file_stem: &str, owner: &str) -> Option<String> {
        let result = match self {
            BlobStore::Local(store) => store.store(bytes, file_stem, owner).await,
            BlobStore::Remote(store) => store.store(bytes, file_stem, owner).await,
        };
        match result {
            Ok(location) => Some(location),
            Err(err) => {
                error!(owner, %err, "failed to store processed image");
                None
            }
        }
    }

    pub async fn retrieve(&self, location: &str) -> Option<Vec<u8>> {
        let result = if is_remote_ref(location) {
            match self {
                BlobStore::Remote(store) => store.retrieve(location).await,
                BlobStore::Local(_) => {
                    warn!(location, "remote blob ref but local backend active");
                    return None;
                }
            }
        } else {
            match self {
                BlobStore::Local(store) => store.retrieve(location).await,
                // A local path written before a backend switch still reads
                // from disk.
                BlobStore::Remote(_) => match fs::read(location).await {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(err) => Err(err.into()),
                },
            }
        };
        match result {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(location, %err, "failed to retrieve blob");
                None
            }
        }
    }

    pub async fn delete(&self, location: &str) -> bool {
        let result = if is_remote_ref(location) {
            match self {
                BlobStore::Remote(store) => store.delete(location).await,
                BlobStore::Local(_) => {
                    warn!(location, "remote blob ref but local backend active");
                    return false;
                }
            }
        } else {
            match self {
                BlobStore::Local(store) => store.delete(location).await,
                BlobStore::Remote(_) => match fs::remove_file(location).await {
                    Ok(()) => Ok(true),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
                    Err(err) => Err(err.into()),
                },
            }
        };
        match result {
            Ok(deleted) => deleted,
            Err(err) => {
                error!(location, %err, "failed to delete blob");
                false
            }
        }
    }

    pub async fn list(&self, owner: &str) -> Vec<String> {
        let result = match self {
            BlobStore::Local(store) => store.list(owner).await,
            BlobStore::Remote(store) => store.list(owner).await,
        };
        match result {
            Ok(locations) => locations,
            Err(err) => {
                error!(owner, %err, "failed to list blobs");
                Vec::new()
            }
        }
    }

    /// Resolve a location ref to something a client can download: a signed
    /// URL for remote refs, a static-mount path for local ones.
    pub async fn download_url(&self, location: &str) -> Option<String> {
        if location.is_empty() {
            return None;
        }
        if is_remote_ref(location) {
            match self {
                BlobStore::Remote(store) => match store.signed_url(location).await {
                    Ok(url) => Some(url),
                    Err(err) => {
                        error!(location, %err, "failed to mint signed url");
                        None
                    }
                },
                BlobStore::Local(_) => {
                    warn!(location, "cannot sign remote ref with local backend");
                    None
                }
            }
        } else {
            match self {
                BlobStore::Local(store) => Some(store.download_url(location)),
                BlobStore::Remote(_) => Some(local_path_url(location)),
            }
        }
    }
}
