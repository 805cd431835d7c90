use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Result, anyhow};
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs;
use tracing::{debug, error, warn};

pub const ATTRIBUTES_FILE_NAME: &str = "image_attributes.json";

/// One persisted clothing item for one user, keyed by content hash.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageRecord {
    pub filename: String,
    pub content_type: String,
    pub file_size_bytes: u64,
    pub file_size_mb: f64,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    pub processed_timestamp: String,
    pub image_hash: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub saved_images: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LedgerMetadata {
    #[serde(default)]
    pub total_images: usize,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub user_id: String,
}

/// The full per-user collection of extracted image records.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UserLedger {
    #[serde(default)]
    pub images: BTreeMap<String, ImageRecord>,
    #[serde(default)]
    pub metadata: LedgerMetadata,
}

impl UserLedger {
    pub fn empty(user_id: &str) -> Self {
        Self {
            images: BTreeMap::new(),
            metadata: LedgerMetadata {
                total_images: 0,
                last_updated: None,
                user_id: user_id.to_string(),
            },
        }
    }

    /// Insert or overwrite a record and recompute the derived metadata.
    pub fn insert(&mut self, image_hash: String, record: ImageRecord) {
        self.images.insert(image_hash, record);
        self.metadata.total_images = self.images.len();
        self.metadata.last_updated = Some(Utc::now().to_rfc3339());
    }

    pub fn get(&self, image_hash: &str) -> Option<&ImageRecord> {
        self.images.get(image_hash)
    }
}

/// Local backend: one JSON file per user under the configured base directory.
#[derive(Clone, Debug)]
pub struct LocalRecordStore {
    base_dir: PathBuf,
    per_user_subdirs: bool,
}

impl LocalRecordStore {
    pub fn new(base_dir: PathBuf, per_user_subdirs: bool) -> Self {
        Self {
            base_dir,
            per_user_subdirs,
        }
    }

    pub fn user_file_path(&self, normalized_id: &str) -> PathBuf {
        if self.per_user_subdirs {
            self.base_dir.join(normalized_id).join(ATTRIBUTES_FILE_NAME)
        } else {
            self.base_dir
                .join(format!("{normalized_id}_{ATTRIBUTES_FILE_NAME}"))
        }
    }

    pub async fn load(&self, normalized_id: &str) -> Result<Option<UserLedger>> {
        let path = self.user_file_path(normalized_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice::<UserLedger>(&bytes) {
            Ok(ledger) => Ok(Some(ledger)),
            Err(err) => {
                // Unparseable data counts as absent; callers reinitialize.
                error!(path = %path.display(), %err, "unparseable ledger file, treating as absent");
                Ok(None)
            }
        }
    }

    pub async fn save(&self, normalized_id: &str, ledger: &UserLedger) -> Result<()> {
        let path = self.user_file_path(normalized_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(ledger)?;
        fs::write(&path, payload).await?;
        Ok(())
    }
}

/// Remote backend: one document per case-folded user id in a single
/// collection of the document service, written with merge semantics. The
/// server stamps an `updated_at` field on every write.
#[derive(Clone, Debug)]
pub struct DocStoreClient {
    client: Client,
    base_url: String,
    collection: String,
    token: Option<String>,
}

impl DocStoreClient {
    pub fn new(client: Client, base_url: String, collection: String, token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            collection,
            token,
        }
    }

    fn doc_id(user_id: &str) -> String {
        user_id.trim().to_lowercase()
    }

    fn doc_url(&self, user_id: &str) -> String {
        format!(
            "{}/v1/collections/{}/docs/{}",
            self.base_url,
            self.collection,
            Self::doc_id(user_id)
        )
    }

    fn with_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    pub async fn healthcheck(&self) -> Result<()> {
        let response = self
            .with_auth(self.client.get(format!("{}/v1/healthz", self.base_url)))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "document store health check failed: {}",
                response.status()
            ));
        }
        Ok(())
    }

    pub async fn load(&self, user_id: &str) -> Result<Option<UserLedger>> {
        let response = self
            .with_auth(self.client.get(self.doc_url(user_id)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(anyhow!(
                "document store read failed: {}",
                response.status()
            ));
        }
        let ledger = response.json::<UserLedger>().await?;
        Ok(Some(ledger))
    }

    pub async fn save(&self, user_id: &str, ledger: &UserLedger) -> Result<()> {
        let url = format!("{}?merge=true", self.doc_url(user_id));
        let response = self
            .with_auth(self.client.patch(url))
            .json(ledger)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "document store write failed: {}",
                response.status()
            ));
        }
        Ok(())
    }
}

/// Backend-agnostic record persistence. The variant is chosen once at
/// startup; callers never branch on it.
#[derive(Clone, Debug)]
pub enum RecordStore {
    Local(LocalRecordStore),
    Remote(DocStoreClient),
}

impl RecordStore {
    pub fn backend_name(&self) -> &'static str {
        match self {
            RecordStore::Local(_) => "local",
            RecordStore::Remote(_) => "remote",
        }
    }

    /// Load a user's ledger; absent or unreadable data comes back as `None`.
    pub async fn load(&self, normalized_id: &str) -> Option<UserLedger> {
        let result = match self {
            RecordStore::Local(store) => store.load(normalized_id).await,
            RecordStore::Remote(store) => store.load(normalized_id).await,
        };
        match result {
            Ok(ledger) => ledger,
            Err(err) => {
                error!(user = normalized_id, %err, "failed to load user ledger");
                None
            }
        }
    }

    pub async fn save(&self, normalized_id: &str, ledger: &UserLedger) -> bool {
        let result = match self {
            RecordStore::Local(store) => store.save(normalized_id, ledger).await,
            RecordStore::Remote(store) => store.save(normalized_id, ledger).await,
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                error!(user = normalized_id, %err, "failed to save user ledger");
                false
            }
        }
    }

    /// Read-modify-write: load (or initialize) the ledger, insert the record
    /// under its hash, recompute metadata, save.
    pub async fn upsert_image(
        &self,
        normalized_id: &str,
        image_hash: &str,
        record: ImageRecord,
    ) -> bool {
        let mut ledger = match self.load(normalized_id).await {
            Some(ledger) => ledger,
            None => {
                debug!(user = normalized_id, "no existing ledger, initializing");
                UserLedger::empty(normalized_id)
            }
        };
        ledger.insert(image_hash.to_string(), record);
        let saved = self.save(normalized_id, &ledger).await;
        if !saved {
            warn!(user = normalized_id, hash = image_hash, "ledger upsert failed");
        }
        saved
    }
}
