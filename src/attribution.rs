use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::{ApiError, ApiResult};
use crate::hashing::content_hash;
use crate::imaging::{self, TransformOptions};
use crate::providers::{CompletionModel, parse_json_with_salvage};
use crate::retry::{
    RATE_LIMIT_SUGGESTION, RetryError, RetryPolicy, is_rate_limit_error, rate_limit_message,
};
use crate::storage::records::ImageRecord;
use crate::storage::{BlobStore, RecordStore, UserLedger, UserLocks, normalize_user_id};

const ATTRIBUTION_PROMPT: &str = r#"You are a fashion expert AI assistant. Analyze the clothing item in this image and provide its key attributes.
Your response MUST be a single, minified JSON object with no other text before or after it.

The JSON object should have the following keys:
- "identifier": Is it a top, bottom, dress, outerwear, shoes or accessory?
- "category": Identify the type of clothing. Examples: "T-Shirt", "Jeans", "Sweater", "Dress", "Jacket".
- "gender": Is it for men, women, or unisex?
- "primary_color": The dominant color. Be specific and accurate - use precise color names like "Navy", "Burgundy", "Forest Green", "Charcoal", "Cream", "Olive", "Maroon", "Teal", "Coral", "Beige" instead of generic terms like "Blue", "Red", "Green", "Gray", "White", "Yellow", "Pink", "Brown".
- "style": A descriptive style. Examples: "Casual", "Formal", "Sporty", "Minimalist", "Business Casual".
- "occasion": The suitable occasion. Examples: "Everyday", "Work", "Party", "Outdoor", "Formal Event".
- "weather": The appropriate weather. Examples: "Warm", "Cold", "Rainy", "Mild".
- "fit": The fit type. Examples: "Slim Fit", "Regular Fit", "Loose Fit", "Oversized".
- "sleeve_length": Sleeve length if applicable. Examples: "Short Sleeve", "Long Sleeve", "Sleeveless", "3/4 Sleeve".
- "description": A brief, one-sentence description of the item.

Analyze the provided image and generate the JSON now. Rules to read from the image:
- Focus on the main clothing item in the image.
- If multiple items are present, describe the most prominent one.
- If the item is not clearly visible, make your best guess based on visible features.
- Pay special attention to color accuracy - distinguish between similar shades (e.g., Navy vs Royal Blue, Charcoal vs Black, Cream vs White)."#;

pub const STATUS_EXTRACTED: &str = "attributes_extracted";
pub const STATUS_DUPLICATE: &str = "duplicate_found";
pub const STATUS_FAILED: &str = "attributes_failed";
pub const STATUS_ERROR: &str = "error";

/// One uploaded file, already pulled out of the multipart body.
#[derive(Clone, Debug)]
pub struct UploadedImage {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ImageInfo {
    pub filename: String,
    pub content_type: String,
    pub file_size_bytes: u64,
    pub file_size_mb: f64,
}

impl ImageInfo {
    fn from_upload(file: &UploadedImage) -> Self {
        let size = file.bytes.len() as u64;
        Self {
            filename: file.filename.clone(),
            content_type: file.content_type.clone(),
            file_size_bytes: size,
            file_size_mb: round2(size as f64 / (1024.0 * 1024.0)),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ImageAnalysisResult {
    pub image_info: ImageInfo,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl ImageAnalysisResult {
    fn failure(image_info: ImageInfo, status: &str, error: String) -> Self {
        Self {
            image_info,
            status: status.to_string(),
            attributes: None,
            error: Some(error),
            image_url: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct AttributeAnalysisResponse {
    pub success: bool,
    pub message: String,
    pub processing_timestamp: String,
    pub total_images: usize,
    pub successful_analyses: usize,
    pub failed_analyses: usize,
    pub results: Vec<ImageAnalysisResult>,
}

/// Per-image attribution: validate, hash, dedup-check, transform, extract,
/// persist, respond; batches aggregate without letting one image's failure
/// unwind the loop.
pub struct AttributionPipeline {
    settings: Arc<Settings>,
    records: Arc<RecordStore>,
    blobs: Arc<BlobStore>,
    vision: Arc<dyn CompletionModel>,
    retry: RetryPolicy,
    user_locks: UserLocks,
}

impl AttributionPipeline {
    pub fn new(
        settings: Arc<Settings>,
        records: Arc<RecordStore>,
        blobs: Arc<BlobStore>,
        vision: Arc<dyn CompletionModel>,
        user_locks: UserLocks,
    ) -> Self {
        let retry = RetryPolicy::new(settings.retry.clone());
        Self {
            settings,
            records,
            blobs,
            vision,
            retry,
            user_locks,
        }
    }

    pub async fn process_batch(
        &self,
        files: Vec<UploadedImage>,
        user_id: &str,
    ) -> ApiResult<AttributeAnalysisResponse> {
        if files.is_empty() {
            return Err(ApiError::BadRequest("No files provided".to_string()));
        }
        let normalized =
            normalize_user_id(user_id, Some(self.settings.user_data_dir.as_path()))?;
        if files.len() > self.settings.max_files_per_batch {
            return Err(ApiError::BadRequest(format!(
                "Too many files. Maximum allowed: {}",
                self.settings.max_files_per_batch
            )));
        }

        info!(
            user = user_id,
            files = files.len(),
            storage = self.blobs.backend_name(),
            "starting batch attribute analysis"
        );

        let total_images = files.len();
        let mut results = Vec::with_capacity(total_images);
        let mut successful = 0usize;
        let mut failed = 0usize;

        for (index, file) in files.into_iter().enumerate() {
            debug!(user = user_id, index = index + 1, total_images, filename = %file.filename, "processing image");
            let result = self.process_single(file, user_id, &normalized).await;
            if result.succeeded() {
                successful += 1;
            } else {
                failed += 1;
                warn!(
                    user = user_id,
                    filename = %result.image_info.filename,
                    error = result.error.as_deref().unwrap_or(""),
                    "image analysis failed"
                );
            }
            results.push(result);
        }

        let message = if successful == total_images {
            format!("All {total_images} images processed successfully for user {user_id}")
        } else if successful > 0 {
            format!("{successful} of {total_images} images processed successfully for user {user_id}")
        } else {
            format!("Failed to process all {total_images} images for user {user_id}")
        };
        info!(
            user = user_id,
            successful, failed, total_images, "batch analysis complete"
        );

        Ok(AttributeAnalysisResponse {
            success: successful > 0,
            message,
            processing_timestamp: Utc::now().to_rfc3339(),
            total_images,
            successful_analyses: successful,
            failed_analyses: failed,
            results,
        })
    }

    async fn process_single(
        &self,
        file: UploadedImage,
        user_id: &str,
        normalized: &str,
    ) -> ImageAnalysisResult {
        let image_info = ImageInfo::from_upload(&file);

        if let Err(message) = self.validate_upload(&file) {
            return ImageAnalysisResult::failure(image_info, STATUS_ERROR, message);
        }

        let image_hash = content_hash(&file.bytes);

        // Serialize the dedup-check-to-persist section per user so concurrent
        // uploads cannot lose ledger writes.
        let lock = self.user_locks.for_user(normalized);
        let _guard = lock.lock().await;

        if self.settings.avoid_duplicates {
            if let Some(ledger) = self.records.load(normalized).await {
                if let Some(existing) = ledger.get(&image_hash) {
                    info!(user = user_id, hash = %&image_hash[..8], "duplicate image detected");
                    return self.duplicate_result(image_info, existing, user_id).await;
                }
            }
        }

        let transform = TransformOptions {
            target_width: self.settings.target_width,
            target_height: self.settings.target_height,
            jpeg_quality: self.settings.jpeg_quality,
            maintain_aspect_ratio: self.settings.maintain_aspect_ratio,
        };
        let (jpeg, processing_info) = match imaging::compress_and_resize(&file.bytes, &transform) {
            Ok(output) => output,
            Err(err) => {
                return ImageAnalysisResult::failure(
                    image_info,
                    STATUS_ERROR,
                    format!("Failed to process image: {err}"),
                );
            }
        };

        let mut attributes =
            self.extract_attributes(&jpeg, &file.filename, processing_info.processed_size).await;
        let attribute_map = match attributes.as_object_mut() {
            Some(map) if !map.contains_key("error") => map,
            Some(map) => {
                let message = map
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("Attribute extraction failed")
                    .to_string();
                return ImageAnalysisResult::failure(image_info, STATUS_FAILED, message);
            }
            None => {
                return ImageAnalysisResult::failure(
                    image_info,
                    STATUS_FAILED,
                    "Invalid model response format: expected a JSON object".to_string(),
                );
            }
        };

        let mut saved_images = BTreeMap::new();
        if self.settings.save_processed_images {
            let stem = unique_file_stem(&file.filename, &image_hash);
            match self.blobs.store(&jpeg, &stem, normalized).await {
                Some(location) => {
                    info!(user = user_id, location = %location, "processed image saved");
                    saved_images.insert("processed".to_string(), location);
                }
                None => warn!(user = user_id, filename = %file.filename, "failed to save processed image"),
            }
        }

        if !saved_images.is_empty() {
            attribute_map.insert("saved_images".to_string(), json!(saved_images.clone()));
        }
        attribute_map.insert("processing_info".to_string(), json!(processing_info));
        attribute_map.insert("image_hash".to_string(), json!(image_hash));
        attribute_map.insert("user_id".to_string(), json!(user_id));

        let record = ImageRecord {
            filename: file.filename.clone(),
            content_type: file.content_type.clone(),
            file_size_bytes: image_info.file_size_bytes,
            file_size_mb: image_info.file_size_mb,
            attributes: attribute_map.clone(),
            processed_timestamp: Utc::now().to_rfc3339(),
            image_hash: image_hash.clone(),
            user_id: user_id.to_string(),
            saved_images: saved_images.clone(),
        };
        let persisted = self.records.upsert_image(normalized, &image_hash, record).await;
        if !persisted {
            // Blob and record are not atomic; flag the stray blob distinctly.
            if let Some(location) = saved_images.get("processed") {
                error!(
                    user = user_id,
                    location = %location,
                    "image stored but ledger write failed, blob has no record"
                );
            }
            attribute_map.insert(
                "persistence_error".to_string(),
                json!("attributes could not be saved, they will be re-extracted next time"),
            );
        }

        let image_url = match saved_images.get("processed") {
            Some(location) => self.blobs.download_url(location).await,
            None => None,
        };

        info!(user = user_id, filename = %file.filename, hash = %&image_hash[..8], "image analysis completed");
        ImageAnalysisResult {
            image_info,
            status: STATUS_EXTRACTED.to_string(),
            attributes: Some(Value::Object(attribute_map.clone())),
            error: None,
            image_url,
        }
    }

    fn validate_upload(&self, file: &UploadedImage) -> Result<(), String> {
        if file.filename.trim().is_empty() {
            return Err("Invalid file: filename is missing".to_string());
        }
        let extension = Path::new(&file.filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{}", ext.to_lowercase()))
            .unwrap_or_default();
        if !self.settings.allowed_extensions.contains(&extension) {
            let allowed: Vec<&str> = self
                .settings
                .allowed_extensions
                .iter()
                .map(String::as_str)
                .collect();
            return Err(format!(
                "Invalid file type. Allowed extensions: {}",
                allowed.join(", ")
            ));
        }
        if !file.content_type.starts_with("image/") {
            return Err(format!(
                "Invalid content type: {} (expected image/*)",
                file.content_type
            ));
        }
        if file.bytes.len() > self.settings.max_file_size {
            return Err(format!(
                "File too large. Maximum size: {}MB",
                self.settings.max_file_size_mb()
            ));
        }
        Ok(())
    }

    async fn duplicate_result(
        &self,
        image_info: ImageInfo,
        existing: &ImageRecord,
        user_id: &str,
    ) -> ImageAnalysisResult {
        let mut attributes = existing.attributes.clone();
        attributes.insert(
            "duplicate_info".to_string(),
            json!({
                "original_filename": existing.filename,
                "original_processed_timestamp": existing.processed_timestamp,
                "is_duplicate": true,
                "user_id": user_id,
            }),
        );

        let image_url = match existing.saved_images.get("processed") {
            Some(location) => self.blobs.download_url(location).await,
            None => None,
        };

        ImageAnalysisResult {
            image_info,
            status: STATUS_DUPLICATE.to_string(),
            attributes: Some(Value::Object(attributes)),
            error: None,
            image_url,
        }
    }

    /// Call the vision model through the retry policy and shape every
    /// failure as an object carrying an `error` key.
    async fn extract_attributes(
        &self,
        jpeg: &[u8],
        filename: &str,
        processed_size: (u32, u32),
    ) -> Value {
        let outcome = self
            .retry
            .execute(
                || self.vision.generate(ATTRIBUTION_PROMPT, Some(jpeg)),
                is_rate_limit_error,
                "attribute extraction",
            )
            .await;

        let text = match outcome {
            Ok(text) => text,
            Err(RetryError::RateLimited { attempts, .. }) => {
                return json!({
                    "error": rate_limit_message(attempts),
                    "suggestion": RATE_LIMIT_SUGGESTION,
                });
            }
            Err(RetryError::NonRetryable { last_error, .. }) => {
                return json!({
                    "error": format!("Failed to extract attributes: {last_error}"),
                });
            }
        };

        let mut parsed = parse_json_with_salvage(&text);
        if let Some(map) = parsed.as_object_mut() {
            if !map.contains_key("error") {
                map.insert("image".to_string(), json!(filename));
                map.insert(
                    "processing_metadata".to_string(),
                    json!({
                        "processed_image_dimensions": format!(
                            "{}x{}",
                            processed_size.0, processed_size.1
                        ),
                        "extraction_method": "vision_model",
                        "model": self.vision.model_name(),
                    }),
                );
            }
        }
        parsed
    }

    /// Read-only view of a user's ledger.
    pub async fn load_ledger(&self, normalized: &str) -> Option<UserLedger> {
        self.records.load(normalized).await
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Timestamped blob stem so repeated uploads of the same original filename
/// never collide: `{yyyymmdd_hhmmss}_{stem}_{hash8}`.
fn unique_file_stem(filename: &str, image_hash: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("image");
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let short_hash = &image_hash[..8.min(image_hash.len())];
    format!("{timestamp}_{stem}_{short_hash}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use crate::storage::blobs::LocalBlobStore;
    use crate::storage::records::LocalRecordStore;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct StubModel {
        response: Box<dyn Fn() -> anyhow::Result<String> + Send + Sync>,
        calls: AtomicU32,
    }

    impl StubModel {
        fn returning(text: &'static str) -> Self {
            Self {
                response: Box::new(move || Ok(text.to_string())),
                calls: AtomicU32::new(0),
            }
        }

        fn failing(message: &'static str) -> Self {
            Self {
                response: Box::new(move || Err(anyhow!(message))),
                calls: AtomicU32::new(0),
            }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionModel for StubModel {
        async fn generate(&self, _prompt: &str, _image: Option<&[u8]>) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.response)()
        }

        fn model_name(&self) -> &str {
            "stub-model"
        }
    }

    fn test_settings(dir: &Path) -> Settings {
        Settings {
            host: "127.0.0.1".to_string(),
            port: 0,
            allowed_extensions: BTreeSet::from([
                ".jpg".to_string(),
                ".jpeg".to_string(),
                ".png".to_string(),
            ]),
            max_file_size: 1024 * 1024,
            max_files_per_batch: 10,
            target_width: 64,
            target_height: 64,
            jpeg_quality: 85,
            maintain_aspect_ratio: true,
            user_data_dir: dir.to_path_buf(),
            images_directory: "saved_images".to_string(),
            create_user_subdirs: true,
            save_processed_images: true,
            avoid_duplicates: true,
            use_remote_records: false,
            doc_store_url: None,
            doc_store_collection: "users".to_string(),
            doc_store_token: None,
            use_remote_blobs: false,
            blob_gateway_url: None,
            blob_bucket: None,
            blob_gateway_token: None,
            signed_url_expiry_secs: 3600,
            gemini_api_key: String::new(),
            openai_api_key: String::new(),
            default_styler: "gemini".to_string(),
            request_timeout_secs: 5,
            retry: RetryConfig {
                max_attempts: 2,
                initial_delay: Duration::ZERO,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                backoff_multiplier: 2.0,
                jitter: false,
            },
        }
    }

    fn pipeline_with(dir: &Path, model: Arc<StubModel>) -> AttributionPipeline {
        let settings = Arc::new(test_settings(dir));
        let records = Arc::new(RecordStore::Local(LocalRecordStore::new(
            settings.user_data_dir.clone(),
            settings.create_user_subdirs,
        )));
        let blobs = Arc::new(BlobStore::Local(LocalBlobStore::new(
            settings.user_data_dir.clone(),
            settings.images_directory.clone(),
            settings.create_user_subdirs,
        )));
        AttributionPipeline::new(settings, records, blobs, model, UserLocks::new())
    }

    fn png_upload(filename: &str, shade: u8) -> UploadedImage {
        let mut pixels = image::RgbaImage::new(32, 32);
        for pixel in pixels.pixels_mut() {
            *pixel = image::Rgba([shade, 80, 120, 255]);
        }
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgba8(pixels)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        UploadedImage {
            filename: filename.to_string(),
            content_type: "image/png".to_string(),
            bytes,
        }
    }

    const VALID_ATTRIBUTES: &str =
        r#"{"identifier":"top","category":"T-Shirt","primary_color":"Navy","style":"Casual"}"#;

    #[tokio::test]
    async fn batch_aggregates_mixed_results_as_overall_success() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(StubModel::returning(VALID_ATTRIBUTES));
        let pipeline = pipeline_with(dir.path(), model);

        let files = vec![
            png_upload("shirt.png", 10),
            png_upload("jeans.png", 200),
            UploadedImage {
                filename: "notes.txt".to_string(),
                content_type: "text/plain".to_string(),
                bytes: b"not an image".to_vec(),
            },
        ];
        let response = pipeline.process_batch(files, "alice").await.unwrap();

        assert_eq!(response.total_images, 3);
        assert_eq!(response.successful_analyses, 2);
        assert_eq!(response.failed_analyses, 1);
        assert!(response.success);
    }

    #[tokio::test]
    async fn all_failed_batch_is_overall_failure() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(StubModel::failing("invalid response payload"));
        let pipeline = pipeline_with(dir.path(), model);

        let files = vec![png_upload("a.png", 1), png_upload("b.png", 2), png_upload("c.png", 3)];
        let response = pipeline.process_batch(files, "alice").await.unwrap();

        assert_eq!(response.successful_analyses, 0);
        assert_eq!(response.failed_analyses, 3);
        assert!(!response.success);
    }

    #[tokio::test]
    async fn duplicate_upload_short_circuits_without_a_second_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(StubModel::returning(VALID_ATTRIBUTES));
        let pipeline = pipeline_with(dir.path(), model.clone());

        let first = pipeline
            .process_batch(vec![png_upload("shirt.png", 42)], "alice")
            .await
            .unwrap();
        assert_eq!(first.results[0].status, STATUS_EXTRACTED);
        assert_eq!(model.call_count(), 1);

        let second = pipeline
            .process_batch(vec![png_upload("shirt.png", 42)], "alice")
            .await
            .unwrap();
        let result = &second.results[0];
        assert_eq!(result.status, STATUS_DUPLICATE);
        assert!(result.succeeded());
        let attributes = result.attributes.as_ref().unwrap();
        assert_eq!(attributes["duplicate_info"]["is_duplicate"], true);
        assert_eq!(attributes["category"], "T-Shirt");
        assert!(result.image_url.is_some());
        // No second model call, and still exactly one stored record.
        assert_eq!(model.call_count(), 1);
        let ledger = pipeline.load_ledger("alice").await.unwrap();
        assert_eq!(ledger.metadata.total_images, 1);
    }

    #[tokio::test]
    async fn extraction_failure_persists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(StubModel::returning("no json in this reply"));
        let pipeline = pipeline_with(dir.path(), model);

        let response = pipeline
            .process_batch(vec![png_upload("shirt.png", 9)], "alice")
            .await
            .unwrap();
        let result = &response.results[0];
        assert_eq!(result.status, STATUS_FAILED);
        assert!(!result.succeeded());
        assert!(pipeline.load_ledger("alice").await.is_none());
    }

    #[tokio::test]
    async fn rate_limited_extraction_carries_the_apology_message() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(StubModel::failing("429 too many requests"));
        let pipeline = pipeline_with(dir.path(), model.clone());

        let response = pipeline
            .process_batch(vec![png_upload("shirt.png", 9)], "alice")
            .await
            .unwrap();
        let result = &response.results[0];
        assert_eq!(result.status, STATUS_FAILED);
        assert!(result.error.as_deref().unwrap().contains("Rate limit exceeded after 2 attempts"));
        // Retryable budget fully consumed.
        assert_eq!(model.call_count(), 2);
        assert!(pipeline.load_ledger("alice").await.is_none());
    }

    #[tokio::test]
    async fn oversized_file_fails_per_item() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(StubModel::returning(VALID_ATTRIBUTES));
        let pipeline = pipeline_with(dir.path(), model.clone());

        let mut upload = png_upload("big.png", 1);
        upload.bytes = vec![0u8; 2 * 1024 * 1024];
        let response = pipeline.process_batch(vec![upload], "alice").await.unwrap();

        assert_eq!(response.results[0].status, STATUS_ERROR);
        assert!(response.results[0].error.as_deref().unwrap().contains("File too large"));
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn batch_over_the_cap_is_a_client_error() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(StubModel::returning(VALID_ATTRIBUTES));
        let pipeline = pipeline_with(dir.path(), model);

        let files: Vec<_> = (0..11).map(|i| png_upload("a.png", i as u8)).collect();
        let err = pipeline.process_batch(files, "alice").await.err().unwrap();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[tokio::test]
    async fn traversal_user_id_is_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(StubModel::returning(VALID_ATTRIBUTES));
        let pipeline = pipeline_with(dir.path(), model.clone());

        let err = pipeline
            .process_batch(vec![png_upload("a.png", 1)], "../escape")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ApiError::BadRequest(_)));
        assert_eq!(model.call_count(), 0);
    }

    #[test]
    fn unique_stem_embeds_original_stem_and_hash_prefix() {
        let stem = unique_file_stem("photos/blue shirt.jpg", "abcdef1234567890");
        assert!(stem.contains("blue shirt"));
        assert!(stem.ends_with("abcdef12"));
    }
}
