use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{ApiError, ApiResult};
use crate::providers::{CompletionModel, parse_json_with_salvage};
use crate::retry::{RetryError, RetryPolicy, is_rate_limit_error, rate_limit_message};
use crate::storage::{BlobStore, RecordStore, UserLedger, normalize_user_id};

pub const DEFAULT_CITY: &str = "Toronto";
pub const DEFAULT_WEATHER: &str =
    "early fall weather - expect temperatures around 15-20°C, partly cloudy";
pub const DEFAULT_OCCASION: &str = "casual day out";

const MAX_PARAMETER_LENGTH: usize = 200;
const OUTFIT_ROLES: &[&str] = &["top", "bottom", "outerwear"];
const UNKNOWN: &str = "unknown";

#[derive(Clone, Debug, Serialize)]
pub struct StylingParams {
    pub city: String,
    pub weather: String,
    pub occasion: String,
}

/// Default and sanity-check the styling request parameters.
pub fn validate_styling_parameters(
    city: Option<String>,
    weather: Option<String>,
    occasion: Option<String>,
) -> ApiResult<StylingParams> {
    let params = StylingParams {
        city: defaulted(city, DEFAULT_CITY),
        weather: defaulted(weather, DEFAULT_WEATHER),
        occasion: defaulted(occasion, DEFAULT_OCCASION),
    };
    for (name, value) in [
        ("city", &params.city),
        ("weather", &params.weather),
        ("occasion", &params.occasion),
    ] {
        if value.chars().count() > MAX_PARAMETER_LENGTH {
            return Err(ApiError::BadRequest(format!(
                "Parameter '{name}' is too long. Maximum length is {MAX_PARAMETER_LENGTH} characters."
            )));
        }
    }
    Ok(params)
}

fn defaulted(value: Option<String>, fallback: &str) -> String {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

/// Reduced, styling-relevant projection of one stored record.
#[derive(Clone, Debug, Serialize)]
struct StylingItem {
    image: String,
    identifier: String,
    category: String,
    gender: String,
    primary_color: String,
    style: String,
    occasion: String,
    weather: String,
    fit: String,
    description: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct StylerResponse {
    pub success: bool,
    pub message: String,
    pub user_id: String,
    pub styling_timestamp: String,
    pub request_parameters: StylingParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outfit_recommendation: Option<Value>,
    pub available_items_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outfit_images: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outfit recommendation over a user's accumulated wardrobe.
pub struct StylingPipeline {
    settings: Arc<Settings>,
    records: Arc<RecordStore>,
    blobs: Arc<BlobStore>,
    styler: Arc<dyn CompletionModel>,
    retry: RetryPolicy,
}

impl StylingPipeline {
    pub fn new(
        settings: Arc<Settings>,
        records: Arc<RecordStore>,
        blobs: Arc<BlobStore>,
        styler: Arc<dyn CompletionModel>,
    ) -> Self {
        let retry = RetryPolicy::new(settings.retry.clone());
        Self {
            settings,
            records,
            blobs,
            styler,
            retry,
        }
    }

    pub async fn recommend(&self, user_id: &str, params: StylingParams) -> ApiResult<StylerResponse> {
        info!(
            user = user_id,
            city = %params.city,
            occasion = %params.occasion,
            "starting outfit recommendation"
        );
        let normalized =
            normalize_user_id(user_id, Some(self.settings.user_data_dir.as_path()))?;

        let ledger = match self.records.load(&normalized).await {
            Some(ledger) => ledger,
            None => {
                return Err(ApiError::NotFound(format!(
                    "No clothing data found for user '{user_id}'. Please upload some images first using /attribute_clothes endpoint."
                )));
            }
        };

        let items = styling_items(&ledger);
        if items.is_empty() {
            warn!(user = user_id, "no valid clothing items found for styling");
            return Ok(self.failure_response(
                user_id,
                params,
                0,
                format!(
                    "No valid clothing items found for user '{user_id}'. Please upload some images with valid clothing items first."
                ),
                "No valid clothing items available for styling".to_string(),
            ));
        }
        info!(user = user_id, items = items.len(), "clothing items selected for styling");

        let closet_json = match serde_json::to_string_pretty(&items) {
            Ok(json) => json,
            Err(err) => {
                return Err(ApiError::Internal(format!(
                    "failed to serialize closet items: {err}"
                )));
            }
        };
        let prompt = build_styling_prompt(&closet_json, &params);

        let outcome = self
            .retry
            .execute(
                || self.styler.generate(&prompt, None),
                is_rate_limit_error,
                "outfit styling",
            )
            .await;

        let text = match outcome {
            Ok(text) => text,
            Err(RetryError::RateLimited { attempts, .. }) => {
                return Ok(self.failure_response(
                    user_id,
                    params,
                    items.len(),
                    format!("Failed to generate outfit recommendation for user '{user_id}'"),
                    rate_limit_message(attempts),
                ));
            }
            Err(RetryError::NonRetryable { last_error, .. }) => {
                return Ok(self.failure_response(
                    user_id,
                    params,
                    items.len(),
                    format!("Failed to generate outfit recommendation for user '{user_id}'"),
                    format!("Styling error: {last_error}"),
                ));
            }
        };

        let outfit = parse_json_with_salvage(&text);
        let selection_valid = outfit
            .as_object()
            .map(|map| !map.contains_key("error"))
            .unwrap_or(false);
        if !selection_valid {
            let detail = outfit
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("model response was not a JSON object")
                .to_string();
            return Ok(self.failure_response(
                user_id,
                params,
                items.len(),
                format!("Failed to generate outfit recommendation for user '{user_id}'"),
                format!("Styling error: {detail}"),
            ));
        }

        let outfit_images = self.resolve_outfit_urls(&outfit, &ledger).await;
        info!(
            user = user_id,
            urls = outfit_images.len(),
            "outfit recommendation complete"
        );

        Ok(StylerResponse {
            success: true,
            message: format!("Outfit recommendation generated successfully for user '{user_id}'"),
            user_id: user_id.to_string(),
            styling_timestamp: Utc::now().to_rfc3339(),
            request_parameters: params,
            outfit_recommendation: Some(outfit),
            available_items_count: items.len(),
            outfit_images: Some(outfit_images),
            error: None,
        })
    }

    fn failure_response(
        &self,
        user_id: &str,
        params: StylingParams,
        available_items_count: usize,
        message: String,
        error: String,
    ) -> StylerResponse {
        StylerResponse {
            success: false,
            message,
            user_id: user_id.to_string(),
            styling_timestamp: Utc::now().to_rfc3339(),
            request_parameters: params,
            outfit_recommendation: None,
            available_items_count,
            outfit_images: None,
            error: Some(error),
        }
    }

    /// Map each selected role back to a stored blob and mint a download URL.
    /// A role that cannot be matched is logged and left out; it does not fail
    /// the recommendation.
    async fn resolve_outfit_urls(
        &self,
        outfit: &Value,
        ledger: &UserLedger,
    ) -> BTreeMap<String, String> {
        let mut urls = BTreeMap::new();
        for role in OUTFIT_ROLES {
            let Some(selected) = outfit.get(*role).and_then(Value::as_str) else {
                debug!(role, "no item selected for role");
                continue;
            };
            if selected.is_empty() {
                continue;
            }

            let matched = ledger.images.values().find(|record| {
                record.filename == selected
                    || record.filename.contains(selected)
                    || record
                        .saved_images
                        .values()
                        .any(|path| path.contains(selected))
            });
            let Some(record) = matched else {
                warn!(role, selected, "selected item not found in ledger");
                continue;
            };
            let Some(location) = record.saved_images.get("processed") else {
                warn!(role, selected, "no processed image stored for selected item");
                continue;
            };
            match self.blobs.download_url(location).await {
                Some(url) => {
                    urls.insert(role.to_string(), url);
                }
                None => warn!(role, selected, "failed to resolve download url"),
            }
        }
        urls
    }
}

/// Project ledger records into the reduced styling shape, dropping anything
/// whose identifier or category never resolved past the unknown sentinel.
fn styling_items(ledger: &UserLedger) -> Vec<StylingItem> {
    let mut items = Vec::new();
    for (image_hash, record) in &ledger.images {
        if record.attributes.is_empty() {
            continue;
        }
        let attr = |key: &str, fallback: &str| -> String {
            record
                .attributes
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| fallback.to_string())
        };

        let fallback_image = if record.filename.is_empty() {
            format!("image_{}", &image_hash[..8.min(image_hash.len())])
        } else {
            record.filename.clone()
        };
        let item = StylingItem {
            image: attr("image", &fallback_image),
            identifier: attr("identifier", UNKNOWN),
            category: attr("category", UNKNOWN),
            gender: attr("gender", "unisex"),
            primary_color: attr("primary_color", UNKNOWN),
            style: attr("style", "casual"),
            occasion: attr("occasion", "everyday"),
            weather: attr("weather", "mild"),
            fit: attr("fit", "regular"),
            description: attr("description", "clothing item"),
        };
        if item.identifier != UNKNOWN && item.category != UNKNOWN {
            items.push(item);
        }
    }
    items
}

fn build_styling_prompt(closet_json: &str, params: &StylingParams) -> String {
    format!(
        r#"You are an expert AI fashion stylist with deep knowledge of color theory, seasonal trends, and style coordination. I will provide you with a JSON list of clothing items available in my digital closet.

Your task is to create a stylish, modern, and coherent outfit suitable for a '{occasion} in {city}'. The weather conditions are: {weather}.

Here is my closet (JSON format):
---
{closet_json}
---

ADVANCED STYLING GUIDELINES:
COLOR COORDINATION:
- Prioritize complementary or analogous color schemes
- Consider neutral bases with one accent color
- Avoid clashing patterns unless intentionally eclectic
- Account for undertones (warm vs cool) in color matching

FIT & SILHOUETTE:
- Balance proportions (fitted top with relaxed bottom, or vice versa)
- Consider layering potential for variable weather
- Ensure the outfit flatters different body types

STYLE HARMONY:
- Match formality levels (don't mix overly casual with formal)
- Consider fabric textures and how they work together
- Think about the overall aesthetic (minimalist, bohemian, classic, etc.)

SEASONAL APPROPRIATENESS:
- Choose weather-appropriate pieces for the specified conditions
- Layer-friendly pieces are ideal for variable weather
- Consider transitional pieces that work in changing weather

SELECTION RULES:
1. MANDATORY: Select exactly one 'top' and one 'bottom' from the provided list
2. OPTIONAL: Include an 'outerwear' piece if it enhances the outfit or suits the weather
3. STRICT REQUIREMENT: Only use items that exist in the provided JSON list
4. IMAGE PRECISION: Use the EXACT "image" field value from selected items
5. NO SHOES: The list contains no footwear, so don't include shoes in selections
6. JSON ONLY: Your response must be pure JSON with no additional text

Required output format (valid JSON only):
{{
    "top": "exact_image_filename_from_top_item",
    "bottom": "exact_image_filename_from_bottom_item",
    "outerwear": "exact_image_filename_from_outerwear_item_or_null",
    "justification": "Short explanation of why this outfit works together (color theory, fit, occasion suitability)",
    "style_notes": "Short professional styling tips about why this combination works (textures, proportions, versatility)",
    "other_accessories": "Specific accessory recommendations (jewelry, bags, scarves) that would complete this look",
    "weather_consideration": "How this outfit addresses the specified weather conditions"
}}

CRITICAL REMINDER: Use exact "image" field values from the JSON items. For example, if selecting an item with "image": "top_1_shirt.jpg", use exactly "top_1_shirt.jpg" in your response.

Generate ONLY the JSON response now:"#,
        occasion = params.occasion,
        city = params.city,
        weather = params.weather,
        closet_json = closet_json,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use crate::storage::blobs::LocalBlobStore;
    use crate::storage::records::{ImageRecord, LocalRecordStore};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::{Map, json};
    use std::collections::BTreeSet;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct StubStyler {
        response: anyhow::Result<&'static str>,
        calls: AtomicU32,
    }

    impl StubStyler {
        fn returning(text: &'static str) -> Self {
            Self {
                response: Ok(text),
                calls: AtomicU32::new(0),
            }
        }

        fn failing(message: &'static str) -> Self {
            Self {
                response: Err(anyhow!(message)),
                calls: AtomicU32::new(0),
            }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionModel for StubStyler {
        async fn generate(&self, _prompt: &str, _image: Option<&[u8]>) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.response {
                Ok(text) => Ok(text.to_string()),
                Err(err) => Err(anyhow!("{err}")),
            }
        }

        fn model_name(&self) -> &str {
            "stub-styler"
        }
    }

    fn test_settings(dir: &Path) -> Settings {
        Settings {
            host: "127.0.0.1".to_string(),
            port: 0,
            allowed_extensions: BTreeSet::from([".jpg".to_string()]),
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

    fn pipeline_with(dir: &Path, styler: Arc<StubStyler>) -> (StylingPipeline, Arc<RecordStore>) {
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
        let pipeline = StylingPipeline::new(settings, records.clone(), blobs, styler);
        (pipeline, records)
    }

    fn record(user: &str, hash: &str, filename: &str, identifier: &str, category: &str) -> ImageRecord {
        let mut attributes = Map::new();
        attributes.insert("image".to_string(), json!(filename));
        attributes.insert("identifier".to_string(), json!(identifier));
        attributes.insert("category".to_string(), json!(category));
        attributes.insert("primary_color".to_string(), json!("Navy"));
        ImageRecord {
            filename: filename.to_string(),
            content_type: "image/jpeg".to_string(),
            file_size_bytes: 1024,
            file_size_mb: 0.0,
            attributes,
            processed_timestamp: Utc::now().to_rfc3339(),
            image_hash: hash.to_string(),
            user_id: user.to_string(),
            saved_images: BTreeMap::from([(
                "processed".to_string(),
                format!("user_data/{user}/saved_images/processed/{filename}"),
            )]),
        }
    }

    fn params() -> StylingParams {
        StylingParams {
            city: DEFAULT_CITY.to_string(),
            weather: DEFAULT_WEATHER.to_string(),
            occasion: DEFAULT_OCCASION.to_string(),
        }
    }

    const OUTFIT_JSON: &str = r#"{"top":"blue_shirt.jpg","bottom":"jeans.jpg","outerwear":null,"justification":"navy over denim","style_notes":"clean","other_accessories":"watch","weather_consideration":"layers"}"#;

    #[tokio::test]
    async fn absent_ledger_is_a_not_found_error() {
        let dir = tempfile::tempdir().unwrap();
        let styler = Arc::new(StubStyler::returning(OUTFIT_JSON));
        let (pipeline, _records) = pipeline_with(dir.path(), styler.clone());

        let err = pipeline.recommend("nobody", params()).await.err().unwrap();
        assert!(matches!(err, ApiError::NotFound(_)));
        assert_eq!(styler.call_count(), 0);
    }

    #[tokio::test]
    async fn empty_filter_short_circuits_without_calling_the_model() {
        let dir = tempfile::tempdir().unwrap();
        let styler = Arc::new(StubStyler::returning(OUTFIT_JSON));
        let (pipeline, records) = pipeline_with(dir.path(), styler.clone());

        // Only unknown-identifier items survive persistence; none are styleable.
        records
            .upsert_image("alice", "h1", record("alice", "h1", "blur.jpg", "unknown", "unknown"))
            .await;

        let response = pipeline.recommend("alice", params()).await.unwrap();
        assert!(!response.success);
        assert_eq!(response.available_items_count, 0);
        assert_eq!(styler.call_count(), 0);
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn recommendation_resolves_selected_roles_to_urls() {
        let dir = tempfile::tempdir().unwrap();
        let styler = Arc::new(StubStyler::returning(OUTFIT_JSON));
        let (pipeline, records) = pipeline_with(dir.path(), styler.clone());

        records
            .upsert_image("alice", "h1", record("alice", "h1", "blue_shirt.jpg", "top", "T-Shirt"))
            .await;
        records
            .upsert_image("alice", "h2", record("alice", "h2", "jeans.jpg", "bottom", "Jeans"))
            .await;

        let response = pipeline.recommend("alice", params()).await.unwrap();
        assert!(response.success);
        assert_eq!(response.available_items_count, 2);
        assert_eq!(styler.call_count(), 1);

        let outfit = response.outfit_recommendation.unwrap();
        assert_eq!(outfit["top"], "blue_shirt.jpg");

        let urls = response.outfit_images.unwrap();
        assert!(urls.contains_key("top"));
        assert!(urls.contains_key("bottom"));
        // Null outerwear is tolerated and simply omitted.
        assert!(!urls.contains_key("outerwear"));
        assert!(urls["top"].starts_with("/images/"));
    }

    #[tokio::test]
    async fn unmatched_selection_is_omitted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let styler = Arc::new(StubStyler::returning(
            r#"{"top":"missing.jpg","bottom":"jeans.jpg","outerwear":null}"#,
        ));
        let (pipeline, records) = pipeline_with(dir.path(), styler);

        records
            .upsert_image("alice", "h2", record("alice", "h2", "jeans.jpg", "bottom", "Jeans"))
            .await;

        let response = pipeline.recommend("alice", params()).await.unwrap();
        assert!(response.success);
        let urls = response.outfit_images.unwrap();
        assert!(!urls.contains_key("top"));
        assert!(urls.contains_key("bottom"));
    }

    #[tokio::test]
    async fn styler_failure_is_a_structured_non_success_response() {
        let dir = tempfile::tempdir().unwrap();
        let styler = Arc::new(StubStyler::failing("upstream exploded"));
        let (pipeline, records) = pipeline_with(dir.path(), styler.clone());

        records
            .upsert_image("alice", "h1", record("alice", "h1", "blue_shirt.jpg", "top", "T-Shirt"))
            .await;

        let response = pipeline.recommend("alice", params()).await.unwrap();
        assert!(!response.success);
        assert_eq!(response.available_items_count, 1);
        assert!(response.error.as_deref().unwrap().contains("Styling error"));
        // Non-retryable: a single call, no retry budget spent.
        assert_eq!(styler.call_count(), 1);
    }

    #[tokio::test]
    async fn unparseable_styler_output_is_a_structured_failure() {
        let dir = tempfile::tempdir().unwrap();
        let styler = Arc::new(StubStyler::returning("sorry, I cannot pick an outfit"));
        let (pipeline, records) = pipeline_with(dir.path(), styler);

        records
            .upsert_image("alice", "h1", record("alice", "h1", "blue_shirt.jpg", "top", "T-Shirt"))
            .await;

        let response = pipeline.recommend("alice", params()).await.unwrap();
        assert!(!response.success);
        assert!(response.error.is_some());
    }

    #[test]
    fn parameters_fall_back_to_defaults() {
        let params = validate_styling_parameters(None, Some("  ".to_string()), None).unwrap();
        assert_eq!(params.city, DEFAULT_CITY);
        assert_eq!(params.weather, DEFAULT_WEATHER);
        assert_eq!(params.occasion, DEFAULT_OCCASION);
    }

    #[test]
    fn overlong_parameter_is_rejected() {
        let long = "x".repeat(201);
        let err = validate_styling_parameters(Some(long), None, None).err().unwrap();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[test]
    fn prompt_embeds_closet_and_context() {
        let params = StylingParams {
            city: "Lisbon".to_string(),
            weather: "hot and sunny".to_string(),
            occasion: "beach party".to_string(),
        };
        let prompt = build_styling_prompt(r#"[{"image":"a.jpg"}]"#, &params);
        assert!(prompt.contains("beach party in Lisbon"));
        assert!(prompt.contains("hot and sunny"));
        assert!(prompt.contains(r#"[{"image":"a.jpg"}]"#));
        assert!(prompt.contains("exactly one 'top' and one 'bottom'"));
    }
}
