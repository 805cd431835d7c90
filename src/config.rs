use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryConfig;

pub const APP_NAME: &str = "Fashion Backend API";
pub const APP_DESCRIPTION: &str =
    "API for processing fashion images and analyzing clothing attributes";

const DEFAULT_ALLOWED_EXTENSIONS: &[&str] =
    &[".jpg", ".jpeg", ".png", ".gif", ".bmp", ".webp", ".avif"];

/// Application settings, resolved once from the environment at startup.
#[derive(Clone, Debug)]
pub struct Settings {
    pub host: String,
    pub port: u16,

    // Image validation
    pub allowed_extensions: BTreeSet<String>,
    pub max_file_size: usize,
    pub max_files_per_batch: usize,

    // Image processing
    pub target_width: u32,
    pub target_height: u32,
    pub jpeg_quality: u8,
    pub maintain_aspect_ratio: bool,

    // Storage layout
    pub user_data_dir: PathBuf,
    pub images_directory: String,
    pub create_user_subdirs: bool,
    pub save_processed_images: bool,
    pub avoid_duplicates: bool,

    // Remote record store (document service)
    pub use_remote_records: bool,
    pub doc_store_url: Option<String>,
    pub doc_store_collection: String,
    pub doc_store_token: Option<String>,

    // Remote blob store (object storage gateway)
    pub use_remote_blobs: bool,
    pub blob_gateway_url: Option<String>,
    pub blob_bucket: Option<String>,
    pub blob_gateway_token: Option<String>,
    pub signed_url_expiry_secs: u64,

    // Providers
    pub gemini_api_key: String,
    pub openai_api_key: String,
    pub default_styler: String,
    pub request_timeout_secs: u64,

    // Retry tuning
    pub retry: RetryConfig,
}

impl Settings {
    pub fn from_env() -> Self {
        let allowed_extensions = env_string("ALLOWED_EXTENSIONS")
            .map(|raw| {
                raw.split(',')
                    .map(|ext| ext.trim().to_lowercase())
                    .filter(|ext| !ext.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| {
                DEFAULT_ALLOWED_EXTENSIONS
                    .iter()
                    .map(|ext| ext.to_string())
                    .collect()
            });

        Self {
            host: env_string("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env_parse("PORT").unwrap_or(8000),

            allowed_extensions,
            max_file_size: env_parse("MAX_FILE_SIZE").unwrap_or(10 * 1024 * 1024),
            max_files_per_batch: env_parse("MAX_FILES_PER_BATCH").unwrap_or(10),

            target_width: env_parse("TARGET_WIDTH").unwrap_or(512),
            target_height: env_parse("TARGET_HEIGHT").unwrap_or(512),
            jpeg_quality: env_parse("JPEG_QUALITY").unwrap_or(85),
            maintain_aspect_ratio: env_flag("MAINTAIN_ASPECT_RATIO").unwrap_or(true),

            user_data_dir: env_string("USER_DATA_DIRECTORY")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("user_data")),
            images_directory: env_string("IMAGES_DIRECTORY")
                .unwrap_or_else(|| "saved_images".to_string()),
            create_user_subdirs: env_flag("CREATE_USER_SUBDIRS").unwrap_or(true),
            save_processed_images: env_flag("SAVE_PROCESSED_IMAGES").unwrap_or(true),
            avoid_duplicates: env_flag("AVOID_DUPLICATES").unwrap_or(true),

            use_remote_records: env_flag("USE_REMOTE_RECORDS").unwrap_or(false),
            doc_store_url: env_string("DOC_STORE_URL"),
            doc_store_collection: env_string("DOC_STORE_COLLECTION")
                .unwrap_or_else(|| "users".to_string()),
            doc_store_token: env_string("DOC_STORE_TOKEN"),

            use_remote_blobs: env_flag("USE_REMOTE_BLOBS").unwrap_or(false),
            blob_gateway_url: env_string("BLOB_GATEWAY_URL"),
            blob_bucket: env_string("BLOB_BUCKET"),
            blob_gateway_token: env_string("BLOB_GATEWAY_TOKEN"),
            signed_url_expiry_secs: env_parse("SIGNED_URL_EXPIRY_SECS").unwrap_or(3600),

            gemini_api_key: env_string("GEMINI_API_KEY").unwrap_or_default(),
            openai_api_key: env_string("OPENAI_API_KEY").unwrap_or_default(),
            default_styler: env_string("DEFAULT_STYLER")
                .map(|value| value.to_lowercase())
                .unwrap_or_else(|| "gemini".to_string()),
            request_timeout_secs: env_parse("REQUEST_TIMEOUT_SECS").unwrap_or(120),

            retry: RetryConfig {
                max_attempts: env_parse("RETRY_MAX_ATTEMPTS").unwrap_or(3),
                initial_delay: env_duration_ms("RETRY_INITIAL_DELAY_MS", 1_000),
                base_delay: env_duration_ms("RETRY_BASE_DELAY_MS", 2_000),
                max_delay: env_duration_ms("RETRY_MAX_DELAY_MS", 60_000),
                backoff_multiplier: env_parse("RETRY_BACKOFF_MULTIPLIER").unwrap_or(2.0),
                jitter: env_flag("RETRY_JITTER").unwrap_or(true),
            },
        }
    }

    pub fn max_file_size_mb(&self) -> usize {
        self.max_file_size / (1024 * 1024)
    }

    /// Root directory that local blobs live under; also what `/images` serves.
    pub fn local_images_root(&self) -> PathBuf {
        self.user_data_dir.clone()
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|value| value.parse::<T>().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    env_string(name).map(|value| {
        matches!(
            value.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_duration_ms(name: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parse(name).unwrap_or(default_ms))
}
