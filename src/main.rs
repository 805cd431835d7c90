use std::sync::Arc;

use anyhow::Result;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use fashion_backend::attribution::AttributionPipeline;
use fashion_backend::config::Settings;
use fashion_backend::providers;
use fashion_backend::routes::{AppState, build_router};
use fashion_backend::storage::blobs::{BlobGatewayClient, LocalBlobStore};
use fashion_backend::storage::records::{DocStoreClient, LocalRecordStore};
use fashion_backend::storage::{BlobStore, RecordStore, UserLocks};
use fashion_backend::styling::StylingPipeline;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = Arc::new(Settings::from_env());
    info!(version = env!("CARGO_PKG_VERSION"), "starting fashion backend");

    let client = providers::http_client(&settings)?;
    let records = Arc::new(resolve_record_store(&settings, client.clone()).await);
    let blobs = Arc::new(resolve_blob_store(&settings, client.clone()).await);
    info!(
        records = records.backend_name(),
        blobs = blobs.backend_name(),
        "storage backends resolved"
    );

    let vision = providers::vision_model(&settings, client.clone());
    let styler = providers::styling_model(&settings, client);
    let user_locks = UserLocks::new();

    let attribution = AttributionPipeline::new(
        settings.clone(),
        records.clone(),
        blobs.clone(),
        vision,
        user_locks,
    );
    let styling = StylingPipeline::new(settings.clone(), records.clone(), blobs.clone(), styler);

    let state = Arc::new(AppState {
        settings: settings.clone(),
        attribution,
        styling,
        records,
        blobs,
    });
    let router = build_router(state);

    let bind_address = format!("{}:{}", settings.host, settings.port);
    let tcp_listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!(%bind_address, "listening");

    let _ = axum::serve(tcp_listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    Ok(())
}

/// Remote records only when explicitly enabled and reachable; everything
/// else falls back to local JSON files with a logged warning.
async fn resolve_record_store(settings: &Settings, client: reqwest::Client) -> RecordStore {
    if settings.use_remote_records {
        if let Some(base_url) = settings.doc_store_url.clone() {
            let remote = DocStoreClient::new(
                client,
                base_url,
                settings.doc_store_collection.clone(),
                settings.doc_store_token.clone(),
            );
            match remote.healthcheck().await {
                Ok(()) => {
                    info!("using remote document store for records");
                    return RecordStore::Remote(remote);
                }
                Err(err) => {
                    warn!(%err, "remote document store unavailable, falling back to local records");
                }
            }
        } else {
            warn!("USE_REMOTE_RECORDS set but DOC_STORE_URL missing, falling back to local records");
        }
    }
    info!("using local JSON files for records");
    RecordStore::Local(LocalRecordStore::new(
        settings.user_data_dir.clone(),
        settings.create_user_subdirs,
    ))
}

async fn resolve_blob_store(settings: &Settings, client: reqwest::Client) -> BlobStore {
    if settings.use_remote_blobs {
        match (
            settings.blob_gateway_url.clone(),
            settings.blob_bucket.clone(),
        ) {
            (Some(base_url), Some(bucket)) => {
                let remote = BlobGatewayClient::new(
                    client,
                    base_url,
                    bucket,
                    settings.blob_gateway_token.clone(),
                    settings.signed_url_expiry_secs,
                    settings.create_user_subdirs,
                );
                match remote.healthcheck().await {
                    Ok(()) => {
                        info!("using remote object storage for images");
                        return BlobStore::Remote(remote);
                    }
                    Err(err) => {
                        warn!(%err, "blob gateway unavailable, falling back to local image storage");
                    }
                }
            }
            _ => {
                warn!(
                    "USE_REMOTE_BLOBS set but BLOB_GATEWAY_URL or BLOB_BUCKET missing, falling back to local image storage"
                );
            }
        }
    }
    info!("using local filesystem for image storage");
    BlobStore::Local(LocalBlobStore::new(
        settings.local_images_root(),
        settings.images_directory.clone(),
        settings.create_user_subdirs,
    ))
}
