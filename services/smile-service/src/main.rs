use axum::{
    Json, Router,
    http::StatusCode,
    routing::{get, post},
};
use serde::Serialize;
use sp_chain::{ChainConfig, RpcGateway, load_payer_keypair};
use sp_gallery::{GalleryStore, HttpGallery, InMemoryGallery, RocksDbGallery};
use sp_reward::RewardOrchestrator;
use sp_scorer::{GeminiScorer, SmileScorer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{SystemTime, UNIX_EPOCH};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

mod reward;
mod smiles;

#[derive(Debug, Serialize)]
struct HealthResponse {
    service: &'static str,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct VersionResponse {
    service: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorResponse {
    pub(crate) error: String,
}

pub(crate) type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) gallery: Arc<dyn GalleryStore>,
    pub(crate) scorer: Arc<dyn SmileScorer>,
    /// Absent when no signing keypair could be loaded; reward and
    /// balance operations then refuse with a precondition error.
    pub(crate) rewards: Option<Arc<RewardOrchestrator>>,
    pub(crate) claim_in_flight: Arc<AtomicBool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let gallery = build_gallery()?;
    let scorer: Arc<dyn SmileScorer> = Arc::new(GeminiScorer::default());
    let rewards = build_rewards()?;

    let state = AppState {
        gallery,
        scorer,
        rewards,
        claim_in_flight: Arc::new(AtomicBool::new(false)),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/smiles", post(smiles::score_smile).get(smiles::list_smiles))
        .route("/reward/claim", post(reward::claim_reward))
        .route("/reward/donate", post(reward::donate))
        .route("/balances", get(reward::balances))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    info!("smile-service listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Gallery backend selection: `SMILE_GALLERY_BACKEND` is `memory`,
/// `rocksdb`, or `http`; the ephemeral backend is the fallback.
fn build_gallery() -> anyhow::Result<Arc<dyn GalleryStore>> {
    let backend = std::env::var("SMILE_GALLERY_BACKEND").unwrap_or_else(|_| "memory".to_string());

    Ok(match backend.as_str() {
        "rocksdb" => {
            let path = std::env::var("SMILE_GALLERY_PATH")
                .unwrap_or_else(|_| "./smilepool-gallery".to_string());
            Arc::new(RocksDbGallery::open_default(&path)?)
        }
        "http" => Arc::new(HttpGallery::default()),
        "memory" => Arc::new(InMemoryGallery::default()),
        other => {
            warn!("unknown gallery backend '{}', using in-memory", other);
            Arc::new(InMemoryGallery::default())
        }
    })
}

fn build_rewards() -> anyhow::Result<Option<Arc<RewardOrchestrator>>> {
    let config = ChainConfig::from_env()?;

    let payer = match load_payer_keypair() {
        Ok(payer) => payer,
        Err(err) => {
            warn!("reward operations disabled: {}", err);
            return Ok(None);
        }
    };

    let gateway = Arc::new(RpcGateway::new(config.rpc_url.clone(), payer));
    Ok(Some(Arc::new(RewardOrchestrator::new(gateway, config))))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        service: "smile-service",
        status: "ok",
    })
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        service: "smile-service",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub(crate) fn bad_request(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_owned(),
        }),
    )
}

pub(crate) fn conflict(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::CONFLICT,
        Json(ErrorResponse {
            error: message.to_owned(),
        }),
    )
}

pub(crate) fn upstream_error(err: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_GATEWAY,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

pub(crate) fn internal_error(err: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

pub(crate) fn epoch_ms() -> anyhow::Result<u128> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis())
}
