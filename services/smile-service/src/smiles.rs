use axum::{Json, extract::State};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use sp_api_types::{GalleryResponse, ScoreSmileRequest, ScoreSmileResponse, SmileRecord};
use sp_gallery::QUALIFYING_SCORE;
use tracing::info;

use crate::{ApiResult, AppState, bad_request, internal_error, upstream_error};

/// Scores an uploaded selfie and, when it qualifies, persists it to the
/// gallery. A scoring failure aborts the request with nothing persisted.
pub(crate) async fn score_smile(
    State(state): State<AppState>,
    Json(request): Json<ScoreSmileRequest>,
) -> ApiResult<ScoreSmileResponse> {
    if request.image_base64.trim().is_empty() {
        return Err(bad_request("image_base64 is required"));
    }

    let image = STANDARD
        .decode(request.image_base64.as_bytes())
        .map_err(|_| bad_request("image_base64 must be valid base64"))?;

    let score = state.scorer.score(&image).await.map_err(upstream_error)?;
    let qualified = score >= QUALIFYING_SCORE;
    info!("selfie scored {:.1}, qualified: {}", score, qualified);

    let record = if qualified {
        let url = state
            .gallery
            .store_image(&image)
            .await
            .map_err(internal_error)?;
        let record = SmileRecord {
            url,
            score,
            created_at_epoch_ms: crate::epoch_ms().map_err(internal_error)?,
        };
        state
            .gallery
            .persist(&record)
            .await
            .map_err(internal_error)?;
        Some(record)
    } else {
        None
    };

    Ok(Json(ScoreSmileResponse {
        score,
        qualified,
        record,
    }))
}

pub(crate) async fn list_smiles(State(state): State<AppState>) -> ApiResult<GalleryResponse> {
    let smiles = state
        .gallery
        .list(QUALIFYING_SCORE)
        .await
        .map_err(internal_error)?;

    Ok(Json(GalleryResponse { smiles }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use sp_gallery::{GalleryStore, InMemoryGallery};
    use sp_scorer::SmileScorer;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    struct FixedScorer(f64);

    #[async_trait]
    impl SmileScorer for FixedScorer {
        async fn score(&self, _image: &[u8]) -> Result<f64> {
            Ok(self.0)
        }
    }

    struct FailingScorer;

    #[async_trait]
    impl SmileScorer for FailingScorer {
        async fn score(&self, _image: &[u8]) -> Result<f64> {
            Err(anyhow!("scoring API unreachable"))
        }
    }

    fn state_with_scorer(scorer: Arc<dyn SmileScorer>) -> AppState {
        AppState {
            gallery: Arc::new(InMemoryGallery::default()),
            scorer,
            rewards: None,
            claim_in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    fn image_request() -> ScoreSmileRequest {
        ScoreSmileRequest {
            image_base64: STANDARD.encode([0xff, 0xd8, 0xff, 0xe0]),
        }
    }

    #[tokio::test]
    async fn qualifying_score_persists_a_gallery_record() -> Result<()> {
        let state = state_with_scorer(Arc::new(FixedScorer(7.2)));

        let response = score_smile(State(state.clone()), Json(image_request()))
            .await
            .map_err(|(status, _)| anyhow!("unexpected status {status}"))?;

        assert_eq!(response.score, 7.2);
        assert!(response.qualified);
        let record = response.record.clone().expect("record should be persisted");
        assert_eq!(record.score, 7.2);

        let listed = state.gallery.list(QUALIFYING_SCORE).await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0], record);
        Ok(())
    }

    #[tokio::test]
    async fn low_score_is_reported_but_not_persisted() -> Result<()> {
        let state = state_with_scorer(Arc::new(FixedScorer(4.9)));

        let response = score_smile(State(state.clone()), Json(image_request()))
            .await
            .map_err(|(status, _)| anyhow!("unexpected status {status}"))?;

        assert!(!response.qualified);
        assert!(response.record.is_none());
        assert!(state.gallery.list(QUALIFYING_SCORE).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn invalid_base64_is_rejected_before_scoring() {
        let state = state_with_scorer(Arc::new(FixedScorer(9.0)));
        let request = ScoreSmileRequest {
            image_base64: "not base64!!!".to_owned(),
        };

        let result = score_smile(State(state), Json(request)).await;
        let (status, _) = result.err().expect("should be rejected");
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn scorer_failure_surfaces_and_persists_nothing() -> Result<()> {
        let state = state_with_scorer(Arc::new(FailingScorer));

        let result = score_smile(State(state.clone()), Json(image_request())).await;
        let (status, _) = result.err().expect("should fail");
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(state.gallery.list(0.0).await?.is_empty());
        Ok(())
    }
}
