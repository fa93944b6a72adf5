use axum::{Json, extract::State, http::StatusCode};
use sp_api_types::{BalancesResponse, ClaimRewardResponse, DonateRequest, DonateResponse};
use sp_reward::{RewardError, to_ui_amount};
use std::sync::atomic::Ordering;
use tracing::warn;

use crate::{ApiResult, AppState, ErrorResponse, conflict};

/// One claim at a time: the in-flight flag rejects concurrent triggers
/// and is reset on every outcome.
pub(crate) async fn claim_reward(State(state): State<AppState>) -> ApiResult<ClaimRewardResponse> {
    let Some(rewards) = state.rewards.as_ref() else {
        return Err(reward_error(RewardError::Unauthenticated));
    };

    if state
        .claim_in_flight
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Err(conflict("a claim is already in flight"));
    }

    let result = rewards.claim().await;
    state.claim_in_flight.store(false, Ordering::SeqCst);

    match result {
        Ok(signature) => Ok(Json(ClaimRewardResponse {
            signature: signature.to_string(),
        })),
        Err(err) => {
            warn!("claim failed: {}", err);
            Err(reward_error(err))
        }
    }
}

pub(crate) async fn donate(
    State(state): State<AppState>,
    Json(request): Json<DonateRequest>,
) -> ApiResult<DonateResponse> {
    let Some(rewards) = state.rewards.as_ref() else {
        return Err(reward_error(RewardError::Unauthenticated));
    };

    let (signature, base_units) = rewards.donate(&request.amount).await.map_err(reward_error)?;

    Ok(Json(DonateResponse {
        signature: signature.to_string(),
        base_units,
    }))
}

pub(crate) async fn balances(State(state): State<AppState>) -> ApiResult<BalancesResponse> {
    let Some(rewards) = state.rewards.as_ref() else {
        return Err(reward_error(RewardError::Unauthenticated));
    };

    let balances = rewards.balances().await.map_err(reward_error)?;

    Ok(Json(BalancesResponse {
        wallet_address: rewards.user().to_string(),
        user_base_units: balances.user_base_units,
        pool_base_units: balances.pool_base_units,
        user_amount: to_ui_amount(balances.user_base_units),
        pool_amount: to_ui_amount(balances.pool_base_units),
    }))
}

fn reward_error(err: RewardError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        RewardError::Unauthenticated => StatusCode::UNAUTHORIZED,
        RewardError::InvalidAmount(_) => StatusCode::BAD_REQUEST,
        RewardError::AccountNotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
        RewardError::Chain(_) => StatusCode::BAD_GATEWAY,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}
