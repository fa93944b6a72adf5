use serde::{Deserialize, Serialize};

/// A persisted gallery entry. Created only for qualifying scores,
/// immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SmileRecord {
    pub url: String,
    pub score: f64,
    pub created_at_epoch_ms: u128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreSmileRequest {
    pub image_base64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreSmileResponse {
    pub score: f64,
    pub qualified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<SmileRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryResponse {
    pub smiles: Vec<SmileRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRewardResponse {
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DonateRequest {
    /// Decimal USDC amount, e.g. "1.5".
    pub amount: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DonateResponse {
    pub signature: String,
    pub base_units: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancesResponse {
    pub wallet_address: String,
    pub user_base_units: u64,
    pub pool_base_units: u64,
    pub user_amount: String,
    pub pool_amount: String,
}
