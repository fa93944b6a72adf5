use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use sp_chain::{
    ChainConfig, ChainGateway, associated_token_address, claim_reward_ix,
    create_associated_token_account_ix, donate_ix, initialize_pool_ix, initialize_user_stats_ix,
    pool_authority, user_stats_address,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const BASE_UNITS_PER_TOKEN: u64 = 1_000_000;

#[derive(Debug, Error)]
pub enum RewardError {
    #[error("no connected wallet identity")]
    Unauthenticated,
    #[error("account {0} was not visible within the retry budget")]
    AccountNotReady(Pubkey),
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("chain operation failed")]
    Chain(#[from] anyhow::Error),
}

pub type RewardResult<T> = Result<T, RewardError>;

/// Bounded visibility polling for the gap between transaction
/// confirmation and account readability: at most `max_attempts`
/// existence checks, with the delay doubling after each miss.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2_u32.saturating_pow(attempt)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Balances {
    pub user_base_units: u64,
    pub pool_base_units: u64,
}

/// Sequences the on-chain calls behind a reward claim or donation.
///
/// A claim guarantees, in order: the user's token account, the user's
/// stats account, and the pool-stats account, then submits the claim
/// instruction. Every ensure step is a no-op success when the account
/// already exists, so repeated claims never resubmit creations. Any step
/// failure aborts the remainder; account creation is irreversible and
/// idempotent, so no rollback is attempted.
pub struct RewardOrchestrator {
    gateway: Arc<dyn ChainGateway>,
    config: ChainConfig,
    retry: RetryPolicy,
}

impl RewardOrchestrator {
    pub fn new(gateway: Arc<dyn ChainGateway>, config: ChainConfig) -> Self {
        Self {
            gateway,
            config,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn user(&self) -> Pubkey {
        self.gateway.payer()
    }

    pub async fn claim(&self) -> RewardResult<Signature> {
        let user = self.gateway.payer();
        let user_token = self.ensure_user_token_account().await?;
        let user_stats = self.ensure_user_stats().await?;
        let pool_stats = self.resolve_pool_stats().await?;

        let (pool_auth, _) = pool_authority(&self.config.program_id);
        let pool_token = associated_token_address(&pool_auth, &self.config.usdc_mint);

        info!("submitting claim for {} (stats {}, pool {})", user, user_stats, pool_stats);
        let instruction = claim_reward_ix(
            &self.config.program_id,
            &user,
            &user_stats,
            &pool_stats,
            &pool_token,
            &user_token,
        );
        let signature = self.gateway.send_and_confirm(&[instruction], &[]).await?;
        info!("claim confirmed: {}", signature);
        Ok(signature)
    }

    /// Validates and converts the amount before touching the network,
    /// ensures the donor token account, then submits the transfer. The
    /// pool's own transfer rules are enforced by the program, not here.
    pub async fn donate(&self, amount: &str) -> RewardResult<(Signature, u64)> {
        let base_units = to_base_units(amount)?;

        let user = self.gateway.payer();
        let donor_token = self.ensure_user_token_account().await?;
        let (pool_auth, _) = pool_authority(&self.config.program_id);
        let pool_token = associated_token_address(&pool_auth, &self.config.usdc_mint);

        info!("submitting donation of {} base units from {}", base_units, user);
        let instruction = donate_ix(
            &self.config.program_id,
            &user,
            &donor_token,
            &pool_token,
            base_units,
        );
        let signature = self.gateway.send_and_confirm(&[instruction], &[]).await?;
        Ok((signature, base_units))
    }

    /// Two independent reads, not an atomic snapshot. A token account
    /// that does not exist yet reads as zero.
    pub async fn balances(&self) -> RewardResult<Balances> {
        let user_token = associated_token_address(&self.gateway.payer(), &self.config.usdc_mint);
        let (pool_auth, _) = pool_authority(&self.config.program_id);
        let pool_token = associated_token_address(&pool_auth, &self.config.usdc_mint);

        let user_base_units = self
            .gateway
            .token_account_base_units(&user_token)
            .await?
            .unwrap_or(0);
        let pool_base_units = self
            .gateway
            .token_account_base_units(&pool_token)
            .await?
            .unwrap_or(0);

        Ok(Balances {
            user_base_units,
            pool_base_units,
        })
    }

    pub async fn ensure_user_token_account(&self) -> RewardResult<Pubkey> {
        let user = self.gateway.payer();
        let token_account = associated_token_address(&user, &self.config.usdc_mint);

        if self.gateway.account_exists(&token_account).await? {
            debug!("user token account {} already exists", token_account);
            return Ok(token_account);
        }

        info!("creating user token account {}", token_account);
        let instruction = create_associated_token_account_ix(&user, &user, &self.config.usdc_mint);
        self.gateway.send_and_confirm(&[instruction], &[]).await?;
        self.wait_until_visible(&token_account).await?;
        Ok(token_account)
    }

    pub async fn ensure_user_stats(&self) -> RewardResult<Pubkey> {
        let user = self.gateway.payer();
        let (user_stats, bump) = user_stats_address(&self.config.program_id, &user);

        if self.gateway.account_exists(&user_stats).await? {
            debug!("user stats account {} already exists", user_stats);
            return Ok(user_stats);
        }

        info!("initializing user stats account {}", user_stats);
        let instruction =
            initialize_user_stats_ix(&self.config.program_id, &user, &user_stats, bump);
        self.gateway.send_and_confirm(&[instruction], &[]).await?;
        self.wait_until_visible(&user_stats).await?;
        Ok(user_stats)
    }

    /// The pool-stats account is keypair-backed, so it is located by a
    /// structural size match over program-owned accounts instead of a
    /// derived address. When none exists, a fresh one is initialized.
    pub async fn resolve_pool_stats(&self) -> RewardResult<Pubkey> {
        let found = self
            .gateway
            .program_accounts_by_size(&self.config.program_id, self.config.pool_stats_size)
            .await?;

        if let Some(existing) = found.first() {
            debug!("using existing pool stats account {}", existing);
            return Ok(*existing);
        }

        let pool_stats = Keypair::new();
        let address = pool_stats.pubkey();
        let (_, bump) = pool_authority(&self.config.program_id);

        info!("initializing pool stats account {}", address);
        let instruction = initialize_pool_ix(
            &self.config.program_id,
            &self.gateway.payer(),
            &address,
            bump,
        );
        self.gateway
            .send_and_confirm(&[instruction], &[&pool_stats])
            .await?;
        self.wait_until_visible(&address).await?;
        Ok(address)
    }

    async fn wait_until_visible(&self, address: &Pubkey) -> RewardResult<()> {
        let mut attempt = 0;
        loop {
            if self.gateway.account_exists(address).await? {
                return Ok(());
            }
            if attempt + 1 >= self.retry.max_attempts {
                return Err(RewardError::AccountNotReady(*address));
            }
            tokio::time::sleep(self.retry.delay_for(attempt)).await;
            attempt += 1;
        }
    }
}

/// Converts a decimal token amount into base units (6 decimals),
/// truncating anything beyond the sixth fractional digit. Zero,
/// negative, and non-numeric input is rejected.
pub fn to_base_units(amount: &str) -> RewardResult<u64> {
    let trimmed = amount.trim();
    if trimmed.is_empty() {
        return Err(RewardError::InvalidAmount("amount is required".to_owned()));
    }
    if trimmed.starts_with('-') {
        return Err(RewardError::InvalidAmount(
            "amount must be positive".to_owned(),
        ));
    }

    let (whole, frac) = match trimmed.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (trimmed, ""),
    };

    let digits_only =
        |part: &str| !part.is_empty() && part.bytes().all(|byte| byte.is_ascii_digit());
    if !digits_only(whole) && !(whole.is_empty() && digits_only(frac)) {
        return Err(RewardError::InvalidAmount(format!(
            "not a decimal number: {trimmed}"
        )));
    }
    if !frac.is_empty() && !frac.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(RewardError::InvalidAmount(format!(
            "not a decimal number: {trimmed}"
        )));
    }

    let whole_units: u64 = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .map_err(|_| RewardError::InvalidAmount(format!("amount too large: {trimmed}")))?
    };

    let mut frac_padded = frac.to_owned();
    frac_padded.truncate(6);
    while frac_padded.len() < 6 {
        frac_padded.push('0');
    }
    let frac_units: u64 = frac_padded
        .parse()
        .map_err(|_| RewardError::InvalidAmount(format!("not a decimal number: {trimmed}")))?;

    let base_units = whole_units
        .checked_mul(BASE_UNITS_PER_TOKEN)
        .and_then(|units| units.checked_add(frac_units))
        .ok_or_else(|| RewardError::InvalidAmount(format!("amount too large: {trimmed}")))?;

    if base_units == 0 {
        return Err(RewardError::InvalidAmount(
            "amount must be greater than zero".to_owned(),
        ));
    }

    Ok(base_units)
}

/// Formats base units as a display amount with trailing zeros trimmed.
pub fn to_ui_amount(base_units: u64) -> String {
    let whole = base_units / BASE_UNITS_PER_TOKEN;
    let frac = base_units % BASE_UNITS_PER_TOKEN;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{frac:06}");
    format!("{whole}.{}", frac.trim_end_matches('0'))
}
