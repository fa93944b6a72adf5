use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcProgramAccountsConfig;
use solana_client::rpc_filter::RpcFilterType;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer, read_keypair_file};
use solana_sdk::system_program;
use solana_sdk::transaction::Transaction;
use tracing::{debug, info};

pub const TOKEN_PROGRAM_ID: Pubkey = pubkey!("TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA");
pub const ASSOCIATED_TOKEN_PROGRAM_ID: Pubkey =
    pubkey!("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL");

/// Expected byte length of a pool-stats account: 8 discriminator +
/// 32 authority + 8 total_rewards + 8 total_claims.
pub const POOL_STATS_SIZE: usize = 56;

/// SPL token account layout: the u64 amount sits at bytes 64..72.
const TOKEN_AMOUNT_OFFSET: usize = 64;

/// Identifies which program, mint, and network the reward flows talk to.
/// Every value is externally supplied configuration with a hardcoded
/// fallback; none participates in business logic beyond addressing.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub program_id: Pubkey,
    pub usdc_mint: Pubkey,
    pub pool_stats_size: usize,
}

impl ChainConfig {
    /// Reads `SMILE_RPC_URL`, `SMILE_PROGRAM_ID`, and `SMILE_USDC_MINT`
    /// from the environment, falling back to the devnet deployment.
    pub fn from_env() -> Result<Self> {
        let rpc_url = std::env::var("SMILE_RPC_URL")
            .unwrap_or_else(|_| "https://api.devnet.solana.com".to_string());

        let program_id = match std::env::var("SMILE_PROGRAM_ID") {
            Ok(value) => value
                .parse::<Pubkey>()
                .context("SMILE_PROGRAM_ID is not a valid pubkey")?,
            Err(_) => pubkey!("FQn8MWGWrtSsittvBV8qfJhKRhaqZA68JSUAc8hJrtPZ"),
        };

        let usdc_mint = match std::env::var("SMILE_USDC_MINT") {
            Ok(value) => value
                .parse::<Pubkey>()
                .context("SMILE_USDC_MINT is not a valid pubkey")?,
            Err(_) => pubkey!("Dk4r51T9fVg5UVq2rT5FC9KA7oGAyiahAQUEjS7QDAt1"),
        };

        Ok(Self {
            rpc_url,
            program_id,
            usdc_mint,
            pool_stats_size: POOL_STATS_SIZE,
        })
    }
}

// ── Address derivation ───────────────────────────────────────────────

pub fn pool_authority(program_id: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[b"pool"], program_id)
}

pub fn user_stats_address(program_id: &Pubkey, user: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[b"user_stats", user.as_ref()], program_id)
}

/// Associated token address for any owner, on- or off-curve (the pool
/// authority PDA owns its token account the same way a user does).
pub fn associated_token_address(owner: &Pubkey, mint: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[owner.as_ref(), TOKEN_PROGRAM_ID.as_ref(), mint.as_ref()],
        &ASSOCIATED_TOKEN_PROGRAM_ID,
    )
    .0
}

// ── Instruction builders ─────────────────────────────────────────────
//
// The reward program is an Anchor deployment; instruction data is the
// 8-byte method discriminator followed by little-endian args. Account
// orders mirror the program's account structs.

pub fn anchor_discriminator(method: &str) -> [u8; 8] {
    let digest = Sha256::digest(format!("global:{method}").as_bytes());
    let mut discriminator = [0_u8; 8];
    discriminator.copy_from_slice(&digest[..8]);
    discriminator
}

pub fn create_associated_token_account_ix(
    payer: &Pubkey,
    owner: &Pubkey,
    mint: &Pubkey,
) -> Instruction {
    let ata = associated_token_address(owner, mint);
    Instruction {
        program_id: ASSOCIATED_TOKEN_PROGRAM_ID,
        accounts: vec![
            AccountMeta::new(*payer, true),
            AccountMeta::new(ata, false),
            AccountMeta::new_readonly(*owner, false),
            AccountMeta::new_readonly(*mint, false),
            AccountMeta::new_readonly(system_program::id(), false),
            AccountMeta::new_readonly(TOKEN_PROGRAM_ID, false),
        ],
        data: Vec::new(),
    }
}

pub fn initialize_user_stats_ix(
    program_id: &Pubkey,
    user: &Pubkey,
    user_stats: &Pubkey,
    bump: u8,
) -> Instruction {
    let mut data = anchor_discriminator("initialize_user_stats").to_vec();
    data.push(bump);
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*user, true),
            AccountMeta::new(*user_stats, false),
            AccountMeta::new_readonly(system_program::id(), false),
        ],
        data,
    }
}

/// `pool_stats` is a fresh keypair-backed account and must co-sign.
pub fn initialize_pool_ix(
    program_id: &Pubkey,
    authority: &Pubkey,
    pool_stats: &Pubkey,
    bump: u8,
) -> Instruction {
    let (pool_authority, _) = pool_authority(program_id);
    let mut data = anchor_discriminator("initialize_pool").to_vec();
    data.push(bump);
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*authority, true),
            AccountMeta::new(*pool_stats, true),
            AccountMeta::new_readonly(pool_authority, false),
            AccountMeta::new_readonly(system_program::id(), false),
        ],
        data,
    }
}

pub fn claim_reward_ix(
    program_id: &Pubkey,
    user: &Pubkey,
    user_stats: &Pubkey,
    pool_stats: &Pubkey,
    pool_token: &Pubkey,
    user_token: &Pubkey,
) -> Instruction {
    let (pool_authority, _) = pool_authority(program_id);
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new_readonly(*user, true),
            AccountMeta::new(*user_stats, false),
            AccountMeta::new(*pool_stats, false),
            AccountMeta::new(*pool_token, false),
            AccountMeta::new(*user_token, false),
            AccountMeta::new_readonly(pool_authority, false),
            AccountMeta::new_readonly(TOKEN_PROGRAM_ID, false),
        ],
        data: anchor_discriminator("claim_reward").to_vec(),
    }
}

pub fn donate_ix(
    program_id: &Pubkey,
    donor: &Pubkey,
    donor_token: &Pubkey,
    pool_token: &Pubkey,
    base_units: u64,
) -> Instruction {
    let mut data = anchor_discriminator("donate").to_vec();
    data.extend_from_slice(&base_units.to_le_bytes());
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new_readonly(*donor, true),
            AccountMeta::new(*donor_token, false),
            AccountMeta::new(*pool_token, false),
            AccountMeta::new_readonly(TOKEN_PROGRAM_ID, false),
        ],
        data,
    }
}

/// Extracts the amount from raw SPL token account data.
pub fn parse_token_amount(data: &[u8]) -> Result<u64> {
    let bytes = data
        .get(TOKEN_AMOUNT_OFFSET..TOKEN_AMOUNT_OFFSET + 8)
        .ok_or_else(|| anyhow!("token account data too short: {} bytes", data.len()))?;
    Ok(u64::from_le_bytes(bytes.try_into()?))
}

// ── Gateway ──────────────────────────────────────────────────────────

/// The chain operations the reward flows need. Kept narrow so the
/// orchestration core can run against a mock in tests.
#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// The connected signing identity; pays for and signs every
    /// submitted transaction.
    fn payer(&self) -> Pubkey;

    async fn account_exists(&self, address: &Pubkey) -> Result<bool>;

    /// `None` when the token account does not exist yet.
    async fn token_account_base_units(&self, address: &Pubkey) -> Result<Option<u64>>;

    async fn program_accounts_by_size(
        &self,
        program_id: &Pubkey,
        size: usize,
    ) -> Result<Vec<Pubkey>>;

    async fn send_and_confirm(
        &self,
        instructions: &[Instruction],
        extra_signers: &[&Keypair],
    ) -> Result<Signature>;
}

/// RPC-backed gateway at confirmed commitment.
pub struct RpcGateway {
    client: RpcClient,
    payer: Keypair,
}

impl RpcGateway {
    pub fn new(rpc_url: String, payer: Keypair) -> Self {
        Self {
            client: RpcClient::new_with_commitment(rpc_url, CommitmentConfig::confirmed()),
            payer,
        }
    }
}

#[async_trait]
impl ChainGateway for RpcGateway {
    fn payer(&self) -> Pubkey {
        self.payer.pubkey()
    }

    async fn account_exists(&self, address: &Pubkey) -> Result<bool> {
        let response = self
            .client
            .get_account_with_commitment(address, self.client.commitment())
            .await
            .context("account lookup")?;

        let exists = response.value.is_some();
        debug!("account {} exists: {}", address, exists);
        Ok(exists)
    }

    async fn token_account_base_units(&self, address: &Pubkey) -> Result<Option<u64>> {
        let response = self
            .client
            .get_account_with_commitment(address, self.client.commitment())
            .await
            .context("token account lookup")?;

        match response.value {
            Some(account) => Ok(Some(parse_token_amount(&account.data)?)),
            None => Ok(None),
        }
    }

    async fn program_accounts_by_size(
        &self,
        program_id: &Pubkey,
        size: usize,
    ) -> Result<Vec<Pubkey>> {
        let accounts = self
            .client
            .get_program_accounts_with_config(
                program_id,
                RpcProgramAccountsConfig {
                    filters: Some(vec![RpcFilterType::DataSize(size as u64)]),
                    ..Default::default()
                },
            )
            .await
            .context("program account scan")?;

        debug!(
            "{} program account(s) of {} bytes under {}",
            accounts.len(),
            size,
            program_id
        );
        Ok(accounts.into_iter().map(|(address, _)| address).collect())
    }

    async fn send_and_confirm(
        &self,
        instructions: &[Instruction],
        extra_signers: &[&Keypair],
    ) -> Result<Signature> {
        let latest_blockhash = self
            .client
            .get_latest_blockhash()
            .await
            .context("latest blockhash")?;

        let mut signers: Vec<&Keypair> = vec![&self.payer];
        signers.extend_from_slice(extra_signers);

        let transaction = Transaction::new_signed_with_payer(
            instructions,
            Some(&self.payer.pubkey()),
            &signers,
            latest_blockhash,
        );

        info!(
            "submitting transaction with {} instruction(s), {} signer(s)",
            instructions.len(),
            signers.len()
        );
        let signature = self
            .client
            .send_and_confirm_transaction(&transaction)
            .await
            .context("transaction submission")?;
        info!("transaction confirmed: {}", signature);

        Ok(signature)
    }
}

/// Loads the service's signing keypair. `SMILE_KEYPAIR` overrides the
/// standard Solana CLI location.
pub fn load_payer_keypair() -> Result<Keypair> {
    let path = match std::env::var("SMILE_KEYPAIR") {
        Ok(value) => value,
        Err(_) => {
            let home = std::env::var("HOME").context("HOME is not set")?;
            format!("{home}/.config/solana/id.json")
        }
    };

    read_keypair_file(&path).map_err(|err| anyhow!("failed to read keypair file {path}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program_id() -> Pubkey {
        "FQn8MWGWrtSsittvBV8qfJhKRhaqZA68JSUAc8hJrtPZ"
            .parse()
            .unwrap()
    }

    #[test]
    fn derivations_are_deterministic() {
        let user = Pubkey::new_unique();
        assert_eq!(
            user_stats_address(&program_id(), &user),
            user_stats_address(&program_id(), &user)
        );
        assert_eq!(pool_authority(&program_id()), pool_authority(&program_id()));
    }

    #[test]
    fn user_stats_addresses_differ_per_user() {
        let a = user_stats_address(&program_id(), &Pubkey::new_unique()).0;
        let b = user_stats_address(&program_id(), &Pubkey::new_unique()).0;
        assert_ne!(a, b);
    }

    #[test]
    fn pool_authority_owns_a_derivable_token_account() {
        let (authority, _) = pool_authority(&program_id());
        let mint = Pubkey::new_unique();
        // Off-curve owner must still derive cleanly.
        let ata = associated_token_address(&authority, &mint);
        assert_ne!(ata, authority);
    }

    #[test]
    fn discriminators_are_stable_and_distinct() {
        assert_eq!(
            anchor_discriminator("claim_reward"),
            anchor_discriminator("claim_reward")
        );
        assert_ne!(
            anchor_discriminator("claim_reward"),
            anchor_discriminator("donate")
        );
    }

    #[test]
    fn claim_instruction_account_order_matches_program() {
        let user = Pubkey::new_unique();
        let user_stats = Pubkey::new_unique();
        let pool_stats = Pubkey::new_unique();
        let pool_token = Pubkey::new_unique();
        let user_token = Pubkey::new_unique();

        let ix = claim_reward_ix(
            &program_id(),
            &user,
            &user_stats,
            &pool_stats,
            &pool_token,
            &user_token,
        );

        assert_eq!(ix.program_id, program_id());
        assert_eq!(ix.accounts.len(), 7);
        assert_eq!(ix.accounts[0].pubkey, user);
        assert!(ix.accounts[0].is_signer);
        assert_eq!(ix.accounts[1].pubkey, user_stats);
        assert_eq!(ix.accounts[2].pubkey, pool_stats);
        assert_eq!(ix.accounts[3].pubkey, pool_token);
        assert_eq!(ix.accounts[4].pubkey, user_token);
        assert_eq!(ix.accounts[5].pubkey, pool_authority(&program_id()).0);
        assert_eq!(ix.accounts[6].pubkey, TOKEN_PROGRAM_ID);
        assert_eq!(ix.data, anchor_discriminator("claim_reward").to_vec());
    }

    #[test]
    fn donate_instruction_encodes_amount_little_endian() {
        let donor = Pubkey::new_unique();
        let ix = donate_ix(
            &program_id(),
            &donor,
            &Pubkey::new_unique(),
            &Pubkey::new_unique(),
            1_500_000,
        );

        assert_eq!(&ix.data[..8], &anchor_discriminator("donate"));
        assert_eq!(&ix.data[8..], &1_500_000_u64.to_le_bytes());
    }

    #[test]
    fn pool_stats_creation_requires_its_signature() {
        let authority = Pubkey::new_unique();
        let pool_stats = Pubkey::new_unique();
        let ix = initialize_pool_ix(&program_id(), &authority, &pool_stats, 254);

        assert!(ix.accounts[0].is_signer);
        assert_eq!(ix.accounts[1].pubkey, pool_stats);
        assert!(ix.accounts[1].is_signer);
        assert_eq!(*ix.data.last().unwrap(), 254);
    }

    #[test]
    fn token_amount_parses_from_spl_layout() {
        let mut data = vec![0_u8; 165];
        data[64..72].copy_from_slice(&42_000_000_u64.to_le_bytes());
        assert_eq!(parse_token_amount(&data).unwrap(), 42_000_000);

        assert!(parse_token_amount(&[0_u8; 10]).is_err());
    }
}
