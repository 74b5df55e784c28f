//! Ledger access for the finalizer.
//!
//! [`LedgerClient`] is the seam the submitter talks to; [`RpcLedgerClient`]
//! is the Solana JSON-RPC implementation. Address derivation and instruction
//! encoding are plain functions so they can be checked without a network.

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{read_keypair_file, Keypair, Signature, Signer};
use solana_sdk::transaction::{Transaction, TransactionError};
use std::str::FromStr;
use tracing::{debug, info};

use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::models::MarketRecord;

pub const GLOBAL_CONFIG_SEED: &[u8] = b"global-config";
pub const MARKET_SEED: &[u8] = b"market";

/// `backend_authority` inside the GlobalConfig account: after the 8-byte
/// account discriminator and the 32-byte admin key.
const AUTHORITY_OFFSET: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureState {
    /// Not seen yet, or seen below the target commitment.
    Pending,
    Confirmed,
    /// Landed with a transaction error. Terminal.
    Failed(String),
}

/// A market ready to be finalized on the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeTarget {
    pub address: Pubkey,
    pub market_id: Option<[u8; 32]>,
}

impl FinalizeTarget {
    /// Parses the mirror row and, when the 32-byte market id is known, checks
    /// the address is the PDA the program would derive for it.
    pub fn from_record(record: &MarketRecord, program_id: &Pubkey) -> Result<Self, LedgerError> {
        let address = Pubkey::from_str(&record.ledger_address)
            .map_err(|_| LedgerError::InvalidAddress(record.ledger_address.clone()))?;

        let market_id = match record.market_id.as_deref() {
            None => None,
            Some(hex_id) => {
                let bytes = hex::decode(hex_id)
                    .ok()
                    .and_then(|b| <[u8; 32]>::try_from(b.as_slice()).ok())
                    .ok_or_else(|| LedgerError::InvalidAddress(format!("market id {}", hex_id)))?;
                Some(bytes)
            }
        };

        if let Some(id) = market_id {
            let (expected, _) = market_pda(program_id, &id);
            if expected != address {
                return Err(LedgerError::InvalidAddress(format!(
                    "{} is not the market PDA {}",
                    address, expected
                )));
            }
        }

        Ok(Self { address, market_id })
    }
}

pub fn global_config_pda(program_id: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[GLOBAL_CONFIG_SEED], program_id)
}

pub fn market_pda(program_id: &Pubkey, market_id: &[u8; 32]) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[MARKET_SEED, market_id], program_id)
}

/// `sha256("global:finalize_market")[..8]` followed by two `Option<u64>`
/// dispute tallies, both `None` on the no-dispute path.
pub fn finalize_instruction_data() -> Vec<u8> {
    let digest = Sha256::digest(b"global:finalize_market");
    let mut data = digest[..8].to_vec();
    let args: (Option<u64>, Option<u64>) = (None, None);
    // Serializing into a Vec cannot fail.
    if let Ok(encoded) = borsh::to_vec(&args) {
        data.extend_from_slice(&encoded);
    }
    data
}

pub fn finalize_instruction(program_id: &Pubkey, market: &Pubkey, authority: &Pubkey) -> Instruction {
    let (global_config, _) = global_config_pda(program_id);
    Instruction::new_with_bytes(
        *program_id,
        &finalize_instruction_data(),
        vec![
            AccountMeta::new_readonly(global_config, false),
            AccountMeta::new(*market, false),
            AccountMeta::new_readonly(*authority, true),
        ],
    )
}

/// Reads `backend_authority` out of raw GlobalConfig account data.
pub fn parse_backend_authority(data: &[u8]) -> Option<Pubkey> {
    let bytes = data.get(AUTHORITY_OFFSET..AUTHORITY_OFFSET + 32)?;
    Pubkey::try_from(bytes).ok()
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Public key transactions are signed with, if a keypair is loaded.
    fn signer(&self) -> Option<Pubkey>;

    async fn backend_authority(&self) -> Result<Pubkey, LedgerError>;

    /// Builds, signs and sends one `finalize_market`. Returns once the ledger
    /// has accepted it for processing, not once it is confirmed.
    async fn submit_finalize(&self, target: &FinalizeTarget) -> Result<Signature, LedgerError>;

    async fn signature_state(&self, signature: &Signature) -> Result<SignatureState, LedgerError>;
}

/// Startup check: the loaded keypair must be the program's backend authority.
pub async fn verify_authority(ledger: &dyn LedgerClient) -> anyhow::Result<()> {
    let Some(signer) = ledger.signer() else {
        return Ok(());
    };
    let authority = ledger.backend_authority().await?;
    if authority != signer {
        anyhow::bail!(
            "backend keypair {} is not the configured backend authority {}",
            signer,
            authority
        );
    }
    info!(authority = %authority, "🔑 Backend authority verified");
    Ok(())
}

pub struct RpcLedgerClient {
    rpc: Arc<RpcClient>,
    program_id: Pubkey,
    commitment: CommitmentConfig,
    keypair: Option<Keypair>,
}

impl RpcLedgerClient {
    pub fn new(program_id: Pubkey, cfg: &LedgerConfig) -> anyhow::Result<Self> {
        let keypair = match &cfg.keypair_path {
            Some(path) => Some(
                read_keypair_file(path)
                    .map_err(|e| anyhow::anyhow!("failed to read backend keypair {}: {}", path, e))?,
            ),
            None => None,
        };
        Ok(Self {
            rpc: Arc::new(RpcClient::new_with_commitment(cfg.rpc_url.clone(), cfg.commitment)),
            program_id,
            commitment: cfg.commitment,
            keypair,
        })
    }
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    fn signer(&self) -> Option<Pubkey> {
        self.keypair.as_ref().map(|k| k.pubkey())
    }

    async fn backend_authority(&self) -> Result<Pubkey, LedgerError> {
        let (address, _) = global_config_pda(&self.program_id);
        let account = self
            .rpc
            .get_account_with_commitment(&address, self.commitment)
            .await
            .map_err(classify)?
            .value
            .ok_or_else(|| LedgerError::Rejected(format!("global config {} not found", address)))?;

        if account.owner != self.program_id {
            return Err(LedgerError::Rejected(format!(
                "global config {} is owned by {}",
                address, account.owner
            )));
        }
        parse_backend_authority(&account.data)
            .ok_or_else(|| LedgerError::Rejected("global config account too short".into()))
    }

    async fn submit_finalize(&self, target: &FinalizeTarget) -> Result<Signature, LedgerError> {
        let keypair = self
            .keypair
            .as_ref()
            .ok_or_else(|| LedgerError::Rejected("no backend keypair loaded".into()))?;

        let ix = finalize_instruction(&self.program_id, &target.address, &keypair.pubkey());
        let blockhash = self.rpc.get_latest_blockhash().await.map_err(classify)?;
        let tx = Transaction::new_signed_with_payer(&[ix], Some(&keypair.pubkey()), &[keypair], blockhash);

        let signature = self
            .rpc
            .send_transaction_with_config(
                &tx,
                RpcSendTransactionConfig {
                    preflight_commitment: Some(self.commitment.commitment),
                    ..RpcSendTransactionConfig::default()
                },
            )
            .await
            .map_err(classify)?;

        debug!(market = %target.address, signature = %signature, "finalize_market sent");
        Ok(signature)
    }

    async fn signature_state(&self, signature: &Signature) -> Result<SignatureState, LedgerError> {
        let statuses = self
            .rpc
            .get_signature_statuses(&[*signature])
            .await
            .map_err(classify)?
            .value;

        Ok(match statuses.into_iter().next().flatten() {
            None => SignatureState::Pending,
            Some(status) => match &status.err {
                Some(err) => SignatureState::Failed(err.to_string()),
                None if status.satisfies_commitment(self.commitment) => SignatureState::Confirmed,
                None => SignatureState::Pending,
            },
        })
    }
}

/// Program and runtime errors are final; transport problems and stale
/// blockhashes are worth another attempt.
fn classify(err: ClientError) -> LedgerError {
    if let Some(tx_err) = err.get_transaction_error() {
        return match tx_err {
            TransactionError::BlockhashNotFound => LedgerError::Transient(tx_err.to_string()),
            other => LedgerError::Rejected(other.to_string()),
        };
    }
    match err.kind() {
        ClientErrorKind::SigningError(e) => LedgerError::Rejected(e.to_string()),
        _ => LedgerError::Transient(err.to_string()),
    }
}
