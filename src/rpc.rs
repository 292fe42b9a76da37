// Solana RPC wrapper
//
// Nonblocking client plus the process-lifetime caches: native balance
// (TTL = balance refresh interval) and resolved address lookup tables
// (60 s TTL, per-address coalescing).

use anyhow::{Context, Result};
use dashmap::DashMap;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::{RpcSendTransactionConfig, RpcSimulateTransactionConfig};
use solana_sdk::address_lookup_table::state::AddressLookupTable;
use solana_sdk::address_lookup_table::AddressLookupTableAccount;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature};
use solana_sdk::signer::Signer;
use solana_sdk::transaction::{Transaction, VersionedTransaction};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

const RPC_TIMEOUT: Duration = Duration::from_secs(20);
const LOOKUP_TABLE_TTL: Duration = Duration::from_secs(60);
const CONFIRM_POLL_INTERVAL: Duration = Duration::from_millis(500);
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(45);

pub fn parse_commitment(name: &str) -> CommitmentConfig {
    match name {
        "processed" => CommitmentConfig::processed(),
        "finalized" => CommitmentConfig::finalized(),
        _ => CommitmentConfig::confirmed(),
    }
}

struct LutSlot {
    inserted: Instant,
    cell: Arc<OnceCell<Option<AddressLookupTableAccount>>>,
}

pub struct SolanaRpc {
    client: RpcClient,
    commitment: CommitmentConfig,
    balance_cache: DashMap<Pubkey, (Instant, u64)>,
    lut_cache: DashMap<Pubkey, LutSlot>,
}

impl SolanaRpc {
    pub fn new(url: &str, commitment: &str) -> Self {
        let commitment = parse_commitment(commitment);
        let client =
            RpcClient::new_with_timeout_and_commitment(url.to_string(), RPC_TIMEOUT, commitment);
        info!("✅ RPC client initialized: {}", url);
        Self {
            client,
            commitment,
            balance_cache: DashMap::new(),
            lut_cache: DashMap::new(),
        }
    }

    pub fn commitment(&self) -> CommitmentConfig {
        self.commitment
    }

    /// Raw client, for callers that need endpoints not wrapped here
    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    /// Latest blockhash at "confirmed" plus its last-valid-block-height
    pub async fn latest_blockhash(&self) -> Result<(Hash, u64)> {
        self.client
            .get_latest_blockhash_with_commitment(CommitmentConfig::confirmed())
            .await
            .context("failed to fetch latest blockhash")
    }

    /// Native balance with caller-supplied cache TTL
    pub async fn balance_cached(&self, pubkey: &Pubkey, ttl_ms: u64) -> Result<u64> {
        let ttl = Duration::from_millis(ttl_ms.max(1));
        if let Some(entry) = self.balance_cache.get(pubkey) {
            let (fetched, balance) = *entry;
            if fetched.elapsed() < ttl {
                return Ok(balance);
            }
        }
        let balance = self
            .client
            .get_balance(pubkey)
            .await
            .with_context(|| format!("failed to fetch balance for {}", pubkey))?;
        self.balance_cache.insert(*pubkey, (Instant::now(), balance));
        Ok(balance)
    }

    /// Simulate at "processed"; Ok(None) = clean, Ok(Some(err)) = would fail
    pub async fn simulate(&self, tx: &VersionedTransaction) -> Result<Option<String>> {
        let config = RpcSimulateTransactionConfig {
            sig_verify: false,
            commitment: Some(CommitmentConfig::processed()),
            ..Default::default()
        };
        let response = self
            .client
            .simulate_transaction_with_config(tx, config)
            .await
            .context("simulation rpc failed")?;
        match response.value.err {
            Some(err) => {
                if let Some(logs) = &response.value.logs {
                    for log in logs.iter().rev().take(5) {
                        debug!("   sim log: {}", log);
                    }
                }
                Ok(Some(format!("{:?}", err)))
            }
            None => Ok(None),
        }
    }

    /// Send a signed transaction (preflight skipped; bounded RPC retries)
    pub async fn send(&self, tx: &VersionedTransaction) -> Result<Signature> {
        let config = RpcSendTransactionConfig {
            skip_preflight: true,
            max_retries: Some(2),
            ..Default::default()
        };
        let signature = self
            .client
            .send_transaction_with_config(tx, config)
            .await
            .context("failed to send transaction")?;
        info!("📤 Transaction sent: {}", signature);
        Ok(signature)
    }

    pub async fn send_legacy(&self, tx: &Transaction) -> Result<Signature> {
        let config = RpcSendTransactionConfig {
            skip_preflight: false,
            max_retries: Some(2),
            ..Default::default()
        };
        self.client
            .send_transaction_with_config(tx, config)
            .await
            .context("failed to send transaction")
    }

    /// Poll until the signature reaches the client commitment, the chain
    /// passes `last_valid_block_height`, or the poll deadline expires.
    pub async fn confirm(
        &self,
        signature: &Signature,
        last_valid_block_height: Option<u64>,
    ) -> Result<bool> {
        let deadline = Instant::now() + CONFIRM_TIMEOUT;
        loop {
            let statuses = self
                .client
                .get_signature_statuses(&[*signature])
                .await
                .context("failed to poll signature status")?;
            if let Some(Some(status)) = statuses.value.first() {
                if status.err.is_some() {
                    warn!("❌ Transaction failed on-chain: {} ({:?})", signature, status.err);
                    return Ok(false);
                }
                if status.satisfies_commitment(self.commitment) {
                    debug!("✅ Confirmed: {}", signature);
                    return Ok(true);
                }
            }

            if let Some(lvbh) = last_valid_block_height {
                let height = self
                    .client
                    .get_block_height()
                    .await
                    .context("failed to fetch block height")?;
                if height > lvbh {
                    warn!(
                        "⏰ Blockhash expired before confirmation: {} (height {} > {})",
                        signature, height, lvbh
                    );
                    return Ok(false);
                }
            }

            if Instant::now() >= deadline {
                anyhow::bail!("confirmation timed out for {}", signature);
            }
            tokio::time::sleep(CONFIRM_POLL_INTERVAL).await;
        }
    }

    /// Resolve lookup tables through the cache; unknown addresses are
    /// dropped. Input order is preserved for the survivors, duplicates
    /// collapse to their first occurrence.
    pub async fn lookup_tables(
        &self,
        addresses: &[Pubkey],
    ) -> Result<Vec<AddressLookupTableAccount>> {
        let mut seen = std::collections::HashSet::new();
        let mut resolved = Vec::new();
        for address in addresses {
            if !seen.insert(*address) {
                continue;
            }
            if let Some(table) = self.lookup_table(address).await? {
                resolved.push(table);
            }
        }
        Ok(resolved)
    }

    async fn lookup_table(&self, address: &Pubkey) -> Result<Option<AddressLookupTableAccount>> {
        let cell = {
            let mut entry = self.lut_cache.entry(*address).or_insert_with(|| LutSlot {
                inserted: Instant::now(),
                cell: Arc::new(OnceCell::new()),
            });
            if entry.inserted.elapsed() > LOOKUP_TABLE_TTL && entry.cell.initialized() {
                *entry = LutSlot {
                    inserted: Instant::now(),
                    cell: Arc::new(OnceCell::new()),
                };
            }
            entry.cell.clone()
        };

        let result = cell
            .get_or_try_init(|| async {
                match self.client.get_account(address).await {
                    Ok(account) => {
                        let table = AddressLookupTable::deserialize(&account.data)
                            .map_err(|e| anyhow::anyhow!("bad lookup table {}: {:?}", address, e))?;
                        Ok::<_, anyhow::Error>(Some(AddressLookupTableAccount {
                            key: *address,
                            addresses: table.addresses.to_vec(),
                        }))
                    }
                    Err(e) => {
                        let msg = e.to_string();
                        if msg.contains("AccountNotFound") || msg.contains("could not find account") {
                            Ok(None)
                        } else {
                            Err(anyhow::anyhow!("lookup table fetch {}: {}", address, e))
                        }
                    }
                }
            })
            .await
            .map(|v| v.clone());

        if result.is_err() {
            if let Some(entry) = self.lut_cache.get(address) {
                if Arc::ptr_eq(&entry.cell, &cell) {
                    drop(entry);
                    self.lut_cache.remove(address);
                }
            }
        }
        result
    }

    /// Create the associated token accounts for every mint, idempotently.
    /// Returns the number of accounts actually created; when all exist
    /// already, no transaction is signed or sent.
    pub async fn setup_wallet(&self, wallet: &Keypair, mints: &[Pubkey]) -> Result<usize> {
        let owner = wallet.pubkey();
        let mut instructions = Vec::new();
        let mut missing = Vec::new();

        let mut unique: Vec<Pubkey> = mints.to_vec();
        unique.sort();
        unique.dedup();

        for mint in &unique {
            let ata = spl_associated_token_account::get_associated_token_address(&owner, mint);
            match self.client.get_account(&ata).await {
                Ok(_) => debug!("token account exists for mint {}", mint),
                Err(_) => {
                    missing.push(*mint);
                    instructions.push(
                        spl_associated_token_account::instruction::create_associated_token_account_idempotent(
                            &owner,
                            &owner,
                            mint,
                            &spl_token::id(),
                        ),
                    );
                }
            }
        }

        if instructions.is_empty() {
            info!("✅ All {} token accounts already exist", unique.len());
            return Ok(0);
        }

        info!("🛠️ Creating {} token accounts: {:?}", missing.len(), missing);
        let (blockhash, last_valid_block_height) = self.latest_blockhash().await?;
        let tx = Transaction::new_signed_with_payer(
            &instructions,
            Some(&owner),
            &[wallet],
            blockhash,
        );
        let signature = self.send_legacy(&tx).await?;
        let confirmed = self.confirm(&signature, Some(last_valid_block_height)).await?;
        if !confirmed {
            anyhow::bail!("setup-wallet transaction {} not confirmed", signature);
        }
        info!("✅ Token accounts created: {}", signature);
        Ok(missing.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commitment() {
        assert!(parse_commitment("processed").is_processed());
        assert!(parse_commitment("confirmed").is_confirmed());
        assert!(parse_commitment("finalized").is_finalized());
        // Unknown falls back to confirmed
        assert!(parse_commitment("other").is_confirmed());
    }
}
