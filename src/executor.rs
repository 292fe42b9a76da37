// Candidate execution
//
// Four paths, selected by the candidate tag and execution strategy:
//   atomic    merge all legs into one versioned transaction, optionally
//             submitted as a block-engine bundle (tip inside the tx)
//   swap      one transaction per leg via the Primary swap endpoint
//   ultra     pre-built order transactions, signed and posted to execute
//   secondary OpenOcean per-leg transactions, sent in order
//
// Dry-run builds (and optionally simulates) but never sends. Live mode
// optionally preflights at "processed" and refuses to send on any
// simulation error.

use anyhow::{Context, Result};
use base64::Engine;
use serde_json::json;
use solana_sdk::signature::{Keypair, Signature};
use solana_sdk::signer::Signer;
use solana_sdk::transaction::VersionedTransaction;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{Config, ExecutionStrategy, Mode, PriorityFeeStrategy};
use crate::event_log::{EventLog, EventType};
use crate::jito_client::{choose_tip_account, BundleOutcome, JitoBundleClient};
use crate::jupiter::JupiterQuoteClient;
use crate::openocean::{decode_transaction_bytes, OpenOceanClient};
use crate::pairs::PairConfig;
use crate::priority_fee::PriorityFeeEstimator;
use crate::rpc::SolanaRpc;
use crate::tx_builder::build_atomic_transaction;
use crate::types::{Candidate, LegQuote, LoopCandidate, NATIVE_MINT};
use crate::ultra::UltraClient;

/// What happened to a fired candidate
#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub executed: bool,
    pub signatures: Vec<String>,
    pub bundle_id: Option<String>,
    pub fallback_rpc: bool,
    pub skip_reason: Option<String>,
}

impl ExecutionReport {
    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            skip_reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// RPC fallback applies only to terminal bundle failures (rejected,
/// dropped, or a failed submission), and only when the operator opted
/// in and asked to wait for the result. A wait that times out is
/// neither: the caller returns without confirmation.
pub fn should_fallback(outcome: &BundleOutcome, wait_ms: u64, fallback_rpc: bool) -> bool {
    fallback_rpc && wait_ms > 0 && outcome.is_failure()
}

/// Sign an aggregator-built transaction: bincode-deserialize, then
/// re-wrap the message with our signature
pub fn sign_transaction_bytes(bytes: &[u8], wallet: &Keypair) -> Result<VersionedTransaction> {
    let unsigned: VersionedTransaction =
        bincode::deserialize(bytes).context("failed to deserialize transaction")?;
    VersionedTransaction::try_new(unsigned.message, &[wallet])
        .context("failed to sign transaction")
}

pub fn sign_transaction_base64(tx_base64: &str, wallet: &Keypair) -> Result<VersionedTransaction> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(tx_base64.trim())
        .context("transaction is not valid base64")?;
    sign_transaction_bytes(&bytes, wallet)
}

pub struct Executor {
    pub cfg: Arc<Config>,
    pub rpc: Arc<SolanaRpc>,
    pub wallet: Arc<Keypair>,
    pub jupiter: Arc<JupiterQuoteClient>,
    pub ultra: Arc<UltraClient>,
    pub openocean: Option<Arc<OpenOceanClient>>,
    pub jito: Option<Arc<JitoBundleClient>>,
    pub priority_fees: Arc<PriorityFeeEstimator>,
    pub events: Arc<EventLog>,
}

impl Executor {
    fn live(&self) -> bool {
        self.cfg.mode == Mode::Live
    }

    async fn skip(&self, pair: &str, reason: &str) -> ExecutionReport {
        self.events
            .emit(EventType::Skip, json!({"pair": pair, "reason": reason}))
            .await;
        ExecutionReport::skipped(reason)
    }

    async fn cu_price(&self, pair: &PairConfig) -> u64 {
        let pair_price = pair
            .cu_price_micro_lamports
            .unwrap_or(self.cfg.fees.cu_price_micro_lamports);
        match self.cfg.fees.priority_fee_strategy {
            PriorityFeeStrategy::Off => pair_price,
            _ => self
                .priority_fees
                .cu_price(self.rpc.client())
                .await
                .max(pair_price),
        }
    }

    /// Live-mode native balance gate (TTL-cached)
    async fn balance_ok(&self) -> Result<bool> {
        if !self.live() || self.cfg.min_balance_lamports == 0 {
            return Ok(true);
        }
        let balance = self
            .rpc
            .balance_cached(&self.wallet.pubkey(), self.cfg.balance_refresh_ms)
            .await?;
        Ok(balance >= self.cfg.min_balance_lamports)
    }

    /// Preflight a signed transaction; Ok(true) = proceed to send
    async fn preflight(&self, pair: &str, tx: &VersionedTransaction) -> Result<bool> {
        match self.rpc.simulate(tx).await? {
            None => {
                self.events
                    .emit(EventType::Preflight, json!({"pair": pair, "ok": true}))
                    .await;
                Ok(true)
            }
            Some(err) => {
                self.events
                    .emit(
                        EventType::Preflight,
                        json!({"pair": pair, "ok": false, "error": err}),
                    )
                    .await;
                Ok(false)
            }
        }
    }

    pub async fn execute(&self, pair: &PairConfig, candidate: &Candidate) -> Result<ExecutionReport> {
        if !self.balance_ok().await? {
            return Ok(self.skip(&pair.name, "min-balance").await);
        }

        match candidate {
            Candidate::Loop(inner) if inner.ultra.is_some() => {
                self.execute_ultra(pair, inner).await
            }
            Candidate::Loop(inner) => match self.cfg.execution_strategy {
                ExecutionStrategy::Atomic => {
                    self.execute_atomic(pair, candidate, &[&inner.leg1, &inner.leg2])
                        .await
                }
                ExecutionStrategy::Sequential => self.execute_sequential_swap(pair, inner).await,
            },
            // Triangular candidates are priced as one transaction and
            // always travel atomically
            Candidate::Triangular(inner) => {
                self.execute_atomic(pair, candidate, &[&inner.leg1, &inner.leg2, &inner.leg3])
                    .await
            }
            Candidate::LoopSecondary(inner) => self.execute_secondary(pair, inner).await,
        }
    }

    // ---- atomic -------------------------------------------------------

    async fn execute_atomic(
        &self,
        pair: &PairConfig,
        candidate: &Candidate,
        legs: &[&LegQuote],
    ) -> Result<ExecutionReport> {
        let user = self.wallet.pubkey().to_string();
        let cu_price = self.cu_price(pair).await;
        let cu_limit = pair.cu_limit.unwrap_or(self.cfg.fees.cu_limit);

        // All legs' instruction groups, fetched concurrently
        let bundles = futures::future::try_join_all(
            legs.iter()
                .copied()
                .map(|leg| self.jupiter.build_swap_instructions(leg, &user, None)),
        )
        .await?;

        let use_bundle = self.jito.is_some() && self.cfg.jito.enabled;
        let tip_lamports = candidate.tip_lamports();
        let tip = if use_bundle && tip_lamports > 0 {
            Some((
                choose_tip_account(self.cfg.jito.tip_account.as_deref()),
                tip_lamports,
            ))
        } else {
            None
        };

        let (tx, last_valid_block_height) = build_atomic_transaction(
            &self.rpc,
            &self.wallet,
            &bundles,
            cu_limit,
            cu_price,
            tip,
        )
        .await?;

        self.events
            .emit(
                EventType::Built,
                json!({
                    "pair": pair.name,
                    "legs": legs.len(),
                    "atomic": true,
                    "tipLamports": tip.map(|(_, l)| l).unwrap_or(0),
                    "cuLimit": cu_limit,
                    "cuPrice": cu_price,
                    "lastValidBlockHeight": last_valid_block_height,
                }),
            )
            .await;

        if !self.live() {
            if self.cfg.dry_run_simulate {
                let err = self.rpc.simulate(&tx).await?;
                self.events
                    .emit(
                        EventType::Simulate,
                        json!({"pair": pair.name, "ok": err.is_none(), "error": err}),
                    )
                    .await;
            }
            return Ok(self.skip(&pair.name, "dry-run").await);
        }

        if self.cfg.live_preflight_simulate && !self.preflight(&pair.name, &tx).await? {
            return Ok(self.skip(&pair.name, "preflight-failed").await);
        }

        if use_bundle {
            return self
                .submit_bundle(pair, &bundles, tx, cu_limit, cu_price, last_valid_block_height)
                .await;
        }

        let signature = self.rpc.send(&tx).await?;
        self.confirm_and_report(pair, signature, Some(last_valid_block_height), None, false)
            .await
    }

    async fn submit_bundle(
        &self,
        pair: &PairConfig,
        leg_bundles: &[crate::types::SwapInstructionBundle],
        tx: VersionedTransaction,
        cu_limit: u32,
        cu_price: u64,
        last_valid_block_height: u64,
    ) -> Result<ExecutionReport> {
        let jito = self.jito.as_ref().expect("bundle path requires jito client");
        let wait_ms = self.cfg.jito.wait_ms;
        let fallback_enabled = self.cfg.jito.fallback_rpc;
        let signature = tx.signatures[0];

        let submit = jito.submit_bundle(std::slice::from_ref(&tx)).await;
        let outcome = match &submit {
            Ok(bundle_id) => {
                self.events
                    .emit(
                        EventType::JitoBundle,
                        json!({"pair": pair.name, "bundleId": bundle_id, "waitMs": wait_ms}),
                    )
                    .await;
                if wait_ms == 0 {
                    // Fire-and-forget: no confirmation requested
                    return Ok(ExecutionReport {
                        executed: true,
                        signatures: vec![signature.to_string()],
                        bundle_id: Some(bundle_id.clone()),
                        ..Default::default()
                    });
                }
                jito.wait_for_result(bundle_id, wait_ms).await
            }
            Err(e) => {
                warn!("❌ bundle submission failed: {:#}", e);
                self.events
                    .emit(
                        EventType::JitoBundle,
                        json!({"pair": pair.name, "error": format!("{:#}", e)}),
                    )
                    .await;
                BundleOutcome::Rejected
            }
        };

        if should_fallback(&outcome, wait_ms, fallback_enabled) {
            info!("🔁 bundle {:?}, rebuilding without tip for RPC fallback", outcome);
            // Same legs, no tip transfer; fresh blockhash
            let (fallback_tx, lvbh) = build_atomic_transaction(
                &self.rpc,
                &self.wallet,
                leg_bundles,
                cu_limit,
                cu_price,
                None,
            )
            .await?;
            let rpc_signature = self.rpc.send(&fallback_tx).await?;
            return self
                .confirm_and_report(
                    pair,
                    rpc_signature,
                    Some(lvbh),
                    submit.ok(),
                    true,
                )
                .await;
        }

        if outcome.is_failure() {
            let reason = format!("bundle-{:?}", outcome).to_lowercase();
            return Ok(self.skip(&pair.name, &reason).await);
        }

        if outcome == BundleOutcome::Pending {
            // Wait deadline passed without a terminal status: return
            // without confirmation
            let bundle_id = submit.ok();
            self.events
                .emit(
                    EventType::JitoBundle,
                    json!({
                        "pair": pair.name,
                        "bundleId": bundle_id.clone(),
                        "result": "wait-timeout",
                        "signature": signature.to_string(),
                    }),
                )
                .await;
            return Ok(ExecutionReport {
                executed: true,
                signatures: vec![signature.to_string()],
                bundle_id,
                ..Default::default()
            });
        }

        // Landed: confirm the original signature
        self.confirm_and_report(
            pair,
            signature,
            Some(last_valid_block_height),
            submit.ok(),
            false,
        )
        .await
    }

    async fn confirm_and_report(
        &self,
        pair: &PairConfig,
        signature: Signature,
        last_valid_block_height: Option<u64>,
        bundle_id: Option<String>,
        fallback_rpc: bool,
    ) -> Result<ExecutionReport> {
        let confirmed = match self.rpc.confirm(&signature, last_valid_block_height).await {
            Ok(ok) => ok,
            Err(e) => {
                // Economic correctness beats retries: never re-send
                self.events
                    .emit(
                        EventType::ConfirmError,
                        json!({
                            "pair": pair.name,
                            "signature": signature.to_string(),
                            "error": format!("{:#}", e),
                        }),
                    )
                    .await;
                false
            }
        };

        self.events
            .emit(
                EventType::Executed,
                json!({
                    "pair": pair.name,
                    "signature": signature.to_string(),
                    "confirmed": confirmed,
                    "jito": bundle_id.is_some() || fallback_rpc,
                    "bundleId": bundle_id,
                    "fallbackRpc": fallback_rpc,
                }),
            )
            .await;

        Ok(ExecutionReport {
            executed: true,
            signatures: vec![signature.to_string()],
            bundle_id,
            fallback_rpc,
            skip_reason: None,
        })
    }

    // ---- sequential (Primary swap) -----------------------------------

    async fn execute_sequential_swap(
        &self,
        pair: &PairConfig,
        candidate: &LoopCandidate,
    ) -> Result<ExecutionReport> {
        let user = self.wallet.pubkey().to_string();
        let cu_price = self.cu_price(pair).await;
        let mut report = ExecutionReport::default();

        for (idx, leg) in [&candidate.leg1, &candidate.leg2].into_iter().enumerate() {
            let built = self
                .jupiter
                .build_swap_transaction(leg, &user, Some(cu_price))
                .await?;
            let tx = sign_transaction_base64(&built.tx_base64, &self.wallet)?;

            self.events
                .emit(
                    EventType::Built,
                    json!({
                        "pair": pair.name,
                        "leg": idx + 1,
                        "atomic": false,
                        "lastValidBlockHeight": built.last_valid_block_height,
                    }),
                )
                .await;

            if !self.live() {
                continue;
            }

            if self.cfg.live_preflight_simulate && !self.preflight(&pair.name, &tx).await? {
                return Ok(self.skip(&pair.name, "preflight-failed").await);
            }

            let signature = self.rpc.send(&tx).await?;
            report.signatures.push(signature.to_string());
            let confirmed = self
                .rpc
                .confirm(&signature, built.last_valid_block_height)
                .await
                .unwrap_or(false);
            if !confirmed {
                self.events
                    .emit(
                        EventType::ConfirmError,
                        json!({
                            "pair": pair.name,
                            "leg": idx + 1,
                            "signature": signature.to_string(),
                        }),
                    )
                    .await;
                anyhow::bail!("leg {} not confirmed: {}", idx + 1, signature);
            }
            info!("✅ leg {} confirmed: {}", idx + 1, signature);
        }

        if !self.live() {
            return Ok(self.skip(&pair.name, "dry-run").await);
        }

        report.executed = true;
        self.events
            .emit(
                EventType::Executed,
                json!({
                    "pair": pair.name,
                    "signatures": report.signatures,
                    "sequential": true,
                }),
            )
            .await;
        Ok(report)
    }

    // ---- ultra --------------------------------------------------------

    async fn execute_ultra(
        &self,
        pair: &PairConfig,
        candidate: &LoopCandidate,
    ) -> Result<ExecutionReport> {
        if pair.is_triangular() {
            return Ok(self.skip(&pair.name, "ultra-does-not-support-triangular").await);
        }
        if pair.a_mint != NATIVE_MINT {
            return Ok(self.skip(&pair.name, "ultra-requires-sol-amint").await);
        }
        if self.cfg.execution_strategy == ExecutionStrategy::Atomic {
            return Ok(self.skip(&pair.name, "ultra-requires-sequential").await);
        }

        let ultra_legs = candidate
            .ultra
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("ultra candidate without orders"))?;
        let orders = [&ultra_legs.order1, &ultra_legs.order2];
        let mut report = ExecutionReport::default();

        for (idx, order) in orders.into_iter().enumerate() {
            let tx = sign_transaction_base64(&order.transaction_base64, &self.wallet)?;
            let signed_base64 =
                base64::engine::general_purpose::STANDARD.encode(bincode::serialize(&tx)?);

            self.events
                .emit(
                    EventType::Built,
                    json!({"pair": pair.name, "leg": idx + 1, "ultra": true}),
                )
                .await;

            if !self.live() {
                continue;
            }

            let result = self.ultra.execute(&signed_base64, &order.request_id).await?;
            if result.is_failure() {
                let reason = format!("ultra-exec-failed-leg{}", idx + 1);
                self.events
                    .emit(
                        EventType::Error,
                        json!({
                            "pair": pair.name,
                            "reason": reason,
                            "status": result.status,
                            "code": result.code,
                            "error": result.error,
                        }),
                    )
                    .await;
                report.skip_reason = Some(reason);
                return Ok(report);
            }

            // Best-effort confirmation of the reported signature
            let signature = result
                .signature
                .as_deref()
                .and_then(|s| Signature::from_str(s).ok())
                .unwrap_or(tx.signatures[0]);
            report.signatures.push(signature.to_string());
            if let Err(e) = self.rpc.confirm(&signature, None).await {
                debug!("ultra leg {} confirm: {:#}", idx + 1, e);
            }
            info!("✅ ultra leg {} executed: {}", idx + 1, signature);
        }

        if !self.live() {
            return Ok(self.skip(&pair.name, "dry-run").await);
        }

        report.executed = true;
        self.events
            .emit(
                EventType::Executed,
                json!({"pair": pair.name, "ultra": true, "signatures": report.signatures}),
            )
            .await;
        Ok(report)
    }

    // ---- secondary (OpenOcean) ----------------------------------------

    async fn execute_secondary(
        &self,
        pair: &PairConfig,
        candidate: &LoopCandidate,
    ) -> Result<ExecutionReport> {
        let openocean = self
            .openocean
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("openocean client not configured"))?;
        let account = self.wallet.pubkey().to_string();
        let mut report = ExecutionReport::default();

        let legs = [
            (
                1usize,
                pair.a_mint.as_str(),
                pair.b_mint.as_str(),
                candidate.amount_a,
                pair.leg_slippage(0),
            ),
            (
                2usize,
                pair.b_mint.as_str(),
                pair.a_mint.as_str(),
                candidate.leg1.min_out_amount,
                pair.leg_slippage(1),
            ),
        ];

        for (leg_no, input, output, amount, slippage) in legs {
            let swap = openocean
                .swap(input, output, amount, slippage, &account)
                .await?;
            let bytes = decode_transaction_bytes(&swap.data)?;
            let tx = sign_transaction_bytes(&bytes, &self.wallet)?;

            self.events
                .emit(
                    EventType::Built,
                    json!({
                        "pair": pair.name,
                        "leg": leg_no,
                        "provider": "openocean",
                        "lastValidBlockHeight": swap.last_valid_block_height,
                    }),
                )
                .await;

            let simulate_this_leg = if self.live() {
                self.cfg.live_preflight_simulate
            } else {
                self.cfg.dry_run_simulate
            };

            if simulate_this_leg {
                let err = self.rpc.simulate(&tx).await?;
                if let Some(err) = err {
                    if !self.live() && leg_no == 2 {
                        // Expected in dry-run: the intermediate balance is
                        // not held on chain, so leg 2 cannot simulate.
                        self.events
                            .emit(
                                EventType::OpenOceanSkip,
                                json!({
                                    "pair": pair.name,
                                    "note": "preflight-expected-fail-leg2",
                                    "error": err,
                                }),
                            )
                            .await;
                    } else {
                        self.events
                            .emit(
                                EventType::Preflight,
                                json!({"pair": pair.name, "leg": leg_no, "ok": false, "error": err}),
                            )
                            .await;
                        if self.live() {
                            return Ok(self.skip(&pair.name, "preflight-failed").await);
                        }
                    }
                } else {
                    self.events
                        .emit(
                            EventType::Simulate,
                            json!({"pair": pair.name, "leg": leg_no, "ok": true}),
                        )
                        .await;
                }
            }

            if !self.live() {
                continue;
            }

            let signature = self.rpc.send(&tx).await?;
            report.signatures.push(signature.to_string());
            let confirmed = self
                .rpc
                .confirm(&signature, swap.last_valid_block_height)
                .await
                .unwrap_or(false);
            if !confirmed {
                self.events
                    .emit(
                        EventType::ConfirmError,
                        json!({
                            "pair": pair.name,
                            "leg": leg_no,
                            "signature": signature.to_string(),
                        }),
                    )
                    .await;
                anyhow::bail!("openocean leg {} not confirmed: {}", leg_no, signature);
            }
        }

        if !self.live() {
            return Ok(self.skip(&pair.name, "dry-run").await);
        }

        report.executed = true;
        self.events
            .emit(
                EventType::Executed,
                json!({
                    "pair": pair.name,
                    "provider": "openocean",
                    "sequential": true,
                    "signatures": report.signatures,
                }),
            )
            .await;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::hash::Hash;
    use solana_sdk::pubkey::Pubkey;
    use solana_sdk::message::{v0, VersionedMessage};
    use solana_sdk::system_instruction;

    #[test]
    fn test_should_fallback_boundary() {
        let rejected = BundleOutcome::Rejected;
        let dropped = BundleOutcome::Dropped;
        let landed = BundleOutcome::Landed;
        let pending = BundleOutcome::Pending;

        assert!(should_fallback(&rejected, 2_000, true));
        assert!(should_fallback(&dropped, 2_000, true));
        // No wait requested: never fall back
        assert!(!should_fallback(&rejected, 0, true));
        // Fallback not enabled
        assert!(!should_fallback(&rejected, 2_000, false));
        // Landed confirms the original submission
        assert!(!should_fallback(&landed, 2_000, true));
        // A timed-out wait returns without confirmation, not via fallback
        assert!(!should_fallback(&pending, 2_000, true));
    }

    #[test]
    fn test_sign_transaction_roundtrip() {
        let wallet = Keypair::new();
        let to = Pubkey::new_unique();
        let ix = system_instruction::transfer(&wallet.pubkey(), &to, 1_000);
        let message =
            v0::Message::try_compile(&wallet.pubkey(), &[ix], &[], Hash::default()).unwrap();
        // The "aggregator" ships an unsigned copy
        let unsigned = VersionedTransaction {
            signatures: vec![Signature::default()],
            message: VersionedMessage::V0(message),
        };
        let bytes = bincode::serialize(&unsigned).unwrap();

        let signed = sign_transaction_bytes(&bytes, &wallet).unwrap();
        assert_ne!(signed.signatures[0], Signature::default());
        assert!(signed.verify_with_results().iter().all(|ok| *ok));

        let b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
        let signed2 = sign_transaction_base64(&b64, &wallet).unwrap();
        assert_eq!(signed2.signatures[0], signed.signatures[0]);
    }

    #[test]
    fn test_sign_rejects_garbage() {
        let wallet = Keypair::new();
        assert!(sign_transaction_bytes(&[1, 2, 3], &wallet).is_err());
        assert!(sign_transaction_base64("!!!", &wallet).is_err());
    }
}
