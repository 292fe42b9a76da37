// Primary aggregator client (quote / swap / swap-instructions)
//
// Quotes go through a short-TTL coalescing cache: concurrent callers for
// the same (in, out, amount, slippage, venue filters) share one upstream
// request. Every upstream call runs under the Primary rate limiter with
// retry/backoff; a failed fetch clears its cache slot.

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::rate_limiter::{retry_with_limiter, AdaptiveRateLimiter};
use crate::types::{ApiInstruction, LegQuote, Provider, QuoteRoute, SwapInstructionBundle};

pub const PUBLIC_API_HOST: &str = "api.jup.ag";

const QUOTE_TIMEOUT: Duration = Duration::from_secs(10);
const SWAP_TIMEOUT: Duration = Duration::from_secs(20);

/// Normalize a configured base URL: add a scheme when missing, strip
/// query/fragment and trailing slashes; fall back to the default on
/// anything unparseable.
pub fn normalize_base_url(raw: &str, default_url: &str) -> String {
    let mut s = raw.trim().to_string();
    if s.is_empty() {
        return default_url.to_string();
    }
    if !s.contains("://") {
        s = format!("https://{}", s);
    }
    match reqwest::Url::parse(&s) {
        Ok(mut url) => {
            if url.host_str().is_none() {
                return default_url.to_string();
            }
            url.set_query(None);
            url.set_fragment(None);
            let mut out = url.to_string();
            while out.ends_with('/') {
                out.pop();
            }
            out
        }
        Err(_) => default_url.to_string(),
    }
}

/// Quote request parameters for one leg
#[derive(Debug, Clone)]
pub struct QuoteRequest {
    pub input_mint: String,
    pub output_mint: String,
    pub amount: u128,
    pub slippage_bps: u16,
    pub include_dexes: Option<Vec<String>>,
    pub exclude_dexes: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct QuoteCacheKey {
    input_mint: String,
    output_mint: String,
    amount: u128,
    slippage_bps: u16,
    include: String,
    exclude: String,
}

impl QuoteCacheKey {
    fn from_request(req: &QuoteRequest) -> Self {
        let joined = |list: &Option<Vec<String>>| {
            let mut v = list.clone().unwrap_or_default();
            v.sort();
            v.join(",")
        };
        Self {
            input_mint: req.input_mint.clone(),
            output_mint: req.output_mint.clone(),
            amount: req.amount,
            slippage_bps: req.slippage_bps,
            include: joined(&req.include_dexes),
            exclude: joined(&req.exclude_dexes),
        }
    }
}

struct CacheSlot {
    inserted: Instant,
    cell: Arc<OnceCell<LegQuote>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteResponseHead {
    in_amount: String,
    out_amount: String,
    other_amount_threshold: String,
    #[serde(default)]
    slippage_bps: Option<u16>,
}

/// Result of POST /swap: a pre-built unsigned transaction
#[derive(Debug, Clone)]
pub struct BuiltSwapTransaction {
    pub tx_base64: String,
    pub last_valid_block_height: Option<u64>,
}

pub struct JupiterQuoteClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    limiter: Arc<AdaptiveRateLimiter>,
    quote_cache: DashMap<QuoteCacheKey, CacheSlot>,
    quote_ttl: Duration,
}

impl JupiterQuoteClient {
    pub fn new(
        base_url: &str,
        default_url: &str,
        api_key: Option<String>,
        quote_ttl_ms: u64,
        limiter: Arc<AdaptiveRateLimiter>,
    ) -> Result<Self> {
        let base_url = normalize_base_url(base_url, default_url);
        let host = reqwest::Url::parse(&base_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_default();
        if host == PUBLIC_API_HOST && api_key.is_none() {
            anyhow::bail!(
                "JUPITER_API_KEY is required when using the public host {}",
                PUBLIC_API_HOST
            );
        }
        debug!("jupiter quote client: {}", base_url);
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            api_key,
            limiter,
            quote_cache: DashMap::new(),
            quote_ttl: Duration::from_millis(quote_ttl_ms.max(1)),
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("x-api-key", key),
            None => builder,
        }
    }

    pub fn limiter(&self) -> &AdaptiveRateLimiter {
        &self.limiter
    }

    /// Exact-in quote, coalesced through the short-TTL cache
    pub async fn quote_exact_in(&self, req: &QuoteRequest) -> Result<LegQuote> {
        let key = QuoteCacheKey::from_request(req);

        // Fetch-or-join the in-flight slot; expired slots are replaced
        let cell = {
            let mut entry = self
                .quote_cache
                .entry(key.clone())
                .or_insert_with(|| CacheSlot {
                    inserted: Instant::now(),
                    cell: Arc::new(OnceCell::new()),
                });
            if entry.inserted.elapsed() > self.quote_ttl && entry.cell.initialized() {
                *entry = CacheSlot {
                    inserted: Instant::now(),
                    cell: Arc::new(OnceCell::new()),
                };
            }
            entry.cell.clone()
        };

        let result = cell
            .get_or_try_init(|| self.fetch_quote(req))
            .await
            .map(|quote| quote.clone());

        if result.is_err() {
            // Drop the failed slot so the next caller retries upstream
            if let Some(entry) = self.quote_cache.get(&key) {
                if Arc::ptr_eq(&entry.cell, &cell) {
                    drop(entry);
                    self.quote_cache.remove(&key);
                }
            }
        }
        result
    }

    async fn fetch_quote(&self, req: &QuoteRequest) -> Result<LegQuote> {
        retry_with_limiter(&self.limiter, "jupiter quote", || async {
            let mut query: Vec<(&str, String)> = vec![
                ("inputMint", req.input_mint.clone()),
                ("outputMint", req.output_mint.clone()),
                ("amount", req.amount.to_string()),
                ("slippageBps", req.slippage_bps.to_string()),
            ];
            if let Some(include) = &req.include_dexes {
                if !include.is_empty() {
                    query.push(("dexes", include.join(",")));
                }
            }
            if let Some(exclude) = &req.exclude_dexes {
                if !exclude.is_empty() {
                    query.push(("excludeDexes", exclude.join(",")));
                }
            }

            let response = self
                .request(self.http.get(format!("{}/quote", self.base_url)))
                .query(&query)
                .timeout(QUOTE_TIMEOUT)
                .send()
                .await
                .context("jupiter quote request failed")?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("HTTP {}: {}", status.as_u16(), body);
            }

            let raw: serde_json::Value = response.json().await?;
            let head: QuoteResponseHead = serde_json::from_value(raw.clone())
                .context("unexpected jupiter quote shape")?;

            Ok(LegQuote {
                provider: Provider::Jupiter,
                input_mint: req.input_mint.clone(),
                output_mint: req.output_mint.clone(),
                in_amount: head
                    .in_amount
                    .parse()
                    .with_context(|| format!("bad inAmount {:?}", head.in_amount))?,
                out_amount: head
                    .out_amount
                    .parse()
                    .with_context(|| format!("bad outAmount {:?}", head.out_amount))?,
                min_out_amount: head
                    .other_amount_threshold
                    .parse()
                    .with_context(|| {
                        format!("bad otherAmountThreshold {:?}", head.other_amount_threshold)
                    })?,
                slippage_bps: head.slippage_bps.unwrap_or(req.slippage_bps),
                route: QuoteRoute::Jupiter(raw),
            })
        })
        .await
    }

    /// POST /swap: one unsigned transaction for this quote
    pub async fn build_swap_transaction(
        &self,
        quote: &LegQuote,
        user_pubkey: &str,
        cu_price_micro_lamports: Option<u64>,
    ) -> Result<BuiltSwapTransaction> {
        let QuoteRoute::Jupiter(quote_response) = &quote.route else {
            anyhow::bail!("build_swap_transaction requires a jupiter quote");
        };

        let mut body = json!({
            "userPublicKey": user_pubkey,
            "quoteResponse": quote_response,
            "wrapAndUnwrapSol": true,
            "dynamicComputeUnitLimit": false,
        });
        if let Some(price) = cu_price_micro_lamports.filter(|&p| p > 0) {
            body["computeUnitPriceMicroLamports"] = json!(price);
        }

        retry_with_limiter(&self.limiter, "jupiter swap build", || async {
            let response = self
                .request(self.http.post(format!("{}/swap", self.base_url)))
                .json(&body)
                .timeout(SWAP_TIMEOUT)
                .send()
                .await
                .context("jupiter swap request failed")?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("HTTP {}: {}", status.as_u16(), body);
            }

            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct SwapResponse {
                swap_transaction: String,
                #[serde(default)]
                last_valid_block_height: Option<u64>,
            }

            let parsed: SwapResponse = response.json().await?;
            Ok(BuiltSwapTransaction {
                tx_base64: parsed.swap_transaction,
                last_valid_block_height: parsed.last_valid_block_height,
            })
        })
        .await
    }

    /// POST /swap-instructions: grouped instructions for the atomic builder
    pub async fn build_swap_instructions(
        &self,
        quote: &LegQuote,
        user_pubkey: &str,
        cu_price_micro_lamports: Option<u64>,
    ) -> Result<SwapInstructionBundle> {
        let QuoteRoute::Jupiter(quote_response) = &quote.route else {
            anyhow::bail!("build_swap_instructions requires a jupiter quote");
        };

        let mut body = json!({
            "userPublicKey": user_pubkey,
            "quoteResponse": quote_response,
            "wrapAndUnwrapSol": true,
        });
        if let Some(price) = cu_price_micro_lamports.filter(|&p| p > 0) {
            body["computeUnitPriceMicroLamports"] = json!(price);
        }

        retry_with_limiter(&self.limiter, "jupiter swap-instructions", || async {
            let response = self
                .request(self.http.post(format!("{}/swap-instructions", self.base_url)))
                .json(&body)
                .timeout(SWAP_TIMEOUT)
                .send()
                .await
                .context("jupiter swap-instructions request failed")?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("HTTP {}: {}", status.as_u16(), body);
            }

            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct InstructionsResponse {
                #[serde(default)]
                compute_budget_instructions: Vec<ApiInstruction>,
                #[serde(default)]
                setup_instructions: Vec<ApiInstruction>,
                #[serde(default)]
                other_instructions: Vec<ApiInstruction>,
                swap_instruction: ApiInstruction,
                #[serde(default)]
                cleanup_instruction: Option<ApiInstruction>,
                #[serde(default)]
                address_lookup_table_addresses: Vec<String>,
            }

            let parsed: InstructionsResponse = response.json().await?;

            let convert = |list: Vec<ApiInstruction>| -> Result<Vec<_>> {
                list.into_iter().map(|ix| ix.into_instruction()).collect()
            };

            let mut lookup_table_addresses = Vec::new();
            for addr in parsed.address_lookup_table_addresses {
                lookup_table_addresses.push(
                    addr.parse()
                        .map_err(|e| anyhow::anyhow!("bad lookup table address {}: {}", addr, e))?,
                );
            }

            Ok(SwapInstructionBundle {
                compute_budget: convert(parsed.compute_budget_instructions)?,
                setup: convert(parsed.setup_instructions)?,
                other: convert(parsed.other_instructions)?,
                swap: parsed.swap_instruction.into_instruction()?,
                cleanup: convert(parsed.cleanup_instruction.into_iter().collect())?,
                lookup_table_addresses,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateConfig;

    fn limiter() -> Arc<AdaptiveRateLimiter> {
        Arc::new(AdaptiveRateLimiter::new(
            "jupiter",
            RateConfig {
                rps: 10.0,
                min_rps: 1.0,
                burst: 1.0,
                penalty_ms: 1_000,
                recovery_every_ms: 1_000,
                recovery_step_rps: 0.1,
                backoff_base_ms: 10,
                backoff_max_ms: 50,
                max_attempts: 1,
                cooldown_429_ms: 1_000,
            },
        ))
    }

    #[test]
    fn test_normalize_base_url() {
        let def = "https://api.jup.ag/swap/v1";
        assert_eq!(normalize_base_url("", def), def);
        assert_eq!(normalize_base_url("lite-api.jup.ag/swap/v1", def), "https://lite-api.jup.ag/swap/v1");
        assert_eq!(
            normalize_base_url("https://example.com/jup/", def),
            "https://example.com/jup"
        );
        assert_eq!(
            normalize_base_url("https://example.com/jup?x=1#frag", def),
            "https://example.com/jup"
        );
        assert_eq!(normalize_base_url("::::", def), def);
    }

    #[test]
    fn test_public_host_requires_api_key() {
        let err = JupiterQuoteClient::new(
            "https://api.jup.ag/swap/v1",
            "https://api.jup.ag/swap/v1",
            None,
            250,
            limiter(),
        );
        assert!(err.is_err());

        let ok = JupiterQuoteClient::new(
            "https://lite-api.jup.ag/swap/v1",
            "https://api.jup.ag/swap/v1",
            None,
            250,
            limiter(),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_cache_key_sorts_venue_filters() {
        let req = |include: &[&str]| QuoteRequest {
            input_mint: "A".into(),
            output_mint: "B".into(),
            amount: 1,
            slippage_bps: 50,
            include_dexes: Some(include.iter().map(|s| s.to_string()).collect()),
            exclude_dexes: None,
        };
        let k1 = QuoteCacheKey::from_request(&req(&["Orca", "Raydium"]));
        let k2 = QuoteCacheKey::from_request(&req(&["Raydium", "Orca"]));
        assert_eq!(k1, k2);
    }
}
