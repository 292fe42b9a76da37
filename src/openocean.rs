// Secondary aggregator client (OpenOcean meta-aggregator, Solana API)
//
// Quote carries the winning venue id; swap returns a serialized
// transaction (base64 or hex, the deserializer copes with both).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::OpenOceanConfig;
use crate::jupiter::normalize_base_url;
use crate::rate_limiter::{retry_with_limiter, AdaptiveRateLimiter};
use crate::types::{LegQuote, Provider, QuoteRoute};

const QUOTE_TIMEOUT: Duration = Duration::from_secs(10);
const SWAP_TIMEOUT: Duration = Duration::from_secs(20);

pub const DEFAULT_BASE_URL: &str = "https://open-api.openocean.finance/v4/solana";

/// Result of the swap endpoint: a serialized unsigned transaction
#[derive(Debug, Clone)]
pub struct OpenOceanSwap {
    /// base64 or hex; see `decode_transaction_bytes`
    pub data: String,
    pub last_valid_block_height: Option<u64>,
}

/// Accept both encodings the upstream has been observed returning
pub fn decode_transaction_bytes(data: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    let trimmed = data.trim();
    if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(trimmed) {
        return Ok(bytes);
    }
    let hex_input = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    hex::decode(hex_input).context("swap payload is neither base64 nor hex")
}

pub struct OpenOceanClient {
    http: reqwest::Client,
    base_url: String,
    cfg: OpenOceanConfig,
    limiter: Arc<AdaptiveRateLimiter>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

impl OpenOceanClient {
    pub fn new(cfg: OpenOceanConfig, limiter: Arc<AdaptiveRateLimiter>) -> Self {
        let base_url = normalize_base_url(&cfg.base_url, DEFAULT_BASE_URL);
        debug!("openocean client: {}", base_url);
        Self {
            http: reqwest::Client::new(),
            base_url,
            cfg,
            limiter,
        }
    }

    pub fn limiter(&self) -> &AdaptiveRateLimiter {
        &self.limiter
    }

    /// Slippage is a percentage string on the wire (bps / 100)
    fn slippage_param(slippage_bps: u16) -> String {
        format!("{}", slippage_bps as f64 / 100.0)
    }

    fn venue_params(&self, query: &mut Vec<(&'static str, String)>) {
        if let Some(ids) = &self.cfg.enabled_dex_ids {
            query.push(("enabledDexIds", ids.clone()));
        }
        if let Some(ids) = &self.cfg.disabled_dex_ids {
            query.push(("disabledDexIds", ids.clone()));
        }
        if let Some(referrer) = &self.cfg.referrer {
            query.push(("referrer", referrer.clone()));
            if let Some(fee) = self.cfg.referrer_fee_bps {
                query.push(("referrerFee", format!("{}", fee as f64 / 100.0)));
            }
        }
    }

    async fn get_enveloped(
        &self,
        path: &str,
        query: &[(&'static str, String)],
        timeout: Duration,
        what: &str,
    ) -> Result<serde_json::Value> {
        let response = self
            .http
            .get(format!("{}/{}", self.base_url, path))
            .query(query)
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("{} request failed", what))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("HTTP {}: {}", status.as_u16(), body);
        }

        let envelope: Envelope = response.json().await?;
        if let Some(code) = envelope.code {
            if code != 200 {
                anyhow::bail!(
                    "openocean {} code {}: {}",
                    what,
                    code,
                    envelope.error.unwrap_or_default()
                );
            }
        }
        envelope
            .data
            .ok_or_else(|| anyhow::anyhow!("openocean {} returned no data", what))
    }

    /// Exact-in quote. min-out is derived from the applied slippage.
    pub async fn quote_exact_in(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u128,
        slippage_bps: u16,
    ) -> Result<LegQuote> {
        retry_with_limiter(&self.limiter, "openocean quote", || async {
            let mut query: Vec<(&'static str, String)> = vec![
                ("inTokenAddress", input_mint.to_string()),
                ("outTokenAddress", output_mint.to_string()),
                ("amountDecimals", amount.to_string()),
                ("slippage", Self::slippage_param(slippage_bps)),
            ];
            self.venue_params(&mut query);

            let data = self
                .get_enveloped("quote", &query, QUOTE_TIMEOUT, "quote")
                .await?;

            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct QuoteData {
                out_amount: serde_json::Value,
                #[serde(default)]
                dex_id: Option<u64>,
            }

            let parsed: QuoteData = serde_json::from_value(data.clone())
                .context("unexpected openocean quote shape")?;
            let out_amount = parse_amount(&parsed.out_amount).context("bad outAmount")?;
            // Conservative output under the applied slippage
            let min_out_amount = out_amount * (10_000 - slippage_bps as u128) / 10_000;

            Ok(LegQuote {
                provider: Provider::OpenOcean,
                input_mint: input_mint.to_string(),
                output_mint: output_mint.to_string(),
                in_amount: amount,
                out_amount,
                min_out_amount,
                slippage_bps,
                route: QuoteRoute::OpenOcean {
                    dex_id: parsed.dex_id,
                    data,
                },
            })
        })
        .await
    }

    /// Build a swap transaction for the given account
    pub async fn swap(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u128,
        slippage_bps: u16,
        account: &str,
    ) -> Result<OpenOceanSwap> {
        retry_with_limiter(&self.limiter, "openocean swap", || async {
            let mut query: Vec<(&'static str, String)> = vec![
                ("inTokenAddress", input_mint.to_string()),
                ("outTokenAddress", output_mint.to_string()),
                ("amountDecimals", amount.to_string()),
                ("slippage", Self::slippage_param(slippage_bps)),
                ("account", account.to_string()),
            ];
            self.venue_params(&mut query);

            let data = self
                .get_enveloped("swap", &query, SWAP_TIMEOUT, "swap")
                .await?;

            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct SwapData {
                #[serde(alias = "tx", alias = "data")]
                transaction: String,
                #[serde(default)]
                last_valid_block_height: Option<u64>,
            }

            let parsed: SwapData =
                serde_json::from_value(data).context("unexpected openocean swap shape")?;
            Ok(OpenOceanSwap {
                data: parsed.transaction,
                last_valid_block_height: parsed.last_valid_block_height,
            })
        })
        .await
    }
}

/// Amounts arrive as either JSON strings or numbers
fn parse_amount(value: &serde_json::Value) -> Result<u128> {
    match value {
        serde_json::Value::String(s) => s
            .parse()
            .with_context(|| format!("non-decimal amount {:?}", s)),
        serde_json::Value::Number(n) => n
            .as_u64()
            .map(u128::from)
            .ok_or_else(|| anyhow::anyhow!("non-integral amount {}", n)),
        other => anyhow::bail!("unexpected amount shape: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_transaction_bytes_base64_and_hex() {
        use base64::Engine;
        let payload = vec![1u8, 2, 3, 4, 255];

        let b64 = base64::engine::general_purpose::STANDARD.encode(&payload);
        assert_eq!(decode_transaction_bytes(&b64).unwrap(), payload);

        let hexed = hex::encode(&payload);
        assert_eq!(decode_transaction_bytes(&hexed).unwrap(), payload);
        assert_eq!(
            decode_transaction_bytes(&format!("0x{}", hexed)).unwrap(),
            payload
        );

        assert!(decode_transaction_bytes("zz!!").is_err());
    }

    #[test]
    fn test_parse_amount_shapes() {
        assert_eq!(parse_amount(&serde_json::json!("12345")).unwrap(), 12345);
        assert_eq!(parse_amount(&serde_json::json!(987)).unwrap(), 987);
        assert!(parse_amount(&serde_json::json!(1.5)).is_err());
        assert!(parse_amount(&serde_json::json!({"x": 1})).is_err());
    }

    #[test]
    fn test_slippage_param() {
        assert_eq!(OpenOceanClient::slippage_param(50), "0.5");
        assert_eq!(OpenOceanClient::slippage_param(100), "1");
        assert_eq!(OpenOceanClient::slippage_param(5000), "50");
    }
}
