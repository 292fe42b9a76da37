// Primary Ultra client (order / execute)
//
// Ultra orders return a pre-built unsigned transaction and a request id;
// execution posts the signed transaction back. Status decoding is
// deliberately paranoid: the upstream reports failure through any of the
// status string, a non-zero code, or an error field.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::jupiter::normalize_base_url;
use crate::rate_limiter::{retry_with_limiter, AdaptiveRateLimiter};
use crate::types::{LegQuote, Provider, QuoteRoute, UltraOrder};

const ORDER_TIMEOUT: Duration = Duration::from_secs(10);
const EXECUTE_TIMEOUT: Duration = Duration::from_secs(20);

/// Outcome of POST /execute for one leg
#[derive(Debug, Clone)]
pub struct UltraExecuteResult {
    pub status: String,
    pub signature: Option<String>,
    pub error: Option<String>,
    pub code: Option<i64>,
}

impl UltraExecuteResult {
    /// Any of: failing status string, non-zero code, non-empty error
    pub fn is_failure(&self) -> bool {
        let status = self.status.to_lowercase();
        ["fail", "error", "revert", "reject"]
            .iter()
            .any(|needle| status.contains(needle))
            || self.code.is_some_and(|c| c != 0)
            || self.error.as_deref().is_some_and(|e| !e.is_empty())
    }
}

pub struct UltraClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    limiter: Arc<AdaptiveRateLimiter>,
}

impl UltraClient {
    pub fn new(
        base_url: &str,
        default_url: &str,
        api_key: Option<String>,
        limiter: Arc<AdaptiveRateLimiter>,
    ) -> Self {
        // Accept the base with or without the trailing /ultra segment
        let mut base_url = normalize_base_url(base_url, default_url);
        if !base_url.ends_with("/ultra") {
            base_url.push_str("/ultra");
        }
        debug!("ultra client: {}", base_url);
        Self {
            http: reqwest::Client::new(),
            base_url,
            api_key,
            limiter,
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("x-api-key", key),
            None => builder,
        }
    }

    /// GET /v1/order: quote plus unsigned transaction
    pub async fn order(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u128,
        taker: &str,
        exclude_dexes: Option<&[String]>,
    ) -> Result<UltraOrder> {
        retry_with_limiter(&self.limiter, "ultra order", || async {
            let mut query: Vec<(&str, String)> = vec![
                ("inputMint", input_mint.to_string()),
                ("outputMint", output_mint.to_string()),
                ("amount", amount.to_string()),
                ("taker", taker.to_string()),
            ];
            if let Some(exclude) = exclude_dexes {
                if !exclude.is_empty() {
                    query.push(("excludeDexes", exclude.join(",")));
                }
            }

            let response = self
                .request(self.http.get(format!("{}/v1/order", self.base_url)))
                .query(&query)
                .timeout(ORDER_TIMEOUT)
                .send()
                .await
                .context("ultra order request failed")?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("HTTP {}: {}", status.as_u16(), body);
            }

            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct OrderResponse {
                in_amount: String,
                out_amount: String,
                other_amount_threshold: String,
                #[serde(default)]
                slippage_bps: Option<u16>,
                transaction: Option<String>,
                request_id: String,
            }

            let raw: serde_json::Value = response.json().await?;
            let parsed: OrderResponse =
                serde_json::from_value(raw.clone()).context("unexpected ultra order shape")?;
            let transaction = parsed
                .transaction
                .ok_or_else(|| anyhow::anyhow!("ultra order carried no transaction"))?;

            Ok(UltraOrder {
                quote: LegQuote {
                    provider: Provider::Jupiter,
                    input_mint: input_mint.to_string(),
                    output_mint: output_mint.to_string(),
                    in_amount: parsed
                        .in_amount
                        .parse()
                        .with_context(|| format!("bad inAmount {:?}", parsed.in_amount))?,
                    out_amount: parsed
                        .out_amount
                        .parse()
                        .with_context(|| format!("bad outAmount {:?}", parsed.out_amount))?,
                    min_out_amount: parsed.other_amount_threshold.parse().with_context(|| {
                        format!(
                            "bad otherAmountThreshold {:?}",
                            parsed.other_amount_threshold
                        )
                    })?,
                    slippage_bps: parsed.slippage_bps.unwrap_or(0),
                    route: QuoteRoute::Jupiter(raw),
                },
                request_id: parsed.request_id,
                transaction_base64: transaction,
            })
        })
        .await
    }

    /// POST /v1/execute: submit the signed order transaction
    pub async fn execute(
        &self,
        signed_tx_base64: &str,
        request_id: &str,
    ) -> Result<UltraExecuteResult> {
        let body = json!({
            "signedTransaction": signed_tx_base64,
            "requestId": request_id,
        });

        retry_with_limiter(&self.limiter, "ultra execute", || async {
            let response = self
                .request(self.http.post(format!("{}/v1/execute", self.base_url)))
                .json(&body)
                .timeout(EXECUTE_TIMEOUT)
                .send()
                .await
                .context("ultra execute request failed")?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("HTTP {}: {}", status.as_u16(), body);
            }

            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct ExecuteResponse {
                #[serde(default)]
                status: Option<String>,
                #[serde(default)]
                signature: Option<String>,
                #[serde(default)]
                error: Option<String>,
                #[serde(default)]
                code: Option<i64>,
            }

            let parsed: ExecuteResponse = response.json().await?;
            Ok(UltraExecuteResult {
                status: parsed.status.unwrap_or_default(),
                signature: parsed.signature,
                error: parsed.error,
                code: parsed.code,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: &str, code: Option<i64>, error: Option<&str>) -> UltraExecuteResult {
        UltraExecuteResult {
            status: status.to_string(),
            signature: None,
            error: error.map(|e| e.to_string()),
            code,
        }
    }

    #[test]
    fn test_failure_detection_is_paranoid() {
        assert!(result("Failed", None, None).is_failure());
        assert!(result("TransactionReverted", None, None).is_failure());
        assert!(result("rejected", None, None).is_failure());
        assert!(result("Success", Some(7), None).is_failure());
        assert!(result("Success", None, Some("slippage exceeded")).is_failure());
        assert!(!result("Success", Some(0), Some("")).is_failure());
        assert!(!result("Success", None, None).is_failure());
    }

    #[test]
    fn test_base_url_accepts_optional_ultra_suffix() {
        let limiter = Arc::new(AdaptiveRateLimiter::new(
            "ultra",
            crate::config::RateConfig {
                rps: 1.0,
                min_rps: 0.25,
                burst: 1.0,
                penalty_ms: 1_000,
                recovery_every_ms: 1_000,
                recovery_step_rps: 0.1,
                backoff_base_ms: 10,
                backoff_max_ms: 50,
                max_attempts: 1,
                cooldown_429_ms: 1_000,
            },
        ));
        let with = UltraClient::new("https://api.jup.ag/ultra", "https://api.jup.ag/ultra", None, limiter.clone());
        let without = UltraClient::new("https://api.jup.ag", "https://api.jup.ag/ultra", None, limiter);
        assert_eq!(with.base_url, "https://api.jup.ag/ultra");
        assert_eq!(without.base_url, "https://api.jup.ag/ultra");
    }
}
