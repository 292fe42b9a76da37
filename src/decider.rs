// Profitability decider
//
// Pure integer arithmetic: profit = out - in - feeInA, conservative
// profit uses the slippage-protected min-out, and a candidate is
// profitable iff the conservative profit clears the pair's minimum.
// An optional offloaded decider speaks one JSON object per line over a
// persistent child-process pipe; any failure falls back to the
// in-process computation with identical semantics.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::types::Decision;

fn to_i128(v: u128) -> i128 {
    v.min(i128::MAX as u128) as i128
}

/// Pure, deterministic profitability check
pub fn decide(
    in_amount: u128,
    out_amount: u128,
    min_out_amount: u128,
    fee_in_a: u128,
    min_profit_in_a: u128,
) -> Decision {
    let profit = to_i128(out_amount) - to_i128(in_amount) - to_i128(fee_in_a);
    let conservative_profit = to_i128(min_out_amount) - to_i128(in_amount) - to_i128(fee_in_a);
    Decision {
        profit,
        conservative_profit,
        profitable: conservative_profit >= to_i128(min_profit_in_a),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DecideRequest<'a> {
    r#in: &'a str,
    out: &'a str,
    min_out: &'a str,
    fee_in_a: &'a str,
    min_profit_in_a: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecideResponse {
    profit: String,
    conservative_profit: String,
    profitable: bool,
}

struct Pipe {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Line-oriented JSON-RPC over a persistent subprocess
pub struct ExternalDecider {
    // Kept alive for the process lifetime; dropping would close the pipes
    _child: Child,
    pipe: Mutex<Pipe>,
}

impl ExternalDecider {
    pub fn spawn(cmd: &str) -> Result<Self> {
        let mut parts = cmd.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty DECIDER_CMD"))?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn decider {:?}", cmd))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("decider has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("decider has no stdout"))?;

        info!("🧮 External decider spawned: {}", cmd);
        Ok(Self {
            _child: child,
            pipe: Mutex::new(Pipe {
                stdin,
                stdout: BufReader::new(stdout),
            }),
        })
    }

    async fn decide(
        &self,
        in_amount: u128,
        out_amount: u128,
        min_out_amount: u128,
        fee_in_a: u128,
        min_profit_in_a: u128,
    ) -> Result<Decision> {
        let request = serde_json::to_string(&DecideRequest {
            r#in: &in_amount.to_string(),
            out: &out_amount.to_string(),
            min_out: &min_out_amount.to_string(),
            fee_in_a: &fee_in_a.to_string(),
            min_profit_in_a: &min_profit_in_a.to_string(),
        })?;

        let mut pipe = self.pipe.lock().await;
        pipe.stdin.write_all(request.as_bytes()).await?;
        pipe.stdin.write_all(b"\n").await?;
        pipe.stdin.flush().await?;

        let mut line = String::new();
        let read = pipe.stdout.read_line(&mut line).await?;
        if read == 0 {
            anyhow::bail!("decider closed its pipe");
        }

        let response: DecideResponse =
            serde_json::from_str(line.trim()).context("bad decider response")?;
        Ok(Decision {
            profit: response.profit.parse().context("bad decider profit")?,
            conservative_profit: response
                .conservative_profit
                .parse()
                .context("bad decider conservativeProfit")?,
            profitable: response.profitable,
        })
    }
}

/// Decider capability consumed by the scanner
pub enum Decider {
    InProcess,
    External(ExternalDecider),
}

impl Decider {
    pub fn from_cmd(cmd: Option<&str>) -> Self {
        match cmd {
            Some(cmd) => match ExternalDecider::spawn(cmd) {
                Ok(external) => Decider::External(external),
                Err(e) => {
                    warn!("⚠️ external decider unavailable, using in-process: {:#}", e);
                    Decider::InProcess
                }
            },
            None => Decider::InProcess,
        }
    }

    /// Never fails: external errors fall back to the in-process path
    pub async fn decide(
        &self,
        in_amount: u128,
        out_amount: u128,
        min_out_amount: u128,
        fee_in_a: u128,
        min_profit_in_a: u128,
    ) -> Decision {
        if let Decider::External(external) = self {
            match external
                .decide(in_amount, out_amount, min_out_amount, fee_in_a, min_profit_in_a)
                .await
            {
                Ok(decision) => return decision,
                Err(e) => warn!("⚠️ external decider failed, falling back: {:#}", e),
            }
        }
        decide(in_amount, out_amount, min_out_amount, fee_in_a, min_profit_in_a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decide_basic() {
        // Spec scenario: unprofitable loop
        let d = decide(1_000_000, 999_500, 995_000, 5_000, 0);
        assert_eq!(d.profit, -5_500);
        assert_eq!(d.conservative_profit, -10_000);
        assert!(!d.profitable);

        // Profitable variant
        let d = decide(1_000_000, 1_020_000, 1_010_000, 5_000, 0);
        assert_eq!(d.profit, 15_000);
        assert_eq!(d.conservative_profit, 5_000);
        assert!(d.profitable);
    }

    #[test]
    fn test_profitable_iff_threshold() {
        // conservative = 5_000 exactly at threshold
        let d = decide(1_000_000, 1_020_000, 1_010_000, 5_000, 5_000);
        assert!(d.profitable);
        let d = decide(1_000_000, 1_020_000, 1_010_000, 5_000, 5_001);
        assert!(!d.profitable);
    }

    #[test]
    fn test_decide_invariant_sweep() {
        // profitable <=> min_out - in - fee >= min_profit, across a grid
        let values: [u128; 5] = [0, 1, 5_000, 1_000_000, u64::MAX as u128];
        for &inp in &values {
            for &min_out in &values {
                for &fee in &values {
                    for &min_profit in &values {
                        let d = decide(inp, min_out, min_out, fee, min_profit);
                        let expected = to_i128(min_out) - to_i128(inp) - to_i128(fee)
                            >= to_i128(min_profit);
                        assert_eq!(d.profitable, expected);
                    }
                }
            }
        }
    }

    #[test]
    fn test_large_values_no_overflow() {
        let big = u64::MAX as u128 * 1_000;
        let d = decide(big, big * 2, big * 2, 1, 0);
        assert!(d.conservative_profit > 0);
        assert!(d.profitable);
    }

    #[tokio::test]
    async fn test_in_process_handle() {
        let decider = Decider::InProcess;
        let d = decider.decide(100, 200, 150, 10, 0).await;
        assert_eq!(d.profit, 90);
        assert_eq!(d.conservative_profit, 40);
        assert!(d.profitable);
    }

    #[tokio::test]
    async fn test_external_fallback_via_cat() {
        // `cat` echoes the request, which is not a valid response; the
        // handle must fall back to identical in-process semantics.
        let decider = Decider::from_cmd(Some("cat"));
        let d = decider.decide(100, 200, 150, 10, 0).await;
        assert_eq!(d, decide(100, 200, 150, 10, 0));
    }
}
