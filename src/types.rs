// Common types shared across the scan/decide/execute pipeline

use serde::{Deserialize, Serialize};
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;

/// Wrapped SOL mint (native unit for fee accounting)
pub const NATIVE_MINT: &str = "So11111111111111111111111111111111111111112";

/// Quote/order provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    Jupiter,
    OpenOcean,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Jupiter => "jupiter",
            Provider::OpenOcean => "openocean",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque route metadata carried from quote to swap-build
#[derive(Debug, Clone)]
pub enum QuoteRoute {
    /// Raw Jupiter quoteResponse, passed back verbatim to /swap and
    /// /swap-instructions
    Jupiter(serde_json::Value),
    /// OpenOcean quote payload plus the winning venue id
    OpenOcean {
        dex_id: Option<u64>,
        data: serde_json::Value,
    },
}

/// One leg's quote: optimistic and slippage-protected output
#[derive(Debug, Clone)]
pub struct LegQuote {
    pub provider: Provider,
    pub input_mint: String,
    pub output_mint: String,
    pub in_amount: u128,
    pub out_amount: u128,
    /// otherAmountThreshold: conservative output under the applied slippage
    pub min_out_amount: u128,
    pub slippage_bps: u16,
    pub route: QuoteRoute,
}

/// Jupiter Ultra order: a quote plus a pre-built unsigned transaction
#[derive(Debug, Clone)]
pub struct UltraOrder {
    pub quote: LegQuote,
    pub request_id: String,
    pub transaction_base64: String,
}

/// Pure profitability verdict (exact integer arithmetic, see decider)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub profit: i128,
    pub conservative_profit: i128,
    pub profitable: bool,
}

/// Ultra legs attached to a loop candidate when the execution provider is
/// Ultra (pre-built transactions, executed sequentially)
#[derive(Debug, Clone)]
pub struct UltraLegs {
    pub order1: UltraOrder,
    pub order2: UltraOrder,
}

/// A→B→A candidate
#[derive(Debug, Clone)]
pub struct LoopCandidate {
    pub pair: String,
    pub amount_a: u128,
    pub leg1: LegQuote,
    pub leg2: LegQuote,
    pub ultra: Option<UltraLegs>,
    pub tip_lamports: u64,
    pub fee_lamports: u64,
    pub fee_in_a: u128,
    pub decision: Decision,
}

/// A→B→C→A candidate (Primary quote-only path)
#[derive(Debug, Clone)]
pub struct TriangularCandidate {
    pub pair: String,
    pub amount_a: u128,
    pub leg1: LegQuote,
    pub leg2: LegQuote,
    pub leg3: LegQuote,
    pub tip_lamports: u64,
    pub fee_lamports: u64,
    pub fee_in_a: u128,
    pub decision: Decision,
}

/// Scan output, tagged by route shape and provider
#[derive(Debug, Clone)]
pub enum Candidate {
    Loop(LoopCandidate),
    LoopSecondary(LoopCandidate),
    Triangular(TriangularCandidate),
}

impl Candidate {
    pub fn pair(&self) -> &str {
        match self {
            Candidate::Loop(c) | Candidate::LoopSecondary(c) => &c.pair,
            Candidate::Triangular(c) => &c.pair,
        }
    }

    pub fn amount_a(&self) -> u128 {
        match self {
            Candidate::Loop(c) | Candidate::LoopSecondary(c) => c.amount_a,
            Candidate::Triangular(c) => c.amount_a,
        }
    }

    pub fn decision(&self) -> Decision {
        match self {
            Candidate::Loop(c) | Candidate::LoopSecondary(c) => c.decision,
            Candidate::Triangular(c) => c.decision,
        }
    }

    pub fn tip_lamports(&self) -> u64 {
        match self {
            Candidate::Loop(c) | Candidate::LoopSecondary(c) => c.tip_lamports,
            Candidate::Triangular(c) => c.tip_lamports,
        }
    }

    pub fn fee_lamports(&self) -> u64 {
        match self {
            Candidate::Loop(c) | Candidate::LoopSecondary(c) => c.fee_lamports,
            Candidate::Triangular(c) => c.fee_lamports,
        }
    }

    pub fn leg_count(&self) -> usize {
        match self {
            Candidate::Loop(_) | Candidate::LoopSecondary(_) => 2,
            Candidate::Triangular(_) => 3,
        }
    }

    /// Conservative profit per million units of notional
    pub fn conservative_ppm(&self) -> f64 {
        let amount = self.amount_a();
        if amount == 0 {
            return 0.0;
        }
        self.decision().conservative_profit as f64 * 1e6 / amount as f64
    }
}

/// One leg's instruction groups from the Primary swap-instructions endpoint
#[derive(Debug, Clone)]
pub struct SwapInstructionBundle {
    pub compute_budget: Vec<Instruction>,
    pub setup: Vec<Instruction>,
    pub other: Vec<Instruction>,
    pub swap: Instruction,
    pub cleanup: Vec<Instruction>,
    pub lookup_table_addresses: Vec<Pubkey>,
}

/// Wire shape of a single instruction as returned by the aggregator APIs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiInstruction {
    pub program_id: String,
    pub accounts: Vec<ApiAccountMeta>,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiAccountMeta {
    pub pubkey: String,
    pub is_signer: bool,
    pub is_writable: bool,
}

impl ApiInstruction {
    pub fn into_instruction(self) -> anyhow::Result<Instruction> {
        use base64::Engine;

        let program_id: Pubkey = self
            .program_id
            .parse()
            .map_err(|e| anyhow::anyhow!("bad program id {}: {}", self.program_id, e))?;

        let mut accounts = Vec::with_capacity(self.accounts.len());
        for meta in self.accounts {
            let pubkey: Pubkey = meta
                .pubkey
                .parse()
                .map_err(|e| anyhow::anyhow!("bad account key {}: {}", meta.pubkey, e))?;
            accounts.push(AccountMeta {
                pubkey,
                is_signer: meta.is_signer,
                is_writable: meta.is_writable,
            });
        }

        let data = base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .map_err(|e| anyhow::anyhow!("bad instruction data: {}", e))?;

        Ok(Instruction {
            program_id,
            accounts,
            data,
        })
    }
}

/// True when the string is a non-empty decimal amount (atomic units)
pub fn is_decimal_string(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_string_validation() {
        assert!(is_decimal_string("1000000"));
        assert!(is_decimal_string("0"));
        assert!(!is_decimal_string(""));
        assert!(!is_decimal_string("1.5"));
        assert!(!is_decimal_string("-5"));
        assert!(!is_decimal_string("1e9"));
    }

    #[test]
    fn test_conservative_ppm() {
        let cand = Candidate::Loop(LoopCandidate {
            pair: "SOL/USDC".to_string(),
            amount_a: 1_000_000,
            leg1: dummy_quote(),
            leg2: dummy_quote(),
            ultra: None,
            tip_lamports: 0,
            fee_lamports: 5000,
            fee_in_a: 5000,
            decision: Decision {
                profit: 2_000,
                conservative_profit: 1_000,
                profitable: true,
            },
        });

        // 1_000 / 1_000_000 notional = 1000 ppm
        assert!((cand.conservative_ppm() - 1000.0).abs() < f64::EPSILON);
    }

    fn dummy_quote() -> LegQuote {
        LegQuote {
            provider: Provider::Jupiter,
            input_mint: NATIVE_MINT.to_string(),
            output_mint: NATIVE_MINT.to_string(),
            in_amount: 0,
            out_amount: 0,
            min_out_amount: 0,
            slippage_bps: 50,
            route: QuoteRoute::Jupiter(serde_json::Value::Null),
        }
    }
}
