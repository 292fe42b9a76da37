// Atomic multi-leg transaction assembly
//
// Merges the per-leg instruction bundles from the aggregator into one
// versioned transaction. Strict output order:
//
//   1. compute budget (one fresh limit, optional price; per-leg compute
//      budget instructions are discarded, they cannot be duplicated in a
//      single transaction)
//   2. leg 1's "other" instructions only (later legs' duplicates clash
//      on account keys)
//   3. setup instructions across all legs, deduplicated
//   4. each leg's swap instruction, in path order
//   5. cleanup instructions across all legs, deduplicated
//   6. tip transfer, always last, so native-unwrap cleanup refunds the
//      payer before the tip is paid

use anyhow::{Context, Result};
use base64::Engine;
use solana_sdk::compute_budget::ComputeBudgetInstruction;
use solana_sdk::hash::Hash;
use solana_sdk::instruction::Instruction;
use solana_sdk::message::{v0, VersionedMessage};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use solana_sdk::system_instruction;
use solana_sdk::transaction::VersionedTransaction;
use std::collections::HashSet;
use tracing::debug;

use crate::rpc::SolanaRpc;
use crate::types::SwapInstructionBundle;

/// Identity for instruction dedup: program, payload, and the account
/// list with flags (sorted, so meta order differences don't defeat it)
pub fn instruction_dedup_key(ix: &Instruction) -> String {
    let mut accounts: Vec<String> = ix
        .accounts
        .iter()
        .map(|meta| format!("{}:{}:{}", meta.pubkey, meta.is_signer, meta.is_writable))
        .collect();
    accounts.sort();
    format!(
        "{}|{}|{}",
        ix.program_id,
        base64::engine::general_purpose::STANDARD.encode(&ix.data),
        accounts.join(",")
    )
}

fn dedup_in_order(groups: impl Iterator<Item = Instruction>) -> Vec<Instruction> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for ix in groups {
        if seen.insert(instruction_dedup_key(&ix)) {
            out.push(ix);
        }
    }
    out
}

/// Merged instruction list plus the deduplicated lookup-table addresses
pub struct MergedLegs {
    pub instructions: Vec<Instruction>,
    pub lookup_table_addresses: Vec<Pubkey>,
}

pub fn merge_legs(
    legs: &[SwapInstructionBundle],
    payer: &Pubkey,
    cu_limit: u32,
    cu_price_micro_lamports: u64,
    tip: Option<(Pubkey, u64)>,
) -> MergedLegs {
    let mut instructions = Vec::new();

    instructions.push(ComputeBudgetInstruction::set_compute_unit_limit(cu_limit));
    if cu_price_micro_lamports > 0 {
        instructions.push(ComputeBudgetInstruction::set_compute_unit_price(
            cu_price_micro_lamports,
        ));
    }

    if let Some(first) = legs.first() {
        instructions.extend(first.other.iter().cloned());
    }

    instructions.extend(dedup_in_order(
        legs.iter().flat_map(|leg| leg.setup.iter().cloned()),
    ));

    for leg in legs {
        instructions.push(leg.swap.clone());
    }

    instructions.extend(dedup_in_order(
        legs.iter().flat_map(|leg| leg.cleanup.iter().cloned()),
    ));

    if let Some((tip_account, tip_lamports)) = tip {
        instructions.push(system_instruction::transfer(payer, &tip_account, tip_lamports));
    }

    let mut seen = HashSet::new();
    let lookup_table_addresses = legs
        .iter()
        .flat_map(|leg| leg.lookup_table_addresses.iter().copied())
        .filter(|addr| seen.insert(*addr))
        .collect();

    MergedLegs {
        instructions,
        lookup_table_addresses,
    }
}

/// Compile and sign the merged legs against a fresh blockhash
pub async fn build_atomic_transaction(
    rpc: &SolanaRpc,
    wallet: &Keypair,
    legs: &[SwapInstructionBundle],
    cu_limit: u32,
    cu_price_micro_lamports: u64,
    tip: Option<(Pubkey, u64)>,
) -> Result<(VersionedTransaction, u64)> {
    let payer = wallet.pubkey();
    let merged = merge_legs(legs, &payer, cu_limit, cu_price_micro_lamports, tip);
    let tables = rpc.lookup_tables(&merged.lookup_table_addresses).await?;
    let (blockhash, last_valid_block_height) = rpc.latest_blockhash().await?;

    debug!(
        "🔧 Atomic build: {} instructions, {} lookup tables",
        merged.instructions.len(),
        tables.len()
    );

    let tx = compile_and_sign(wallet, &merged.instructions, &tables, blockhash)?;
    Ok((tx, last_valid_block_height))
}

pub fn compile_and_sign(
    wallet: &Keypair,
    instructions: &[Instruction],
    tables: &[solana_sdk::address_lookup_table::AddressLookupTableAccount],
    blockhash: Hash,
) -> Result<VersionedTransaction> {
    let message = v0::Message::try_compile(&wallet.pubkey(), instructions, tables, blockhash)
        .context("failed to compile v0 message")?;
    VersionedTransaction::try_new(VersionedMessage::V0(message), &[wallet])
        .context("failed to sign transaction")
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::instruction::AccountMeta;

    fn ix(program: Pubkey, data: &[u8], keys: &[Pubkey]) -> Instruction {
        Instruction {
            program_id: program,
            accounts: keys
                .iter()
                .map(|k| AccountMeta::new(*k, false))
                .collect(),
            data: data.to_vec(),
        }
    }

    fn bundle(
        setup: Vec<Instruction>,
        other: Vec<Instruction>,
        swap: Instruction,
        cleanup: Vec<Instruction>,
        luts: Vec<Pubkey>,
    ) -> SwapInstructionBundle {
        SwapInstructionBundle {
            compute_budget: vec![ComputeBudgetInstruction::set_compute_unit_limit(1)],
            setup,
            other,
            swap,
            cleanup,
            lookup_table_addresses: luts,
        }
    }

    #[test]
    fn test_merge_order_and_dedup() {
        let payer = Pubkey::new_unique();
        let program = Pubkey::new_unique();
        let key = Pubkey::new_unique();

        let shared_setup = ix(program, b"setup", &[key]);
        let shared_cleanup = ix(program, b"cleanup", &[key]);
        let other1 = ix(program, b"other1", &[key]);
        let other2 = ix(program, b"other2", &[key]);
        let swap1 = ix(program, b"swap1", &[key]);
        let swap2 = ix(program, b"swap2", &[key]);

        let lut1 = Pubkey::new_unique();
        let lut2 = Pubkey::new_unique();

        let legs = vec![
            bundle(
                vec![shared_setup.clone()],
                vec![other1.clone()],
                swap1.clone(),
                vec![shared_cleanup.clone()],
                vec![lut1, lut2],
            ),
            bundle(
                vec![shared_setup.clone()],
                vec![other2],
                swap2.clone(),
                vec![shared_cleanup.clone()],
                vec![lut2],
            ),
        ];

        let tip_account = Pubkey::new_unique();
        let merged = merge_legs(&legs, &payer, 600_000, 1_000, Some((tip_account, 5_000)));

        // compute limit + compute price + other1 + setup + swap1 + swap2 + cleanup + tip
        assert_eq!(merged.instructions.len(), 8);
        assert_eq!(
            merged.instructions[0].program_id,
            solana_sdk::compute_budget::id()
        );
        assert_eq!(
            merged.instructions[1].program_id,
            solana_sdk::compute_budget::id()
        );
        // leg1's other only; leg2's "other2" is discarded
        assert_eq!(merged.instructions[2].data, b"other1");
        assert!(!merged.instructions.iter().any(|i| i.data == b"other2"));
        assert_eq!(merged.instructions[3].data, b"setup");
        assert_eq!(merged.instructions[4].data, b"swap1");
        assert_eq!(merged.instructions[5].data, b"swap2");
        assert_eq!(merged.instructions[6].data, b"cleanup");
        // Tip is last
        assert_eq!(
            merged.instructions[7].program_id,
            solana_sdk::system_program::id()
        );

        // Lookup tables deduplicated, order preserved
        assert_eq!(merged.lookup_table_addresses, vec![lut1, lut2]);
    }

    #[test]
    fn test_no_price_instruction_when_zero() {
        let payer = Pubkey::new_unique();
        let program = Pubkey::new_unique();
        let legs = vec![bundle(
            vec![],
            vec![],
            ix(program, b"swap", &[]),
            vec![],
            vec![],
        )];
        let merged = merge_legs(&legs, &payer, 200_000, 0, None);
        // Exactly one compute-budget instruction (the limit), then the swap
        assert_eq!(merged.instructions.len(), 2);
        assert_eq!(merged.instructions[1].data, b"swap");
    }

    #[test]
    fn test_dedup_key_ignores_meta_order() {
        let program = Pubkey::new_unique();
        let k1 = Pubkey::new_unique();
        let k2 = Pubkey::new_unique();
        let a = ix(program, b"x", &[k1, k2]);
        let b = ix(program, b"x", &[k2, k1]);
        assert_eq!(instruction_dedup_key(&a), instruction_dedup_key(&b));

        let c = ix(program, b"y", &[k1, k2]);
        assert_ne!(instruction_dedup_key(&a), instruction_dedup_key(&c));
    }

    #[test]
    fn test_per_leg_compute_budget_discarded() {
        let payer = Pubkey::new_unique();
        let program = Pubkey::new_unique();
        let legs = vec![
            bundle(vec![], vec![], ix(program, b"s1", &[]), vec![], vec![]),
            bundle(vec![], vec![], ix(program, b"s2", &[]), vec![], vec![]),
        ];
        let merged = merge_legs(&legs, &payer, 300_000, 0, None);
        let cb_count = merged
            .instructions
            .iter()
            .filter(|i| i.program_id == solana_sdk::compute_budget::id())
            .count();
        assert_eq!(cb_count, 1, "per-leg compute budget must not leak through");
    }
}
