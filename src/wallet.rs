// Wallet secret loading
//
// Accepts the three documented encodings: base58 string, JSON byte array,
// or a filesystem path to a JSON byte array (solana-keygen format).

use anyhow::{Context, Result};
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use std::path::Path;
use tracing::info;

/// Parse the wallet secret from its raw env value
pub fn load_keypair(secret: &str) -> Result<Keypair> {
    let trimmed = secret.trim();

    // JSON byte array, inline
    if trimmed.starts_with('[') {
        return keypair_from_json(trimmed).context("failed to parse WALLET_SECRET_KEY JSON array");
    }

    // Path to a JSON byte array file
    if Path::new(trimmed).exists() {
        let raw = std::fs::read_to_string(trimmed)
            .with_context(|| format!("failed to read wallet file {}", trimmed))?;
        return keypair_from_json(raw.trim())
            .with_context(|| format!("failed to parse wallet file {}", trimmed));
    }

    // Base58 secret key
    let bytes = bs58::decode(trimmed)
        .into_vec()
        .context("WALLET_SECRET_KEY is neither a JSON array, a file path, nor base58")?;
    let keypair = Keypair::from_bytes(&bytes).context("invalid base58 secret key length")?;
    info!("🔑 Wallet loaded: {}", keypair.pubkey());
    Ok(keypair)
}

fn keypair_from_json(raw: &str) -> Result<Keypair> {
    let bytes: Vec<u8> = serde_json::from_str(raw)?;
    let keypair = Keypair::from_bytes(&bytes).context("invalid secret key length")?;
    info!("🔑 Wallet loaded: {}", keypair.pubkey());
    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_json_array_roundtrip() {
        let keypair = Keypair::new();
        let json = serde_json::to_string(&keypair.to_bytes().to_vec()).unwrap();
        let loaded = load_keypair(&json).unwrap();
        assert_eq!(loaded.pubkey(), keypair.pubkey());
    }

    #[test]
    fn test_base58_roundtrip() {
        let keypair = Keypair::new();
        let b58 = bs58::encode(keypair.to_bytes()).into_string();
        let loaded = load_keypair(&b58).unwrap();
        assert_eq!(loaded.pubkey(), keypair.pubkey());
    }

    #[test]
    fn test_path_roundtrip() {
        let keypair = Keypair::new();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "{}",
            serde_json::to_string(&keypair.to_bytes().to_vec()).unwrap()
        )
        .unwrap();
        let loaded = load_keypair(file.path().to_str().unwrap()).unwrap();
        assert_eq!(loaded.pubkey(), keypair.pubkey());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(load_keypair("!!not-a-key!!").is_err());
        assert!(load_keypair("[1,2,3]").is_err());
    }
}
