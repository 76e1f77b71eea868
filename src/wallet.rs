// Wallet keypair loading. The secret never reaches a log line; only the
// public key is ever printed.

use log::info;
use solana_sdk::signature::{read_keypair_file, Keypair};
use solana_sdk::signer::Signer;

use crate::errors::EngineError;

pub fn load_keypair(path: &str) -> Result<Keypair, EngineError> {
    let keypair = read_keypair_file(path).map_err(|e| {
        EngineError::Keystore(format!("cannot read keypair at {}: {}", path, e))
    })?;
    info!("🔑 Wallet loaded: {}", keypair.pubkey());
    Ok(keypair)
}
