//! Deterministic stand-in for the key tool.

use crate::keys::KeyRecord;
use sha2::{Digest, Sha256};

const ADDRESS_PREFIX: &str = "Pts";
const PUBLIC_PREFIX: &str = "XTS";
const WIF_PREFIX: &str = "5K";
const BODY_LENGTH: usize = 40;

fn body(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    hex.truncate(BODY_LENGTH);
    hex
}

/// Key `index` derived from `seed`.
pub fn key(seed: &str, index: usize) -> KeyRecord {
    let body = body(&format!("{seed}{index}"));
    KeyRecord {
        pts_address: format!("{ADDRESS_PREFIX}{body}"),
        public_key: format!("{PUBLIC_PREFIX}{body}"),
        wif_private_key: format!("{WIF_PREFIX}{body}"),
    }
}

/// The first `count` keys derived from `seed`.
pub fn generate(count: usize, seed: &str) -> Vec<KeyRecord> {
    (0..count).map(|index| key(seed, index)).collect()
}

/// Address that owns the balance of a private key produced by [generate].
pub fn address_of(wif: &str) -> Option<String> {
    wif.strip_prefix(WIF_PREFIX)
        .filter(|body| body.len() == BODY_LENGTH)
        .map(|body| format!("{ADDRESS_PREFIX}{body}"))
}

/// Public key a wallet assigns to a freshly created account.
pub fn account_key(name: &str) -> String {
    format!("{PUBLIC_PREFIX}{}", body(&format!("account:{name}")))
}
