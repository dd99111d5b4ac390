//! Private key and mnemonic validation, BIP-32/BIP-44 derivation, addresses.

use crate::errors::KeyError;
use alloy::signers::local::{coins_bip39::English, MnemonicBuilder, PrivateKeySigner};
use bip39::{Language, Mnemonic};
use zeroize::Zeroizing;

pub const DEFAULT_DERIVATION_PATH: &str = "m/44'/60'/0'/0/0";
const PRIVATE_KEY_HEX_LEN: usize = 64;
const MIN_PATH_COMPONENTS: usize = 5;

/// Key material derived from a mnemonic. The private key is `0x`-prefixed hex.
pub struct DerivedKey {
    pub private_key: Zeroizing<String>,
    pub address: String,
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

/// Decode and range-check a hex private key.
fn parse_private_key(hex_key: &str) -> Result<Zeroizing<[u8; 32]>, KeyError> {
    let digits = strip_hex_prefix(hex_key.trim());
    let length = digits.chars().count();
    if length != PRIVATE_KEY_HEX_LEN {
        return Err(KeyError::InvalidFormat {
            length,
            reason: "wrong length",
        });
    }
    let mut bytes = Zeroizing::new([0_u8; 32]);
    hex::decode_to_slice(digits, bytes.as_mut_slice()).map_err(|e| {
        tracing::debug!(error = %e, "private key is not hex");
        KeyError::InvalidFormat {
            length,
            reason: "not hexadecimal",
        }
    })?;
    // Rejects zero and values at or above the secp256k1 group order.
    k256::SecretKey::from_slice(bytes.as_slice()).map_err(|e| {
        tracing::debug!(error = %e, "private key is not a valid secp256k1 scalar");
        KeyError::InvalidFormat {
            length,
            reason: "not a valid secp256k1 scalar",
        }
    })?;
    Ok(bytes)
}

pub fn validate_private_key(hex_key: &str) -> Result<(), KeyError> {
    parse_private_key(hex_key).map(drop)
}

/// Canonical stored form: `0x` + 64 lowercase hex digits.
pub fn normalize_private_key(hex_key: &str) -> Result<Zeroizing<String>, KeyError> {
    let bytes = parse_private_key(hex_key)?;
    Ok(Zeroizing::new(format!("0x{}", hex::encode(bytes.as_slice()))))
}

/// EIP-55 checksummed address for a hex private key.
pub fn address_of(hex_key: &str) -> Result<String, KeyError> {
    let bytes = parse_private_key(hex_key)?;
    let signer = PrivateKeySigner::from_slice(bytes.as_slice())
        .map_err(|e| KeyError::Derivation(format!("load private key: {e}")))?;
    Ok(signer.address().to_checksum(None))
}

/// Collapse runs of whitespace so pasted phrases compare equal.
pub fn normalize_mnemonic(phrase: &str) -> Zeroizing<String> {
    Zeroizing::new(phrase.split_whitespace().collect::<Vec<_>>().join(" "))
}

pub fn validate_mnemonic(phrase: &str) -> Result<(), KeyError> {
    let normalized = normalize_mnemonic(phrase);
    let word_count = normalized.split(' ').filter(|w| !w.is_empty()).count();
    if word_count != 12 && word_count != 24 {
        return Err(KeyError::InvalidMnemonic { word_count });
    }
    Mnemonic::parse_in_normalized(Language::English, normalized.as_str()).map_err(|e| {
        tracing::debug!(error = %e, "mnemonic failed bip39 validation");
        KeyError::InvalidMnemonic { word_count }
    })?;
    Ok(())
}

/// Generate a fresh English mnemonic with `words` words (12 or 24).
pub fn generate_mnemonic(words: usize) -> Result<Zeroizing<String>, KeyError> {
    if words != 12 && words != 24 {
        return Err(KeyError::InvalidMnemonic { word_count: words });
    }
    // 16 bytes of entropy per 12 words.
    let mut entropy = Zeroizing::new(vec![0_u8; words / 12 * 16]);
    crate::vault::crypto::fill_random(entropy.as_mut_slice());
    let mnemonic = Mnemonic::from_entropy_in(Language::English, entropy.as_slice())
        .map_err(|e| KeyError::Derivation(format!("mnemonic from entropy: {e}")))?;
    Ok(Zeroizing::new(mnemonic.to_string()))
}

fn invalid_path(path: &str, reason: impl Into<String>) -> KeyError {
    KeyError::InvalidDerivationPath {
        path: path.to_owned(),
        reason: reason.into(),
    }
}

/// Check a BIP-32 path of the form `m/44'/60'/0'/0/0`.
///
/// At least five components after `m`; each is a decimal index below 2^31,
/// optionally hardened with `'` or `h`.
pub fn validate_derivation_path(path: &str) -> Result<(), KeyError> {
    let mut parts = path.trim().split('/');
    if parts.next() != Some("m") {
        return Err(invalid_path(path, "must start with m/"));
    }
    let components: Vec<&str> = parts.collect();
    if components.len() < MIN_PATH_COMPONENTS {
        return Err(invalid_path(
            path,
            format!(
                "expected at least {MIN_PATH_COMPONENTS} components, got {}",
                components.len()
            ),
        ));
    }
    for c in components {
        let index = c
            .strip_suffix('\'')
            .or_else(|| c.strip_suffix('h'))
            .unwrap_or(c);
        if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid_path(path, format!("bad component {c:?}")));
        }
        let n: u32 = index
            .parse()
            .map_err(|e| invalid_path(path, format!("component {c:?}: {e}")))?;
        if n >= 1 << 31 {
            return Err(invalid_path(path, format!("component {c:?} out of range")));
        }
    }
    Ok(())
}

/// Derive the private key and address at `path` for a BIP-39 phrase.
pub fn derive_from_mnemonic(phrase: &str, path: &str) -> Result<DerivedKey, KeyError> {
    validate_mnemonic(phrase)?;
    validate_derivation_path(path)?;
    let normalized = normalize_mnemonic(phrase);

    let signer = MnemonicBuilder::<English>::default()
        .phrase(normalized.as_str())
        .derivation_path(path.trim())
        .map_err(|e| invalid_path(path, e.to_string()))?
        .build()
        .map_err(|e| KeyError::Derivation(format!("build signer: {e}")))?;

    let private_key = Zeroizing::new(format!(
        "0x{}",
        hex::encode(signer.credential().to_bytes())
    ));
    Ok(DerivedKey {
        private_key,
        address: signer.address().to_checksum(None),
    })
}
