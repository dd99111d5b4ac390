use aes_gcm::{
    aead::{Aead as _, KeyInit as _, Payload},
    Aes256Gcm, Nonce,
};
use argon2::{
    password_hash::{PasswordHasher as _, SaltString},
    Algorithm, Argon2, Params, Version,
};
use base64::Engine as _;
use hkdf::Hkdf;
use rand::Rng as _;
use secrecy::{ExposeSecret as _, SecretString};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::errors::VaultError;

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub type VaultKey = Zeroizing<[u8; 32]>;

pub fn fill_random(buf: &mut [u8]) {
    let mut rng = rand::rng();
    rng.fill_bytes(buf);
}

pub fn random_salt() -> [u8; SALT_LEN] {
    let mut s = [0_u8; SALT_LEN];
    fill_random(&mut s);
    s
}

/// Derive the vault data key from a password and the per-vault salt.
///
/// Argon2id stretches the password into a master key; HKDF then binds the
/// result to its purpose so the master key itself never encrypts anything.
pub fn derive_vault_key(
    password: &SecretString,
    salt: &[u8; SALT_LEN],
) -> Result<VaultKey, VaultError> {
    // Frozen Argon2id parameters (the argon2 0.5.x defaults).
    let params = Params::new(19 * 1024, 2, 1, Some(32))
        .map_err(|e| VaultError::Crypto(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let salt = SaltString::encode_b64(salt)
        .map_err(|e| VaultError::Crypto(format!("encode salt: {e}")))?;

    let hash = argon2
        .hash_password(password.expose_secret().as_bytes(), &salt)
        .map_err(|e| VaultError::Crypto(format!("argon2 hash: {e}")))?;
    let out = hash
        .hash
        .ok_or_else(|| VaultError::Crypto("argon2 missing hash".to_owned()))?;
    let Some(raw) = out.as_bytes().get(..32) else {
        return Err(VaultError::Crypto("argon2 hash too short".to_owned()));
    };
    let mut master = Zeroizing::new([0_u8; 32]);
    master.copy_from_slice(raw);

    let hk = Hkdf::<Sha256>::new(None, master.as_slice());
    let mut key = Zeroizing::new([0_u8; 32]);
    hk.expand(b"walletvault:vault:data", key.as_mut_slice())
        .map_err(|e| VaultError::Crypto(format!("hkdf expand: {e}")))?;
    Ok(key)
}

/// Encrypt `plaintext` into `base64(nonce || ciphertext || tag)`.
///
/// `label` (the entry name) is bound as associated data: a blob only opens
/// under the name it was sealed for.
pub fn seal(key: &[u8; 32], label: &str, plaintext: &[u8]) -> Result<String, VaultError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| VaultError::Crypto(format!("aes init: {e}")))?;
    let mut nonce = [0_u8; NONCE_LEN];
    fill_random(&mut nonce);
    let ct = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: label.as_bytes(),
            },
        )
        .map_err(|e| VaultError::Crypto(format!("aes encrypt: {e}")))?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ct.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ct);
    Ok(base64::engine::general_purpose::STANDARD.encode(blob))
}

/// Authenticate and decrypt a blob produced by [`seal`].
///
/// Any failure (bad encoding, truncated blob, wrong key, wrong label, tampering)
/// yields `DecryptionFailed(label)`; no partial plaintext is ever returned.
pub fn open(key: &[u8; 32], blob: &str, label: &str) -> Result<Zeroizing<Vec<u8>>, VaultError> {
    let failed = || VaultError::DecryptionFailed(label.to_owned());
    let raw = base64::engine::general_purpose::STANDARD
        .decode(blob)
        .map_err(|e| {
            tracing::debug!(key = label, error = %e, "vault blob is not valid base64");
            failed()
        })?;
    if raw.len() < NONCE_LEN + TAG_LEN {
        return Err(failed());
    }
    let (nonce, ct) = raw.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| VaultError::Crypto(format!("aes init: {e}")))?;
    let payload = Payload {
        msg: ct,
        aad: label.as_bytes(),
    };
    let pt = cipher.decrypt(Nonce::from_slice(nonce), payload).map_err(|e| {
        tracing::debug!(key = label, error = %e, "vault blob failed authentication");
        failed()
    })?;
    Ok(Zeroizing::new(pt))
}
