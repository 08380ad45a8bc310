// Copyright 2024 The Reposync Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Password-derived keys for encrypted repositories.
//!
//! A repo's `magic` is the hex of a key derived from `repo_id || password`;
//! verifying a password recomputes the same derivation and compares. The
//! actual blob payload is protected with AES-128-CBC using a key/IV pair
//! derived the same way, so two installs that both know the password can
//! derive identical keys without ever transmitting them.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::Hmac;
use pbkdf2::pbkdf2;
use sha1::Sha1;
use thiserror::Error;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// `enc_version` selects the KDF iteration count. Version 1 is the original,
/// low-iteration scheme kept only so old repos still decrypt; new repos
/// should always be created with the current version.
pub const CURRENT_ENC_VERSION: u32 = 2;

fn iterations_for_version(enc_version: u32) -> u32 {
    match enc_version {
        1 => 1000,
        _ => 100_000,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedKeys {
    pub key: [u8; 16],
    pub iv: [u8; 16],
}

impl DerivedKeys {
    pub fn key_hex(&self) -> String {
        hex::encode(self.key)
    }

    pub fn iv_hex(&self) -> String {
        hex::encode(self.iv)
    }
}

/// Derives a 16-byte key and 16-byte IV from `repo_id || password` using
/// PBKDF2-HMAC-SHA1, with the iteration count selected by `enc_version`.
pub fn derive_keys(repo_id: &str, password: &str, enc_version: u32) -> DerivedKeys {
    let mut salt = Vec::with_capacity(repo_id.len() + password.len());
    salt.extend_from_slice(repo_id.as_bytes());
    salt.extend_from_slice(password.as_bytes());

    let mut okm = [0u8; 32];
    pbkdf2::<Hmac<Sha1>>(
        password.as_bytes(),
        &salt,
        iterations_for_version(enc_version),
        &mut okm,
    )
    .expect("32-byte PBKDF2 output is always valid");

    let mut key = [0u8; 16];
    let mut iv = [0u8; 16];
    key.copy_from_slice(&okm[0..16]);
    iv.copy_from_slice(&okm[16..32]);
    DerivedKeys { key, iv }
}

/// The 32-hex fingerprint stored on the repo. Proves a password is correct
/// without ever storing the password itself.
pub fn generate_magic(repo_id: &str, password: &str, enc_version: u32) -> String {
    derive_keys(repo_id, password, enc_version).key_hex()
}

/// Returns `true` iff `password` re-derives the stored `magic`.
pub fn verify_password(repo_id: &str, password: &str, enc_version: u32, magic: &str) -> bool {
    generate_magic(repo_id, password, enc_version) == magic
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("ciphertext is not a multiple of the AES block size or padding is invalid")]
    InvalidCiphertext,
}

/// Encrypts one chunk's plaintext with AES-128-CBC/PKCS7 under the repo's
/// derived key and IV.
pub fn encrypt_chunk(keys: &DerivedKeys, plaintext: &[u8]) -> Vec<u8> {
    Aes128CbcEnc::new(&keys.key.into(), &keys.iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypts a chunk previously produced by [`encrypt_chunk`]. Returns
/// [`CryptoError::InvalidCiphertext`] for a wrong key/IV or corrupted data,
/// rather than panicking — the password may simply be wrong.
pub fn decrypt_chunk(keys: &DerivedKeys, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    Aes128CbcDec::new(&keys.key.into(), &keys.iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::InvalidCiphertext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let keys = derive_keys("repo-1", "hunter2", CURRENT_ENC_VERSION);
        let ciphertext = encrypt_chunk(&keys, b"hello world");
        assert_ne!(ciphertext, b"hello world");
        assert_eq!(decrypt_chunk(&keys, &ciphertext).unwrap(), b"hello world");
    }

    #[test]
    fn wrong_password_fails_to_decrypt_or_produces_garbage() {
        let keys = derive_keys("repo-1", "hunter2", CURRENT_ENC_VERSION);
        let ciphertext = encrypt_chunk(&keys, b"hello world");
        let wrong_keys = derive_keys("repo-1", "hunter3", CURRENT_ENC_VERSION);
        let result = decrypt_chunk(&wrong_keys, &ciphertext);
        assert!(result.is_err() || result.unwrap() != b"hello world");
    }

    #[test]
    fn verify_password_matches_generate_magic() {
        let magic = generate_magic("repo-1", "pw", CURRENT_ENC_VERSION);
        assert!(verify_password("repo-1", "pw", CURRENT_ENC_VERSION, &magic));
        assert!(!verify_password("repo-1", "pwx", CURRENT_ENC_VERSION, &magic));
    }
}
