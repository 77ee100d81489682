//! Cryptography module: password-based key derivation and the incremental
//! AES-128-CBC cipher used for every encrypted segment of a container.
//!
//! Key derivation is PBKDF2-HMAC-SHA1 over the password and the salt stored in
//! the container header, truncated to a 128-bit AES key. Every encrypted
//! segment carries its own random IV; the metadata and data segments of one
//! record are two independent CBC streams initialized from the same IV.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;

use crate::error::SafeError;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// AES block size in bytes; also the default IV length.
pub const BLOCK_SIZE: usize = 16;
/// Derived key size in bytes (AES-128).
pub const KEY_SIZE: usize = 16;
/// Salt size in bytes written by `create`.
pub const SALT_SIZE: usize = 16;

pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn generate_iv(len: usize) -> Vec<u8> {
    let mut iv = vec![0u8; len];
    OsRng.fill_bytes(&mut iv);
    iv
}

pub fn derive_key(password: &str, salt: &[u8], iterations: u32) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha1>(password.as_bytes(), salt, iterations, &mut key);
    key
}

/// An incremental block cipher: feed plaintext or ciphertext through
/// [`update`](Cipher::update), then [`finalize`](Cipher::finalize) exactly once
/// to flush (encrypt) or strip (decrypt) the PKCS7 padding.
///
/// `update` buffers input internally and only emits whole blocks, so a call
/// may legitimately return an empty vector.
pub trait Cipher {
    fn update(&mut self, input: &[u8]) -> Result<Vec<u8>, SafeError>;
    fn finalize(&mut self) -> Result<Vec<u8>, SafeError>;
}

enum Inner {
    Encrypt(Aes128CbcEnc),
    Decrypt(Aes128CbcDec),
    Finished,
}

/// AES-128-CBC with PKCS7 padding, usable as a streaming [`Cipher`].
pub struct AesCbc {
    inner: Inner,
    carry: Vec<u8>,
}

impl AesCbc {
    pub fn encryptor(key: &[u8], iv: &[u8]) -> Result<Self, SafeError> {
        let enc = Aes128CbcEnc::new_from_slices(key, iv)
            .map_err(|e| SafeError::Crypto(format!("bad key/IV length: {}", e)))?;
        Ok(Self { inner: Inner::Encrypt(enc), carry: Vec::new() })
    }

    pub fn decryptor(key: &[u8], iv: &[u8]) -> Result<Self, SafeError> {
        let dec = Aes128CbcDec::new_from_slices(key, iv)
            .map_err(|e| SafeError::Crypto(format!("bad key/IV length: {}", e)))?;
        Ok(Self { inner: Inner::Decrypt(dec), carry: Vec::new() })
    }

}

/// Split off every processable whole block, leaving the remainder (and for
/// decryption the trailing block, which may hold padding) in `carry`.
fn take_blocks(carry: &mut Vec<u8>, keep_last_block: bool) -> Vec<u8> {
    let len = carry.len();
    let processable = if keep_last_block {
        // Hold back one full block until finalize.
        (len.saturating_sub(1) / BLOCK_SIZE) * BLOCK_SIZE
    } else {
        (len / BLOCK_SIZE) * BLOCK_SIZE
    };
    let rest = carry.split_off(processable);
    std::mem::replace(carry, rest)
}

impl Cipher for AesCbc {
    fn update(&mut self, input: &[u8]) -> Result<Vec<u8>, SafeError> {
        self.carry.extend_from_slice(input);
        match &mut self.inner {
            Inner::Encrypt(enc) => {
                let mut blocks = take_blocks(&mut self.carry, false);
                for chunk in blocks.chunks_exact_mut(BLOCK_SIZE) {
                    enc.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
                }
                Ok(blocks)
            }
            Inner::Decrypt(dec) => {
                let mut blocks = take_blocks(&mut self.carry, true);
                for chunk in blocks.chunks_exact_mut(BLOCK_SIZE) {
                    dec.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
                }
                Ok(blocks)
            }
            Inner::Finished => Err(SafeError::Crypto("cipher already finalized".into())),
        }
    }

    fn finalize(&mut self) -> Result<Vec<u8>, SafeError> {
        match std::mem::replace(&mut self.inner, Inner::Finished) {
            Inner::Encrypt(enc) => {
                if self.carry.len() >= BLOCK_SIZE {
                    return Err(SafeError::Crypto("unprocessed plaintext at finalize".into()));
                }
                let mut block = [0u8; BLOCK_SIZE];
                block[..self.carry.len()].copy_from_slice(&self.carry);
                let ct = enc
                    .encrypt_padded_mut::<Pkcs7>(&mut block, self.carry.len())
                    .map_err(|e| SafeError::Crypto(format!("padding failed: {}", e)))?;
                self.carry.clear();
                Ok(ct.to_vec())
            }
            Inner::Decrypt(dec) => {
                if self.carry.len() != BLOCK_SIZE {
                    return Err(SafeError::Crypto(
                        "ciphertext length is not a multiple of the block size".into(),
                    ));
                }
                let mut block = std::mem::take(&mut self.carry);
                let pt = dec
                    .decrypt_padded_mut::<Pkcs7>(&mut block)
                    .map_err(|_| SafeError::Crypto("bad padding (wrong password?)".into()))?;
                Ok(pt.to_vec())
            }
            Inner::Finished => Err(SafeError::Crypto("cipher already finalized".into())),
        }
    }
}

/// One-shot encryption of an in-memory buffer (header properties, record metadata).
pub fn encrypt_all(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, SafeError> {
    let mut cipher = AesCbc::encryptor(key, iv)?;
    let mut out = cipher.update(plaintext)?;
    out.extend(cipher.finalize()?);
    Ok(out)
}

/// One-shot decryption of an in-memory buffer.
pub fn decrypt_all(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, SafeError> {
    let mut cipher = AesCbc::decryptor(key, iv)?;
    let mut out = cipher.update(ciphertext)?;
    out.extend(cipher.finalize()?);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_round_trip() {
        let key = derive_key("secret", b"0123456789abcdef", 1000);
        let iv = generate_iv(BLOCK_SIZE);
        let plain = b"The quick brown fox jumps over the lazy dog";

        let ct = encrypt_all(&key, &iv, plain).unwrap();
        assert_eq!(ct.len() % BLOCK_SIZE, 0);
        assert_ne!(&ct[..plain.len().min(ct.len())], &plain[..]);

        let pt = decrypt_all(&key, &iv, &ct).unwrap();
        assert_eq!(pt, plain);
    }

    #[test]
    fn streaming_matches_one_shot() {
        let key = derive_key("secret", b"0123456789abcdef", 1000);
        let iv = generate_iv(BLOCK_SIZE);
        // Deliberately awkward chunk sizes around the block boundary.
        let plain: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

        let mut cipher = AesCbc::encryptor(&key, &iv).unwrap();
        let mut streamed = Vec::new();
        for chunk in plain.chunks(7) {
            streamed.extend(cipher.update(chunk).unwrap());
        }
        streamed.extend(cipher.finalize().unwrap());

        assert_eq!(streamed, encrypt_all(&key, &iv, &plain).unwrap());

        let mut dec = AesCbc::decryptor(&key, &iv).unwrap();
        let mut recovered = Vec::new();
        for chunk in streamed.chunks(13) {
            recovered.extend(dec.update(chunk).unwrap());
        }
        recovered.extend(dec.finalize().unwrap());
        assert_eq!(recovered, plain);
    }

    #[test]
    fn empty_plaintext_produces_one_padded_block() {
        let key = derive_key("secret", b"0123456789abcdef", 1000);
        let iv = generate_iv(BLOCK_SIZE);
        let ct = encrypt_all(&key, &iv, b"").unwrap();
        assert_eq!(ct.len(), BLOCK_SIZE);
        assert_eq!(decrypt_all(&key, &iv, &ct).unwrap(), b"");
    }

    #[test]
    fn wrong_key_is_a_crypto_error() {
        let key = derive_key("secret", b"0123456789abcdef", 1000);
        let other = derive_key("not the secret", b"0123456789abcdef", 1000);
        let iv = generate_iv(BLOCK_SIZE);
        let ct = encrypt_all(&key, &iv, b"payload bytes").unwrap();

        let result = decrypt_all(&other, &iv, &ct);
        assert!(matches!(result, Err(SafeError::Crypto(_))));
    }

    #[test]
    fn derive_key_is_deterministic_per_salt_and_rounds() {
        let a = derive_key("pw", b"salt-one-16bytes", 2000);
        let b = derive_key("pw", b"salt-one-16bytes", 2000);
        let c = derive_key("pw", b"salt-two-16bytes", 2000);
        let d = derive_key("pw", b"salt-one-16bytes", 2001);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }
}
