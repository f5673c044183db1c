//! Cryptographic primitives
//!
//! Everything the account store and transfer protocol need: email
//! hashing, login key derivation, envelope encryption of profile
//! fields, chunked file hashing, and transfer tokens.
//!
//! The envelope key is derived from the plaintext email, so profile
//! fields are only decryptable once a user has logged in and supplied
//! that email. The email itself is never persisted.

use crate::error::{Error, Result};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use std::fmt::Write as _;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use subtle::ConstantTimeEq;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// PBKDF2-HMAC-SHA512 iteration count.
pub const PBKDF2_ITERATIONS: u32 = 10_000;

/// Derived login key length in bytes.
pub const LOGIN_KEY_LEN: usize = 64;

/// Salt length in bytes.
pub const SALT_LEN: usize = 32;

/// Transfer token length in bytes (hex-encoded on the wire).
pub const TOKEN_LEN: usize = 32;

const IV_LEN: usize = 16;

/// File hashing reads in chunks of this many bytes.
const HASH_CHUNK_SIZE: usize = 4096;

/// Lowercase-hex SHA-256 of an email address; the on-server primary
/// key for an account.
#[must_use]
pub fn email_hash(email: &str) -> String {
    hex_encode(&Sha256::digest(email.as_bytes()))
}

/// Generate a fresh random salt.
#[must_use]
pub fn make_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derive the stored login key from a password and salt.
#[must_use]
pub fn derive_login_key(password: &str, salt: &[u8]) -> [u8; LOGIN_KEY_LEN] {
    let mut key = [0u8; LOGIN_KEY_LEN];
    pbkdf2_hmac::<Sha512>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Constant-time comparison of a derived key against the stored one.
#[must_use]
pub fn verify_login_key(candidate: &[u8], stored: &[u8]) -> bool {
    candidate.ct_eq(stored).into()
}

/// Generate a fresh transfer token: 32 random bytes, lowercase hex.
#[must_use]
pub fn make_token() -> String {
    let mut bytes = [0u8; TOKEN_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

/// First 32 bytes of SHAKE-256 over the plaintext email; the AES key
/// for that user's profile envelopes.
#[must_use]
pub fn envelope_key(email: &str) -> [u8; 32] {
    use sha3::Shake256;
    use sha3::digest::{ExtendableOutput, Update, XofReader};

    let mut hasher = Shake256::default();
    hasher.update(email.as_bytes());
    let mut key = [0u8; 32];
    XofReader::read(&mut hasher.finalize_xof(), &mut key);
    key
}

/// Encrypt a profile field under the owner's envelope key.
///
/// AES-256-CBC with PKCS7 padding and a fresh random IV prepended to
/// the ciphertext; the whole blob is base64-encoded.
pub fn encrypt_field(plaintext: &str, email: &str) -> Result<String> {
    let key = envelope_key(email);
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let msg_len = plaintext.len();
    let mut buf = vec![0u8; msg_len + IV_LEN];
    buf[..msg_len].copy_from_slice(plaintext.as_bytes());
    let ciphertext = Aes256CbcEnc::new((&key).into(), (&iv).into())
        .encrypt_padded_mut::<Pkcs7>(&mut buf, msg_len)
        .map_err(|_| Error::Crypto("envelope encryption failed".into()))?;

    let mut blob = Vec::with_capacity(IV_LEN + ciphertext.len());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(ciphertext);
    Ok(BASE64.encode(blob))
}

/// Decrypt a profile field. Fails if the blob is malformed or the
/// email does not match the one the field was encrypted under.
pub fn decrypt_field(encoded: &str, email: &str) -> Result<String> {
    let key = envelope_key(email);
    let blob = BASE64
        .decode(encoded)
        .map_err(|_| Error::Crypto("invalid base64 envelope".into()))?;
    if blob.len() < IV_LEN || (blob.len() - IV_LEN) % 16 != 0 {
        return Err(Error::Crypto("truncated envelope".into()));
    }
    let iv: [u8; IV_LEN] = blob[..IV_LEN]
        .try_into()
        .map_err(|_| Error::Crypto("truncated envelope".into()))?;

    let mut buf = blob[IV_LEN..].to_vec();
    let plaintext = Aes256CbcDec::new((&key).into(), (&iv).into())
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|_| Error::Crypto("envelope decryption failed".into()))?;
    String::from_utf8(plaintext.to_vec())
        .map_err(|_| Error::Crypto("decrypted envelope is not UTF-8".into()))
}

/// Lowercase-hex SHA-256 of a file, read in 4096-byte chunks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; HASH_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
