//! Hybrid RSA+AES streaming codec.
//!
//! A replica is encrypted block by block. Each block reads up to `B - 2`
//! plaintext bytes (`B` = RSA modulus size in bytes), AES-256-CTR-encrypts
//! them with a key stream that runs continuously across the whole file, then
//! wraps the result with textbook RSA so it always serializes to exactly `B`
//! bytes: the AES output is left-padded with zero bytes up to `B - 2`,
//! interpreted as a big-endian integer strictly less than the modulus, raised
//! to a power mod `n`. No OAEP/PKCS1 padding is applied, the block is
//! already fixed-length by construction, and padding schemes would eat into
//! the `B - 2` plaintext budget the ciphertext-size formula depends on.
//!
//! The wrap uses the *private* exponent `d` and the unwrap uses the *public*
//! exponent `e`, the reverse of conventional RSA encryption. Raw RSA modpow
//! is symmetric (`(m^d)^e == (m^e)^d == m mod n`), so this is still a valid
//! round trip; the reason to orient it this way is that only the party
//! holding the private key can ever *produce* a valid replica (the client,
//! at replica-creation time), while any holder of the public half, which is
//! all a keeper is ever given, per `DecryptionKeys`, can *read* it back.
//! This matches the original C++ source (`EncryptData`/`DecryptData` driven
//! by `RSA_private_encrypt`/`RSA_public_decrypt`) and keeps the keeper from
//! ever needing, or being trusted with, the client's private exponent.

use aes::cipher::{KeyIvInit, StreamCipher};
use rand::rngs::OsRng;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};

use crate::error::{StorageError, StorageResult};
use crate::secure_random::fill_secure_bytes;
use crate::types::DecryptionKeys;

type Aes256Ctr = ctr::Ctr64BE<aes::Aes256>;

/// Minimum RSA modulus, in bits, accepted by `generate_keys`. Below this the
/// `B - 2`-byte plaintext block isn't guaranteed to land under the modulus
/// with enough margin for the modular reduction to be lossless.
pub const MIN_MODULUS_BITS: usize = 1024;

/// A fixed AES-256-CTR IV used for every replica. Each replica gets a freshly
/// generated AES key (see `generate_keys`), so the (key, IV) pair is unique
/// per replica despite the IV being constant.
const CTR_IV: [u8; 16] = [0u8; 16];

/// A generated RSA keypair plus the AES-256 key used for the bulk cipher.
/// The client keeps this whole struct; only the public half plus the AES key
/// (see `ReplicaKeys::decryption_keys`) ever go out on the wire.
pub struct ReplicaKeys {
    pub rsa_private: RsaPrivateKey,
    pub rsa_public: RsaPublicKey,
    pub aes_key: [u8; 32],
}

impl ReplicaKeys {
    /// The half of this keypair safe to hand to a keeper: public modulus and
    /// exponent plus the AES key, sufficient to decrypt but not to forge a
    /// replica.
    pub fn decryption_keys(&self) -> DecryptionKeys {
        DecryptionKeys {
            modulus: self.rsa_public.n().to_bytes_be(),
            public_exponent: self.rsa_public.e().to_bytes_be(),
            aes_key: self.aes_key,
        }
    }
}

/// Generate a fresh RSA keypair and AES-256 key, both from `OsRng`. The
/// original hard-coded a 16-byte AES key; this crate never does.
pub fn generate_keys(rsa_bits: usize) -> StorageResult<ReplicaKeys> {
    if rsa_bits < MIN_MODULUS_BITS {
        return Err(StorageError::CryptoFailure(format!(
            "rsa_bits {} below minimum {}",
            rsa_bits, MIN_MODULUS_BITS
        )));
    }

    let rsa_private = RsaPrivateKey::new(&mut OsRng, rsa_bits)
        .map_err(|e| StorageError::CryptoFailure(format!("rsa keygen failed: {}", e)))?;
    let rsa_public = RsaPublicKey::from(&rsa_private);

    let mut aes_key = [0u8; 32];
    fill_secure_bytes(&mut aes_key);

    Ok(ReplicaKeys {
        rsa_private,
        rsa_public,
        aes_key,
    })
}

/// The RSA modulus size in bytes: the codec's fixed block size `B`.
pub fn block_size(public: &RsaPublicKey) -> usize {
    public.size()
}

/// `⌈n/(B−2)⌉·B`: the on-disk ciphertext size for a `plaintext_size`-byte
/// file under a codec with block size `block_size`.
pub fn ciphertext_size(plaintext_size: u64, block_size: usize) -> u64 {
    let payload = (block_size - 2) as u64;
    let blocks = plaintext_size.div_ceil(payload).max(1);
    blocks * block_size as u64
}

fn wrap_block_rsa(plain_block: &[u8], n: &BigUint, exponent: &BigUint, b: usize) -> StorageResult<Vec<u8>> {
    debug_assert_eq!(plain_block.len(), b - 2);

    let m = BigUint::from_bytes_be(plain_block);
    let c = m.modpow(exponent, n);

    let mut out = c.to_bytes_be();
    if out.len() > b {
        return Err(StorageError::CryptoFailure(
            "rsa-wrapped block overflowed modulus width".to_string(),
        ));
    }
    let mut padded = vec![0u8; b - out.len()];
    padded.append(&mut out);
    Ok(padded)
}

fn unwrap_block_rsa(cipher_block: &[u8], n: &BigUint, exponent: &BigUint, b: usize) -> StorageResult<Vec<u8>> {
    if cipher_block.len() != b {
        return Err(StorageError::BadCiphertextSize(format!(
            "expected {} byte block, got {}",
            b,
            cipher_block.len()
        )));
    }

    let c = BigUint::from_bytes_be(cipher_block);
    let m = c.modpow(exponent, n);

    let mut out = m.to_bytes_be();
    let target = b - 2;
    if out.len() > target {
        return Err(StorageError::CryptoFailure(
            "rsa-unwrapped block wider than plaintext budget".to_string(),
        ));
    }
    let mut padded = vec![0u8; target - out.len()];
    padded.append(&mut out);
    Ok(padded)
}

/// Encrypt `plaintext` into a ciphertext whose length is exactly
/// `ciphertext_size(plaintext.len(), block_size(&rsa_private.to_public_key()))`.
///
/// Consumes a one-shot AES key: the caller owns `aes_key` (generated fresh
/// per replica by `generate_keys`) and this function uses it for a single
/// streaming pass, in keeping with the codec's one-shot-owner design (§9).
/// Wraps each block with the *private* exponent; see the module docs for why.
pub fn encrypt_stream(
    plaintext: &[u8],
    aes_key: &[u8; 32],
    rsa_private: &RsaPrivateKey,
) -> StorageResult<Vec<u8>> {
    let b = rsa_private.size();
    let payload_len = b - 2;
    let n = rsa_private.n();
    let d = rsa_private.d();

    let mut cipher = Aes256Ctr::new(aes_key.into(), &CTR_IV.into());
    let block_count = ciphertext_size(plaintext.len() as u64, b) as usize / b;
    let mut out = Vec::with_capacity(block_count * b);

    for i in 0..block_count {
        let start = i * payload_len;
        let end = std::cmp::min(start + payload_len, plaintext.len());
        let mut buf = vec![0u8; payload_len];
        if start < plaintext.len() {
            buf[..end - start].copy_from_slice(&plaintext[start..end]);
        }
        cipher.apply_keystream(&mut buf);
        out.extend(wrap_block_rsa(&buf, n, d, b)?);
    }

    Ok(out)
}

/// Decrypt a ciphertext produced by `encrypt_stream` back to exactly
/// `plaintext_size` bytes (the caller's own `StorageOrder.file_size`, not a
/// field of `keys`, see `DecryptionKeys`'s doc comment). Unwraps each block
/// with the *public* exponent carried in `keys`.
pub fn decrypt_stream(ciphertext: &[u8], keys: &DecryptionKeys, plaintext_size: u64) -> StorageResult<Vec<u8>> {
    let n = BigUint::from_bytes_be(&keys.modulus);
    let e = BigUint::from_bytes_be(&keys.public_exponent);
    let b = keys.modulus.len();

    if ciphertext.len() % b != 0 {
        return Err(StorageError::BadCiphertextSize(format!(
            "ciphertext length {} not a multiple of block size {}",
            ciphertext.len(),
            b
        )));
    }

    let payload_len = b - 2;
    let mut cipher = Aes256Ctr::new((&keys.aes_key).into(), &CTR_IV.into());
    let mut out = Vec::with_capacity(ciphertext.len() / b * payload_len);

    for block in ciphertext.chunks(b) {
        let mut buf = unwrap_block_rsa(block, &n, &e, b)?;
        cipher.apply_keystream(&mut buf);
        out.extend_from_slice(&buf);
    }

    if (plaintext_size as usize) > out.len() {
        return Err(StorageError::ShortRead(format!(
            "decrypted {} bytes, expected at least {}",
            out.len(),
            plaintext_size
        )));
    }
    out.truncate(plaintext_size as usize);
    Ok(out)
}
