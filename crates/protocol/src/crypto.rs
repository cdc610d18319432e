//! Cryptographic primitives for the secure handshake and channel
//!
//! Asymmetric key wrapping uses 3072-bit RSA with OAEP padding; payload
//! encryption uses AES-256-CBC with ISO 10126 padding. Key and IV sizes
//! travel on the wire verbatim, so nothing here is negotiated.

use crate::error::{ProtocolError, Result};
use aes::cipher::{block_padding::Iso10126, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Default RSA modulus length in bits
pub const RSA_KEY_BITS: usize = 3072;

/// AES key length in bytes
pub const AES_KEY_LEN: usize = 32;

/// AES block / IV length in bytes
pub const AES_IV_LEN: usize = 16;

/// Local asymmetric keypair.
///
/// The private half decrypts traffic addressed to this endpoint; the public
/// half is exported as a portable DER blob and shipped to the peer.
pub struct RsaKeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl RsaKeyPair {
    /// Generate a keypair with the default modulus length
    pub fn generate() -> Result<Self> {
        Self::generate_with_bits(RSA_KEY_BITS)
    }

    /// Generate a keypair with an explicit modulus length
    pub fn generate_with_bits(bits: usize) -> Result<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, bits).map_err(ProtocolError::crypto)?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    /// Export the public key as a PKCS#1 DER blob
    pub fn public_key_blob(&self) -> Result<Vec<u8>> {
        let doc = self
            .public
            .to_pkcs1_der()
            .map_err(ProtocolError::crypto)?;
        Ok(doc.as_bytes().to_vec())
    }

    /// OAEP-decrypt a blob wrapped against our public key
    pub fn unwrap_blob(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.private
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(ProtocolError::crypto)
    }
}

impl std::fmt::Debug for RsaKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaKeyPair").finish_non_exhaustive()
    }
}

/// A peer's public key, imported from its DER blob
#[derive(Debug, Clone)]
pub struct PeerPublicKey {
    public: RsaPublicKey,
}

impl PeerPublicKey {
    /// Import a PKCS#1 DER blob received from the peer
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let public = RsaPublicKey::from_pkcs1_der(blob).map_err(ProtocolError::crypto)?;
        Ok(Self { public })
    }

    /// OAEP-encrypt a blob for the peer
    pub fn wrap_blob(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.public
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
            .map_err(ProtocolError::crypto)
    }
}

/// One direction's symmetric key and IV.
///
/// Zeroized on drop. Equality is constant-time; it exists for tests that
/// check the two endpoints ended up with matching material.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricMaterial {
    key: [u8; AES_KEY_LEN],
    iv: [u8; AES_IV_LEN],
}

impl SymmetricMaterial {
    /// Generate fresh material from the OS RNG
    pub fn generate() -> Self {
        let mut key = [0u8; AES_KEY_LEN];
        let mut iv = [0u8; AES_IV_LEN];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut iv);
        Self { key, iv }
    }

    /// Reassemble material from unwrapped peer blobs
    pub fn from_parts(key: &[u8], iv: &[u8]) -> Result<Self> {
        let key: [u8; AES_KEY_LEN] = key
            .try_into()
            .map_err(|_| ProtocolError::crypto(format!("bad key length: {}", key.len())))?;
        let iv: [u8; AES_IV_LEN] = iv
            .try_into()
            .map_err(|_| ProtocolError::crypto(format!("bad IV length: {}", iv.len())))?;
        Ok(Self { key, iv })
    }

    /// Key bytes, for wrapping
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// IV bytes, for wrapping
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }
}

impl PartialEq for SymmetricMaterial {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.key[..].ct_eq(&other.key[..]) & self.iv[..].ct_eq(&other.iv[..]))
    }
}

impl Eq for SymmetricMaterial {}

impl std::fmt::Debug for SymmetricMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricMaterial").finish_non_exhaustive()
    }
}

/// A fixed-key AES-CBC cipher context for one direction.
///
/// The key and IV are set at construction and never rotate; every call runs
/// a full CBC pass with ISO 10126 padding.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CbcCipher {
    key: [u8; AES_KEY_LEN],
    iv: [u8; AES_IV_LEN],
}

impl CbcCipher {
    /// Build a cipher context from symmetric material
    pub fn new(material: &SymmetricMaterial) -> Self {
        Self {
            key: material.key,
            iv: material.iv,
        }
    }

    /// Encrypt a plaintext blob in one finalized pass
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Aes256CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<Iso10126>(plaintext)
    }

    /// Decrypt a ciphertext blob in one finalized pass
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Aes256CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Iso10126>(ciphertext)
            .map_err(|_| ProtocolError::Crypto("CBC decryption failed".into()))
    }
}

impl std::fmt::Debug for CbcCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CbcCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cbc_roundtrip() {
        let material = SymmetricMaterial::generate();
        let cipher = CbcCipher::new(&material);
        let plaintext = b"secret payload";
        let ciphertext = cipher.encrypt(plaintext);
        assert_ne!(&ciphertext, plaintext);
        assert_eq!(ciphertext.len() % AES_IV_LEN, 0);
        assert_eq!(cipher.decrypt(&ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn test_cbc_empty_plaintext() {
        let cipher = CbcCipher::new(&SymmetricMaterial::generate());
        let ciphertext = cipher.encrypt(b"");
        // ISO 10126 always emits at least one padding block
        assert_eq!(ciphertext.len(), AES_IV_LEN);
        assert!(cipher.decrypt(&ciphertext).unwrap().is_empty());
    }

    #[test]
    fn test_cbc_garbage_rejected() {
        let cipher = CbcCipher::new(&SymmetricMaterial::generate());
        assert!(cipher.decrypt(&[0u8; 7]).is_err());
    }

    #[test]
    fn test_rsa_wrap_roundtrip() {
        // Small modulus keeps keygen fast in tests; the wrap path is the same.
        let keypair = RsaKeyPair::generate_with_bits(1024).unwrap();
        let peer = PeerPublicKey::from_blob(&keypair.public_key_blob().unwrap()).unwrap();

        let material = SymmetricMaterial::generate();
        let wrapped_key = peer.wrap_blob(material.key()).unwrap();
        let wrapped_iv = peer.wrap_blob(material.iv()).unwrap();
        assert_ne!(wrapped_key.as_slice(), material.key());

        let key = keypair.unwrap_blob(&wrapped_key).unwrap();
        let iv = keypair.unwrap_blob(&wrapped_iv).unwrap();
        assert_eq!(SymmetricMaterial::from_parts(&key, &iv).unwrap(), material);
    }

    #[test]
    fn test_rsa_bad_blob_rejected() {
        assert!(PeerPublicKey::from_blob(b"not a key").is_err());
    }
}
