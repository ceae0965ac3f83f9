//! SSH public keys and signatures (RFC 4253 Section 6.6, RFC 8332).
//!
//! # Supported Algorithms
//!
//! - `ssh-ed25519` - EdDSA signature using Ed25519
//! - `rsa-sha2-256` - RSA PKCS#1 v1.5 signature with SHA-256
//! - `rsa-sha2-512` - RSA PKCS#1 v1.5 signature with SHA-512
//! - `ssh-rsa` - RSA PKCS#1 v1.5 signature with SHA-1 (legacy servers only)
//!
//! A [`PublicKey`] never holds private material. It is either the projection
//! of a [`KeyPair`](super::privatekey::KeyPair) or decoded from the host key
//! blob a server sends during key exchange.
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::{KeyPair, PublicKey};
//!
//! # fn example() -> keel_platform::KeelResult<()> {
//! let key = KeyPair::generate_ed25519();
//! let public = key.clone_public_key();
//!
//! let signature = key.sign_detached(b"data to sign")?;
//! assert!(public.verify_detached(b"data to sign", &signature));
//!
//! let line = public.to_openssh();
//! assert_eq!(PublicKey::from_openssh(&line)?, public);
//! println!("{}", public.fingerprint());
//! # Ok(())
//! # }
//! ```

use super::privatekey::MAX_RSA_BITS;
use super::wire::{read_bytes, read_string, write_bytes, write_mpint, write_string};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use bytes::BytesMut;
use ed25519_dalek::{Verifier, VerifyingKey};
use keel_platform::{KeelError, KeelResult};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

/// Host key algorithm identifier, as negotiated in KEXINIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyAlgorithm {
    /// ssh-ed25519
    SshEd25519,
    /// rsa-sha2-256
    RsaSha2_256,
    /// rsa-sha2-512
    RsaSha2_512,
    /// ssh-rsa (SHA-1)
    SshRsa,
}

impl HostKeyAlgorithm {
    /// Get the algorithm name as specified in RFC 4253 / RFC 8332
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
            HostKeyAlgorithm::RsaSha2_256 => "rsa-sha2-256",
            HostKeyAlgorithm::RsaSha2_512 => "rsa-sha2-512",
            HostKeyAlgorithm::SshRsa => "ssh-rsa",
        }
    }

    /// Parse algorithm from name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ssh-ed25519" => Some(HostKeyAlgorithm::SshEd25519),
            "rsa-sha2-256" => Some(HostKeyAlgorithm::RsaSha2_256),
            "rsa-sha2-512" => Some(HostKeyAlgorithm::RsaSha2_512),
            "ssh-rsa" => Some(HostKeyAlgorithm::SshRsa),
            _ => None,
        }
    }

    /// Signature hash for RSA algorithms, `None` for Ed25519.
    pub fn signature_hash(&self) -> Option<SignatureHash> {
        match self {
            HostKeyAlgorithm::SshEd25519 => None,
            HostKeyAlgorithm::RsaSha2_256 => Some(SignatureHash::SHA2_256),
            HostKeyAlgorithm::RsaSha2_512 => Some(SignatureHash::SHA2_512),
            HostKeyAlgorithm::SshRsa => Some(SignatureHash::SHA1),
        }
    }
}

/// Hash used for RSA signatures.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SignatureHash {
    /// SHA-256 (`rsa-sha2-256`)
    SHA2_256 = 0,
    /// SHA-512 (`rsa-sha2-512`)
    SHA2_512 = 1,
    /// SHA-1 (`ssh-rsa`)
    SHA1 = 2,
}

impl SignatureHash {
    /// Parses the numeric selector.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(SignatureHash::SHA2_256),
            1 => Some(SignatureHash::SHA2_512),
            2 => Some(SignatureHash::SHA1),
            _ => None,
        }
    }

    /// RSA signature algorithm name for this hash.
    pub fn rsa_algorithm(&self) -> &'static str {
        match self {
            SignatureHash::SHA2_256 => "rsa-sha2-256",
            SignatureHash::SHA2_512 => "rsa-sha2-512",
            SignatureHash::SHA1 => "ssh-rsa",
        }
    }

    /// Maps an RSA signature algorithm name back to its hash.
    pub fn from_rsa_algorithm(name: &str) -> Option<Self> {
        HostKeyAlgorithm::from_name(name).and_then(|alg| alg.signature_hash())
    }

    /// PKCS#1 v1.5 padding scheme and message digest for `data`.
    pub(crate) fn pkcs1v15(&self, data: &[u8]) -> (Pkcs1v15Sign, Vec<u8>) {
        match self {
            SignatureHash::SHA2_256 => (Pkcs1v15Sign::new::<Sha256>(), Sha256::digest(data).to_vec()),
            SignatureHash::SHA2_512 => (Pkcs1v15Sign::new::<Sha512>(), Sha512::digest(data).to_vec()),
            SignatureHash::SHA1 => (Pkcs1v15Sign::new::<Sha1>(), Sha1::digest(data).to_vec()),
        }
    }
}

/// A detached signature: algorithm name plus raw signature bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Signature {
    algorithm: String,
    bytes: Vec<u8>,
}

impl Signature {
    /// Creates a signature from its parts.
    pub fn new(algorithm: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            algorithm: algorithm.into(),
            bytes,
        }
    }

    /// Signature algorithm name.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Raw signature bytes (without the SSH blob framing).
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// SSH signature blob: `string algorithm, string signature`.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_string(&mut buf, &self.algorithm);
        write_bytes(&mut buf, &self.bytes);
        buf.to_vec()
    }

    /// Parses an SSH signature blob.
    pub fn from_blob(blob: &[u8]) -> KeelResult<Self> {
        let mut offset = 0;
        let algorithm = read_string(blob, &mut offset)?;
        let bytes = read_bytes(blob, &mut offset)?;
        Ok(Self { algorithm, bytes })
    }

    /// Base64 of the signature blob.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_blob())
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signature")
            .field("algorithm", &self.algorithm)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// A public key.
///
/// Equality compares the key itself; the RSA hash selector is ignored.
#[derive(Clone)]
pub enum PublicKey {
    /// Ed25519 public key (32 bytes)
    Ed25519([u8; 32]),
    /// RSA public key with the hash used for its signatures
    Rsa {
        /// Modulus and exponent
        key: RsaPublicKey,
        /// Signature hash selector
        hash: SignatureHash,
    },
}

impl PublicKey {
    /// Key type as written in blobs and known_hosts (`ssh-ed25519` or `ssh-rsa`).
    pub fn key_type(&self) -> &'static str {
        match self {
            PublicKey::Ed25519(_) => "ssh-ed25519",
            PublicKey::Rsa { .. } => "ssh-rsa",
        }
    }

    /// Signature algorithm name used with this key.
    pub fn name(&self) -> &'static str {
        match self {
            PublicKey::Ed25519(_) => "ssh-ed25519",
            PublicKey::Rsa { hash, .. } => hash.rsa_algorithm(),
        }
    }

    /// Changes the RSA signature hash. No-op for Ed25519.
    pub fn set_algorithm(&mut self, new_hash: SignatureHash) {
        if let PublicKey::Rsa { hash, .. } = self {
            *hash = new_hash;
        }
    }

    /// SSH public key blob.
    ///
    /// ```text
    /// ssh-ed25519:  string "ssh-ed25519", string key(32)
    /// ssh-rsa:      string "ssh-rsa", mpint e, mpint n
    /// ```
    pub fn to_blob(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_string(&mut buf, self.key_type());
        match self {
            PublicKey::Ed25519(key) => write_bytes(&mut buf, key),
            PublicKey::Rsa { key, .. } => {
                write_mpint(&mut buf, &key.e().to_bytes_be());
                write_mpint(&mut buf, &key.n().to_bytes_be());
            }
        }
        buf.to_vec()
    }

    /// Decodes an SSH public key blob. RSA keys default to SHA-256 signatures.
    pub fn from_blob(blob: &[u8]) -> KeelResult<Self> {
        let mut offset = 0;
        let key_type = read_string(blob, &mut offset)
            .map_err(|e| KeelError::KeyFormat(format!("Invalid public key blob: {}", e)))?;

        let key = match key_type.as_str() {
            "ssh-ed25519" => {
                let raw = read_bytes(blob, &mut offset)
                    .map_err(|e| KeelError::KeyFormat(format!("Invalid Ed25519 key: {}", e)))?;
                let bytes: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
                    KeelError::KeyFormat(format!(
                        "Ed25519 public key must be 32 bytes, got {}",
                        raw.len()
                    ))
                })?;
                VerifyingKey::from_bytes(&bytes).map_err(|e| {
                    KeelError::KeyFormat(format!("Invalid Ed25519 public key: {}", e))
                })?;
                PublicKey::Ed25519(bytes)
            }
            "ssh-rsa" => {
                let e = read_bytes(blob, &mut offset)
                    .map_err(|e| KeelError::KeyFormat(format!("Invalid RSA exponent: {}", e)))?;
                let n = read_bytes(blob, &mut offset)
                    .map_err(|e| KeelError::KeyFormat(format!("Invalid RSA modulus: {}", e)))?;
                let key = RsaPublicKey::new_with_max_size(
                    BigUint::from_bytes_be(&n),
                    BigUint::from_bytes_be(&e),
                    MAX_RSA_BITS,
                )
                .map_err(|e| KeelError::KeyFormat(format!("Invalid RSA public key: {}", e)))?;
                PublicKey::Rsa {
                    key,
                    hash: SignatureHash::SHA2_256,
                }
            }
            other => {
                return Err(KeelError::KeyFormat(format!(
                    "Unsupported public key type: {}",
                    other
                )))
            }
        };

        if offset != blob.len() {
            return Err(KeelError::KeyFormat(
                "Trailing data after public key".to_string(),
            ));
        }
        Ok(key)
    }

    /// OpenSSH one-line form: `<type> <base64 blob>`.
    pub fn to_openssh(&self) -> String {
        format!("{} {}", self.key_type(), STANDARD.encode(self.to_blob()))
    }

    /// Parses `<type> <base64 blob> [comment]`.
    pub fn from_openssh(line: &str) -> KeelResult<Self> {
        let mut parts = line.split_whitespace();
        let (key_type, encoded) = match (parts.next(), parts.next()) {
            (Some(t), Some(k)) => (t, k),
            _ => {
                return Err(KeelError::KeyFormat(
                    "Expected '<type> <base64>' public key".to_string(),
                ))
            }
        };

        let blob = STANDARD
            .decode(encoded)
            .map_err(|e| KeelError::KeyFormat(format!("Invalid base64 key data: {}", e)))?;
        let key = Self::from_blob(&blob)?;

        if key.key_type() != key_type {
            return Err(KeelError::KeyFormat(format!(
                "Key type mismatch: line says {}, blob is {}",
                key_type,
                key.key_type()
            )));
        }
        Ok(key)
    }

    /// OpenSSH SHA-256 fingerprint, e.g. `SHA256:uNiVztksCsDhcc0u9e8BujQXVUpKZIDTMczCvj3tD2s`.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.to_blob());
        format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
    }

    /// Verifies a detached signature. Malformed input yields `false`.
    pub fn verify_detached(&self, data: &[u8], signature: &Signature) -> bool {
        match self {
            PublicKey::Ed25519(key) => {
                if signature.algorithm() != "ssh-ed25519" {
                    return false;
                }
                let Ok(verifying_key) = VerifyingKey::from_bytes(key) else {
                    return false;
                };
                let Ok(sig) = ed25519_dalek::Signature::from_slice(signature.as_bytes()) else {
                    return false;
                };
                verifying_key.verify(data, &sig).is_ok()
            }
            PublicKey::Rsa { key, .. } => {
                let Some(hash) = SignatureHash::from_rsa_algorithm(signature.algorithm()) else {
                    return false;
                };
                let (scheme, digest) = hash.pkcs1v15(data);
                key.verify(scheme, &digest, signature.as_bytes()).is_ok()
            }
        }
    }

    /// Verifies an SSH signature blob over `data`, as sent in KEX replies.
    ///
    /// The blob's algorithm must belong to this key's family, and for RSA
    /// must match the negotiated host key algorithm when one is given.
    pub fn verify_signature_blob(
        &self,
        data: &[u8],
        blob: &[u8],
        negotiated: Option<HostKeyAlgorithm>,
    ) -> KeelResult<()> {
        let signature = Signature::from_blob(blob)?;

        if let Some(alg) = negotiated {
            if signature.algorithm() != alg.name() {
                return Err(KeelError::Protocol(format!(
                    "Host key signature algorithm {} does not match negotiated {}",
                    signature.algorithm(),
                    alg.name()
                )));
            }
        }

        if self.verify_detached(data, &signature) {
            Ok(())
        } else {
            Err(KeelError::Protocol(format!(
                "Invalid {} host key signature",
                signature.algorithm()
            )))
        }
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PublicKey::Ed25519(a), PublicKey::Ed25519(b)) => a == b,
            (PublicKey::Rsa { key: a, .. }, PublicKey::Rsa { key: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Eq for PublicKey {}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublicKey::Ed25519(key) => f
                .debug_struct("PublicKey")
                .field("algorithm", &"ssh-ed25519")
                .field("key", &hex::encode(key))
                .finish(),
            PublicKey::Rsa { key, hash } => f
                .debug_struct("PublicKey")
                .field("algorithm", &hash.rsa_algorithm())
                .field("bits", &(key.size() * 8))
                .field("fingerprint", &self.fingerprint())
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    fn ed25519_public() -> PublicKey {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        PublicKey::Ed25519(signing.verifying_key().to_bytes())
    }

    #[test]
    fn test_algorithm_name() {
        assert_eq!(HostKeyAlgorithm::SshEd25519.name(), "ssh-ed25519");
        assert_eq!(HostKeyAlgorithm::RsaSha2_256.name(), "rsa-sha2-256");
        assert_eq!(HostKeyAlgorithm::RsaSha2_512.name(), "rsa-sha2-512");
        assert_eq!(HostKeyAlgorithm::SshRsa.name(), "ssh-rsa");
    }

    #[test]
    fn test_algorithm_from_name() {
        assert_eq!(
            HostKeyAlgorithm::from_name("rsa-sha2-512"),
            Some(HostKeyAlgorithm::RsaSha2_512)
        );
        assert_eq!(HostKeyAlgorithm::from_name("ecdsa-sha2-nistp256"), None);
    }

    #[test]
    fn test_signature_hash_selector() {
        assert_eq!(SignatureHash::from_u32(0), Some(SignatureHash::SHA2_256));
        assert_eq!(SignatureHash::from_u32(1), Some(SignatureHash::SHA2_512));
        assert_eq!(SignatureHash::from_u32(2), Some(SignatureHash::SHA1));
        assert_eq!(SignatureHash::from_u32(3), None);
        assert_eq!(SignatureHash::SHA1.rsa_algorithm(), "ssh-rsa");
        assert_eq!(
            SignatureHash::from_rsa_algorithm("rsa-sha2-512"),
            Some(SignatureHash::SHA2_512)
        );
        assert_eq!(SignatureHash::from_rsa_algorithm("ssh-ed25519"), None);
    }

    #[test]
    fn test_ed25519_blob_layout() {
        let key = ed25519_public();
        let blob = key.to_blob();
        assert_eq!(&blob[..4], &[0, 0, 0, 11]);
        assert_eq!(&blob[4..15], b"ssh-ed25519");
        assert_eq!(&blob[15..19], &[0, 0, 0, 32]);
        assert_eq!(blob.len(), 51);
        assert_eq!(PublicKey::from_blob(&blob).unwrap(), key);
    }

    #[test]
    fn test_from_blob_rejects_garbage() {
        assert!(matches!(
            PublicKey::from_blob(b"nonsense"),
            Err(KeelError::KeyFormat(_))
        ));

        let mut buf = BytesMut::new();
        write_string(&mut buf, "ssh-dss");
        write_bytes(&mut buf, &[1, 2, 3]);
        assert!(PublicKey::from_blob(&buf).is_err());

        let mut blob = ed25519_public().to_blob();
        blob.push(0);
        assert!(PublicKey::from_blob(&blob).is_err());
    }

    fn rsa_blob(modulus_bits: usize) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "ssh-rsa");
        write_mpint(&mut buf, &[0x01, 0x00, 0x01]);
        write_mpint(&mut buf, &vec![0xff; modulus_bits / 8]);
        buf.to_vec()
    }

    #[test]
    fn test_rsa_keys_up_to_generation_limit() {
        for bits in [2048, 6144, MAX_RSA_BITS] {
            let blob = rsa_blob(bits);
            let key = PublicKey::from_blob(&blob).unwrap();
            assert_eq!(key.to_blob(), blob);
            assert_eq!(PublicKey::from_openssh(&key.to_openssh()).unwrap(), key);
        }
        assert!(matches!(
            PublicKey::from_blob(&rsa_blob(MAX_RSA_BITS + 8)),
            Err(KeelError::KeyFormat(_))
        ));
    }

    #[test]
    fn test_openssh_line() {
        let key = ed25519_public();
        let line = format!("{} user@host", key.to_openssh());
        assert!(line.starts_with("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5"));
        assert_eq!(PublicKey::from_openssh(&line).unwrap(), key);

        let wrong_type = line.replacen("ssh-ed25519", "ssh-rsa", 1);
        assert!(PublicKey::from_openssh(&wrong_type).is_err());
        assert!(PublicKey::from_openssh("ssh-ed25519").is_err());
    }

    #[test]
    fn test_fingerprint_format() {
        let fingerprint = ed25519_public().fingerprint();
        assert!(fingerprint.starts_with("SHA256:"));
        // 32-byte digest, unpadded base64
        assert_eq!(fingerprint.len(), 7 + 43);
        assert!(!fingerprint.ends_with('='));
        assert_eq!(fingerprint, ed25519_public().fingerprint());
    }

    #[test]
    fn test_signature_blob() {
        let sig = Signature::new("ssh-ed25519", vec![9u8; 64]);
        let parsed = Signature::from_blob(&sig.to_blob()).unwrap();
        assert_eq!(parsed, sig);
        assert_eq!(parsed.algorithm(), "ssh-ed25519");
        assert!(!sig.to_base64().is_empty());
    }

    #[test]
    fn test_verify_detached_rejects_wrong_family() {
        let key = ed25519_public();
        let sig = Signature::new("rsa-sha2-256", vec![0u8; 64]);
        assert!(!key.verify_detached(b"data", &sig));

        let short = Signature::new("ssh-ed25519", vec![0u8; 10]);
        assert!(!key.verify_detached(b"data", &short));
    }

    #[test]
    fn test_set_algorithm_is_noop_for_ed25519() {
        let mut key = ed25519_public();
        key.set_algorithm(SignatureHash::SHA2_512);
        assert_eq!(key.name(), "ssh-ed25519");
    }
}
