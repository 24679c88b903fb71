//! Asymmetric key pair generation
//!
//! Produces RSA OpenPGP keys as ASCII-armored text. The primary key can sign,
//! certify and encrypt. Its secret material is locked with an iterated and
//! salted SHA-256 string-to-key under a fixed passphrase before it ever
//! leaves this module, and the self-signature advertises AES-256, SHA-256
//! and ZLIB as preferences.

use pgp::crypto::{hash::HashAlgorithm, sym::SymmetricKeyAlgorithm};
use pgp::types::{CompressionAlgorithm, SecretKeyTrait};
use pgp::{KeyType, SecretKeyParamsBuilder};
use rand::rngs::OsRng;
use smallvec::smallvec;
use zeroize::Zeroizing;

use super::entity::{KeyMaterial, SecureString};
use super::error::KeyError;

/// Smallest modulus the generator will produce
pub const MIN_KEY_BITS: usize = 2048;

/// Passphrase used when none is configured
pub const DEFAULT_KEY_PASSPHRASE: &str = "keysmith-private-key";

/// User id bound to every generated key
pub const KEY_USER_ID: &str = "keysmith";

/// Source of fresh key pairs
///
/// Implementations must return a new pair on every call.
pub trait KeyPairGenerator: Send + Sync {
    fn generate_key_pair(&self) -> Result<KeyMaterial, KeyError>;
}

/// RSA OpenPGP generator with a passphrase-protected secret key
pub struct RsaKeyPairGenerator {
    bits: usize,
    passphrase: SecureString,
}

impl RsaKeyPairGenerator {
    pub fn new(bits: usize, passphrase: SecureString) -> Result<Self, KeyError> {
        if bits < MIN_KEY_BITS {
            return Err(KeyError::KeyGeneration(format!(
                "RSA modulus of {} bits is below the minimum of {}",
                bits, MIN_KEY_BITS
            )));
        }
        Ok(Self { bits, passphrase })
    }

    pub fn bits(&self) -> usize {
        self.bits
    }
}

impl KeyPairGenerator for RsaKeyPairGenerator {
    fn generate_key_pair(&self) -> Result<KeyMaterial, KeyError> {
        let bits = u32::try_from(self.bits).map_err(generation_error)?;
        let passphrase = Zeroizing::new(self.passphrase.as_str().to_owned());

        let mut key_params = SecretKeyParamsBuilder::default();
        key_params
            .key_type(KeyType::Rsa(bits))
            .can_certify(true)
            .can_sign(true)
            .can_encrypt(true)
            .primary_user_id(KEY_USER_ID.into())
            .passphrase(Some(passphrase.to_string()))
            .preferred_symmetric_algorithms(smallvec![SymmetricKeyAlgorithm::AES256])
            .preferred_hash_algorithms(smallvec![HashAlgorithm::SHA2_256])
            .preferred_compression_algorithms(smallvec![CompressionAlgorithm::ZLIB]);
        let params = key_params.build().map_err(generation_error)?;

        let mut rng = OsRng;
        let secret_key = params.generate(&mut rng).map_err(generation_error)?;
        let signed_secret_key = secret_key
            .sign(&mut rng, || passphrase.to_string())
            .map_err(generation_error)?;
        let signed_public_key = signed_secret_key
            .public_key()
            .sign(&mut rng, &signed_secret_key, || passphrase.to_string())
            .map_err(generation_error)?;

        let private_key_armored = signed_secret_key
            .to_armored_string(None.into())
            .map_err(generation_error)?;
        let public_key_armored = signed_public_key
            .to_armored_string(None.into())
            .map_err(generation_error)?;

        tracing::debug!(bits = self.bits, "Generated OpenPGP RSA key pair");

        Ok(KeyMaterial {
            private_key_armored: SecureString::new(private_key_armored),
            public_key_armored,
        })
    }
}

impl std::fmt::Debug for RsaKeyPairGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaKeyPairGenerator")
            .field("bits", &self.bits)
            .field("passphrase", &"[REDACTED]")
            .finish()
    }
}

fn generation_error(err: impl std::fmt::Display) -> KeyError {
    KeyError::KeyGeneration(err.to_string())
}
