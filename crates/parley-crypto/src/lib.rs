//! End-to-end encryption for parley conversations.
//!
//! - `symmetric`: per-message AES-256-CBC + HMAC-SHA256 (Encrypt-then-MAC)
//! - `wrap`: RSA-OAEP-SHA256 wrapping of the per-message key
//! - `identity` / `keystore`: per-identity RSA keypair lifecycle

pub mod encoding;
pub mod error;
pub mod identity;
pub mod keystore;
pub mod symmetric;
pub mod wrap;

pub use error::{CryptoError, DirectoryError, KeyStoreError};
pub use identity::{IdentityKeys, KeyPairRecord, KeygenProgress};
pub use keystore::{KeyDirectory, KeyState, KeyStore, MigrationOutcome, UploadOutcome};
pub use symmetric::{decrypt_symmetric, encrypt_symmetric, DecryptOutcome, SealedMessage};
pub use wrap::{parse_public_key_pem, unwrap_key, wrap_key};
