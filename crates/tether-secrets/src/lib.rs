#![cfg_attr(feature = "strict", deny(warnings))]

use std::{
	collections::BTreeMap,
	path::{Path, PathBuf},
	sync::Arc,
};

use aes_gcm::{
	aead::{Aead, KeyInit, OsRng},
	AeadCore, Aes256Gcm, Key, Nonce,
};
use secret_vault::{
	FilesSource, FilesSourceOptions, MultipleSecretsSources, SecretName, SecretNamespace,
	SecretVaultBuilder, SecretVaultRef, SecretVaultView,
};
use tracing::instrument;

mod embedded_key_source;
mod error;

pub use error::SecretError;

pub static TETHER_NAMESPACE: &str = "tether";
pub static CREDENTIALS_KEY: &str = "credentials-key";

/// Version of the sealed envelope layout: 12-byte nonce followed by the
/// AES-256-GCM ciphertext.
pub const ENVELOPE_VERSION: i32 = 1;

const NONCE_LEN: usize = 12;

/// An encrypted payload plus the key reference needed to open it again.
#[derive(Clone, PartialEq, Eq)]
pub struct SealedSecret {
	pub ciphertext: Vec<u8>,
	pub key_id: String,
	pub version: i32,
}

impl core::fmt::Debug for SealedSecret {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("SealedSecret")
			.field("key_id", &self.key_id)
			.field("version", &self.version)
			.finish_non_exhaustive()
	}
}

/// The envelope encryption seam consumed by the credential service.
#[async_trait::async_trait]
pub trait SecretProvider: Send + Sync {
	async fn encrypt(&self, plaintext: &[u8]) -> Result<SealedSecret, SecretError>;

	async fn decrypt(&self, sealed: &SealedSecret) -> Result<Vec<u8>, SecretError>;
}

pub enum TetherSecretsOptions {
	// Generate key material from entropy in memory on demand
	Embedded,
	// Seed named keys from a map of key name to 32-byte seed
	Seeded(BTreeMap<String, [u8; 32]>),
	// Filesystem based keys
	Filesystem(PathBuf),
}

impl TetherSecretsOptions {
	pub fn generate_in_memory() -> TetherSecretsOptions {
		TetherSecretsOptions::Embedded
	}

	pub fn seeded(seeds: BTreeMap<String, [u8; 32]>) -> TetherSecretsOptions {
		TetherSecretsOptions::Seeded(seeds)
	}

	pub fn stored_at_path(path: &Path) -> TetherSecretsOptions {
		TetherSecretsOptions::Filesystem(path.to_owned())
	}
}

/// Envelope encryption over keys held by pluggable secret-vault sources.
#[derive(Clone)]
pub struct TetherSecrets {
	vault: Arc<tokio::sync::Mutex<Box<dyn SecretVaultView + Send + Sync>>>,
	key_id: String,
}

impl core::fmt::Debug for TetherSecrets {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("TetherSecrets").field("key_id", &self.key_id).finish_non_exhaustive()
	}
}

impl TetherSecrets {
	/// Build a provider whose active key is `key_id` within the tether
	/// namespace. All named keys are resolved eagerly so misconfiguration
	/// fails at wiring time.
	pub async fn new(
		key_id: &str,
		required_key_names: Vec<(String, String)>,
		options: Vec<(String, TetherSecretsOptions)>,
	) -> Result<Self, SecretError> {
		let mut multi_source = MultipleSecretsSources::new();
		let required_key_refs: Vec<_> = required_key_names
			.into_iter()
			.map(|(namespace, name)| {
				SecretVaultRef::new(SecretName::new(name))
					.with_namespace(SecretNamespace::new(namespace))
			})
			.collect();

		for options in options {
			match options {
				(namespace, TetherSecretsOptions::Embedded) => {
					let source = embedded_key_source::EmbeddedKeySource::new();
					multi_source =
						multi_source.add_source(&SecretNamespace::new(namespace), source);
				},
				(namespace, TetherSecretsOptions::Seeded(seeds)) => {
					let source = embedded_key_source::EmbeddedKeySource::new_seeded(seeds);
					multi_source =
						multi_source.add_source(&SecretNamespace::new(namespace), source);
				},
				(namespace, TetherSecretsOptions::Filesystem(path)) => {
					let source = FilesSource::with_options(FilesSourceOptions {
						root_path: Some(path.into_boxed_path()),
					});
					multi_source =
						multi_source.add_source(&SecretNamespace::new(namespace), source);
				},
			}
		}

		let vault = SecretVaultBuilder::with_source(multi_source)
			.with_secret_refs(required_key_refs.iter().collect())
			.build()?;

		vault.refresh().await?;
		Ok(Self {
			vault: Arc::new(tokio::sync::Mutex::new(Box::new(vault.viewer()))),
			key_id: key_id.to_owned(),
		})
	}

	/// A provider over a single in-memory generated key, for tests and
	/// devmode
	pub async fn embedded() -> Result<Self, SecretError> {
		Self::new(
			CREDENTIALS_KEY,
			vec![(TETHER_NAMESPACE.to_owned(), CREDENTIALS_KEY.to_owned())],
			vec![(TETHER_NAMESPACE.to_owned(), TetherSecretsOptions::Embedded)],
		)
		.await
	}

	async fn key_bytes(&self, key_id: &str) -> Result<[u8; 32], SecretError> {
		let secret_ref = SecretVaultRef::new(SecretName::new(key_id.to_owned()))
			.with_namespace(TETHER_NAMESPACE.into());
		let secret = self
			.vault
			.lock()
			.await
			.get_secret_by_ref(&secret_ref)
			.await?
			.ok_or_else(|| SecretError::NoKeyFound(key_id.to_owned()))?;

		let decoded = secret.value.exposed_in_as_str(|material| {
			(hex::decode(material.trim().trim_start_matches("0x")), material)
		});

		let decoded = decoded.map_err(|_| SecretError::DecodingFailure)?;
		decoded.try_into().map_err(|_| SecretError::MalformedKey)
	}
}

#[async_trait::async_trait]
impl SecretProvider for TetherSecrets {
	#[instrument(skip(self, plaintext))]
	async fn encrypt(&self, plaintext: &[u8]) -> Result<SealedSecret, SecretError> {
		let key_bytes = self.key_bytes(&self.key_id).await?;
		let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));

		let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
		let mut ciphertext =
			cipher.encrypt(&nonce, plaintext).map_err(|_| SecretError::CiphertextRejected)?;

		let mut envelope = nonce.to_vec();
		envelope.append(&mut ciphertext);

		Ok(SealedSecret {
			ciphertext: envelope,
			key_id: self.key_id.clone(),
			version: ENVELOPE_VERSION,
		})
	}

	#[instrument(skip(self, sealed), fields(key_id = %sealed.key_id))]
	async fn decrypt(&self, sealed: &SealedSecret) -> Result<Vec<u8>, SecretError> {
		if sealed.version != ENVELOPE_VERSION {
			return Err(SecretError::UnsupportedVersion(sealed.version));
		}
		if sealed.ciphertext.len() <= NONCE_LEN {
			return Err(SecretError::DecodingFailure);
		}

		let key_bytes = self.key_bytes(&sealed.key_id).await?;
		let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));

		let (nonce, ciphertext) = sealed.ciphertext.split_at(NONCE_LEN);
		cipher
			.decrypt(Nonce::from_slice(nonce), ciphertext)
			.map_err(|_| SecretError::CiphertextRejected)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[tokio::test]
	async fn round_trips_plaintext() {
		let secrets = TetherSecrets::embedded().await.unwrap();
		let sealed = secrets.encrypt(b"access-token-material").await.unwrap();

		assert_eq!(sealed.key_id, CREDENTIALS_KEY);
		assert_eq!(sealed.version, ENVELOPE_VERSION);
		assert_ne!(sealed.ciphertext, b"access-token-material".to_vec());

		let opened = secrets.decrypt(&sealed).await.unwrap();
		assert_eq!(opened, b"access-token-material".to_vec());
	}

	#[tokio::test]
	async fn seeded_keys_are_deterministic_across_instances() {
		let seeds: BTreeMap<String, [u8; 32]> =
			BTreeMap::from([(CREDENTIALS_KEY.to_owned(), [7u8; 32])]);

		let first = TetherSecrets::new(
			CREDENTIALS_KEY,
			vec![(TETHER_NAMESPACE.to_owned(), CREDENTIALS_KEY.to_owned())],
			vec![(TETHER_NAMESPACE.to_owned(), TetherSecretsOptions::seeded(seeds.clone()))],
		)
		.await
		.unwrap();

		let second = TetherSecrets::new(
			CREDENTIALS_KEY,
			vec![(TETHER_NAMESPACE.to_owned(), CREDENTIALS_KEY.to_owned())],
			vec![(TETHER_NAMESPACE.to_owned(), TetherSecretsOptions::seeded(seeds))],
		)
		.await
		.unwrap();

		let sealed = first.encrypt(b"rotate-me").await.unwrap();
		let opened = second.decrypt(&sealed).await.unwrap();
		assert_eq!(opened, b"rotate-me".to_vec());
	}

	#[tokio::test]
	async fn tampered_ciphertext_is_rejected() {
		let secrets = TetherSecrets::embedded().await.unwrap();
		let mut sealed = secrets.encrypt(b"payload").await.unwrap();
		let last = sealed.ciphertext.len() - 1;
		sealed.ciphertext[last] ^= 0xff;

		assert!(matches!(
			secrets.decrypt(&sealed).await,
			Err(SecretError::CiphertextRejected)
		));
	}

	#[tokio::test]
	async fn unsupported_envelope_version_is_rejected() {
		let secrets = TetherSecrets::embedded().await.unwrap();
		let mut sealed = secrets.encrypt(b"payload").await.unwrap();
		sealed.version = 2;

		assert!(matches!(
			secrets.decrypt(&sealed).await,
			Err(SecretError::UnsupportedVersion(2))
		));
	}
}
