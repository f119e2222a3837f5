use secret_vault::errors::SecretVaultError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SecretError {
	#[error("No encryption key found for key id {0}")]
	NoKeyFound(String),

	#[error("Encryption key material is malformed")]
	MalformedKey,

	#[error("Decoding failure")]
	DecodingFailure,

	#[error("Ciphertext failed authentication")]
	CiphertextRejected,

	#[error("Unsupported envelope version {0}")]
	UnsupportedVersion(i32),

	#[error("Bad key seed")]
	BadSeed,

	#[error("Vault {source}")]
	SecretVault {
		#[from]
		#[source]
		source: SecretVaultError,
	},
}
