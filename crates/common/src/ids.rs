use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{codes, ServiceError};

/// Opaque text identifiers for the runtime's entities. Generated as uuid v4
/// text, but accepted verbatim from the store so callers can seed fixtures.
macro_rules! text_id {
	($name:ident) => {
		#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
		#[serde(transparent)]
		pub struct $name(String);

		impl $name {
			pub fn generate() -> Self {
				Self(Uuid::new_v4().to_string())
			}

			pub fn as_str(&self) -> &str {
				&self.0
			}
		}

		impl From<&str> for $name {
			fn from(value: &str) -> Self {
				Self(value.to_owned())
			}
		}

		impl From<String> for $name {
			fn from(value: String) -> Self {
				Self(value)
			}
		}

		impl core::fmt::Display for $name {
			fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
				f.write_str(&self.0)
			}
		}
	};
}

text_id!(ConnectionId);
text_id!(CredentialId);
text_id!(InstallationId);
text_id!(SubscriptionId);
text_id!(SyncJobId);
text_id!(ActivityEntryId);
text_id!(EventId);

/// A registered provider identifier, normalized to a lowercase token.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
	pub fn new(id: impl AsRef<str>) -> Result<Self, ServiceError> {
		let id = id.as_ref().trim().to_ascii_lowercase();
		if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
			return Err(ServiceError::validation(
				codes::INVALID_PROVIDER_ID,
				format!("provider id {:?} is not a lowercase token", id),
			));
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl From<&str> for ProviderId {
	fn from(value: &str) -> Self {
		Self(value.trim().to_ascii_lowercase())
	}
}

impl core::fmt::Display for ProviderId {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.write_str(&self.0)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn provider_id_normalizes_case_and_whitespace() {
		let id = ProviderId::new("  GitHub ").unwrap();
		assert_eq!(id.as_str(), "github");
	}

	#[test]
	fn provider_id_rejects_non_tokens() {
		assert!(ProviderId::new("git hub").is_err());
		assert!(ProviderId::new("").is_err());
	}

	#[test]
	fn generated_ids_are_unique() {
		assert_ne!(ConnectionId::generate(), ConnectionId::generate());
	}
}
