use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{codes, ServiceError};

/// The kind of host-side subject a connection is bound to (`user`, `org`,
/// `workspace`, ...). An open set, normalized to a lowercase token.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ScopeType(String);

impl ScopeType {
	pub fn new(value: impl AsRef<str>) -> Result<Self, ServiceError> {
		let value = value.as_ref().trim().to_ascii_lowercase();
		if value.is_empty() || !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
			return Err(ServiceError::validation(
				codes::INVALID_SCOPE_REF,
				format!("scope type {:?} is not a token", value),
			));
		}
		Ok(Self(value))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl From<&str> for ScopeType {
	fn from(value: &str) -> Self {
		Self(value.trim().to_ascii_lowercase())
	}
}

impl core::fmt::Display for ScopeType {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.write_str(&self.0)
	}
}

/// The host-side subject of a connection, e.g. `user:u1` or `org:o1`.
/// Immutable; identifies an actor's trust boundary.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeRef {
	#[serde(rename = "type")]
	pub scope_type: ScopeType,
	pub id: String,
}

impl ScopeRef {
	pub fn new(scope_type: impl AsRef<str>, id: impl Into<String>) -> Result<Self, ServiceError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ServiceError::validation(codes::INVALID_SCOPE_REF, "scope id is empty"));
		}
		Ok(Self { scope_type: ScopeType::new(scope_type)?, id })
	}
}

impl core::fmt::Display for ScopeRef {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		write!(f, "{}:{}", self.scope_type, self.id)
	}
}

impl FromStr for ScopeRef {
	type Err = ServiceError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.split_once(':') {
			Some((scope_type, id)) if !id.is_empty() => ScopeRef::new(scope_type, id),
			_ => Err(ServiceError::validation(
				codes::INVALID_SCOPE_REF,
				format!("scope ref {:?} is not of the form type:id", s),
			)),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn round_trips_display_and_parse() {
		let scope = ScopeRef::new("user", "u1").unwrap();
		assert_eq!(scope.to_string(), "user:u1");
		assert_eq!("user:u1".parse::<ScopeRef>().unwrap(), scope);
	}

	#[test]
	fn scope_id_preserves_case() {
		let scope = ScopeRef::new("Org", "TeamAlpha").unwrap();
		assert_eq!(scope.scope_type.as_str(), "org");
		assert_eq!(scope.id, "TeamAlpha");
	}

	#[test]
	fn rejects_malformed_refs() {
		assert!("useru1".parse::<ScopeRef>().is_err());
		assert!("user:".parse::<ScopeRef>().is_err());
		assert!(ScopeRef::new("", "u1").is_err());
	}

	#[test]
	fn serializes_with_type_field() {
		let scope = ScopeRef::new("user", "u1").unwrap();
		let json = serde_json::to_value(&scope).unwrap();
		assert_eq!(json, serde_json::json!({"type": "user", "id": "u1"}));
	}
}
