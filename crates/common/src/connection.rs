use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
	errors::{codes, ServiceError},
	ids::{ConnectionId, CredentialId, ProviderId},
	scope::ScopeRef,
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
	Active,
	Suspended,
	NeedsReconsent,
	Revoked,
}

impl ConnectionStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			ConnectionStatus::Active => "active",
			ConnectionStatus::Suspended => "suspended",
			ConnectionStatus::NeedsReconsent => "needs_reconsent",
			ConnectionStatus::Revoked => "revoked",
		}
	}

	/// The connection state machine. `active ↔ needs_reconsent`,
	/// `active → suspended`, `suspended → active` on reinstatement, and
	/// `active|suspended → revoked` which is terminal.
	pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
		use ConnectionStatus::*;
		matches!(
			(self, next),
			(Active, NeedsReconsent)
				| (NeedsReconsent, Active)
				| (Active, Suspended)
				| (Suspended, Active)
				| (Active, Revoked)
				| (Suspended, Revoked)
		)
	}

	pub fn is_terminal(self) -> bool {
		matches!(self, ConnectionStatus::Revoked)
	}
}

impl FromStr for ConnectionStatus {
	type Err = ServiceError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"active" => Ok(ConnectionStatus::Active),
			"suspended" => Ok(ConnectionStatus::Suspended),
			"needs_reconsent" => Ok(ConnectionStatus::NeedsReconsent),
			"revoked" => Ok(ConnectionStatus::Revoked),
			other => Err(ServiceError::validation(
				codes::INVALID_STATE_TRANSITION,
				format!("unknown connection status {:?}", other),
			)),
		}
	}
}

impl core::fmt::Display for ConnectionStatus {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A durable binding between an application scope and a provider account.
/// `(provider_id, scope, external_account_id)` is unique among rows that are
/// not soft-deleted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Connection {
	pub id: ConnectionId,
	pub provider_id: ProviderId,
	pub scope: ScopeRef,
	pub external_account_id: String,
	pub status: ConnectionStatus,
	pub inherits_from: Option<ConnectionId>,
	pub last_error: Option<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub deleted_at: Option<DateTime<Utc>>,
}

impl Connection {
	pub fn is_deleted(&self) -> bool {
		self.deleted_at.is_some()
	}
}

#[derive(Debug, Clone)]
pub struct NewConnection {
	pub provider_id: ProviderId,
	pub scope: ScopeRef,
	pub external_account_id: String,
	pub inherits_from: Option<ConnectionId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
	Active,
	Revoked,
	Expired,
}

impl CredentialStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			CredentialStatus::Active => "active",
			CredentialStatus::Revoked => "revoked",
			CredentialStatus::Expired => "expired",
		}
	}
}

impl FromStr for CredentialStatus {
	type Err = ServiceError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"active" => Ok(CredentialStatus::Active),
			"revoked" => Ok(CredentialStatus::Revoked),
			"expired" => Ok(CredentialStatus::Expired),
			other => Err(ServiceError::validation(
				codes::INVALID_STATE_TRANSITION,
				format!("unknown credential status {:?}", other),
			)),
		}
	}
}

/// A versioned, encrypted secret and scope set backing a connection. At most
/// one credential per connection is `active`; versions are strictly
/// increasing and older versions are retained as `revoked`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Credential {
	pub id: CredentialId,
	pub connection_id: ConnectionId,
	pub version: i32,
	#[serde(skip_serializing)]
	pub encrypted_payload: Vec<u8>,
	pub payload_format: String,
	pub payload_version: i32,
	pub token_type: String,
	pub requested_scopes: Vec<String>,
	pub granted_scopes: Vec<String>,
	pub expires_at: Option<DateTime<Utc>>,
	pub rotates_at: Option<DateTime<Utc>>,
	pub refreshable: bool,
	pub status: CredentialStatus,
	pub grant_version: i32,
	pub encryption_key_id: String,
	pub encryption_version: i32,
	pub revocation_reason: Option<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl Credential {
	pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
		self.expires_at.map(|at| at <= now).unwrap_or(false)
	}
}

/// Input for a credential rotation. The store assigns `version` and revokes
/// the prior active credential in the same transaction.
#[derive(Debug, Clone)]
pub struct NewCredential {
	pub connection_id: ConnectionId,
	pub encrypted_payload: Vec<u8>,
	pub payload_format: String,
	pub payload_version: i32,
	pub token_type: String,
	pub requested_scopes: Vec<String>,
	pub granted_scopes: Vec<String>,
	pub expires_at: Option<DateTime<Utc>>,
	pub rotates_at: Option<DateTime<Utc>>,
	pub refreshable: bool,
	pub encryption_key_id: String,
	pub encryption_version: i32,
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn legal_transitions() {
		use ConnectionStatus::*;
		assert!(Active.can_transition_to(NeedsReconsent));
		assert!(NeedsReconsent.can_transition_to(Active));
		assert!(Active.can_transition_to(Suspended));
		assert!(Suspended.can_transition_to(Active));
		assert!(Active.can_transition_to(Revoked));
		assert!(Suspended.can_transition_to(Revoked));
	}

	#[test]
	fn revoked_is_terminal() {
		use ConnectionStatus::*;
		assert!(Revoked.is_terminal());
		for next in [Active, Suspended, NeedsReconsent, Revoked] {
			assert!(!Revoked.can_transition_to(next));
		}
	}

	#[test]
	fn no_self_transitions() {
		use ConnectionStatus::*;
		for status in [Active, Suspended, NeedsReconsent, Revoked] {
			assert!(!status.can_transition_to(status));
		}
	}

	#[test]
	fn status_round_trips_text_form() {
		assert_eq!(
			"needs_reconsent".parse::<ConnectionStatus>().unwrap(),
			ConnectionStatus::NeedsReconsent
		);
		assert!("deleted".parse::<ConnectionStatus>().is_err());
	}
}
