use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
	errors::{codes, ServiceError},
	ids::{InstallationId, ProviderId},
	scope::ScopeRef,
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstallationStatus {
	Active,
	Suspended,
	Uninstalled,
	NeedsReconsent,
}

impl InstallationStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			InstallationStatus::Active => "active",
			InstallationStatus::Suspended => "suspended",
			InstallationStatus::Uninstalled => "uninstalled",
			InstallationStatus::NeedsReconsent => "needs_reconsent",
		}
	}

	/// Transitions permitted through `update_status`. Reinstatement of a
	/// suspended install happens only through an explicit upsert, so
	/// `suspended → active` is rejected here.
	pub fn can_update_to(self, next: InstallationStatus) -> bool {
		use InstallationStatus::*;
		matches!(
			(self, next),
			(Active, Suspended)
				| (Active, Uninstalled)
				| (Active, NeedsReconsent)
				| (Suspended, Uninstalled)
				| (NeedsReconsent, Active)
				| (NeedsReconsent, Uninstalled)
		)
	}
}

impl FromStr for InstallationStatus {
	type Err = ServiceError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"active" => Ok(InstallationStatus::Active),
			"suspended" => Ok(InstallationStatus::Suspended),
			"uninstalled" => Ok(InstallationStatus::Uninstalled),
			"needs_reconsent" => Ok(InstallationStatus::NeedsReconsent),
			other => Err(ServiceError::validation(
				codes::INVALID_STATE_TRANSITION,
				format!("unknown installation status {:?}", other),
			)),
		}
	}
}

/// An org-level app install, independent of any per-user connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Installation {
	pub id: InstallationId,
	pub provider_id: ProviderId,
	pub scope: ScopeRef,
	pub install_type: String,
	pub status: InstallationStatus,
	pub granted_at: Option<DateTime<Utc>>,
	pub revoked_at: Option<DateTime<Utc>>,
	pub metadata: Map<String, Value>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UpsertInstallation {
	pub provider_id: ProviderId,
	pub scope: ScopeRef,
	pub install_type: String,
	pub status: InstallationStatus,
	pub granted_at: Option<DateTime<Utc>>,
	pub metadata: Map<String, Value>,
}
