use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityMode {
	Block,
	Degrade,
}

impl CapabilityMode {
	pub fn as_str(self) -> &'static str {
		match self {
			CapabilityMode::Block => "block",
			CapabilityMode::Degrade => "degrade",
		}
	}
}

/// A named operation exposed by a provider, requiring a set of grants.
/// `degraded_grants` is the reduced set that still permits the capability in
/// degraded mode when `mode_on_missing` is `Degrade`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Capability {
	pub name: String,
	pub required_grants: Vec<String>,
	#[serde(default)]
	pub degraded_grants: Vec<String>,
	pub mode_on_missing: CapabilityMode,
}

impl Capability {
	pub fn blocking(name: impl Into<String>, required_grants: Vec<String>) -> Self {
		Self {
			name: name.into(),
			required_grants,
			degraded_grants: vec![],
			mode_on_missing: CapabilityMode::Block,
		}
	}

	pub fn degradable(
		name: impl Into<String>,
		required_grants: Vec<String>,
		degraded_grants: Vec<String>,
	) -> Self {
		Self {
			name: name.into(),
			required_grants,
			degraded_grants,
			mode_on_missing: CapabilityMode::Degrade,
		}
	}

	/// Decide allow/deny/degrade against the latest granted set. Pure; no
	/// side effects.
	pub fn evaluate(&self, granted: &[String]) -> CapabilityDecision {
		let granted: BTreeSet<&str> = granted.iter().map(String::as_str).collect();
		let missing: Vec<String> = self
			.required_grants
			.iter()
			.filter(|g| !granted.contains(g.as_str()))
			.cloned()
			.collect();

		if missing.is_empty() {
			return CapabilityDecision { allowed: true, mode: None, missing_grants: vec![] };
		}

		match self.mode_on_missing {
			CapabilityMode::Degrade
				if self.degraded_grants.iter().all(|g| granted.contains(g.as_str())) =>
				CapabilityDecision {
					allowed: true,
					mode: Some(CapabilityMode::Degrade),
					missing_grants: missing,
				},
			mode_on_missing => CapabilityDecision {
				allowed: false,
				mode: Some(mode_on_missing),
				missing_grants: missing,
			},
		}
	}
}

/// The outcome of a capability permission check. Denial is a decision, not
/// an error.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CapabilityDecision {
	pub allowed: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub mode: Option<CapabilityMode>,
	pub missing_grants: Vec<String>,
}
