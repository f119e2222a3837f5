use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
	errors::{codes, ServiceError},
	ids::ConnectionId,
};

/// Sort and deduplicate a raw grant list. Grants are case-sensitive tokens;
/// comparison everywhere in the runtime is over this normalized form.
pub fn normalize_grants<I, S>(raw: I) -> Vec<String>
where
	I: IntoIterator<Item = S>,
	S: Into<String>,
{
	let set: BTreeSet<String> = raw
		.into_iter()
		.map(Into::into)
		.map(|g| g.trim().to_owned())
		.filter(|g| !g.is_empty())
		.collect();
	set.into_iter().collect()
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GrantEventType {
	Expanded,
	Downgraded,
	Unchanged,
	Snapshot,
}

impl GrantEventType {
	pub fn as_str(self) -> &'static str {
		match self {
			GrantEventType::Expanded => "expanded",
			GrantEventType::Downgraded => "downgraded",
			GrantEventType::Unchanged => "unchanged",
			GrantEventType::Snapshot => "snapshot",
		}
	}
}

impl FromStr for GrantEventType {
	type Err = ServiceError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"expanded" => Ok(GrantEventType::Expanded),
			"downgraded" => Ok(GrantEventType::Downgraded),
			"unchanged" => Ok(GrantEventType::Unchanged),
			"snapshot" => Ok(GrantEventType::Snapshot),
			other => Err(ServiceError::validation(
				codes::INVALID_GRANT_REQUEST,
				format!("unknown grant event type {:?}", other),
			)),
		}
	}
}

/// The outcome of comparing two granted sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantDiff {
	pub added: Vec<String>,
	pub removed: Vec<String>,
}

impl GrantDiff {
	/// `expanded` iff grants were only added, `downgraded` whenever any
	/// grant was removed, `unchanged` otherwise.
	pub fn event_type(&self) -> GrantEventType {
		if !self.removed.is_empty() {
			GrantEventType::Downgraded
		} else if !self.added.is_empty() {
			GrantEventType::Expanded
		} else {
			GrantEventType::Unchanged
		}
	}

	pub fn is_unchanged(&self) -> bool {
		self.added.is_empty() && self.removed.is_empty()
	}
}

/// Set difference over case-sensitive grant tokens; both sides are
/// normalized first so callers can pass raw provider scope lists.
pub fn diff_grants(prev: &[String], next: &[String]) -> GrantDiff {
	let prev: BTreeSet<&str> = prev.iter().map(String::as_str).collect();
	let next: BTreeSet<&str> = next.iter().map(String::as_str).collect();

	GrantDiff {
		added: next.difference(&prev).map(|g| (*g).to_owned()).collect(),
		removed: prev.difference(&next).map(|g| (*g).to_owned()).collect(),
	}
}

/// The authoritative permission set for a connection at a point in time.
/// The latest snapshot is the one with max `(version, captured_at)`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GrantSnapshot {
	pub connection_id: ConnectionId,
	pub version: i32,
	pub requested: Vec<String>,
	pub granted: Vec<String>,
	pub captured_at: DateTime<Utc>,
	pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct NewGrantSnapshot {
	pub connection_id: ConnectionId,
	pub requested: Vec<String>,
	pub granted: Vec<String>,
	pub metadata: Map<String, Value>,
}

/// Append-only record of a grant change, paired with the snapshot write
/// that produced it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GrantEvent {
	pub connection_id: ConnectionId,
	pub event_type: GrantEventType,
	pub added: Vec<String>,
	pub removed: Vec<String>,
	pub occurred_at: DateTime<Utc>,
	pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct NewGrantEvent {
	pub connection_id: ConnectionId,
	pub event_type: GrantEventType,
	pub added: Vec<String>,
	pub removed: Vec<String>,
	pub metadata: Map<String, Value>,
}

impl NewGrantEvent {
	pub fn from_diff(connection_id: &ConnectionId, diff: &GrantDiff) -> Self {
		Self {
			connection_id: connection_id.clone(),
			event_type: diff.event_type(),
			added: diff.added.clone(),
			removed: diff.removed.clone(),
			metadata: Map::new(),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn normalize_sorts_dedupes_and_trims() {
		let grants =
			normalize_grants(["repo:write", " repo:read ", "repo:read", ""].map(String::from));
		assert_eq!(grants, vec!["repo:read".to_owned(), "repo:write".to_owned()]);
	}

	#[test]
	fn grants_are_case_sensitive() {
		let prev = normalize_grants(["Repo:Read".to_owned()]);
		let next = normalize_grants(["repo:read".to_owned()]);
		let diff = diff_grants(&prev, &next);
		assert_eq!(diff.added, vec!["repo:read"]);
		assert_eq!(diff.removed, vec!["Repo:Read"]);
	}

	#[test]
	fn pure_addition_is_expanded() {
		let diff = diff_grants(
			&["repo:read".to_owned()],
			&["repo:read".to_owned(), "repo:write".to_owned()],
		);
		assert_eq!(diff.event_type(), GrantEventType::Expanded);
		assert_eq!(diff.added, vec!["repo:write"]);
		assert!(diff.removed.is_empty());
	}

	#[test]
	fn any_removal_is_downgraded() {
		// A swap still downgrades; removal dominates addition
		let diff = diff_grants(
			&["repo:read".to_owned(), "repo:write".to_owned()],
			&["repo:read".to_owned(), "issues:read".to_owned()],
		);
		assert_eq!(diff.event_type(), GrantEventType::Downgraded);
		assert_eq!(diff.added, vec!["issues:read"]);
		assert_eq!(diff.removed, vec!["repo:write"]);
	}

	#[test]
	fn identical_sets_are_unchanged() {
		let grants = vec!["a".to_owned(), "b".to_owned()];
		let diff = diff_grants(&grants, &grants);
		assert_eq!(diff.event_type(), GrantEventType::Unchanged);
		assert!(diff.is_unchanged());
	}
}
