//! Dialect-aware migration registry. The postgres tree is also embedded for
//! diesel (see [`crate::MIGRATIONS`]); this registry exists so deployments
//! carrying both dialects can assert at wiring time that every migration has
//! complete up and down SQL for every declared dialect.

use common::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
	Postgres,
	Sqlite,
}

impl Dialect {
	pub fn as_str(self) -> &'static str {
		match self {
			Dialect::Postgres => "postgres",
			Dialect::Sqlite => "sqlite",
		}
	}
}

#[derive(Debug, Clone)]
pub struct DialectMigration {
	pub dialect: Dialect,
	pub up: &'static str,
	pub down: &'static str,
}

/// One versioned migration, named `NNNNN_services_<name>`, with one SQL pair
/// per dialect.
#[derive(Debug, Clone)]
pub struct MigrationSet {
	pub name: &'static str,
	pub dialects: Vec<DialectMigration>,
}

macro_rules! migration_set {
	($name:literal) => {
		MigrationSet {
			name: $name,
			dialects: vec![
				DialectMigration {
					dialect: Dialect::Postgres,
					up: include_str!(concat!("../migrations/postgres/", $name, "/up.sql")),
					down: include_str!(concat!("../migrations/postgres/", $name, "/down.sql")),
				},
				DialectMigration {
					dialect: Dialect::Sqlite,
					up: include_str!(concat!("../migrations/sqlite/", $name, "/up.sql")),
					down: include_str!(concat!("../migrations/sqlite/", $name, "/down.sql")),
				},
			],
		}
	};
}

pub fn registered_migrations() -> Vec<MigrationSet> {
	vec![migration_set!("00001_services_core")]
}

/// Every declared dialect must carry non-empty up and down SQL.
pub fn validate_migrations(sets: &[MigrationSet]) -> Result<(), StoreError> {
	for set in sets {
		if set.dialects.is_empty() {
			return Err(StoreError::Config(format!(
				"migration {} declares no dialects",
				set.name
			)));
		}
		for dialect in &set.dialects {
			if dialect.up.trim().is_empty() {
				return Err(StoreError::Config(format!(
					"migration {} has empty {} up SQL",
					set.name,
					dialect.dialect.as_str()
				)));
			}
			if dialect.down.trim().is_empty() {
				return Err(StoreError::Config(format!(
					"migration {} has empty {} down SQL",
					set.name,
					dialect.dialect.as_str()
				)));
			}
		}
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn registered_migrations_are_complete() {
		let sets = registered_migrations();
		assert!(!sets.is_empty());
		validate_migrations(&sets).unwrap();
	}

	#[test]
	fn every_set_declares_both_dialects() {
		for set in registered_migrations() {
			let mut dialects: Vec<_> =
				set.dialects.iter().map(|d| d.dialect.as_str()).collect();
			dialects.sort();
			assert_eq!(dialects, vec!["postgres", "sqlite"], "{}", set.name);
		}
	}

	#[test]
	fn validation_rejects_empty_sql() {
		let sets = vec![MigrationSet {
			name: "00002_services_empty",
			dialects: vec![DialectMigration {
				dialect: Dialect::Sqlite,
				up: "CREATE TABLE t (id TEXT);",
				down: "   ",
			}],
		}];
		assert!(matches!(validate_migrations(&sets), Err(StoreError::Config(_))));
	}

	#[test]
	fn migration_names_follow_the_versioned_scheme() {
		for set in registered_migrations() {
			let (version, rest) = set.name.split_at(5);
			assert!(version.chars().all(|c| c.is_ascii_digit()), "{}", set.name);
			assert!(rest.starts_with("_services_"), "{}", set.name);
		}
	}
}
