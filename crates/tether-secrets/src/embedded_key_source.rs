use std::{
	collections::{BTreeMap, HashMap},
	sync::Arc,
};

use async_trait::async_trait;
use rand::{rngs::StdRng, RngCore, SeedableRng};
use secret_vault::{Secret, SecretMetadata, SecretVaultRef, SecretVaultResult, SecretsSource};
use secret_vault_value::SecretValue;
use tokio::sync::Mutex;
use tracing::debug;

pub struct EmbeddedKeySource {
	keys: Arc<Mutex<HashMap<SecretVaultRef, Vec<u8>>>>,
	seeds: BTreeMap<String, [u8; 32]>,
}

impl EmbeddedKeySource {
	pub fn new() -> Self {
		Self { keys: Arc::new(Mutex::new(HashMap::new())), seeds: BTreeMap::default() }
	}

	pub fn new_seeded(seeds: BTreeMap<String, [u8; 32]>) -> Self {
		Self { keys: Arc::new(Mutex::new(HashMap::new())), seeds }
	}
}

impl Default for EmbeddedKeySource {
	fn default() -> Self {
		Self::new()
	}
}

fn new_key_material(name: &str, seeds: &BTreeMap<String, [u8; 32]>) -> String {
	let key = if let Some(seed) = seeds.get(name) {
		*seed
	} else {
		let mut key = [0u8; 32];
		StdRng::from_entropy().fill_bytes(&mut key);
		key
	};
	format!("0x{}", hex::encode(key))
}

#[async_trait]
impl SecretsSource for EmbeddedKeySource {
	fn name(&self) -> String {
		"EmbeddedKeySource".to_string()
	}

	// Create and cache fresh key material for each novel reference
	async fn get_secrets(
		&self,
		references: &[SecretVaultRef],
	) -> SecretVaultResult<HashMap<SecretVaultRef, Secret>> {
		debug!(get_secrets=?references, "Getting keys from embedded source");

		let mut result_map: HashMap<SecretVaultRef, Secret> = HashMap::new();
		let mut keys = self.keys.lock().await;
		for secret_ref in references.iter() {
			let key = keys.entry(secret_ref.clone()).or_insert_with(|| {
				new_key_material(secret_ref.key.secret_name.as_ref(), &self.seeds).into_bytes()
			});

			let secret_value = SecretValue::from(key);
			let metadata = SecretMetadata::create_from_ref(secret_ref);

			result_map.insert(secret_ref.clone(), Secret::new(secret_value, metadata));
		}

		Ok(result_map)
	}
}
