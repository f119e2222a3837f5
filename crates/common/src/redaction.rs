use serde_json::{Map, Value};

pub const REDACTED: &str = "[REDACTED]";

/// Key fragments whose values never reach the store. Matching is a
/// case-insensitive substring test over the normalized key (`-` folded to
/// `_`, so `api-key`, `api_key` and `apikey` all match).
const SENSITIVE_FRAGMENTS: &[&str] = &[
	"password",
	"secret",
	"token",
	"authorization",
	"api_key",
	"apikey",
	"refresh",
	"credential",
	"signature",
];

fn is_sensitive_key(key: &str) -> bool {
	let normalized = key.to_ascii_lowercase().replace('-', "_");
	SENSITIVE_FRAGMENTS.iter().any(|fragment| normalized.contains(fragment))
}

/// Deep-copy a metadata map, replacing the entire value under every
/// sensitive key (nested maps and arrays included) with `[REDACTED]`. This
/// runs in the repository layer; call sites are not trusted to do it.
pub fn redact_metadata(metadata: &Map<String, Value>) -> Map<String, Value> {
	metadata
		.iter()
		.map(|(key, value)| {
			if is_sensitive_key(key) {
				(key.clone(), Value::String(REDACTED.to_owned()))
			} else {
				(key.clone(), redact_value(value))
			}
		})
		.collect()
}

fn redact_value(value: &Value) -> Value {
	match value {
		Value::Object(map) => Value::Object(redact_metadata(map)),
		Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
		other => other.clone(),
	}
}
