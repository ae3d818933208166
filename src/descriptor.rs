//! Remote method descriptors.
//!
//! The backend addresses every operation as
//! `POST /api/{package}/{class}/{method}[/{recordId}]` with a JSON body.
//! A descriptor is the value form of one such call. Its canonical cache key
//! doubles as the deduplication key: two descriptors with deep-equal args
//! produce the same key regardless of object key order, so the backend layer
//! never has to do structural comparison itself.

use serde_json::Value;

#[derive(Clone, Debug)]
pub struct MethodDescriptor {
    pub package_name: String,
    pub class_name: String,
    pub method_name: String,
    pub record_id: Option<String>,
    pub args: Value,
}

impl MethodDescriptor {
    pub fn new(package_name: &str, class_name: &str, method_name: &str) -> Self {
        Self {
            package_name: package_name.to_string(),
            class_name: class_name.to_string(),
            method_name: method_name.to_string(),
            record_id: None,
            args: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    /// Request path relative to the backend origin.
    pub fn path(&self) -> String {
        let mut path = format!(
            "/api/{}/{}/{}",
            self.package_name, self.class_name, self.method_name
        );
        if let Some(record_id) = &self.record_id {
            path.push('/');
            path.push_str(record_id);
        }
        path
    }

    /// Dotted label for logs, e.g. `core.login.getToken`.
    pub fn label(&self) -> String {
        format!(
            "{}.{}.{}",
            self.package_name, self.class_name, self.method_name
        )
    }

    /// Canonical key: path plus stable-sorted-key JSON of the args.
    /// Deep-equal args always yield the same key.
    pub fn cache_key(&self) -> String {
        let mut key = self.path();
        key.push(' ');
        canonical_json(&self.args, &mut key);
        key
    }
}

/// Serialize a JSON value with object keys emitted in sorted order.
/// Arrays keep their order; only maps are normalized.
fn canonical_json(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Map keys are plain strings; reuse serde_json's escaping.
                out.push_str(&Value::String((*k).clone()).to_string());
                out.push(':');
                canonical_json(&map[*k], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonical_json(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
