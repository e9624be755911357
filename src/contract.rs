//! Sidecar API contract: response envelope, error codes, token policy,
//! endpoint snapshot, and OpenAPI generator.
//!
//! The envelope shape is contractually frozen — removing a field is
//! forbidden, adding one is always allowed. The documented path+method
//! pairs form the external contract; a snapshot of the set is checked in
//! tests so removing an endpoint fails the build.

use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::EngineError;

pub const API_VERSION: &str = "1.0.0";

/// Header carrying the write token.
pub const TOKEN_HEADER: &str = "X-Agrafes-Token";

/// The documented endpoint set: `(method, path, write)` — `write` marks
/// token-guarded endpoints. Adding endpoints is allowed; removing any
/// fails the snapshot test.
pub const ENDPOINTS: &[(&str, &str, bool)] = &[
    ("GET", "/health", false),
    ("GET", "/openapi.json", false),
    ("GET", "/documents", false),
    ("GET", "/doc_relations", false),
    ("POST", "/query", false),
    ("POST", "/import", true),
    ("POST", "/index", true),
    ("POST", "/curate", true),
    ("POST", "/curate/preview", false),
    ("POST", "/segment", true),
    ("POST", "/align", true),
    ("POST", "/align/audit", false),
    ("POST", "/align/quality", false),
    ("POST", "/align/link/update_status", true),
    ("POST", "/align/link/delete", true),
    ("POST", "/align/link/retarget", true),
    ("POST", "/documents/update", true),
    ("POST", "/documents/bulk_update", true),
    ("POST", "/doc_relations/set", true),
    ("POST", "/doc_relations/delete", true),
    ("POST", "/validate-meta", true),
    ("POST", "/export/tei", true),
    ("POST", "/export/align_csv", true),
    ("POST", "/export/run_report", true),
    ("GET", "/jobs", false),
    ("GET", "/jobs/{id}", false),
    ("POST", "/jobs/enqueue", true),
    ("POST", "/jobs/{id}/cancel", true),
    ("POST", "/shutdown", true),
];

/// Build a successful response envelope. `data` keys merge at the top
/// level next to `ok`, `api_version`, `version`, and `status`.
pub fn success_payload(data: Value, status: &str) -> Value {
    let mut payload = Map::new();
    payload.insert("ok".to_string(), json!(true));
    payload.insert("api_version".to_string(), json!(API_VERSION));
    payload.insert("version".to_string(), json!(env!("CARGO_PKG_VERSION")));
    payload.insert("status".to_string(), json!(status));
    if let Value::Object(map) = data {
        for (key, value) in map {
            payload.insert(key, value);
        }
    }
    Value::Object(payload)
}

/// Build an error response envelope from an [`EngineError`].
pub fn error_payload(error: &EngineError, details: Option<Value>) -> Value {
    let mut inner = Map::new();
    inner.insert("type".to_string(), json!(error.kind()));
    inner.insert("message".to_string(), json!(error.to_string()));
    if let Some(ref details) = details {
        inner.insert("details".to_string(), details.clone());
    }

    let mut payload = Map::new();
    payload.insert("ok".to_string(), json!(false));
    payload.insert("api_version".to_string(), json!(API_VERSION));
    payload.insert("version".to_string(), json!(env!("CARGO_PKG_VERSION")));
    payload.insert("status".to_string(), json!("error"));
    payload.insert("error".to_string(), Value::Object(inner));
    payload.insert("error_code".to_string(), json!(error.code()));
    if let Some(details) = details {
        payload.insert("error_details".to_string(), details);
    }
    Value::Object(payload)
}

/// Resolve the token mode: `off` → no auth, `auto` → random opaque token,
/// anything else → explicit fixed token.
pub fn resolve_token_mode(mode: &str) -> Result<Option<String>, EngineError> {
    match mode.trim() {
        "off" => Ok(None),
        "auto" => Ok(Some(format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        ))),
        "" => Err(EngineError::validation(
            "Token mode must be 'auto', 'off', or a non-empty token string",
        )),
        explicit => Ok(Some(explicit.to_string())),
    }
}

/// Machine-readable contract: a minimal OpenAPI 3.0 document generated
/// from the endpoint set.
pub fn openapi_spec() -> Value {
    let mut paths = Map::new();
    for &(method, path, write) in ENDPOINTS {
        let template = path.replace("{id}", "{job_id}");
        let entry = paths
            .entry(template)
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(ref mut operations) = entry {
            let mut operation = Map::new();
            operation.insert("summary".to_string(), json!(format!("{} {}", method, path)));
            if write {
                operation.insert(
                    "security".to_string(),
                    json!([{ "sidecarToken": [] }]),
                );
            }
            operation.insert(
                "responses".to_string(),
                json!({
                    "200": { "description": "JSON envelope" },
                    "400": { "description": "Validation error" },
                    "401": { "description": "Missing or invalid token" },
                    "404": { "description": "Unknown route or resource" },
                    "500": { "description": "Internal error" }
                }),
            );
            operations.insert(method.to_lowercase(), Value::Object(operation));
        }
    }

    json!({
        "openapi": "3.0.3",
        "info": {
            "title": "agrafes sidecar API",
            "version": API_VERSION,
            "description": "Localhost HTTP API for corpus query/import/index/curation/segmentation/alignment/export."
        },
        "servers": [{ "url": "http://127.0.0.1:8765" }],
        "components": {
            "securitySchemes": {
                "sidecarToken": {
                    "type": "apiKey",
                    "in": "header",
                    "name": TOKEN_HEADER
                }
            }
        },
        "paths": Value::Object(paths)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_envelope_shape() {
        let payload = success_payload(json!({"count": 3}), "ok");
        assert_eq!(payload["ok"], json!(true));
        assert_eq!(payload["api_version"], json!(API_VERSION));
        assert_eq!(payload["status"], json!("ok"));
        assert_eq!(payload["count"], json!(3));
        assert!(payload.get("version").is_some());
    }

    #[test]
    fn error_envelope_shape() {
        let error = EngineError::validation("window must be in [3, 25]");
        let payload = error_payload(&error, None);
        assert_eq!(payload["ok"], json!(false));
        assert_eq!(payload["status"], json!("error"));
        assert_eq!(payload["error_code"], json!("VALIDATION_ERROR"));
        assert_eq!(payload["error"]["type"], json!("validation"));
        assert!(payload["error"]["message"].as_str().unwrap().contains("window"));
    }

    #[test]
    fn token_modes() {
        assert!(resolve_token_mode("off").unwrap().is_none());
        let auto = resolve_token_mode("auto").unwrap().unwrap();
        assert!(auto.len() >= 32);
        assert_ne!(auto, resolve_token_mode("auto").unwrap().unwrap());
        assert_eq!(resolve_token_mode("sesame").unwrap().as_deref(), Some("sesame"));
        assert!(resolve_token_mode("  ").is_err());
    }

    #[test]
    fn openapi_covers_every_endpoint() {
        let spec = openapi_spec();
        let paths = spec["paths"].as_object().unwrap();
        for &(method, path, _) in ENDPOINTS {
            let template = path.replace("{id}", "{job_id}");
            let operations = paths.get(&template).unwrap_or_else(|| panic!("missing {}", template));
            assert!(
                operations.get(method.to_lowercase().as_str()).is_some(),
                "missing {} {}",
                method,
                path
            );
        }
    }
}
