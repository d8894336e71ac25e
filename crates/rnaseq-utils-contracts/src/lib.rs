use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const MODULE_NAME: &str = "rnaseq_utils";
pub const VERSION: &str = "0.0.1";
pub const GIT_URL: &str = "";
pub const GIT_COMMIT_HASH: &str = "";

pub const RPC_VERSION: &str = "1.1";
pub const METHOD_RUN_RNASEQ_UTILS: &str = "run_rnaseq_utils";
pub const METHOD_STATUS: &str = "status";

/// JSON-RPC error codes used by the module server.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const SERVER_ERROR: i64 = -32000;
    pub const AUTH_REQUIRED: i64 = -32400;
}

/// Free-form parameters accepted by `run_rnaseq_utils`.
pub type RunParams = Map<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportResults {
    pub report_name: String,
    pub report_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StatusRecord {
    pub state: String,
    pub message: String,
    pub version: String,
    pub git_url: String,
    pub git_commit_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvenanceAction {
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub method_params: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

/// Per-call bundle supplied by the host: who is calling and with which token.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MethodContext {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub authenticated: bool,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub provenance: Vec<ProvenanceAction>,
}

impl MethodContext {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            authenticated: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub version: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub context: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub name: String,
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        let name = match code {
            codes::SERVER_ERROR => "Server error",
            _ => "JSONRPCError",
        };
        Self {
            name: name.to_string(),
            code,
            message: message.into(),
            error: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.error = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub version: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: Option<Value>, result: Vec<Value>) -> Self {
        Self {
            version: RPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Option<Value>, error: RpcError) -> Self {
        Self {
            version: RPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Splits `module.method` into its two halves.
pub fn split_method(qualified: &str) -> Option<(&str, &str)> {
    let (module, method) = qualified.split_once('.')?;
    if module.is_empty() || method.is_empty() || method.contains('.') {
        return None;
    }
    Some((module, method))
}

#[derive(Debug, Clone)]
pub struct ContractSchemaManifest {
    pub path: &'static str,
    pub sha256: &'static str,
    pub body: &'static str,
}

#[derive(Debug, Clone)]
pub struct ContractsManifest {
    pub module_name: &'static str,
    pub funcdefs: Vec<(&'static str, &'static str)>,
    pub module_spec_sha256: &'static str,
    pub module_spec: &'static str,
    pub schema_set_sha256: &'static str,
    pub generated_at: &'static str,
    pub schemas: Vec<ContractSchemaManifest>,
}

include!(concat!(env!("OUT_DIR"), "/generated_contracts.rs"));

pub fn contracts_manifest_v1() -> ContractsManifest {
    ContractsManifest {
        module_name: GENERATED_MODULE_NAME,
        funcdefs: GENERATED_FUNCDEFS.to_vec(),
        module_spec_sha256: GENERATED_MODULE_SPEC_SHA256,
        module_spec: GENERATED_MODULE_SPEC,
        schema_set_sha256: GENERATED_SCHEMA_SET_SHA256,
        generated_at: GENERATED_AT_RFC3339,
        schemas: GENERATED_SCHEMAS
            .iter()
            .map(|(path, sha256, body)| ContractSchemaManifest { path, sha256, body })
            .collect(),
    }
}

/// Authentication mode declared for a method of this module. `status` is
/// served by every module without authentication.
pub fn method_authentication(method: &str) -> Option<&'static str> {
    if method == METHOD_STATUS {
        return Some("none");
    }
    GENERATED_FUNCDEFS
        .iter()
        .find(|(name, _)| *name == method)
        .map(|(_, auth)| *auth)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContractsMetadata {
    pub module: String,
    pub version: String,
    pub module_spec_sha256: String,
    pub schema_set_sha256: String,
    pub generated_at: String,
    pub schemas: BTreeMap<String, String>,
    pub methods: Vec<String>,
    pub authentication: BTreeMap<String, String>,
}

impl ContractsMetadata {
    pub fn current() -> Self {
        let manifest = contracts_manifest_v1();
        Self {
            module: MODULE_NAME.to_string(),
            version: VERSION.to_string(),
            module_spec_sha256: manifest.module_spec_sha256.to_string(),
            schema_set_sha256: manifest.schema_set_sha256.to_string(),
            generated_at: manifest.generated_at.to_string(),
            schemas: manifest
                .schemas
                .iter()
                .map(|s| (s.path.to_string(), s.sha256.to_string()))
                .collect(),
            methods: manifest
                .funcdefs
                .iter()
                .map(|(name, _)| *name)
                .chain([METHOD_STATUS])
                .map(|name| format!("{}.{name}", manifest.module_name))
                .collect(),
            authentication: manifest
                .funcdefs
                .iter()
                .map(|(name, auth)| (name.to_string(), auth.to_string()))
                .chain([(METHOD_STATUS.to_string(), "none".to_string())])
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sha2::{Digest, Sha256};

    fn schema(name: &str) -> Value {
        let manifest = contracts_manifest_v1();
        let entry = manifest
            .schemas
            .iter()
            .find(|s| s.path.ends_with(name))
            .unwrap_or_else(|| panic!("schema {name} not embedded"));
        serde_json::from_str(entry.body).unwrap()
    }

    #[test]
    fn embedded_schemas_are_valid_json_schema() {
        for entry in contracts_manifest_v1().schemas {
            let schema: Value = serde_json::from_str(entry.body).unwrap();
            let _validator = jsonschema::validator_for(&schema)
                .unwrap_or_else(|err| panic!("invalid schema {}: {err}", entry.path));
        }
    }

    #[test]
    fn embedded_digests_match_bodies() {
        let manifest = contracts_manifest_v1();
        let digest: String = Sha256::digest(manifest.module_spec.as_bytes())
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        assert_eq!(digest, manifest.module_spec_sha256);
        for entry in manifest.schemas {
            let digest: String = Sha256::digest(entry.body.as_bytes())
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect();
            assert_eq!(digest, entry.sha256, "{}", entry.path);
        }
    }

    #[test]
    fn status_record_matches_schema() {
        let record = StatusRecord {
            state: "OK".to_string(),
            message: String::new(),
            version: VERSION.to_string(),
            git_url: GIT_URL.to_string(),
            git_commit_hash: GIT_COMMIT_HASH.to_string(),
        };
        let validator = jsonschema::validator_for(&schema("status.schema.json")).unwrap();
        assert!(validator.is_valid(&serde_json::to_value(record).unwrap()));
    }

    #[test]
    fn report_results_schema_requires_both_fields() {
        let validator = jsonschema::validator_for(&schema("report_results.schema.json")).unwrap();
        assert!(validator.is_valid(&json!({"report_name": "rep1", "report_ref": "ws/1/2"})));
        assert!(!validator.is_valid(&json!({"report_name": "rep1"})));
    }

    #[test]
    fn module_spec_declares_run_method() {
        let manifest = contracts_manifest_v1();
        assert_eq!(manifest.module_name, MODULE_NAME);
        assert_eq!(
            manifest.funcdefs,
            vec![(METHOD_RUN_RNASEQ_UTILS, "required")]
        );
    }

    #[test]
    fn authentication_follows_module_spec() {
        assert_eq!(method_authentication(METHOD_RUN_RNASEQ_UTILS), Some("required"));
        assert_eq!(method_authentication(METHOD_STATUS), Some("none"));
        assert_eq!(method_authentication("run_all"), None);

        let meta = ContractsMetadata::current();
        assert_eq!(
            meta.methods,
            vec!["rnaseq_utils.run_rnaseq_utils", "rnaseq_utils.status"]
        );
        assert_eq!(meta.authentication["run_rnaseq_utils"], "required");
    }

    #[test]
    fn split_method_requires_module_and_name() {
        assert_eq!(
            split_method("rnaseq_utils.status"),
            Some(("rnaseq_utils", "status"))
        );
        assert_eq!(split_method("status"), None);
        assert_eq!(split_method(".status"), None);
        assert_eq!(split_method("a.b.c"), None);
    }

    #[test]
    fn rpc_error_response_omits_result() {
        let res = RpcResponse::err(
            Some(json!("1")),
            RpcError::new(codes::METHOD_NOT_FOUND, "Method not found"),
        );
        let value = serde_json::to_value(res).unwrap();
        assert!(value.get("result").is_none());
        assert_eq!(value["error"]["name"], "JSONRPCError");
        assert_eq!(value["error"]["code"], -32601);
    }
}
