use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

pub const ENV_CALLBACK_URL: &str = "SDK_CALLBACK_URL";
pub const ENV_AUTH_TOKEN: &str = "KB_AUTH_TOKEN";
pub const ENV_DEPLOYMENT_CONFIG: &str = "KB_DEPLOYMENT_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
    #[error("required environment variable {0} is not set")]
    MissingEnv(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub rnaseq_utils: ModuleConfig,
    #[serde(default)]
    pub runner: Runner,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

/// The module's section of the deployment file. Keys the service does not
/// interpret are kept in `extra` and handed to the runner untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModuleConfig {
    pub scratch: String,
    #[serde(rename = "workspace-url", default, skip_serializing_if = "Option::is_none")]
    pub workspace_url: Option<String>,
    #[serde(rename = "auth-service-url", default, skip_serializing_if = "Option::is_none")]
    pub auth_service_url: Option<String>,
    #[serde(rename = "kbase-endpoint", default, skip_serializing_if = "Option::is_none")]
    pub kbase_endpoint: Option<String>,
    #[serde(rename = "handle-service-url", default, skip_serializing_if = "Option::is_none")]
    pub handle_service_url: Option<String>,
    #[serde(rename = "srv-wiz-url", default, skip_serializing_if = "Option::is_none")]
    pub srv_wiz_url: Option<String>,
    #[serde(rename = "shock-url", default, skip_serializing_if = "Option::is_none")]
    pub shock_url: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ModuleConfig {
    pub fn new(scratch: impl Into<String>) -> Self {
        Self {
            scratch: scratch.into(),
            ..Self::default()
        }
    }

    /// Flattens the section back into the key/value mapping the runner reads.
    pub fn to_settings(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => {
                let mut map = Map::new();
                map.insert("scratch".to_string(), Value::String(self.scratch.clone()));
                map
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    #[serde(default = "default_runner_method")]
    pub method: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl Default for Runner {
    fn default() -> Self {
        Self {
            method: default_runner_method(),
            endpoint: None,
        }
    }
}

fn default_runner_method() -> String {
    "RNASeqUtil.run_rnaseq_utils_app".to_string()
}

/// Process environment the service depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub callback_url: String,
    pub auth_token: Option<String>,
    pub deployment_config: Option<String>,
}

impl Environment {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let callback_url = lookup(ENV_CALLBACK_URL)
            .ok_or_else(|| ConfigError::MissingEnv(ENV_CALLBACK_URL.to_string()))?;
        Ok(Self {
            callback_url,
            auth_token: lookup(ENV_AUTH_TOKEN).filter(|v| !v.is_empty()),
            deployment_config: lookup(ENV_DEPLOYMENT_CONFIG).filter(|v| !v.is_empty()),
        })
    }
}

/// Picks the deployment file: an explicit path wins over `KB_DEPLOYMENT_CONFIG`.
pub fn deployment_config_path(explicit: Option<&str>, env_value: Option<&str>) -> Option<String> {
    explicit
        .or(env_value)
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.to_string())
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.rnaseq_utils.scratch.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "rnaseq_utils.scratch must not be empty".to_string(),
        ));
    }
    if cfg
        .server
        .listen_addr
        .parse::<std::net::SocketAddr>()
        .is_err()
    {
        return Err(ConfigError::UnsupportedConfig(format!(
            "server.listen_addr={} is not a socket address",
            cfg.server.listen_addr
        )));
    }
    match cfg.runner.method.split_once('.') {
        Some((module, method)) if !module.is_empty() && !method.is_empty() => {}
        _ => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "runner.method={} must look like Module.method",
                cfg.runner.method
            )))
        }
    }
    if let Some(endpoint) = &cfg.runner.endpoint {
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(ConfigError::UnsupportedConfig(format!(
                "runner.endpoint={endpoint} must be an http(s) url"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("rnaseq-utils-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:0"

rnaseq_utils:
  scratch: "/kb/module/work/tmp"
  workspace-url: "https://ci.kbase.us/services/ws"
  auth-service-url: "https://ci.kbase.us/services/auth/api/legacy/KBase/Sessions/Login"
"#
        .to_string()
    }

    #[test]
    fn loads_module_section_and_defaults_runner() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("base config should be accepted");
        assert_eq!(cfg.rnaseq_utils.scratch, "/kb/module/work/tmp");
        assert_eq!(
            cfg.rnaseq_utils.workspace_url.as_deref(),
            Some("https://ci.kbase.us/services/ws")
        );
        assert_eq!(cfg.runner.method, "RNASeqUtil.run_rnaseq_utils_app");
        assert!(cfg.runner.endpoint.is_none());
    }

    #[test]
    fn unknown_module_keys_survive_into_settings() {
        let path = write_temp_config(&base_yaml().replace(
            "rnaseq_utils:\n",
            "rnaseq_utils:\n  job-service-url: \"https://ci.kbase.us/services/njs\"\n",
        ));
        let cfg = load_and_validate(&path).unwrap();
        let settings = cfg.rnaseq_utils.to_settings();
        assert_eq!(settings["job-service-url"], "https://ci.kbase.us/services/njs");
        assert_eq!(settings["scratch"], "/kb/module/work/tmp");
        assert!(!settings.contains_key("shock-url"));
    }

    #[test]
    fn rejects_missing_scratch() {
        let path = write_temp_config(&base_yaml().replace(
            "  scratch: \"/kb/module/work/tmp\"\n",
            "",
        ));
        let err = load_and_validate(&path).expect_err("expected missing scratch");
        assert!(matches!(err, ConfigError::SchemaValidation(_)));
    }

    #[test]
    fn rejects_bad_runner_method() {
        let path = write_temp_config(&format!("{}\nrunner:\n  method: \"nodot\"\n", base_yaml()));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn rejects_unparseable_listen_addr() {
        let path = write_temp_config(&base_yaml().replace("127.0.0.1:0", "localhost"));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn missing_callback_url_is_a_lookup_failure() {
        let err = Environment::from_lookup(|_| None).expect_err("expected missing env");
        match err {
            ConfigError::MissingEnv(name) => assert_eq!(name, "SDK_CALLBACK_URL"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn environment_reads_optional_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("SDK_CALLBACK_URL", "http://10.0.0.2:9999"),
            ("KB_AUTH_TOKEN", ""),
            ("KB_DEPLOYMENT_CONFIG", "/kb/module/deploy.yaml"),
        ]);
        let env = Environment::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(env.callback_url, "http://10.0.0.2:9999");
        assert_eq!(env.auth_token, None);
        assert_eq!(env.deployment_config.as_deref(), Some("/kb/module/deploy.yaml"));
    }

    #[test]
    fn explicit_config_path_wins() {
        assert_eq!(
            deployment_config_path(Some("a.yaml"), Some("b.yaml")).as_deref(),
            Some("a.yaml")
        );
        assert_eq!(
            deployment_config_path(None, Some("b.yaml")).as_deref(),
            Some("b.yaml")
        );
        assert_eq!(deployment_config_path(None, Some("  ")), None);
    }
}
