use std::future::Future;
use std::path::PathBuf;

use rnaseq_utils_config::{Environment, ModuleConfig};
use rnaseq_utils_contracts::{
    MethodContext, RunParams, StatusRecord, GIT_COMMIT_HASH, GIT_URL, VERSION,
};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("runner transport failed: {0}")]
    Transport(String),
    #[error("{message}")]
    Remote {
        name: String,
        code: i64,
        message: String,
        detail: Option<String>,
    },
    #[error("runner protocol error: {0}")]
    Protocol(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    /// The runner answered with something other than a mapping.
    #[error("Method run_rnaseq_utils return value output is not type dict as required.")]
    InvalidReturn,
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// Configuration handed to the runner for one call. Built fresh per call so
/// concurrent callers never see each other's token.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// The caller's token as the host supplied it; `None` for anonymous calls.
    pub token: Option<String>,
    pub callback_url: String,
    pub scratch: PathBuf,
    /// Every deployment key plus `token`, in the flat shape runners expect.
    pub settings: Map<String, Value>,
}

/// The external collaborator that does the actual RNA-seq work.
pub trait Runner: Send + Sync + 'static {
    fn run_rnaseq_utils_app(
        &self,
        config: &RunConfig,
        params: RunParams,
    ) -> impl Future<Output = Result<Value, RunnerError>> + Send;
}

pub struct RnaseqUtils<R> {
    config: ModuleConfig,
    callback_url: String,
    shared_folder: PathBuf,
    runner: R,
}

impl<R: Runner> RnaseqUtils<R> {
    /// Requires a resolved [`Environment`]: a missing `SDK_CALLBACK_URL` has
    /// already failed by the time a façade can exist.
    pub fn new(config: ModuleConfig, env: &Environment, runner: R) -> Self {
        Self {
            shared_folder: PathBuf::from(&config.scratch),
            callback_url: env.callback_url.clone(),
            config,
            runner,
        }
    }

    pub fn callback_url(&self) -> &str {
        &self.callback_url
    }

    pub fn shared_folder(&self) -> &std::path::Path {
        &self.shared_folder
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub async fn run_rnaseq_utils(
        &self,
        ctx: &MethodContext,
        mut params: RunParams,
    ) -> Result<Vec<Map<String, Value>>, ServiceError> {
        normalize_params(&mut params);
        let run_config = self.run_config(ctx.token.as_deref());
        info!(
            call_id = ctx.call_id.as_deref().unwrap_or("-"),
            user_id = ctx.user_id.as_deref().unwrap_or("-"),
            params_sha256 = %params_fingerprint(&params).unwrap_or_default(),
            "run_rnaseq_utils started"
        );

        let output = self
            .runner
            .run_rnaseq_utils_app(&run_config, params)
            .await?;

        match output {
            Value::Object(map) => {
                debug!(keys = map.len(), "run_rnaseq_utils finished");
                Ok(vec![map])
            }
            _ => Err(ServiceError::InvalidReturn),
        }
    }

    pub fn status(&self, _ctx: &MethodContext) -> Vec<StatusRecord> {
        vec![status_record()]
    }

    fn run_config(&self, token: Option<&str>) -> RunConfig {
        let mut settings = self.config.to_settings();
        settings.insert(
            "token".to_string(),
            token.map_or(Value::Null, |t| Value::String(t.to_string())),
        );
        RunConfig {
            token: token.map(str::to_string),
            callback_url: self.callback_url.clone(),
            scratch: self.shared_folder.clone(),
            settings,
        }
    }
}

/// Trims leading and trailing whitespace from every top-level string value.
/// The ASCII file/group/record/unit separators count as whitespace too.
pub fn normalize_params(params: &mut RunParams) {
    for value in params.values_mut() {
        if let Value::String(s) = value {
            let trimmed = s.trim_matches(is_param_whitespace);
            if trimmed.len() != s.len() {
                *s = trimmed.to_string();
            }
        }
    }
}

fn is_param_whitespace(c: char) -> bool {
    c.is_whitespace() || ('\x1c'..='\x1f').contains(&c)
}

pub fn status_record() -> StatusRecord {
    StatusRecord {
        state: "OK".to_string(),
        message: String::new(),
        version: VERSION.to_string(),
        git_url: GIT_URL.to_string(),
        git_commit_hash: GIT_COMMIT_HASH.to_string(),
    }
}

/// Key-order independent digest of a parameter set, for log correlation.
pub fn params_fingerprint(params: &RunParams) -> Result<String, String> {
    let canonical = serde_jcs::to_string(params)
        .map_err(|err| format!("failed to canonicalize params via JCS: {err}"))?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}
