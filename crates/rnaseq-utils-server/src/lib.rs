use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use reqwest::Client;
use rnaseq_utils_config::{Config, Environment};
use rnaseq_utils_contracts::{
    codes, method_authentication, split_method, ContractsMetadata, MethodContext,
    ProvenanceAction, RpcError, RpcRequest, RpcResponse, RunParams, METHOD_RUN_RNASEQ_UTILS,
    METHOD_STATUS, MODULE_NAME, RPC_VERSION,
};
use rnaseq_utils_kernel::{RnaseqUtils, RunConfig, Runner, RunnerError, ServiceError};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

pub async fn serve(cfg: Config, env: Environment) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg, env)?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, module = MODULE_NAME, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

pub fn build_app(cfg: Config, env: Environment) -> Result<Router, String> {
    let runner = CallbackRunner::new(&cfg.runner)?;
    info!(runner_method = runner.method(), "callback runner configured");
    Ok(build_app_with_runner(cfg, env, runner))
}

pub fn build_app_with_runner<R: Runner>(cfg: Config, env: Environment, runner: R) -> Router {
    let state = AppState {
        service: Arc::new(RnaseqUtils::new(cfg.rnaseq_utils, &env, runner)),
    };
    Router::new()
        .route("/", post(rpc::<R>))
        .route("/rpc", post(rpc::<R>))
        .route("/healthz", get(healthz))
        .route("/contracts", get(contracts))
        .with_state(state)
}

struct AppState<R> {
    service: Arc<RnaseqUtils<R>>,
}

impl<R> Clone for AppState<R> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
        }
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn contracts() -> Json<ContractsMetadata> {
    Json(ContractsMetadata::current())
}

type RpcReply = (StatusCode, Json<RpcResponse>);

async fn rpc<R: Runner>(
    State(state): State<AppState<R>>,
    headers: HeaderMap,
    body: Bytes,
) -> RpcReply {
    let raw: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return rpc_error(
                None,
                RpcError::new(codes::PARSE_ERROR, "Parse error").with_detail(e.to_string()),
            )
        }
    };
    let id = raw.get("id").cloned();
    let req: RpcRequest = match serde_json::from_value(raw) {
        Ok(v) => v,
        Err(e) => {
            return rpc_error(
                id,
                RpcError::new(codes::INVALID_REQUEST, "Invalid Request").with_detail(e.to_string()),
            )
        }
    };

    let method = match split_method(&req.method) {
        Some((MODULE_NAME, method)) => method,
        _ => return method_not_found(req.id, &req.method),
    };

    let ctx = method_context(&headers, &req, method);
    info!(
        method = %req.method,
        call_id = ctx.call_id.as_deref().unwrap_or("-"),
        authenticated = ctx.authenticated,
        "rpc call"
    );

    match method {
        METHOD_STATUS => {
            let result = match serde_json::to_value(state.service.status(&ctx)) {
                Ok(Value::Array(items)) => items,
                Ok(other) => vec![other],
                Err(e) => {
                    return rpc_error(
                        req.id,
                        RpcError::new(codes::SERVER_ERROR, format!("render status failed: {e}")),
                    )
                }
            };
            (StatusCode::OK, Json(RpcResponse::ok(req.id, result)))
        }
        METHOD_RUN_RNASEQ_UTILS => {
            if method_authentication(method) == Some("required") && !ctx.authenticated {
                return rpc_error(
                    req.id,
                    RpcError::new(
                        codes::AUTH_REQUIRED,
                        format!(
                            "Authentication required for {MODULE_NAME} but no authentication header was passed"
                        ),
                    ),
                );
            }
            let params = match run_params(&req.params) {
                Ok(p) => p,
                Err(e) => return rpc_error(req.id, e),
            };
            match state.service.run_rnaseq_utils(&ctx, params).await {
                Ok(out) => {
                    let result = out.into_iter().map(Value::Object).collect();
                    (StatusCode::OK, Json(RpcResponse::ok(req.id, result)))
                }
                Err(e) => {
                    warn!(method = %req.method, error = %e, "rpc call failed");
                    rpc_error(req.id, service_error(&e))
                }
            }
        }
        _ => method_not_found(req.id, &req.method),
    }
}

fn rpc_error(id: Option<Value>, error: RpcError) -> RpcReply {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(RpcResponse::err(id, error)),
    )
}

fn method_not_found(id: Option<Value>, method: &str) -> RpcReply {
    rpc_error(
        id,
        RpcError::new(codes::METHOD_NOT_FOUND, "Method not found").with_detail(method),
    )
}

fn run_params(params: &[Value]) -> Result<RunParams, RpcError> {
    match params {
        [Value::Object(map)] => Ok(map.clone()),
        [_] => Err(RpcError::new(
            codes::INVALID_PARAMS,
            "params must be a mapping from string to object",
        )),
        _ => Err(RpcError::new(
            codes::INVALID_PARAMS,
            format!("Wrong number of arguments: expected 1, got {}", params.len()),
        )),
    }
}

fn service_error(err: &ServiceError) -> RpcError {
    let base = RpcError::new(codes::SERVER_ERROR, err.to_string());
    match err {
        ServiceError::Runner(RunnerError::Remote {
            detail: Some(detail),
            ..
        }) => base.with_detail(detail.clone()),
        _ => base,
    }
}

#[derive(Debug, Default, Deserialize)]
struct CallerContext {
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    provenance: Option<Vec<ProvenanceAction>>,
}

fn method_context(headers: &HeaderMap, req: &RpcRequest, method: &str) -> MethodContext {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let caller: CallerContext = req
        .context
        .clone()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    let provenance = caller.provenance.unwrap_or_else(|| {
        vec![ProvenanceAction {
            service: MODULE_NAME.to_string(),
            method: method.to_string(),
            method_params: req.params.clone(),
            time: Some(Utc::now().to_rfc3339()),
        }]
    });
    MethodContext {
        authenticated: token.is_some(),
        token,
        user_id: None,
        call_id: Some(
            caller
                .call_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().as_simple().to_string()),
        ),
        provenance,
    }
}

/// Runs the app method through the SDK callback server as a JSON-RPC call.
#[derive(Clone)]
pub struct CallbackRunner {
    client: Client,
    method: String,
    endpoint: Option<String>,
}

impl CallbackRunner {
    pub fn new(cfg: &rnaseq_utils_config::Runner) -> Result<Self, String> {
        let client = Client::builder().build().map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            method: cfg.method.clone(),
            endpoint: cfg.endpoint.clone(),
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl Runner for CallbackRunner {
    fn run_rnaseq_utils_app(
        &self,
        config: &RunConfig,
        params: RunParams,
    ) -> impl Future<Output = Result<Value, RunnerError>> + Send {
        let client = self.client.clone();
        let url = self
            .endpoint
            .clone()
            .unwrap_or_else(|| config.callback_url.clone());
        let token = config.token.clone();
        let mut settings = config.settings.clone();
        settings.remove("token");
        let body = json!({
            "version": RPC_VERSION,
            "method": self.method,
            "params": [params],
            "id": uuid::Uuid::new_v4().as_simple().to_string(),
            "context": {"config": settings},
        });

        async move {
            let mut request = client.post(&url).json(&body);
            if let Some(token) = token {
                request = request.header(AUTHORIZATION, token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| RunnerError::Transport(e.to_string()))?;
            let status = response.status();
            let payload: RpcResponse = response.json().await.map_err(|e| {
                RunnerError::Protocol(format!("callback returned {status} without rpc body: {e}"))
            })?;

            if let Some(err) = payload.error {
                return Err(RunnerError::Remote {
                    name: err.name,
                    code: err.code,
                    message: err.message,
                    detail: err.error,
                });
            }
            payload
                .result
                .and_then(|mut r| if r.is_empty() { None } else { Some(r.swap_remove(0)) })
                .ok_or_else(|| RunnerError::Protocol("callback returned an empty result".to_string()))
        }
    }
}
