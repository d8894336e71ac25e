use std::env;

use rnaseq_utils_config::{deployment_config_path, Environment, ENV_DEPLOYMENT_CONFIG};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    if cmd == "status" {
        let status = rnaseq_utils_kernel::status_record();
        match serde_json::to_string_pretty(&[status]) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("failed to render status: {e}");
                std::process::exit(1);
            }
        }
        return;
    }
    if cmd != "serve" {
        eprintln!("Usage: rnaseq-utils serve [--config <path>] | rnaseq-utils status");
        std::process::exit(2);
    }

    let mut explicit_config = None;
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(v) = args.next() {
                explicit_config = Some(v);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rnaseq_utils=info")),
        )
        .init();

    let env_config = env::var(ENV_DEPLOYMENT_CONFIG).ok();
    let config_path = deployment_config_path(explicit_config.as_deref(), env_config.as_deref())
        .unwrap_or_else(|| String::from("./config/deploy.yaml"));

    let cfg = match rnaseq_utils_config::load_and_validate(&config_path) {
        Ok(v) => v,
        Err(e) => {
            error!(path = %config_path, "failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let environment = match Environment::from_env() {
        Ok(v) => v,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = rnaseq_utils_server::serve(cfg, environment).await {
        error!("server exited with error: {e}");
        std::process::exit(1);
    }
}
