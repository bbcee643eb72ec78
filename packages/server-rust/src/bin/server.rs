//! Meshlink server binary.
//!
//! Registers the demo arithmetic methods and the resource methods, then
//! serves until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use meshlink_server::{
    register_resource_methods, AuthProvider, DispatchServer, NetworkConfig, NetworkModule,
    ResourceStore,
};
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "meshlink-server", about = "Meshlink RPC server")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "0.0.0.0", env = "MESHLINK_HOST")]
    host: String,

    /// Port to listen on. 0 means OS-assigned.
    #[arg(long, default_value_t = 50051, env = "MESHLINK_PORT")]
    port: u16,

    /// Accept unauthenticated callers with full permissions. Development
    /// only; never enable in production.
    #[arg(long, env = "MESHLINK_ALLOW_ANONYMOUS")]
    allow_anonymous: bool,

    /// Register a client as `id:api_key:perm[,perm...]`. Repeatable.
    #[arg(long = "client", value_name = "ID:KEY:PERMS")]
    clients: Vec<String>,

    /// Request timeout in seconds.
    #[arg(long, default_value_t = 30)]
    request_timeout_secs: u64,
}

/// Parses an `id:api_key:perm[,perm...]` client registration.
fn parse_client_spec(spec: &str) -> anyhow::Result<(String, String, Vec<String>)> {
    let mut parts = spec.splitn(3, ':');
    let (Some(id), Some(key), Some(perms)) = (parts.next(), parts.next(), parts.next()) else {
        anyhow::bail!("invalid client spec '{spec}', expected id:api_key:perm[,perm...]");
    };
    if id.is_empty() || key.is_empty() {
        anyhow::bail!("invalid client spec '{spec}', id and api_key must be non-empty");
    }
    let permissions: Vec<String> = perms
        .split(',')
        .filter(|p| !p.is_empty())
        .map(ToString::to_string)
        .collect();
    Ok((id.to_string(), key.to_string(), permissions))
}

fn number_param(params: &Value, name: &str) -> f64 {
    params.get(name).and_then(Value::as_f64).unwrap_or(0.0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let auth = if args.allow_anonymous {
        warn!("anonymous access enabled; all callers get full permissions");
        Arc::new(AuthProvider::allow_anonymous())
    } else {
        Arc::new(AuthProvider::new())
    };
    for spec in &args.clients {
        let (id, key, permissions) =
            parse_client_spec(spec).context("parsing --client argument")?;
        auth.register_client(&id, &key, permissions);
    }

    let dispatch = Arc::new(DispatchServer::new(auth));
    dispatch.registry().register_fn("add", "read", |params, _| {
        Ok(json!({"result": number_param(&params, "a") + number_param(&params, "b")}))
    });
    dispatch
        .registry()
        .register_fn("multiply", "write", |params, _| {
            Ok(json!({"result": number_param(&params, "a") * number_param(&params, "b")}))
        });

    let store = Arc::new(ResourceStore::new());
    register_resource_methods(dispatch.registry(), &store);

    let config = NetworkConfig {
        host: args.host,
        port: args.port,
        request_timeout: Duration::from_secs(args.request_timeout_secs),
        ..NetworkConfig::default()
    };
    let mut module = NetworkModule::new(config, dispatch);
    let port = module.start().await?;
    info!(port, "meshlink server ready");

    module
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
}
