//! Fleet Core
//!
//! Control plane process: REST API, bootstrap endpoint, health and metrics
//! servers. Runs against Consul, Vault and the Packet API, or entirely in
//! memory with `--standalone`.

use clap::Parser;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fleet_core::config::parse_account;
use fleet_core::{
    ApiServer, ApiServerConfig, BackendMode, ControlPlaneConfig, ControlPlaneMetrics, Error,
    Orchestrator, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Fleet Core - control plane for bare-metal instances and device bootstrap
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Bootstrap endpoint bind address
    #[arg(long, env = "BOOTSTRAP_BIND_ADDRESS", default_value = "0.0.0.0:8443")]
    bootstrap_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Address devices use to reach the control plane
    #[arg(long, env = "PUBLIC_ADDRESS", default_value = "127.0.0.1:8090")]
    public_address: String,

    /// Consul HTTP address
    #[arg(long, env = "CONSUL_ADDRESS", default_value = "http://127.0.0.1:8500")]
    consul_address: String,

    /// Consul ACL token
    #[arg(long, env = "CONSUL_TOKEN")]
    consul_token: Option<String>,

    /// Consul datacenter
    #[arg(long, env = "CONSUL_DATACENTER")]
    consul_datacenter: Option<String>,

    /// Gossip encryption key handed to bootstrapped devices
    #[arg(long, env = "CONSUL_ENCRYPT")]
    consul_encrypt: Option<String>,

    /// Vault HTTP address
    #[arg(long, env = "VAULT_ADDR", default_value = "http://127.0.0.1:8200")]
    vault_addr: String,

    /// Vault token
    #[arg(long, env = "VAULT_TOKEN", default_value = "", hide_env_values = true)]
    vault_token: String,

    /// Packet API base URL
    #[arg(long, env = "PACKET_API_URL", default_value = "https://api.packet.net")]
    packet_api_url: String,

    /// First-boot script sent to new devices
    #[arg(long, env = "USER_DATA_PATH")]
    user_data_path: Option<PathBuf>,

    /// Lifetime of bootstrap tokens in seconds
    #[arg(long, env = "TOKEN_TTL", default_value = "300")]
    token_ttl_secs: u64,

    /// Require the caller identity to match the stored owner
    #[arg(long, env = "ENFORCE_OWNER_MATCH")]
    enforce_owner_match: bool,

    /// Per-request timeout in seconds
    #[arg(long, env = "REQUEST_TIMEOUT", default_value = "30")]
    request_timeout_secs: u64,

    /// Simulated provider account as KEY=PROJECT (standalone mode)
    #[arg(long = "sim-account", env = "SIM_ACCOUNTS", value_delimiter = ',')]
    sim_accounts: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run in standalone mode (in-memory store, secrets and provider)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,
}

impl Args {
    fn to_config(&self) -> Result<ControlPlaneConfig> {
        let mut config = ControlPlaneConfig::default();

        config.api = ApiServerConfig {
            rest_addr: parse_addr(&self.api_addr, "REST API")?,
            request_timeout_secs: self.request_timeout_secs,
            ..Default::default()
        };

        config.bootstrap.bind_addr = parse_addr(&self.bootstrap_addr, "bootstrap")?;
        config.bootstrap.token_ttl = Duration::from_secs(self.token_ttl_secs);
        if let Some(key) = &self.consul_encrypt {
            config
                .bootstrap
                .shared_payload
                .insert("consul_encrypt".to_string(), key.clone());
        }

        config.orchestrator.public_address = self.public_address.clone();
        config.orchestrator.guard.enforce_owner_match = self.enforce_owner_match;

        config.backend.mode = if self.standalone {
            let accounts = self
                .sim_accounts
                .iter()
                .map(|account| parse_account(account))
                .collect::<Result<Vec<_>>>()?;
            BackendMode::Standalone { accounts }
        } else {
            BackendMode::External
        };
        config.backend.consul.address = self.consul_address.clone();
        config.backend.consul.token = self.consul_token.clone();
        config.backend.consul.datacenter = self.consul_datacenter.clone();
        config.backend.vault.address = self.vault_addr.clone();
        config.backend.vault.token = self.vault_token.clone();
        config.backend.packet.api_url = self.packet_api_url.clone();
        config.backend.packet.user_data_path = self.user_data_path.clone();

        Ok(config)
    }
}

fn parse_addr(value: &str, name: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} address {:?}: {}", name, value, e)))
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting Fleet Core control plane");
    info!("  Version: {}", fleet_core::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  Bootstrap: {}", args.bootstrap_addr);
    info!("  Standalone mode: {}", args.standalone);

    let config = args.to_config()?;
    if args.standalone && args.sim_accounts.is_empty() {
        warn!("Standalone mode without --sim-account: every credential will be rejected");
    }
    if config.orchestrator.guard.enforce_owner_match {
        info!("Owner match enforced on instance operations");
    }

    let plane = config.assemble()?;
    info!("Control plane assembled");

    // Start health server
    let health_addr = args.health_addr.clone();
    let orchestrator = plane.orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, orchestrator).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics = plane.metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    let api_server = ApiServer::new(config.api.clone(), plane.orchestrator, plane.bootstrap);

    let shutdown = api_server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            let _ = shutdown.send(());
        }
    });

    api_server.run().await?;

    info!("Control plane shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=info", "tower=warn", "axum=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, orchestrator: Arc<Orchestrator>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let orchestrator = orchestrator.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let orchestrator = orchestrator.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        // Ready once the key-value store answers
                        "/readyz" => match orchestrator.health_check().await {
                            Ok(true) => text_response(StatusCode::OK, "ok"),
                            _ => text_response(StatusCode::SERVICE_UNAVAILABLE, "store unavailable"),
                        },
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let addr = parse_addr(addr, "health server")?;

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Configuration(format!("Failed to bind health server: {}", e)))?
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: ControlPlaneMetrics) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.render() {
                            Ok((content_type, buffer)) => {
                                let mut response = Response::new(Body::from(buffer));
                                if let Ok(value) = HeaderValue::from_str(&content_type) {
                                    response.headers_mut().insert(CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => {
                                error!("Failed to render metrics: {}", e);
                                text_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
                            }
                        },
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let addr = parse_addr(addr, "metrics server")?;

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Configuration(format!("Failed to bind metrics server: {}", e)))?
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_args_to_standalone_config() {
        let args = Args::parse_from([
            "fleet-core",
            "--standalone",
            "--sim-account",
            "key-a=proj-a",
            "--consul-encrypt",
            "gossip-key",
            "--token-ttl-secs",
            "60",
        ]);
        let config = args.to_config().unwrap();

        assert_eq!(
            config.backend.mode,
            BackendMode::Standalone {
                accounts: vec![("key-a".to_string(), "proj-a".to_string())]
            }
        );
        assert_eq!(config.bootstrap.token_ttl, Duration::from_secs(60));
        assert_eq!(
            config.bootstrap.shared_payload,
            BTreeMap::from([("consul_encrypt".to_string(), "gossip-key".to_string())])
        );
    }

    #[test]
    fn test_invalid_address_rejected() {
        let args = Args::parse_from(["fleet-core", "--api-addr", "not-an-address"]);
        assert!(args.to_config().is_err());
    }
}
