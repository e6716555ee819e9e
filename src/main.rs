//! Node IPAM controller
//!
//! Watches cluster nodes and keeps their pod-network and service-endpoint
//! annotations consistent with the configured address space.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use k8s_openapi::api::core::v1::Node;
use kube::api::Api;
use kube::runtime::reflector;
use kube::Client;
use parking_lot::Mutex;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use podnet_operator::adapters::KubeNodeStore;
use podnet_operator::error::{Error, Result};
use podnet_operator::{ClusterState, NetConfig, NodeController};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Node IPAM controller - pod address range and service endpoint management
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the network configuration file (YAML)
    #[arg(long, env = "PODNET_CONFIG", default_value = "/etc/podnet/config.yaml")]
    config: PathBuf,

    /// Override for the pod address chunk size
    #[arg(long, env = "POD_IP_POOL_CHUNK_SIZE")]
    chunk_size: Option<u64>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting node IPAM controller");

    let mut config = NetConfig::from_file(&args.config)?;
    if let Some(chunk) = args.chunk_size {
        config.pod_ip_pool_chunk_size = chunk;
        config.validate()?;
    }
    info!("  Pod subnets: {:?}", config.pod_subnets);
    info!("  Pod subnets (v6): {:?}", config.pod_subnets_v6);
    info!("  Service subnets: {:?}", config.service_subnets);
    info!("  Chunk size: {}", config.pod_ip_pool_chunk_size);

    let client = Client::try_default().await.map_err(|e| {
        error!("Failed to create Kubernetes client: {}", e);
        Error::Internal(format!("Kubernetes client creation failed: {}", e))
    })?;

    info!("Connected to Kubernetes cluster");

    let state = Arc::new(Mutex::new(ClusterState::new(&config)));

    let api: Api<Node> = Api::all(client.clone());
    let (reader, writer) = reflector::store::<Node>();
    let store = Arc::new(KubeNodeStore::new(api.clone(), reader));

    let (controller, resync_rx) = NodeController::new(state, store);

    // Chunk-growth persist requests are handled off the event path.
    let resync_controller = controller.clone();
    tokio::spawn(async move {
        resync_controller.run_resync(resync_rx).await;
    });

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    controller.run(api, writer).await;

    info!("Controller shutdown complete");
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

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("kube=info".parse().unwrap())
        .add_directive("tower=warn".parse().unwrap());

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

async fn run_health_server(addr: &str) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn health_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/healthz" | "/livez" | "/readyz" => Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("ok")))
                .unwrap(),
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("not found")))
                .unwrap(),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid health server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind health server: {}", e)))?;

    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Health server accept error: {}", e)))?;

        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(health_handler))
                .await
            {
                tracing::error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::{Encoder, TextEncoder};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    // Touch the lazily-registered metrics so they appear before first use.
    podnet_operator::metrics::NODE_RECONCILES.get();
    podnet_operator::metrics::PERSIST_CONFLICTS.get();
    podnet_operator::metrics::PERSIST_FAILURES.get();
    podnet_operator::metrics::POD_FREE_V4.get();
    podnet_operator::metrics::POD_FREE_V6.get();
    podnet_operator::metrics::SERVICE_FREE_V4.get();
    podnet_operator::metrics::SERVICE_FREE_V6.get();

    async fn metrics_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => {
                let encoder = TextEncoder::new();
                let metric_families = prometheus::gather();
                let mut buffer = Vec::new();
                encoder.encode(&metric_families, &mut buffer).unwrap();

                Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", encoder.format_type())
                    .body(Full::new(Bytes::from(buffer)))
                    .unwrap()
            }
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("not found")))
                .unwrap(),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid metrics server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?;

        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
