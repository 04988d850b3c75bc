//! RBLN NPU Operator
//!
//! Runs the RBLNClusterPolicy and RBLNDriver controllers side by side,
//! together with the health and metrics endpoints the operator Deployment
//! probes.

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use kube::Client;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rbln_npu_operator::components::ContainerRuntime;
use rbln_npu_operator::controlplane::cluster_info;
use rbln_npu_operator::controlplane::cluster_policy_controller::{self, PolicyReconciler};
use rbln_npu_operator::controlplane::driver_controller::{self, DriverReconciler};
use rbln_npu_operator::crd::crd_manifests;
use rbln_npu_operator::{ClusterStoreRef, ControllerConfig, KubeStore, ReconcileMetrics, SingletonGuard};

// =============================================================================
// CLI Arguments
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

/// RBLN NPU Operator - deploys the Rebellions NPU stack onto Kubernetes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace used when the RBLNClusterPolicy does not set one
    #[arg(long, env = "OPERATOR_NAMESPACE")]
    operator_namespace: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "pretty")]
    log_format: LogFormat,

    /// Health server port
    #[arg(long, env = "HEALTH_PORT", default_value = "8081")]
    health_port: u16,

    /// Metrics server port
    #[arg(long, env = "METRICS_PORT", default_value = "8080")]
    metrics_port: u16,

    /// Container runtime override (containerd, crio, docker); detected from nodes when unset
    #[arg(long, env = "CONTAINER_RUNTIME")]
    container_runtime: Option<ContainerRuntime>,

    /// Requeue interval after a successful reconcile, in seconds
    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value = "300")]
    reconcile_interval_secs: u64,

    /// Print the CRD manifests and exit
    #[arg(long)]
    print_crds: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_crds {
        print!("{}", crd_manifests()?);
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting RBLN NPU Operator");
    info!("  Version: {}", rbln_npu_operator::VERSION);
    info!("  Operator namespace: {}", args.operator_namespace.as_deref().unwrap_or("<unset>"));
    info!("  Reconcile interval: {}s", args.reconcile_interval_secs);

    let ready = Arc::new(AtomicBool::new(false));

    let health_addr = SocketAddr::from(([0, 0, 0, 0], args.health_port));
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_ready).await {
            error!("Health server error: {:#}", e);
        }
    });

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], args.metrics_port));
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let mut cluster_info = cluster_info::discover(&client).await;
    if let Some(runtime) = args.container_runtime {
        info!(runtime = %runtime, "Using container runtime from configuration");
        cluster_info.container_runtime = Some(runtime);
    }
    info!(
        openshift = cluster_info.openshift_version.as_deref().unwrap_or("none"),
        runtime = %cluster_info.container_runtime.unwrap_or_default(),
        "Cluster info discovered"
    );

    let config = ControllerConfig {
        operator_namespace: args.operator_namespace.filter(|ns| !ns.is_empty()),
        resync: Duration::from_secs(args.reconcile_interval_secs),
        cluster_info,
    };
    let metrics = ReconcileMetrics::register(prometheus::default_registry())?;
    let store: ClusterStoreRef = Arc::new(KubeStore::new(client.clone()));
    let singleton = Arc::new(SingletonGuard::new());

    let policy_ctx = Arc::new(cluster_policy_controller::Context::new(
        client.clone(),
        PolicyReconciler::new(store.clone(), singleton.clone(), config.clone()),
        metrics.clone(),
    ));
    let driver_ctx = Arc::new(driver_controller::Context::new(
        DriverReconciler::new(store, singleton, config),
        metrics,
    ));

    ready.store(true, Ordering::SeqCst);
    tokio::join!(
        cluster_policy_controller::run(client.clone(), policy_ctx),
        driver_controller::run(client, driver_ctx),
    );

    info!("Operator shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
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
        .add_directive("hyper=warn".parse()?)
        .add_directive("kube=info".parse()?);

    match args.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init(),
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: SocketAddr, ready: Arc<AtomicBool>) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" if ready => text_response(StatusCode::OK, "ok"),
                        "/readyz" => text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .with_context(|| format!("failed to bind health server to {}", addr))?
        .serve(make_svc)
        .await
        .context("health server failed")?;
    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    use hyper::header::CONTENT_TYPE;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    match encoder.encode(&prometheus::gather(), &mut buffer) {
                        Ok(()) => {
                            let mut response = Response::new(Body::from(buffer));
                            if let Ok(value) = encoder.format_type().parse() {
                                response.headers_mut().insert(CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => {
                            error!("Failed to encode metrics: {}", e);
                            text_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed")
                        }
                    }
                }
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .with_context(|| format!("failed to bind metrics server to {}", addr))?
        .serve(make_svc)
        .await
        .context("metrics server failed")?;
    Ok(())
}
