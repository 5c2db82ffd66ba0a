//! tierwarm
//!
//! Runs the tiered cache service standalone: background sweep, metrics and
//! warming loops, plus health and Prometheus endpoints.
//!
//! ```text
//! tierwarm --redis-endpoints redis://10.0.0.1:6379,redis://10.0.0.2:6379 \
//!          --metrics-addr 0.0.0.0:9090 --health-addr 0.0.0.0:8081
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use hyper::StatusCode;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tierwarm::error::{Error, Result};
use tierwarm::exporter::MetricsExporter;
use tierwarm::health::HealthResponse;
use tierwarm::warming::StaticDataSource;
use tierwarm::{CacheConfig, CacheService};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tierwarm - tiered cache with predictive warming
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; flags below override it
    #[arg(long, env = "TIERWARM_CONFIG")]
    config: Option<PathBuf>,

    /// Comma-separated distributed tier endpoints (empty = memory-only)
    #[arg(long, env = "REDIS_ENDPOINTS", value_delimiter = ',')]
    redis_endpoints: Vec<String>,

    /// Distributed tier password
    #[arg(long, env = "REDIS_PASSWORD", hide_env_values = true)]
    redis_password: Option<String>,

    /// Memory tier capacity in entries
    #[arg(long, env = "MEMORY_CAPACITY")]
    memory_capacity: Option<usize>,

    /// Default TTL in seconds
    #[arg(long, env = "DEFAULT_TTL_SECONDS")]
    default_ttl_seconds: Option<u64>,

    /// Disable cache warming
    #[arg(long, env = "DISABLE_WARMING")]
    disable_warming: bool,

    /// Warming tick interval in seconds
    #[arg(long, env = "WARMING_INTERVAL_SECONDS")]
    warming_interval_seconds: Option<u64>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
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

impl Args {
    /// File (or default) configuration with flag overrides applied
    fn cache_config(&self) -> Result<CacheConfig> {
        let mut config = match &self.config {
            Some(path) => CacheConfig::from_yaml_file(path)?,
            None => CacheConfig::default(),
        };

        if !self.redis_endpoints.is_empty() {
            config.distributed.endpoints = self.redis_endpoints.clone();
        }
        if self.redis_password.is_some() {
            config.distributed.credential = self.redis_password.clone();
        }
        if let Some(capacity) = self.memory_capacity {
            config.memory.capacity = capacity;
        }
        if let Some(ttl) = self.default_ttl_seconds {
            config.default_ttl_secs = ttl;
        }
        if self.disable_warming {
            config.warming.enabled = false;
        }
        if let Some(interval) = self.warming_interval_seconds {
            config.warming.interval_secs = interval;
        }

        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = args.cache_config()?;
    info!("Starting tierwarm");
    info!("  Endpoints: {:?}", config.distributed.endpoints);
    info!("  Memory capacity: {}", config.memory.capacity);
    info!("  Default TTL: {}s", config.default_ttl_secs);
    info!("  Warming enabled: {}", config.warming.enabled);

    let metrics_enabled = config.metrics_enabled;
    let source = Arc::new(StaticDataSource::new());
    let service = Arc::new(CacheService::connect(config, source).await?);
    service.start()?;

    let shutdown = service.shutdown_token();

    let health_service = service.clone();
    let health_addr = args.health_addr.clone();
    let health_shutdown = shutdown.clone();
    let health_server = tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_service, health_shutdown).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_server = if metrics_enabled {
        let metrics_service = service.clone();
        let metrics_addr = args.metrics_addr.clone();
        let metrics_shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&metrics_addr, metrics_service, metrics_shutdown).await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    service.shutdown().await;
    let _ = health_server.await;
    if let Some(server) = metrics_server {
        let _ = server.await;
    }

    info!("tierwarm shutdown complete");
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
    for directive in ["hyper=warn", "redis=info"] {
        if let Ok(directive) = directive.parse::<Directive>() {
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
// HTTP Servers
// =============================================================================

mod responses {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::{Response, StatusCode};

    pub type HttpResponse = Response<Full<Bytes>>;

    pub fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> HttpResponse {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        if let Ok(value) = HeaderValue::from_str(content_type) {
            response.headers_mut().insert(CONTENT_TYPE, value);
        }
        response
    }

    pub fn not_found() -> HttpResponse {
        respond(StatusCode::NOT_FOUND, "text/plain", "not found")
    }
}

/// Accept connections until cancelled, serving each with `handler`
async fn serve<F, Fut>(addr: &str, name: &str, shutdown: CancellationToken, handler: F) -> Result<()>
where
    F: Fn(hyper::Request<hyper::body::Incoming>) -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = std::result::Result<responses::HttpResponse, std::convert::Infallible>>
        + Send
        + 'static,
{
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid {} server address: {}", name, e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {} server: {}", name, e)))?;

    info!("{} server listening on {}", name, addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted
                .map_err(|e| Error::Internal(format!("{} server accept error: {}", name, e)))?,
        };

        let io = TokioIo::new(stream);
        let handler = handler.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handler))
                .await
            {
                error!("{} server connection error: {}", name, e);
            }
        });
    }

    info!("{} server stopped", name);
    Ok(())
}

fn json_report(report: &HealthResponse, ok: bool) -> responses::HttpResponse {
    let status = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    match serde_json::to_vec(report) {
        Ok(body) => responses::respond(status, "application/json", body),
        Err(e) => responses::respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            format!("health encoding failed: {e}"),
        ),
    }
}

async fn run_health_server(addr: &str, service: Arc<CacheService>, shutdown: CancellationToken) -> Result<()> {
    let handler = move |req: hyper::Request<hyper::body::Incoming>| {
        let service = service.clone();
        async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" => {
                    let report = service.health().liveness_report();
                    json_report(&report, report.status.is_operational())
                }
                "/readyz" => {
                    let report = service.health_report();
                    json_report(&report, service.health().is_ready() && report.status.is_operational())
                }
                _ => responses::not_found(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }
    };

    serve(addr, "Health", shutdown, handler).await
}

async fn run_metrics_server(addr: &str, service: Arc<CacheService>, shutdown: CancellationToken) -> Result<()> {
    let exporter = Arc::new(MetricsExporter::new()?);

    let handler = move |req: hyper::Request<hyper::body::Incoming>| {
        let service = service.clone();
        let exporter = exporter.clone();
        async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    exporter.update(&service.observability());
                    match exporter.render() {
                        Ok(text) => responses::respond(StatusCode::OK, &exporter.content_type(), text),
                        Err(e) => responses::respond(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "text/plain",
                            e.to_string(),
                        ),
                    }
                }
                "/snapshot" => match serde_json::to_vec(&service.observability()) {
                    Ok(body) => responses::respond(StatusCode::OK, "application/json", body),
                    Err(e) => responses::respond(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "text/plain",
                        e.to_string(),
                    ),
                },
                _ => responses::not_found(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }
    };

    serve(addr, "Metrics", shutdown, handler).await
}
