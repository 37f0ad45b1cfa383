use anyhow::{Context, Result};
use interceptor::config::{Config, LogFormat};
use interceptor::mitm::{
    load_pem_certificates, CertificateAuthority, MitmInterceptor, RelayOptions, UpstreamTlsConfig,
};
use interceptor::{ProxyServer, RequestSink, RequestStore, UpstreamClient};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Optional env file given as the only argument
    if let Some(path) = std::env::args().nth(1) {
        dotenv::from_path(&path).with_context(|| format!("Failed to load config file {}", path))?;
    }

    let config = Config::from_env()?;
    init_tracing(config.log_format);

    info!("Starting interceptor {}", interceptor::VERSION);

    let ca = CertificateAuthority::load_or_generate(&config.ca_cert_path, &config.ca_key_path)
        .context("Failed to initialize certificate authority")?
        .with_cache(config.cert_cache_size, config.cert_cache_ttl());
    let ca = Arc::new(ca);
    info!(cert = %config.ca_cert_path.display(), "Certificate authority ready");

    let store = RequestStore::new(&config.database_path)
        .await
        .context("Failed to open request database")?;
    let sink: Arc<dyn RequestSink> = Arc::new(store);

    let extra_roots = match &config.upstream_ca_path {
        Some(path) => load_pem_certificates(path)
            .with_context(|| format!("Failed to load UPSTREAM_CA_PATH {}", path.display()))?,
        None => Vec::new(),
    };

    let interceptor = MitmInterceptor::new(
        ca,
        Arc::new(UpstreamTlsConfig::with_extra_roots(&extra_roots)),
        Arc::clone(&sink),
    )
    .with_relay_options(RelayOptions {
        idle_timeout: config.tunnel_idle_timeout(),
        max_capture_bytes: config.max_capture_bytes,
    })
    .with_connect_timeout(config.upstream_timeout())
    .with_tunnel_limit(config.max_tunnels);

    let upstream = UpstreamClient::new(config.upstream_timeout(), &extra_roots)
        .context("Failed to build upstream HTTP client")?;

    let server = Arc::new(ProxyServer::new(
        interceptor,
        upstream,
        sink,
        config.max_request_body_size,
    ));

    let bind_addr = config.bind_addr()?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;

    tokio::select! {
        result = server.serve(listener) => {
            result.context("Proxy server stopped")?;
        }
        _ = shutdown_signal() => {
            info!("Shutting down");
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
