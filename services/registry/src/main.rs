//! `registry-server`: one origin node of a registry cluster.

use std::net::SocketAddr;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::WrapErr as _;
use origin::{Cluster, OriginNode, RemoteOrigin, Replica};
use registry::RegistryBuilder;
use registry::config::ServerConfig;
use tracing_subscriber::EnvFilter;

/// Serve the registry API and the origin peer protocol.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file. Without one, a single in-memory node is served.
    #[clap(short = 'c', long = "config")]
    config: Option<Utf8PathBuf>,

    /// Override the listen address from the configuration.
    #[clap(short, long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON lines.
    #[clap(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let subscriber = tracing_subscriber::fmt().with_env_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {error}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)
            .await
            .wrap_err_with(|| format!("loading {path}"))?,
        None => ServerConfig::standalone(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let storage = config
        .node
        .storage
        .clone()
        .build()
        .wrap_err("building node storage")?;
    let local = OriginNode::new(config.node.id.as_str(), &storage);

    let mut replicas: Vec<Arc<dyn Replica>> = vec![Arc::new(local.clone())];
    for peer in &config.peers {
        tracing::info!(peer = %peer.id, url = %peer.url, "Adding peer origin");
        replicas.push(Arc::new(RemoteOrigin::http(peer.id.as_str(), peer.url.as_str())));
    }

    let cluster = Cluster::new(replicas, &config.cluster).wrap_err("configuring cluster")?;
    let plan = cluster.plan();
    tracing::info!(
        node = %config.node.id,
        nodes = cluster.nodes().len(),
        replicas = plan.replicas,
        quorum = plan.quorum,
        "Cluster configured"
    );
    let maintenance = cluster.spawn_maintenance();

    let app = RegistryBuilder::new(cluster)
        .coordinator(config.node.id.as_str())
        .body_limit(config.max_upload_bytes)
        .upload_timeout(config.upload_timeout())
        .build()
        .merge(origin::peer::router(local));

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .wrap_err_with(|| format!("binding {}", config.listen))?;
    tracing::info!("Registry listening on http://{}", config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    maintenance.abort();
    Ok(())
}
