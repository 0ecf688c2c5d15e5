//! Registry backed by a three-origin in-memory cluster
//!
//! Run with: cargo run -p registry --example basic_server

use std::sync::Arc;

use origin::{Cluster, ClusterConfig, OriginNode, Replica};
use registry::RegistryBuilder;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let nodes: Vec<OriginNode> = ["origin-a", "origin-b", "origin-c"]
        .into_iter()
        .map(OriginNode::memory)
        .collect();
    let replicas: Vec<Arc<dyn Replica>> = nodes
        .iter()
        .map(|node| Arc::new(node.clone()) as Arc<dyn Replica>)
        .collect();
    let cluster = Cluster::new(replicas, &ClusterConfig::default())?;
    let _maintenance = cluster.spawn_maintenance();

    let app = RegistryBuilder::new(cluster).build();

    let addr = "127.0.0.1:5000";
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Registry listening on http://{}", addr);
    tracing::info!("Try: curl http://{}/v2/_catalog", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
