//! TCP entry point: loads config, best-effort relaxes `ping_group_range` so
//! the sandboxed network helper can open ICMP sockets, and accepts client
//! connections.

use std::sync::Arc;

use tracing::info;

mod dispatch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shellbridge_server=info".into()),
        )
        .init();

    let config_path = std::env::var("SHELLBRIDGE_CONFIG").ok();
    let config = shellbridge_core::config::BridgeConfig::load(config_path.as_deref())
        .unwrap_or_else(|e| {
            tracing::warn!("config load failed ({e}), using defaults");
            shellbridge_core::config::BridgeConfig::default()
        });

    relax_ping_group_range();

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("shellbridge listening on {addr}");

    let config = Arc::new(config);

    loop {
        let (socket, peer) = listener.accept().await?;
        let config = config.clone();
        tokio::spawn(async move {
            info!("connection from {peer}");
            if let Err(e) = dispatch::handle_connection(socket, config).await {
                tracing::warn!("connection from {peer} ended: {e}");
            }
        });
    }
}

/// Widen the range of GIDs allowed to open ICMP ping sockets, needed by the
/// sandboxed network helper. Best-effort: a read-only `/proc` (e.g. running
/// outside the intended host setup) is not fatal.
fn relax_ping_group_range() {
    if let Err(e) = std::fs::write("/proc/sys/net/ipv4/ping_group_range", "0 65535") {
        tracing::warn!("could not widen ping_group_range: {e}");
    }
}
