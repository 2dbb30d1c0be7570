use tokio::sync::watch;

use tollgate_core::ProxyConfig;
use tollgate_observe::StderrEventSink;
use tollgate_proxy::ProxyServer;
use tollgate_store::MemoryReviewStore;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = ProxyConfig::from_env()
        .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidInput, error.to_string()))?;

    let store = MemoryReviewStore::new();
    let server = ProxyServer::new(config.clone(), store, StderrEventSink)?;

    eprintln!(
        "tollgate listening on {}:{}",
        config.listen_addr, config.listen_port
    );
    eprintln!(
        "install the root certificate from {} into the browser trust store",
        config.ca_cert_path.display()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("shutdown signal received, draining connections");
            let _ = shutdown_tx.send(true);
        }
    });

    let listener = server.bind_listener().await?;
    server.run_with_listener(listener, shutdown_rx).await
}
