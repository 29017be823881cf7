use std::future::Future;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::connection_limiter::ConnectionLimiter;
use crate::registry::Registry;
use crate::session;

/// Accept chat connections on `listener` until `shutdown` resolves.
///
/// Accept errors are fatal. On shutdown every session is told to stop and
/// given `config.shutdown_grace()` to tear down before it is aborted.
pub async fn serve(
    listener: TcpListener,
    config: Config,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let settings = config.session_settings()?;
    let broadcaster = Broadcaster::new(Registry::new());
    let limiter = ConnectionLimiter::new(config.max_connections, config.max_per_ip);
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut sessions = JoinSet::new();

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;

                // Check connection limits before the handshake
                let client_ip = addr.ip();
                if let Err(e) = limiter.try_connect(client_ip).await {
                    warn!("Connection rejected from {}: {}", addr, e);
                    drop(stream);
                    continue;
                }

                let broadcaster = broadcaster.clone();
                let limiter = limiter.clone();
                let stop_rx = stop_rx.clone();
                sessions.spawn(async move {
                    session::handle_connection(stream, addr, broadcaster, settings, stop_rx).await;
                    limiter.disconnect(client_ip).await;
                });
            }
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = finished {
                    error!("Connection task failed: {}", e);
                }
            }
        }
    }

    drop(listener);
    let (live, _) = limiter.stats().await;
    info!("Shutting down, {} connections in flight", live);
    let _ = stop_tx.send(true);

    let drained = tokio::time::timeout(config.shutdown_grace(), async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "Grace period elapsed, aborting {} connections",
            sessions.len()
        );
        sessions.shutdown().await;
    }

    Ok(())
}
