//! In-process TCP relay used for tunnels that stay on the control node

use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Listen on `listen_port` and forward every connection to `target_port`.
///
/// The listener is bound before this returns; the relay runs until the
/// returned handle is aborted.
pub async fn spawn_relay(listen_port: u16, target_port: u16) -> std::io::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, listen_port))).await?;
    debug!("Relay listening on {} forwarding to {}", listen_port, target_port);

    Ok(tokio::spawn(async move {
        loop {
            let (mut inbound, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Relay on port {} stopped accepting: {}", listen_port, e);
                    return;
                }
            };

            tokio::spawn(async move {
                let target = SocketAddr::from((Ipv4Addr::LOCALHOST, target_port));
                match TcpStream::connect(target).await {
                    Ok(mut outbound) => {
                        if let Err(e) = copy_bidirectional(&mut inbound, &mut outbound).await {
                            debug!("Relay connection from {} closed: {}", peer, e);
                        }
                    }
                    Err(e) => warn!("Relay could not reach port {}: {}", target_port, e),
                }
            });
        }
    }))
}
