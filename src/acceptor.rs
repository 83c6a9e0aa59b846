// ABOUTME: The listener side's ephemeral public TCP socket
// ABOUTME: Accepts client connections and hands each to the engine as a new HalfOpen DataStream

use crate::connection::Transport;
use crate::control_link::ControlLink;
use crate::engine::TunnelEngine;
use crate::handle::Handle;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, warn};

/// Binds an ephemeral TCP port and hands off every accepted connection to the owning engine.
/// Instantiated once per `ControlLink` after that link processes a `ListenRequest`; its
/// lifetime is governed entirely by the link, there is no explicit shutdown, only accept
/// errors, which end the loop silently.
///
/// Accepted client sockets are always concrete TCP regardless of `C`, the owning engine's
/// `ControlLink` transport. Only the signaling channel is generic, per the engine's
/// testability requirements.
pub struct PublicAcceptor {
    local_addr: std::net::SocketAddr,
}

impl PublicAcceptor {
    /// Bind `0.0.0.0:0`, spawn the accept loop, and return the port that was chosen so the
    /// caller can report it in a `ListenResponse`.
    pub async fn bind_and_spawn<C: Transport>(
        engine: Arc<TunnelEngine<C>>,
        link_handle: Handle,
        link: Arc<ControlLink<C>>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let local_addr = listener.local_addr()?;

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer_addr)) => {
                        debug!("link {} accepted public client {}", link_handle, peer_addr);
                        engine.on_incoming(Arc::clone(&link), socket).await;
                    }
                    Err(e) => {
                        warn!("link {} public acceptor terminating: {}", link_handle, e);
                        break;
                    }
                }
            }
        });

        Ok(PublicAcceptor { local_addr })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }
}
