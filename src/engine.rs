// ABOUTME: The signaling-and-multiplexing engine: owns the registry, runs one frame loop per link
// ABOUTME: Both peer roles run the same engine; the asymmetry is which messages they send first

use crate::acceptor::PublicAcceptor;
use crate::codec::Message;
use crate::connection::{self, ReadError, Transport};
use crate::control_link::{ControlLink, Role};
use crate::handle::Handle;
use crate::registry::HandleRegistry;
use crate::stream::DataStream;
use bytes::Bytes;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, instrument, warn};

/// Addresses arrive off the wire as opaque bytes (see `crate::codec::Message`); converting
/// lossily here keeps a stray non-UTF-8 byte from ever being a fatal error this far up the
/// stack, matching the logical-miss handling the rest of the engine gives unknown handles.
fn address_to_string(bytes: Bytes) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}

/// One engine instance: exactly one `HandleRegistry`, an arbitrary number of `ControlLink`s
/// (in practice one at a time per the protocol's single-target-per-tunnel design, but nothing
/// here enforces that), and the `DataStream`s they carry.
///
/// Generic over `C`, the transport each `ControlLink` runs on (`TcpStream` for real use,
/// any in-memory duplex for tests). `DataStream`s accepted through a [`PublicAcceptor`] or
/// dialed on the connector side are always concrete TCP; see `crate::stream`.
pub struct TunnelEngine<C: Transport> {
    registry: Arc<HandleRegistry<C>>,
}

impl<C: Transport> Default for TunnelEngine<C> {
    fn default() -> Self {
        TunnelEngine {
            registry: Arc::new(HandleRegistry::new()),
        }
    }
}

impl<C: Transport> TunnelEngine<C> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn registry(&self) -> &Arc<HandleRegistry<C>> {
        &self.registry
    }

    /// Wrap an already-accepted transport as a `ControlLink` in the *Listener* role, register
    /// it, and start its frame loop.
    pub fn attach_incoming_control(self: &Arc<Self>, transport: C) -> Arc<ControlLink<C>> {
        let handle = self.registry.allocate();
        let link = Arc::new(ControlLink::new(transport, Role::Listener, handle));
        self.registry.insert_link(handle, Arc::clone(&link));
        self.spawn_frame_loop(Arc::clone(&link));
        link
    }

    /// Wrap an already-connected transport as a `ControlLink` in the *Connector* role, register
    /// it, and start its frame loop. [`TunnelEngine::<TcpStream>::dial_control`] layers the
    /// actual TCP connect on top of this for real use; tests use it directly with an in-memory
    /// transport to get two engines talking without a real socket.
    pub fn attach_outgoing_control(self: &Arc<Self>, transport: C) -> Arc<ControlLink<C>> {
        let handle = self.registry.allocate();
        let link = Arc::new(ControlLink::new(transport, Role::Connector, handle));
        self.registry.insert_link(handle, Arc::clone(&link));
        self.spawn_frame_loop(Arc::clone(&link));
        link
    }

    fn spawn_frame_loop(self: &Arc<Self>, link: Arc<ControlLink<C>>) {
        let engine = Arc::clone(self);
        let mut reader = link.take_reader();

        tokio::spawn(async move {
            loop {
                match connection::read_message(&mut reader).await {
                    Ok(msg) => {
                        if let Err(e) = engine.dispatch(&link, msg).await {
                            warn!("link {} dispatch failed, ending frame loop: {}", link.handle(), e);
                            break;
                        }
                    }
                    Err(ReadError::Eof) => {
                        debug!("link {} closed", link.handle());
                        break;
                    }
                    Err(e) => {
                        warn!("link {} frame error, ending frame loop: {}", link.handle(), e);
                        break;
                    }
                }
            }
            engine.registry.take_link(link.handle());
        });
    }

    #[instrument(skip(self, link, msg), fields(link = %link.handle()))]
    async fn dispatch(
        self: &Arc<Self>,
        link: &Arc<ControlLink<C>>,
        msg: Message,
    ) -> std::io::Result<()> {
        match msg {
            Message::ListenRequest {
                proxy_address,
                proxy_port,
            } => {
                self.handle_listen_request(link, address_to_string(proxy_address), proxy_port)
                    .await
            }

            Message::ListenResponse { tunnel_port, .. } => {
                link.set_public_port(tunnel_port);
                Ok(())
            }

            Message::TunnelConnectRequest {
                data_handle,
                proxy_address,
                proxy_port,
                ..
            } => {
                self.handle_connect_request(link, data_handle, address_to_string(proxy_address), proxy_port)
                    .await
            }

            Message::TunnelConnectResponse {
                data_handle,
                proxy_handle,
            } => {
                if let Some(stream) = self.registry.lookup_stream(Handle::from(data_handle)) {
                    stream.open(Handle::from(proxy_handle), Arc::clone(&self.registry));
                } else {
                    debug!("TunnelConnectResponse for unknown handle {}, dropping", data_handle);
                }
                Ok(())
            }

            Message::TunnelDataIndication { peer_handle, data } => {
                let local_h = Handle::from(peer_handle);
                if let Some(stream) = self.registry.lookup_stream(local_h) {
                    stream.write(&data, &self.registry).await;
                } else {
                    debug!("TunnelDataIndication for unknown handle {}, dropping", local_h);
                }
                Ok(())
            }

            Message::TunnelDisconnectRequest { peer_handle } => {
                let local_h = Handle::from(peer_handle);
                if let Some(stream) = self.registry.lookup_stream(local_h) {
                    let reply_to = stream.peer_handle();
                    stream.close(false, &self.registry).await;
                    if let Some(reply_to) = reply_to {
                        let reply = Message::TunnelDisconnectResponse {
                            peer_handle: reply_to.value(),
                        };
                        link.send(&reply).await?;
                    }
                } else {
                    debug!("TunnelDisconnectRequest for unknown handle {}, dropping", local_h);
                }
                Ok(())
            }

            Message::TunnelDisconnectResponse { peer_handle } => {
                let local_h = Handle::from(peer_handle);
                if let Some(stream) = self.registry.lookup_stream(local_h) {
                    stream.close(false, &self.registry).await;
                } else {
                    debug!("TunnelDisconnectResponse for unknown handle {}, dropping", local_h);
                }
                Ok(())
            }
        }
    }

    async fn handle_listen_request(
        self: &Arc<Self>,
        link: &Arc<ControlLink<C>>,
        proxy_address: String,
        proxy_port: u32,
    ) -> std::io::Result<()> {
        link.set_target(proxy_address.clone(), proxy_port);

        let acceptor = PublicAcceptor::bind_and_spawn(Arc::clone(self), link.handle(), Arc::clone(link))
            .await?;
        let chosen_port = acceptor.port();
        // The accept loop runs as its own spawned task and owns the listener; the handle
        // value itself carries nothing else worth keeping alive.

        let reply = Message::ListenResponse {
            proxy_address: Bytes::from(proxy_address.into_bytes()),
            proxy_port,
            tunnel_address: Bytes::from_static(b"0.0.0.0"),
            tunnel_port: chosen_port as u32,
        };
        link.send(&reply).await
    }

    /// Called by a [`PublicAcceptor`] for every client it accepts: create a `HalfOpen`
    /// `DataStream` and ask the peer to dial the target on its behalf.
    pub async fn on_incoming(self: &Arc<Self>, link: Arc<ControlLink<C>>, socket: TcpStream) {
        let handle = self.registry.allocate();
        let stream = DataStream::new_half_open(handle, Arc::clone(&link), socket);
        self.registry.insert_stream(handle, stream);

        let (proxy_address, proxy_port) = link.target().unwrap_or_default();
        let msg = Message::TunnelConnectRequest {
            data_handle: handle.value(),
            // Carried on the wire for compatibility; never consulted on receipt.
            client_address: Bytes::from_static(b"0.0.0.0"),
            proxy_address: Bytes::from(proxy_address.into_bytes()),
            proxy_port,
        };
        let _ = link.send(&msg).await;
    }

    async fn handle_connect_request(
        self: &Arc<Self>,
        link: &Arc<ControlLink<C>>,
        data_handle: u32,
        proxy_address: String,
        proxy_port: u32,
    ) -> std::io::Result<()> {
        let peer_h = Handle::from(data_handle);

        match TcpStream::connect((proxy_address.as_str(), proxy_port as u16)).await {
            Ok(socket) => {
                let local_handle = self.registry.allocate();
                let stream = DataStream::new_half_open(local_handle, Arc::clone(link), socket);
                self.registry.insert_stream(local_handle, Arc::clone(&stream));
                stream.open(peer_h, Arc::clone(&self.registry));

                let reply = Message::TunnelConnectResponse {
                    data_handle,
                    proxy_handle: local_handle.value(),
                };
                link.send(&reply).await
            }
            Err(e) => {
                warn!("dial failed for TunnelConnectRequest to {}:{}: {}", proxy_address, proxy_port, e);
                let reply = Message::TunnelDisconnectResponse {
                    peer_handle: data_handle,
                };
                link.send(&reply).await
            }
        }
    }
}

impl TunnelEngine<TcpStream> {
    /// Dial `address`, wrap the resulting socket as a *Connector*-role `ControlLink`, register
    /// it, and start its frame loop.
    pub async fn dial_control(self: &Arc<Self>, address: &str) -> crate::Result<Arc<ControlLink<TcpStream>>> {
        let transport = TcpStream::connect(address).await?;
        Ok(self.attach_outgoing_control(transport))
    }

    /// Connector-side entry point: record the target on `link` and emit the initial
    /// `ListenRequest`. Completion is asynchronous, the caller observes success via the
    /// subsequent `ListenResponse` (reflected in [`ControlLink::public_port`]).
    pub async fn start_tunnel_for(
        &self,
        link: &Arc<ControlLink<TcpStream>>,
        target_host: String,
        target_port: u32,
    ) -> crate::Result<()> {
        link.set_target(target_host.clone(), target_port);
        let msg = Message::ListenRequest {
            proxy_address: Bytes::from(target_host.into_bytes()),
            proxy_port: target_port,
        };
        link.send(&msg).await?;
        Ok(())
    }
}
