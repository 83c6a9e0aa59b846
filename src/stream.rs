// ABOUTME: One proxied application TCP connection, multiplexed over a ControlLink
// ABOUTME: Owns a read pump task that turns inbound bytes into outbound TunnelDataIndication frames

use crate::codec::Message;
use crate::connection::Transport;
use crate::control_link::ControlLink;
use crate::handle::Handle;
use crate::registry::HandleRegistry;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, warn};

const READ_BUFFER_SIZE: usize = 4 * 1024;

/// The three states a [`DataStream`] passes through, monotonically: *HalfOpen* while waiting
/// for the peer's handle, *Open* once installed and pumping, *Closed* once torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    HalfOpen,
    Open,
    Closed,
}

/// One proxied application connection, identified locally by `local_handle` and, once known,
/// by the peer engine's own handle for the same logical stream, `peer_handle`. Holds a
/// non-owning back-reference to the `ControlLink` that carries its multiplexed frames.
///
/// The application transport itself is always a concrete `TcpStream`. Only the `ControlLink`
/// this stream reports through is generic, to allow in-memory loopback control channels in
/// tests (see `crate::connection::Transport`).
pub struct DataStream<C: Transport> {
    local_handle: Handle,
    peer_handle: Mutex<Option<Handle>>,
    state: Mutex<State>,
    owning_link: Arc<ControlLink<C>>,
    writer: AsyncMutex<WriteHalf<TcpStream>>,
    reader: Mutex<Option<ReadHalf<TcpStream>>>,
    closed: Notify,
}

impl<C: Transport> DataStream<C> {
    /// Construct a stream in *HalfOpen* state. `transport` is split immediately so the write
    /// half is available for inbound `DataIndication` writes even before the peer handle (and
    /// therefore the read pump) exists.
    pub fn new_half_open(
        local_handle: Handle,
        owning_link: Arc<ControlLink<C>>,
        transport: TcpStream,
    ) -> Arc<Self> {
        let (rd, wr) = tokio::io::split(transport);
        Arc::new(DataStream {
            local_handle,
            peer_handle: Mutex::new(None),
            state: Mutex::new(State::HalfOpen),
            owning_link,
            writer: AsyncMutex::new(wr),
            reader: Mutex::new(Some(rd)),
            closed: Notify::new(),
        })
    }

    pub fn local_handle(&self) -> Handle {
        self.local_handle
    }

    pub fn peer_handle(&self) -> Option<Handle> {
        *self.peer_handle.lock().unwrap()
    }

    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    /// Install the peer's handle, transition to *Open*, and spawn the read pump. Called once,
    /// either right after a successful dial (connector side) or on receipt of
    /// `TunnelConnectResponse` (listener side).
    pub fn open(self: &Arc<Self>, peer_handle: Handle, registry: Arc<HandleRegistry<C>>) {
        *self.peer_handle.lock().unwrap() = Some(peer_handle);
        *self.state.lock().unwrap() = State::Open;
        let reader = self
            .reader
            .lock()
            .unwrap()
            .take()
            .expect("DataStream read pump started twice");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.read_pump(reader, registry).await;
        });
    }

    async fn read_pump(
        self: Arc<Self>,
        mut reader: ReadHalf<TcpStream>,
        registry: Arc<HandleRegistry<C>>,
    ) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = self.closed.notified() => break,
                result = reader.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            debug!("data stream {} read EOF", self.local_handle);
                            self.close(true, &registry).await;
                            break;
                        }
                        Ok(n) => {
                            let peer_handle = match self.peer_handle() {
                                Some(h) => h,
                                None => break,
                            };
                            let msg = Message::TunnelDataIndication {
                                peer_handle: peer_handle.value(),
                                data: Bytes::copy_from_slice(&buf[..n]),
                            };
                            if self.owning_link.send(&msg).await.is_err() {
                                warn!("control link write failed for stream {}, closing", self.local_handle);
                                self.close(true, &registry).await;
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("data stream {} read error: {}", self.local_handle, e);
                            self.close(true, &registry).await;
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Write an inbound `DataIndication` payload to the application transport. A no-op (logged)
    /// if the stream is not yet *Open*, since data on a HalfOpen stream is a protocol violation
    /// per the logical-miss policy, not a fatal one.
    pub async fn write(self: &Arc<Self>, data: &[u8], registry: &HandleRegistry<C>) {
        if self.state() != State::Open {
            debug!(
                "dropping data for stream {} in state {:?}",
                self.local_handle,
                self.state()
            );
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(data).await {
            drop(writer);
            warn!("data stream {} write error: {}", self.local_handle, e);
            self.close(true, registry).await;
        }
    }

    /// Remove self from `registry` (no-op if already absent), shut down the transport, and,
    /// if `notify_peer` and this was the first removal, emit a `TunnelDisconnectRequest`
    /// addressed to the peer's handle for this stream. Idempotent: a second call observes the
    /// registry miss and returns immediately.
    pub async fn close(self: &Arc<Self>, notify_peer: bool, registry: &HandleRegistry<C>) {
        let first_removal = registry.take_stream(self.local_handle).is_some();
        if !first_removal {
            return;
        }

        *self.state.lock().unwrap() = State::Closed;
        self.closed.notify_waiters();

        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }

        if notify_peer {
            if let Some(peer_handle) = self.peer_handle() {
                let msg = Message::TunnelDisconnectRequest {
                    peer_handle: peer_handle.value(),
                };
                let _ = self.owning_link.send(&msg).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_link::Role;

    fn link() -> Arc<ControlLink<tokio::io::DuplexStream>> {
        let (a, _b) = tokio::io::duplex(256);
        Arc::new(ControlLink::new(a, Role::Connector, Handle::from(1)))
    }

    /// A connected loopback TCP pair, for tests that need a real socket behind a `DataStream`.
    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = listener.accept();
        let (connected, (accepted, _)) = tokio::join!(connect, accept);
        (connected.unwrap(), accepted)
    }

    #[tokio::test]
    async fn starts_half_open_with_no_peer_handle() {
        let (t, _peer) = tcp_pair().await;
        let stream = DataStream::new_half_open(Handle::from(2), link(), t);
        assert_eq!(stream.state(), State::HalfOpen);
        assert_eq!(stream.peer_handle(), None);
    }

    #[tokio::test]
    async fn open_installs_peer_handle_and_transitions_state() {
        let registry = Arc::new(HandleRegistry::new());
        let (t, _peer) = tcp_pair().await;
        let stream = DataStream::new_half_open(Handle::from(2), link(), t);
        registry.insert_stream(Handle::from(2), Arc::clone(&stream));

        stream.open(Handle::from(9), Arc::clone(&registry));
        assert_eq!(stream.state(), State::Open);
        assert_eq!(stream.peer_handle(), Some(Handle::from(9)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let registry: HandleRegistry<tokio::io::DuplexStream> = HandleRegistry::new();
        let (t, _peer) = tcp_pair().await;
        let stream = DataStream::new_half_open(Handle::from(2), link(), t);
        registry.insert_stream(Handle::from(2), Arc::clone(&stream));

        stream.close(false, &registry).await;
        assert_eq!(stream.state(), State::Closed);
        // Second call must be a silent no-op, not a panic on double-removal.
        stream.close(false, &registry).await;
    }

    #[tokio::test]
    async fn write_to_half_open_stream_is_dropped_not_written() {
        let registry: HandleRegistry<tokio::io::DuplexStream> = HandleRegistry::new();
        let (t, mut peer) = tcp_pair().await;
        let stream = DataStream::new_half_open(Handle::from(2), link(), t);

        stream.write(b"hello", &registry).await;

        let mut buf = [0u8; 8];
        tokio::select! {
            _ = peer.read(&mut buf) => panic!("no bytes should have been written"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {}
        }
    }
}
