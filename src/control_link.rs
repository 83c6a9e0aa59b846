// ABOUTME: The single signaling byte-stream between two engines
// ABOUTME: Serializes all outbound frames through one async mutex on its write half

use crate::codec::Message;
use crate::connection::{self, ReadError, Transport};
use crate::handle::Handle;
use std::sync::Mutex;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;

/// Which side of the protocol a `ControlLink` is playing. Fixed at construction; the two roles
/// differ only in who sent `ListenRequest` and who owns the public ephemeral port, never in
/// how frames are read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listener,
    Connector,
}

/// The signaling channel to one peer engine. Carries every framed message for that peer,
/// including multiplexed `TunnelDataIndication` traffic for all of its `DataStream`s, hence
/// the single write-side mutex: every task that can emit on this link (the frame loop and every
/// stream's read pump) goes through [`ControlLink::send`].
pub struct ControlLink<T: Transport> {
    handle: Handle,
    role: Role,
    writer: AsyncMutex<WriteHalf<T>>,
    reader: Mutex<Option<ReadHalf<T>>>,
    target: Mutex<Option<(String, u32)>>,
    public_port: Mutex<Option<u32>>,
}

impl<T: Transport> ControlLink<T> {
    pub fn new(transport: T, role: Role, handle: Handle) -> Self {
        let (rd, wr) = tokio::io::split(transport);
        ControlLink {
            handle,
            role,
            writer: AsyncMutex::new(wr),
            reader: Mutex::new(Some(rd)),
            target: Mutex::new(None),
            public_port: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Takes the read half for the frame loop. Must be called exactly once; a second call
    /// indicates two frame loops racing over the same link, which is a bug in the caller.
    pub fn take_reader(&self) -> ReadHalf<T> {
        self.reader
            .lock()
            .unwrap()
            .take()
            .expect("ControlLink read half already taken")
    }

    /// Record the target the connector asked to expose, once processing its `ListenRequest`.
    pub fn set_target(&self, host: String, port: u32) {
        *self.target.lock().unwrap() = Some((host, port));
    }

    pub fn target(&self) -> Option<(String, u32)> {
        self.target.lock().unwrap().clone()
    }

    /// Record the public port the listener bound, for the connector side to report back to
    /// its own caller once `ListenResponse` arrives.
    pub fn set_public_port(&self, port: u32) {
        *self.public_port.lock().unwrap() = Some(port);
    }

    pub fn public_port(&self) -> Option<u32> {
        *self.public_port.lock().unwrap()
    }

    /// Serialize and write one frame, flushing before releasing the write lock so no two
    /// frames can ever interleave on the wire.
    pub async fn send(&self, msg: &Message) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        connection::write_message(&mut *writer, msg).await
    }

    pub async fn read_next<R>(reader: &mut R) -> Result<Message, ReadError>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        connection::read_message(reader).await
    }
}
