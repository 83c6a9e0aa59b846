pub mod acceptor;
pub mod codec;
pub mod connection;
pub mod control_link;
pub mod engine;
pub mod handle;
pub mod registry;
pub mod stream;


pub use codec::{CodecError, Message};
pub use connection::{ReadError, Transport};
pub use control_link::{ControlLink, Role};
pub use engine::TunnelEngine;
pub use handle::Handle;
pub use registry::HandleRegistry;
pub use stream::{DataStream, State as StreamState};

/// Error returned by the engine's synchronous entry points (`dial_control`,
/// `start_tunnel_for`, and the CLI's `main`).
///
/// As in most Tokio-based services, a specialized error enum is only worth the ceremony where
/// callers branch on the failure cause. Framing failures get that treatment (`CodecError`);
/// everything above the wire stays boxed.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for tunnel engine operations.
pub type Result<T> = std::result::Result<T, Error>;
