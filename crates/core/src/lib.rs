pub mod client;
pub mod error;
pub mod packet;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use client::{ClientConfig, RtspClient};
pub use error::{Result, RtspError};
pub use packet::PacketKind;
pub use server::{MulticastConfig, Server, ServerConfig, Viewer};
pub use session::SessionState;
