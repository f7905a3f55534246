//! Long-lived daemon control plane: wire protocol, ambient paths, the
//! Unix-socket server, the "ensure running" client bootstrap and the thin
//! request sender used by the `boring` CLI (§4.G, §5, §6, §9).

pub mod client;
pub mod ensure;
pub mod paths;
pub mod protocol;
pub mod server;

pub use protocol::{Request, Response};
