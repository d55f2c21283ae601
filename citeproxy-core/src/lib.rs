//! Building blocks of the citeproxy CORS bridge.
//! Framing, header model and bookkeeping only; the serving loop lives in the `citeproxy` crate.

pub mod control;
pub mod cors;
pub mod error;
pub mod framer;
pub mod message;
pub mod registry;

pub use control::{send_stop, ControlAction};
pub use error::{ProxyError, Result};
pub use framer::{continue_message, read_message};
pub use message::{HeaderMap, Message, MessageHead};
pub use registry::{ChannelRegistry, ConnId, Role};
