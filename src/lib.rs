//! `osmium` is a reliable byte-transport layer for message-passing runtimes:
//! point-to-point, in-order, connection-oriented data transfer between peer
//! processes over non-blocking stream sockets.
//!
//! The upper layer hands the transport a tagged fragment; the transport
//! delivers the bytes to the matching peer endpoint and invokes a completion
//! callback. Connection establishment (with a concurrent-connect tie-break),
//! partial vectored I/O, size-classed fragment pools and the progress engine
//! all live here; peer discovery and address publication are delegated to a
//! [`proc::Directory`] supplied by the surrounding runtime.

pub mod config;
pub mod logging;
pub mod support;

pub mod frag;
pub mod frame;
pub mod pool;
pub mod proc;

pub mod component;
pub mod endpoint;
pub mod module;

mod progress;

pub use crate::component::Transport;
pub use crate::config::TransportConfig;
pub use crate::endpoint::{Endpoint, EndpointState};
pub use crate::frag::Fragment;
pub use crate::module::Module;
pub use crate::proc::{Bitmap, Directory, LocalDirectory, ProcessName};
pub use crate::support::{
    CompletionStatus, DescFlags, ErrorType, TransportError, TransportResult,
};
