//! Chunked file upload/download server built on the `evio` reactor.
//!
//! Clients speak a length-prefixed binary protocol (see [`protocol`]):
//! uploads stream chunks keyed by the file's MD5, downloads stream them
//! back sized to the client's link type. Completed files live in a flat
//! directory managed by [`file_manager::FileManager`].

pub mod config;
pub mod file_manager;
pub mod file_server;
pub mod logging;
pub mod metrics;
pub mod protocol;
pub mod session;
pub mod signal;

pub use config::Config;
pub use file_manager::FileManager;
pub use file_server::FileServer;
pub use session::FileSession;
