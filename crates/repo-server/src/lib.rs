//! repo-server library: exposes the server components for the binary and
//! for integration tests.

pub mod config;
pub mod http;
pub mod keys;
pub mod message;
pub mod server;
pub mod storage;
pub mod websocket;

pub use config::Config;
pub use message::{JoinMessage, MAX_MESSAGE_SIZE};
pub use server::Server;
pub use storage::{FsStorage, SharesFile};
pub use websocket::{WebSocketClientAdapter, WebSocketServerAdapter};
