//! Subprocess RPC channel.
//!
//! The host starts the plugin executable with the magic cookie in its
//! environment. The plugin answers with a handshake line on stdout and then
//! exchanges newline-delimited JSON requests and responses over its
//! stdin/stdout. Plugin logs go to stderr.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{RemotePlugin, RpcClient, SpawnOptions};
pub use protocol::{Handshake, Method, Request, Response};
pub use server::{serve, serve_io};
