//! Peer RPC transport: bincode messages with a length prefix over TCP.

pub mod client;
pub mod rpc;
pub mod server;

pub use client::PeerClient;
pub use rpc::{GetResponse, Message, MAX_MESSAGE_SIZE};
pub use server::{RequestHandler, RpcServer};
