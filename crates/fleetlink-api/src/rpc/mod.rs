// JSON-RPC API (generation-2+ devices)

pub mod client;
pub mod types;

pub use client::RpcClient;
