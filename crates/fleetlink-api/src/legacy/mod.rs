// Legacy REST API (generation-1 devices)

pub mod client;

pub use client::LegacyClient;
