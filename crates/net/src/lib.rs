//! HTTP networking layer for datsync.
//!
//! Provides:
//! - `HttpTransport`: implements `PeerTransport` over plain HTTP GETs
//! - `PeerServer`: answers the four peer requests from the local store

pub mod client;
pub mod server;

pub use client::HttpTransport;
pub use server::PeerServer;
