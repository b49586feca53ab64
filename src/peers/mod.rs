use std::net::SocketAddr;

pub mod client;
pub mod download_worker;
pub mod server;

pub type PeerAddr = SocketAddr;
