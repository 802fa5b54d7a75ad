#![warn(clippy::all)]

pub mod error;
pub mod kv;
pub mod raft;

pub use raft::Server;
