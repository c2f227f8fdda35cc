//! githttp is a library implementing the server side of the Git smart HTTP
//! transfer protocol over bare repositories: reference discovery, pull
//! negotiation and pack streaming, the push pipeline with per-reference
//! policy and commit splicing, plus a read-only JSON browsing API.
pub mod browse;
pub mod config;
pub mod errors;
pub mod hash;
pub mod internal;
pub mod lockfile;
pub mod odb;
pub mod pool;
pub mod protocol;
pub mod repository;
pub mod splice;
pub mod tree_ops;
pub mod utils;
