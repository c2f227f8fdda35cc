//! Git smart-protocol façade: the pkt-line codec, reference discovery, the
//! pull and push state machines, and the HTTP dispatch surface that ties them
//! together.

pub mod discovery;
pub mod http;
pub mod pkt;
pub mod receive;
pub mod types;
pub mod upload;

// Re-export the main entry points.
pub use http::{GitServer, Method, Request, Response, ResponseBody};

pub use types::*;
