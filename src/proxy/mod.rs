//! Proxy engine: ingress routing, credential-rotating dispatch, outcome
//! classification, and response relay.

mod classify;
mod engine;
mod headers;
mod logging;
mod response;

pub use classify::{classify_response, is_uncounted, Outcome};
pub use engine::ProxyService;
pub use headers::{apply_streaming_headers, copy_end_to_end, is_hop_by_hop};
pub use logging::RequestLogger;
