#![warn(clippy::all)]

//! Caching, filtering HTTP/HTTPS forward proxy.
//!
//! Plain HTTP requests are relayed upstream and the raw response bytes are
//! cached per `host:port` with a fixed TTL; `CONNECT` sessions are tunneled
//! opaquely in both directions. A blocklist, editable at runtime from an
//! interactive console, rejects matching hosts before any upstream contact.

pub mod blocklist;
pub mod cache;
pub mod console;
pub mod forward;
pub mod request;
pub mod server;
pub mod tunnel;
