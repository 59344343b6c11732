//! # Thriftlake Core
//!
//! Core abstractions for the thriftlake Thrift proxy. This crate defines the
//! protocol model and the trait seams the router and its collaborators are
//! built against:
//!
//! - [`thrift`]: the Thrift message model (metadata, field and message types,
//!   application exceptions), the encoder-side [`Transport`](thrift::Transport)
//!   and [`Protocol`](thrift::Protocol) traits, and the decoder event surface
//!   ([`DecoderEventHandler`](thrift::DecoderEventHandler) and friends) that
//!   network filters implement.
//! - [`upstream`]: cluster and connection-pool abstractions: route
//!   resolution, pooled connection checkout with asynchronous readiness
//!   callbacks, and the upstream read-side callback surface.
//!
//! Concrete services (the request router, route tables, the monoio-backed
//! connection pool) live in `thriftlake-services`; wire codecs are provided
//! by the embedding proxy through the [`CodecFactory`](thrift::CodecFactory)
//! seam.
pub mod thrift;
pub mod upstream;

mod error;
pub use error::{AnyError, AnyResult};
