//! # Thriftlake Services
//!
//! Building blocks for a Thrift proxy on the monoio runtime. The crate
//! provides the pieces that sit between a downstream Thrift decoder and an
//! upstream cluster:
//!
//! - [`Router`](thrift::router::Router): a decoder filter that resolves each
//!   message to a cluster, checks a connection out of the cluster's pool,
//!   re-encodes the message onto it and relays the reply back downstream.
//! - [`MethodRouter`](thrift::route::MethodRouter): a method-name route table
//!   built from serde-friendly configuration.
//! - [`TcpPool`](thrift::pool::TcpPool) and
//!   [`StaticClusterManager`](thrift::pool::StaticClusterManager): a
//!   monoio-backed upstream connection pool and a fixed cluster set wiring
//!   the router's upstream seams.
//!
//! All services follow the thread-per-core model: state is per worker,
//! shared with `Rc`, and never locked. Construction follows the
//! `service_async` factory conventions so services can be composed into
//! factory stacks and hot-restarted without dropping pooled connections.
pub mod thrift;
