//! Thrift routing services.
//!
//! - [`router`]: the request router filter, the heart of the proxy's Thrift
//!   data path.
//! - [`route`]: method-name route table mapping messages to clusters.
//! - [`pool`]: monoio-backed upstream connection pool and static cluster
//!   manager.
pub mod pool;
pub mod route;
pub mod router;

pub use pool::{ClusterConfig, StaticClusterManager, TcpPool};
pub use route::{MethodRouter, RouteRule, RouteTableError};
pub use router::{Router, RouterFactory};
