//! Method-name route table.
//!
//! Maps the method name of a decoded Thrift message to a target cluster.
//! Patterns use [`matchit`] syntax, so a table can mix exact method names,
//! templates for multiplexed services (`Calculator/{method}`), and a
//! catch-all (`{*any}`):
//!
//! ```
//! use thriftlake_core::thrift::{MessageMetadata, MessageType};
//! use thriftlake_core::upstream::{Route, RouteEntry};
//! use thriftlake_services::thrift::route::{MethodRouter, RouteRule};
//!
//! let table = MethodRouter::new_from_iter([
//!     RouteRule {
//!         method: "add".to_string(),
//!         cluster: "calc".to_string(),
//!     },
//!     RouteRule {
//!         method: "{*any}".to_string(),
//!         cluster: "fallback".to_string(),
//!     },
//! ])
//! .unwrap();
//!
//! let metadata = MessageMetadata::new("add", MessageType::Call, 1);
//! let route = table.route(&metadata).unwrap();
//! assert_eq!(route.route_entry().unwrap().cluster_name(), "calc");
//! ```
//!
//! The table is immutable once built; configuration reloads build a fresh
//! table and swap it in at the factory layer.
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use thriftlake_core::{
    thrift::MessageMetadata,
    upstream::{Route, RouteEntry},
};

/// One routing rule: a method pattern and the cluster handling it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    /// Method-name pattern in [`matchit`] syntax. Multiplexed services
    /// register their fully qualified names (`Calculator/add`).
    pub method: String,

    /// Name of the upstream cluster handling matching methods.
    pub cluster: String,
}

#[derive(thiserror::Error, Debug)]
pub enum RouteTableError {
    #[error("invalid method pattern: {0}")]
    Pattern(#[from] matchit::InsertError),
    #[error("route rule for {0:?} has an empty cluster name")]
    EmptyCluster(String),
}

/// Immutable method-name route table.
///
/// Rules are matched in [`matchit`]'s priority order (static patterns win
/// over templates, templates over catch-alls), not in insertion order.
#[derive(Debug, Default)]
pub struct MethodRouter {
    inner: matchit::Router<usize>,
    entries: Vec<Rc<ClusterRouteEntry>>,
}

impl MethodRouter {
    pub fn new_from_iter<I>(rules: I) -> Result<Self, RouteTableError>
    where
        I: IntoIterator<Item = RouteRule>,
    {
        let mut inner = matchit::Router::new();
        let mut entries = Vec::new();
        for rule in rules {
            if rule.cluster.is_empty() {
                return Err(RouteTableError::EmptyCluster(rule.method));
            }
            inner.insert(rule.method, entries.len())?;
            entries.push(Rc::new(ClusterRouteEntry {
                cluster: rule.cluster,
            }));
        }
        Ok(MethodRouter { inner, entries })
    }

    /// Resolves the message's method name against the table.
    pub fn route(&self, metadata: &MessageMetadata) -> Option<Rc<dyn Route>> {
        let matched = self.inner.at(metadata.method_name()).ok()?;
        let entry = self.entries[*matched.value].clone();
        Some(Rc::new(MatchedRoute { entry }))
    }
}

#[derive(Debug)]
struct ClusterRouteEntry {
    cluster: String,
}

impl RouteEntry for ClusterRouteEntry {
    #[inline]
    fn cluster_name(&self) -> &str {
        &self.cluster
    }
}

#[derive(Debug)]
struct MatchedRoute {
    entry: Rc<ClusterRouteEntry>,
}

impl Route for MatchedRoute {
    #[inline]
    fn route_entry(&self) -> Option<&dyn RouteEntry> {
        Some(self.entry.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use thriftlake_core::thrift::MessageType;

    use super::*;

    fn call(method: &str) -> MessageMetadata {
        MessageMetadata::new(method, MessageType::Call, 1)
    }

    fn cluster_of(table: &MethodRouter, method: &str) -> Option<String> {
        table
            .route(&call(method))
            .and_then(|r| r.route_entry().map(|e| e.cluster_name().to_string()))
    }

    #[test]
    fn exact_match_wins() {
        let table = MethodRouter::new_from_iter([
            RouteRule {
                method: "add".to_string(),
                cluster: "calc".to_string(),
            },
            RouteRule {
                method: "{*any}".to_string(),
                cluster: "fallback".to_string(),
            },
        ])
        .unwrap();

        assert_eq!(cluster_of(&table, "add").as_deref(), Some("calc"));
        assert_eq!(cluster_of(&table, "subtract").as_deref(), Some("fallback"));
    }

    #[test]
    fn multiplexed_service_template() {
        let table = MethodRouter::new_from_iter([RouteRule {
            method: "Calculator/{method}".to_string(),
            cluster: "calc".to_string(),
        }])
        .unwrap();

        assert_eq!(cluster_of(&table, "Calculator/add").as_deref(), Some("calc"));
        assert!(table.route(&call("Echo/ping")).is_none());
    }

    #[test]
    fn no_match_yields_none() {
        let table = MethodRouter::new_from_iter([RouteRule {
            method: "add".to_string(),
            cluster: "calc".to_string(),
        }])
        .unwrap();

        assert!(table.route(&call("missing")).is_none());
    }

    #[test]
    fn duplicate_pattern_is_rejected() {
        let result = MethodRouter::new_from_iter([
            RouteRule {
                method: "add".to_string(),
                cluster: "a".to_string(),
            },
            RouteRule {
                method: "add".to_string(),
                cluster: "b".to_string(),
            },
        ]);
        assert!(matches!(result, Err(RouteTableError::Pattern(_))));
    }

    #[test]
    fn empty_cluster_is_rejected() {
        let result = MethodRouter::new_from_iter([RouteRule {
            method: "add".to_string(),
            cluster: String::new(),
        }]);
        assert!(matches!(result, Err(RouteTableError::EmptyCluster(_))));
    }
}
