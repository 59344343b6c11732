//! Thrift request router.
//!
//! The router is a decoder filter: the downstream connection manager feeds
//! it the structural event stream of each decoded message, and the router
//! replays those events onto a pooled upstream connection chosen by the
//! route table. For two-way calls it then owns the upstream read side and
//! pumps response bytes back into the downstream decoder until a complete
//! reply has been parsed.
//!
//! `message_begin` is the only callback that can suspend the decoder: it
//! resolves the route and cluster, checks a connection out of the cluster's
//! pool, and on a fresh connection may interleave a protocol upgrade
//! exchange before the first user message. Every other callback is a
//! straight translation onto the upstream encoder.
//!
//! One router instance serves one downstream connection and carries at most
//! one in-flight upstream request. All callbacks (decoder, pool, upstream
//! read side) arrive on the same worker thread; state is shared with the
//! in-flight [`UpstreamRequest`](request::UpstreamRequest) through `Rc` and
//! interior mutability, never locks.
use std::{convert::Infallible, rc::Rc};

use service_async::{AsyncMakeService, MakeService};
use thriftlake_core::{
    thrift::{
        AppException, AppExceptionKind, CodecFactory, DecoderEventHandler, DecoderFilter,
        DecoderFilterCallbacks, FieldType, FilterStatus, LoadBalancerContext, MessageMetadataRef,
    },
    upstream::{ClusterManager, Connection, ConnectionEvent, Route},
};
use tracing::debug;

mod request;

use request::UpstreamRequest;

pub struct Router {
    cluster_manager: Rc<dyn ClusterManager>,
    codecs: Rc<dyn CodecFactory>,
    callbacks: Option<Rc<dyn DecoderFilterCallbacks>>,
    route: Option<Rc<dyn Route>>,
    request: Option<Rc<UpstreamRequest>>,
}

impl Router {
    pub fn new(cluster_manager: Rc<dyn ClusterManager>, codecs: Rc<dyn CodecFactory>) -> Self {
        Router {
            cluster_manager,
            codecs,
            callbacks: None,
            route: None,
            request: None,
        }
    }

    pub const fn factory(
        cluster_manager: Rc<dyn ClusterManager>,
        codecs: Rc<dyn CodecFactory>,
    ) -> RouterFactory {
        RouterFactory {
            cluster_manager,
            codecs,
        }
    }

    /// Closes the upstream connection immediately, without recycling it.
    ///
    /// Used by the downstream filter chain when it decides the response can
    /// no longer be delivered (for instance because a later filter forced a
    /// downstream reset).
    pub fn reset_upstream_connection(&self) {
        if let Some(request) = &self.request {
            request.reset_connection();
        }
    }

    /// Connection events observed by the router itself rather than by the
    /// in-flight request's read side. Forwarded; `Connected` is a no-op.
    pub fn on_event(&self, event: ConnectionEvent) {
        if let Some(request) = &self.request {
            request.on_connection_event(event);
        }
    }

    fn callbacks(&self) -> &Rc<dyn DecoderFilterCallbacks> {
        self.callbacks
            .as_ref()
            .expect("decoder filter callbacks not installed")
    }

    fn request(&self) -> &Rc<UpstreamRequest> {
        self.request
            .as_ref()
            .expect("decoder event without an in-flight upstream request")
    }

    fn local_reply(&mut self, kind: AppExceptionKind, message: String) -> FilterStatus {
        debug!(%message, "answering locally");
        self.callbacks().send_local_reply(AppException::new(kind, message));
        FilterStatus::StopIteration
    }
}

impl DecoderFilter for Router {
    fn set_decoder_filter_callbacks(&mut self, callbacks: Rc<dyn DecoderFilterCallbacks>) {
        self.callbacks = Some(callbacks);
    }

    fn on_destroy(&mut self) {
        if let Some(request) = self.request.take() {
            request.on_router_destroy();
        }
        self.route = None;
    }
}

impl DecoderEventHandler for Router {
    fn transport_begin(&mut self, _metadata: Option<MessageMetadataRef>) -> FilterStatus {
        FilterStatus::Continue
    }

    fn transport_end(&mut self) -> FilterStatus {
        FilterStatus::Continue
    }

    fn message_begin(&mut self, metadata: MessageMetadataRef) -> FilterStatus {
        let route = match self.callbacks().route() {
            Some(route) => route,
            None => {
                return self.local_reply(
                    AppExceptionKind::UnknownMethod,
                    format!("no route for method '{}'", metadata.method_name()),
                );
            }
        };
        let cluster_name = match route.route_entry() {
            Some(entry) => entry.cluster_name().to_string(),
            None => {
                return self.local_reply(
                    AppExceptionKind::UnknownMethod,
                    format!("no route for method '{}'", metadata.method_name()),
                );
            }
        };
        self.route = Some(route);

        let cluster = match self.cluster_manager.cluster(&cluster_name) {
            Some(cluster) => cluster,
            None => {
                return self.local_reply(
                    AppExceptionKind::InternalError,
                    format!("unknown cluster '{cluster_name}'"),
                );
            }
        };
        if cluster.maintenance_mode() {
            return self.local_reply(
                AppExceptionKind::InternalError,
                format!("maintenance mode for cluster '{cluster_name}'"),
            );
        }

        let pool = match self.cluster_manager.conn_pool_for_cluster(&cluster_name) {
            Some(pool) => pool,
            None => {
                return self.local_reply(
                    AppExceptionKind::InternalError,
                    format!("no healthy upstream for '{cluster_name}'"),
                );
            }
        };

        debug!(
            method = metadata.method_name(),
            cluster = cluster.name(),
            "routing message"
        );

        // The upstream speaks the cluster's configured flavors, defaulting
        // to whatever the downstream is speaking.
        let callbacks = self.callbacks();
        let transport_type = cluster
            .transport_override()
            .unwrap_or_else(|| callbacks.downstream_transport_type());
        let protocol_type = cluster
            .protocol_override()
            .unwrap_or_else(|| callbacks.downstream_protocol_type());
        let transport = self.codecs.create_transport(transport_type);
        let protocol = self.codecs.create_protocol(protocol_type);

        let request =
            UpstreamRequest::new(callbacks.clone(), pool, metadata, transport, protocol);
        self.request = Some(request.clone());
        request.start();

        // A reused connection with no upgrade pending lets the decoder run
        // straight into the body events; anything else suspends it until the
        // pool (and possibly the upgrade exchange) is done.
        if request.is_connected() {
            FilterStatus::Continue
        } else {
            FilterStatus::StopIteration
        }
    }

    fn message_end(&mut self) -> FilterStatus {
        self.request().complete_request();
        FilterStatus::Continue
    }

    fn struct_begin(&mut self, name: &str) -> FilterStatus {
        self.request().encode(|p, b| p.write_struct_begin(b, name));
        FilterStatus::Continue
    }

    fn struct_end(&mut self) -> FilterStatus {
        self.request().encode(|p, b| {
            p.write_field_begin(b, "", FieldType::Stop, 0);
            p.write_struct_end(b);
        });
        FilterStatus::Continue
    }

    fn field_begin(&mut self, name: &str, field_type: FieldType, field_id: i16) -> FilterStatus {
        self.request()
            .encode(|p, b| p.write_field_begin(b, name, field_type, field_id));
        FilterStatus::Continue
    }

    fn field_end(&mut self) -> FilterStatus {
        self.request().encode(|p, b| p.write_field_end(b));
        FilterStatus::Continue
    }

    fn map_begin(&mut self, key_type: FieldType, value_type: FieldType, size: u32) -> FilterStatus {
        self.request()
            .encode(|p, b| p.write_map_begin(b, key_type, value_type, size));
        FilterStatus::Continue
    }

    fn map_end(&mut self) -> FilterStatus {
        self.request().encode(|p, b| p.write_map_end(b));
        FilterStatus::Continue
    }

    fn list_begin(&mut self, elem_type: FieldType, size: u32) -> FilterStatus {
        self.request()
            .encode(|p, b| p.write_list_begin(b, elem_type, size));
        FilterStatus::Continue
    }

    fn list_end(&mut self) -> FilterStatus {
        self.request().encode(|p, b| p.write_list_end(b));
        FilterStatus::Continue
    }

    fn set_begin(&mut self, elem_type: FieldType, size: u32) -> FilterStatus {
        self.request()
            .encode(|p, b| p.write_set_begin(b, elem_type, size));
        FilterStatus::Continue
    }

    fn set_end(&mut self) -> FilterStatus {
        self.request().encode(|p, b| p.write_set_end(b));
        FilterStatus::Continue
    }

    fn bool_value(&mut self, value: bool) -> FilterStatus {
        self.request().encode(|p, b| p.write_bool(b, value));
        FilterStatus::Continue
    }

    fn byte_value(&mut self, value: i8) -> FilterStatus {
        self.request().encode(|p, b| p.write_byte(b, value));
        FilterStatus::Continue
    }

    fn int16_value(&mut self, value: i16) -> FilterStatus {
        self.request().encode(|p, b| p.write_int16(b, value));
        FilterStatus::Continue
    }

    fn int32_value(&mut self, value: i32) -> FilterStatus {
        self.request().encode(|p, b| p.write_int32(b, value));
        FilterStatus::Continue
    }

    fn int64_value(&mut self, value: i64) -> FilterStatus {
        self.request().encode(|p, b| p.write_int64(b, value));
        FilterStatus::Continue
    }

    fn double_value(&mut self, value: f64) -> FilterStatus {
        self.request().encode(|p, b| p.write_double(b, value));
        FilterStatus::Continue
    }

    fn string_value(&mut self, value: &str) -> FilterStatus {
        self.request().encode(|p, b| p.write_string(b, value));
        FilterStatus::Continue
    }
}

impl LoadBalancerContext for Router {
    fn downstream_connection(&self) -> Option<Rc<dyn Connection>> {
        self.callbacks.as_ref().and_then(|c| c.connection())
    }
}

/// Creates a fresh [`Router`] per downstream connection from shared cluster
/// and codec handles.
pub struct RouterFactory {
    cluster_manager: Rc<dyn ClusterManager>,
    codecs: Rc<dyn CodecFactory>,
}

impl MakeService for RouterFactory {
    type Service = Router;
    type Error = Infallible;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(Router::new(
            self.cluster_manager.clone(),
            self.codecs.clone(),
        ))
    }
}

impl AsyncMakeService for RouterFactory {
    type Service = Router;
    type Error = Infallible;

    async fn make_via_ref(
        &self,
        _old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(Router::new(
            self.cluster_manager.clone(),
            self.codecs.clone(),
        ))
    }
}
