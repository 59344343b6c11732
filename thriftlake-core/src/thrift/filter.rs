//! Decoder filter surface.
//!
//! The downstream connection manager decodes each Thrift message into a
//! stream of structural events and feeds them to a chain of decoder filters.
//! Every callback returns a [`FilterStatus`]: `Continue` lets the decoder
//! proceed, `StopIteration` suspends it until the filter calls
//! [`DecoderFilterCallbacks::continue_decoding`]. All dispatch happens on
//! one worker thread; filters mutate their state inside callbacks and never
//! lock.
use std::{collections::HashMap, rc::Rc};

use bytes::BytesMut;

use super::{
    AppException, FieldType, FilterStatus, MessageMetadataRef, ProtocolType, TransportType,
};
use crate::upstream::{Connection, Route};

/// The structural event stream of one decoded Thrift message.
///
/// Events arrive in wire order: `transport_begin`, `message_begin`, the
/// struct/field/container/value events of the message body, `message_end`,
/// `transport_end`.
pub trait DecoderEventHandler {
    fn transport_begin(&mut self, metadata: Option<MessageMetadataRef>) -> FilterStatus;
    fn transport_end(&mut self) -> FilterStatus;
    fn message_begin(&mut self, metadata: MessageMetadataRef) -> FilterStatus;
    fn message_end(&mut self) -> FilterStatus;
    fn struct_begin(&mut self, name: &str) -> FilterStatus;
    fn struct_end(&mut self) -> FilterStatus;
    fn field_begin(&mut self, name: &str, field_type: FieldType, field_id: i16) -> FilterStatus;
    fn field_end(&mut self) -> FilterStatus;
    fn map_begin(&mut self, key_type: FieldType, value_type: FieldType, size: u32) -> FilterStatus;
    fn map_end(&mut self) -> FilterStatus;
    fn list_begin(&mut self, elem_type: FieldType, size: u32) -> FilterStatus;
    fn list_end(&mut self) -> FilterStatus;
    fn set_begin(&mut self, elem_type: FieldType, size: u32) -> FilterStatus;
    fn set_end(&mut self) -> FilterStatus;
    fn bool_value(&mut self, value: bool) -> FilterStatus;
    fn byte_value(&mut self, value: i8) -> FilterStatus;
    fn int16_value(&mut self, value: i16) -> FilterStatus;
    fn int32_value(&mut self, value: i32) -> FilterStatus;
    fn int64_value(&mut self, value: i64) -> FilterStatus;
    fn double_value(&mut self, value: f64) -> FilterStatus;
    fn string_value(&mut self, value: &str) -> FilterStatus;
}

/// Lifecycle surface of a decoder filter, on top of the event stream.
pub trait DecoderFilter: DecoderEventHandler {
    /// Installs the filter's view of the connection manager. Called once,
    /// before any event.
    fn set_decoder_filter_callbacks(&mut self, callbacks: Rc<dyn DecoderFilterCallbacks>);

    /// Tears the filter down. Any in-flight upstream interaction is
    /// cancelled or closed; no callback arrives afterwards.
    fn on_destroy(&mut self);
}

/// What a decoder filter may ask of the downstream connection manager.
pub trait DecoderFilterCallbacks {
    /// Route resolved for the message currently being decoded, if any.
    fn route(&self) -> Option<Rc<dyn Route>>;

    /// Transport flavor the downstream peer is speaking.
    fn downstream_transport_type(&self) -> TransportType;

    /// Protocol flavor the downstream peer is speaking.
    fn downstream_protocol_type(&self) -> ProtocolType;

    /// The downstream connection. Resolvable from `transport_begin` until
    /// teardown.
    fn connection(&self) -> Option<Rc<dyn Connection>>;

    /// Resumes a decoder previously suspended by `StopIteration`.
    fn continue_decoding(&self);

    /// Answers the downstream caller locally with an application exception,
    /// serialized in place of the upstream reply.
    fn send_local_reply(&self, reply: AppException);

    /// Configures the downstream response decoder for an upstream reply
    /// encoded with the given transport and protocol. Called once, before
    /// the first `upstream_data`.
    fn start_upstream_response(&self, transport_type: TransportType, protocol_type: ProtocolType);

    /// Feeds upstream response bytes to the downstream response decoder;
    /// returns `true` once a complete reply has been decoded and relayed.
    fn upstream_data(&self, buffer: &mut BytesMut) -> bool;

    /// Drops the downstream connection. Used when no reply channel exists
    /// (oneway failures) or a partial response already reached the caller.
    fn reset_downstream_connection(&self);
}

/// Criteria for subset load balancing, carried from route configuration to
/// the cluster's host selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataMatchCriteria {
    pub entries: Vec<(String, String)>,
}

/// Load-balancer integration point of a routing filter.
///
/// Everything here has a conservative default so that host selection can
/// grow (consistent hashing, subset selection, header affinity) without
/// touching the filter contract.
pub trait LoadBalancerContext {
    /// Hash key for consistent-hashing load balancers.
    fn compute_hash_key(&self) -> Option<u64> {
        None
    }

    /// Match criteria for subset load balancers.
    fn metadata_match_criteria(&self) -> Option<&MetadataMatchCriteria> {
        None
    }

    /// Downstream headers, for header-affinity policies.
    fn downstream_headers(&self) -> Option<&HashMap<String, String>> {
        None
    }

    /// The downstream connection behind the request being balanced.
    fn downstream_connection(&self) -> Option<Rc<dyn Connection>> {
        None
    }
}
