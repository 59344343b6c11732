//! Encoder-side codec seams.
//!
//! The router re-encodes a decoded downstream message onto an upstream
//! connection through these traits. Concrete wire codecs (binary, compact,
//! header) are provided by the embedding proxy via [`CodecFactory`]; the
//! router only ever drives the abstract write surface, which keeps it codec
//! agnostic and lets tests substitute recording codecs.
use std::cell::Cell;

use bytes::BytesMut;

use super::{FieldType, MessageMetadata, ProtocolType, TransportType};

/// A transport wraps an encoded message in its framing.
pub trait Transport {
    fn transport_type(&self) -> TransportType;

    /// Wraps `message` in a transport frame and appends the result to `out`.
    /// Called exactly once per request, after `write_message_end`.
    fn encode_frame(&self, out: &mut BytesMut, metadata: &MessageMetadata, message: BytesMut);
}

/// A protocol encodes the structural event stream of one Thrift message.
///
/// The `write_*` calls mirror the decoder event surface one-to-one and
/// append to the caller-owned encoder buffer. Writes into a memory buffer
/// cannot fail; transport and socket errors surface later, at frame time.
pub trait Protocol {
    fn protocol_type(&self) -> ProtocolType;

    fn write_message_begin(&self, buffer: &mut BytesMut, metadata: &MessageMetadata);
    fn write_message_end(&self, buffer: &mut BytesMut);
    fn write_struct_begin(&self, buffer: &mut BytesMut, name: &str);
    fn write_struct_end(&self, buffer: &mut BytesMut);
    fn write_field_begin(
        &self,
        buffer: &mut BytesMut,
        name: &str,
        field_type: FieldType,
        field_id: i16,
    );
    fn write_field_end(&self, buffer: &mut BytesMut);
    fn write_map_begin(
        &self,
        buffer: &mut BytesMut,
        key_type: FieldType,
        value_type: FieldType,
        size: u32,
    );
    fn write_map_end(&self, buffer: &mut BytesMut);
    fn write_list_begin(&self, buffer: &mut BytesMut, elem_type: FieldType, size: u32);
    fn write_list_end(&self, buffer: &mut BytesMut);
    fn write_set_begin(&self, buffer: &mut BytesMut, elem_type: FieldType, size: u32);
    fn write_set_end(&self, buffer: &mut BytesMut);
    fn write_bool(&self, buffer: &mut BytesMut, value: bool);
    fn write_byte(&self, buffer: &mut BytesMut, value: i8);
    fn write_int16(&self, buffer: &mut BytesMut, value: i16);
    fn write_int32(&self, buffer: &mut BytesMut, value: i32);
    fn write_int64(&self, buffer: &mut BytesMut, value: i64);
    fn write_double(&self, buffer: &mut BytesMut, value: f64);
    fn write_string(&self, buffer: &mut BytesMut, value: &str);

    /// Whether this protocol can negotiate an upgraded encoding on a fresh
    /// connection before the first user message.
    fn supports_upgrade(&self) -> bool {
        false
    }

    /// Starts an upgrade exchange on a freshly pooled connection.
    ///
    /// When the sticky `state` shows the exchange already happened (or is
    /// unnecessary) this returns `None` and writes nothing. Otherwise it
    /// fills `buffer` with the upgrade request and returns a parser for the
    /// upgrade response; the caller writes the buffer to the connection and
    /// feeds upstream bytes to the parser until it reports completion.
    fn attempt_upgrade(
        &self,
        _transport: &dyn Transport,
        _state: &ThriftConnectionState,
        _buffer: &mut BytesMut,
    ) -> Option<Box<dyn ThriftObject>> {
        None
    }

    /// Persists the outcome of a completed upgrade exchange on the sticky
    /// connection state.
    fn complete_upgrade(&self, _state: &ThriftConnectionState, _response: &dyn ThriftObject) {}
}

/// An incrementally parsed Thrift value, such as an upgrade response.
pub trait ThriftObject {
    /// Consumes bytes from `buffer`; returns `true` once the object is
    /// completely parsed.
    fn on_data(&mut self, buffer: &mut BytesMut) -> bool;
}

/// Sticky per-connection protocol state, kept on the pool's connection
/// record so it survives successive tenants of the same connection.
///
/// Created the first time an upgrade-capable protocol sees the connection;
/// mutated only through [`Protocol::attempt_upgrade`] /
/// [`Protocol::complete_upgrade`].
#[derive(Debug, Default)]
pub struct ThriftConnectionState {
    upgrade_attempted: Cell<bool>,
    upgraded: Cell<bool>,
}

impl ThriftConnectionState {
    #[inline]
    pub fn upgrade_attempted(&self) -> bool {
        self.upgrade_attempted.get()
    }

    #[inline]
    pub fn mark_upgrade_attempted(&self) {
        self.upgrade_attempted.set(true);
    }

    #[inline]
    pub fn upgraded(&self) -> bool {
        self.upgraded.get()
    }

    #[inline]
    pub fn mark_upgraded(&self) {
        self.upgraded.set(true);
    }
}

/// Materializes codec instances from their configured types.
///
/// Stands in for the named-codec registry of the embedding proxy: the router
/// asks for the upstream cluster's transport and protocol by type and never
/// constructs codecs itself.
pub trait CodecFactory {
    fn create_transport(&self, transport_type: TransportType) -> Box<dyn Transport>;
    fn create_protocol(&self, protocol_type: ProtocolType) -> Box<dyn Protocol>;
}
