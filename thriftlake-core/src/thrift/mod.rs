//! Thrift protocol model shared by the proxy's filters and codecs.
//!
//! The decoder side of the proxy turns raw frames into a stream of structural
//! events (transport, message, struct, field, container and value callbacks);
//! the encoder side replays those events onto an upstream connection. This
//! module defines the vocabulary both sides speak: message metadata, field
//! and message type tags, filter flow-control status, and the application
//! exception used to answer a downstream caller locally.
//!
//! The encoder seams ([`Protocol`], [`Transport`], [`CodecFactory`]) live in
//! [`protocol`]; the decoder event surface ([`DecoderEventHandler`],
//! [`DecoderFilterCallbacks`]) lives in [`filter`].
use std::rc::Rc;

use serde::{Deserialize, Serialize};

mod filter;
mod protocol;

pub use filter::{
    DecoderEventHandler, DecoderFilter, DecoderFilterCallbacks, LoadBalancerContext,
    MetadataMatchCriteria,
};
pub use protocol::{CodecFactory, Protocol, ThriftConnectionState, ThriftObject, Transport};

/// Thrift message kinds, with their on-wire tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum MessageType {
    Call = 1,
    Reply = 2,
    Exception = 3,
    Oneway = 4,
}

impl MessageType {
    /// A `Call` expects a `Reply` (or `Exception`); a `Oneway` expects
    /// nothing back.
    #[inline]
    pub fn expects_response(&self) -> bool {
        matches!(self, MessageType::Call)
    }
}

/// Thrift field type tags (TType). `Stop` is the sentinel terminating a
/// struct's field list on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum FieldType {
    Stop = 0,
    Void = 1,
    Bool = 2,
    Byte = 3,
    Double = 4,
    I16 = 6,
    I32 = 8,
    I64 = 10,
    String = 11,
    Struct = 12,
    Map = 13,
    Set = 14,
    List = 15,
}

/// Named transport (framing) flavors a cluster or listener can be configured
/// with. `Auto` defers to peer detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    #[default]
    Auto,
    Framed,
    Unframed,
    Header,
}

/// Named protocol (encoding) flavors. `Auto` defers to peer detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolType {
    #[default]
    Auto,
    Binary,
    LaxBinary,
    Compact,
}

/// Per-message metadata surfaced by `messageBegin`.
///
/// Immutable once decoded; the router and the encoder only ever read it, so
/// it is shared as `Rc<MessageMetadata>` along the single-threaded filter
/// pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    method_name: String,
    message_type: MessageType,
    sequence_id: i32,
}

impl MessageMetadata {
    pub fn new(
        method_name: impl Into<String>,
        message_type: MessageType,
        sequence_id: i32,
    ) -> Self {
        let method_name = method_name.into();
        debug_assert!(!method_name.is_empty(), "thrift method name is empty");
        MessageMetadata {
            method_name,
            message_type,
            sequence_id,
        }
    }

    #[inline]
    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    #[inline]
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    #[inline]
    pub fn sequence_id(&self) -> i32 {
        self.sequence_id
    }
}

/// Shared handle type for message metadata flowing through filter callbacks.
pub type MessageMetadataRef = Rc<MessageMetadata>;

/// Flow-control result of a decoder filter callback.
///
/// `StopIteration` suspends the decoder; it resumes only after the filter
/// signals `continue_decoding` on its callbacks handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    Continue,
    StopIteration,
}

/// Thrift application exception kinds, with their on-wire tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum AppExceptionKind {
    Unknown = 0,
    UnknownMethod = 1,
    InvalidMessageType = 2,
    WrongMethodName = 3,
    BadSequenceId = 4,
    MissingResult = 5,
    InternalError = 6,
    ProtocolError = 7,
}

/// A Thrift-level error returned to the downstream caller in place of a
/// normal reply.
///
/// The downstream filter chain serializes this as an `Exception` message on
/// the downstream transport; the message text is part of the caller-visible
/// contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct AppException {
    pub kind: AppExceptionKind,
    pub message: String,
}

impl AppException {
    pub fn new(kind: AppExceptionKind, message: impl Into<String>) -> Self {
        AppException {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_response_expectation() {
        assert!(MessageType::Call.expects_response());
        assert!(!MessageType::Oneway.expects_response());
        assert!(!MessageType::Reply.expects_response());
    }

    #[test]
    fn field_type_wire_tags() {
        assert_eq!(FieldType::Stop as i8, 0);
        assert_eq!(FieldType::I32 as i8, 8);
        assert_eq!(FieldType::List as i8, 15);
    }

    #[test]
    fn app_exception_displays_message() {
        let ex = AppException::new(AppExceptionKind::InternalError, "connection failure");
        assert!(ex.to_string().contains("connection failure"));
    }
}
