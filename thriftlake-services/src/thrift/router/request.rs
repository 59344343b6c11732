//! The router's single in-flight upstream interaction.
//!
//! An [`UpstreamRequest`] is created at `message_begin` once the route and
//! cluster have resolved, and lives until the connection is recycled, the
//! request fails, or the router is torn down. It is the shared object the
//! pool and the connection's read side call back into, so it carries the
//! request state behind `Rc` with interior mutability.
//!
//! The lifecycle is an explicit tagged state machine:
//!
//! ```text
//! Idle -> PoolPending -> (Upgrading ->) Connected
//!      -> AwaitingResponse (two-way) | Released (oneway)
//!      -> Released | Failed | Closed
//! ```
//!
//! Two invariants hold throughout: the pooled connection is recycled at most
//! once, and the downstream caller hears about a failure at most once (a
//! local reply for two-way calls, a downstream reset for oneways).
use std::{
    cell::RefCell,
    rc::Rc,
};

use bytes::BytesMut;
use thriftlake_core::{
    thrift::{
        AppException, AppExceptionKind, DecoderFilterCallbacks, MessageMetadataRef, MessageType,
        Protocol, ThriftConnectionState, ThriftObject, Transport,
    },
    upstream::{
        CancelHandle, CloseType, ConnPool, Connection, ConnectionData, ConnectionEvent,
        PoolCallbacks, PoolFailureReason, UpstreamCallbacks,
    },
};
use tracing::{debug, trace, warn};

/// When the pooled connection goes back to the pool. Decided once, from the
/// message type: a oneway has no reply, so its connection is recycled as
/// soon as the request frame is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReleaseAt {
    AfterWrite,
    AfterResponse,
}

enum RequestState {
    /// Constructed, checkout not yet requested.
    Idle,
    /// Waiting for the pool.
    PoolPending,
    /// Upgrade exchange in flight on a fresh connection; the downstream
    /// decoder stays suspended and the first user message is deferred.
    Upgrading {
        response: Box<dyn ThriftObject>,
        conn_state: Rc<ThriftConnectionState>,
    },
    /// Connection live, request being encoded.
    Connected,
    /// Request written; reply being parsed downstream.
    AwaitingResponse { started: bool },
    /// Connection recycled; terminal.
    Released,
    /// Checkout or connection failed; terminal.
    Failed,
    /// Connection closed without recycling; terminal.
    Closed,
}

impl RequestState {
    fn name(&self) -> &'static str {
        match self {
            RequestState::Idle => "idle",
            RequestState::PoolPending => "pool_pending",
            RequestState::Upgrading { .. } => "upgrading",
            RequestState::Connected => "connected",
            RequestState::AwaitingResponse { .. } => "awaiting_response",
            RequestState::Released => "released",
            RequestState::Failed => "failed",
            RequestState::Closed => "closed",
        }
    }
}

pub(crate) struct UpstreamRequest {
    callbacks: Rc<dyn DecoderFilterCallbacks>,
    pool: Rc<dyn ConnPool>,
    metadata: MessageMetadataRef,
    transport: Box<dyn Transport>,
    protocol: Box<dyn Protocol>,
    release_at: ReleaseAt,

    state: RefCell<RequestState>,
    buffer: RefCell<BytesMut>,
    cancel_handle: RefCell<Option<Rc<dyn CancelHandle>>>,
    conn_data: RefCell<Option<Box<dyn ConnectionData>>>,
}

impl UpstreamRequest {
    pub(crate) fn new(
        callbacks: Rc<dyn DecoderFilterCallbacks>,
        pool: Rc<dyn ConnPool>,
        metadata: MessageMetadataRef,
        transport: Box<dyn Transport>,
        protocol: Box<dyn Protocol>,
    ) -> Rc<Self> {
        let release_at = match metadata.message_type() {
            MessageType::Oneway => ReleaseAt::AfterWrite,
            _ => ReleaseAt::AfterResponse,
        };
        Rc::new(UpstreamRequest {
            callbacks,
            pool,
            metadata,
            transport,
            protocol,
            release_at,
            state: RefCell::new(RequestState::Idle),
            buffer: RefCell::new(BytesMut::new()),
            cancel_handle: RefCell::new(None),
            conn_data: RefCell::new(None),
        })
    }

    /// Requests a pooled connection. The pool may complete synchronously, in
    /// which case `pool_ready`/`pool_failure` have already run by the time
    /// this returns and no cancel handle is kept.
    pub(crate) fn start(self: &Rc<Self>) {
        self.set_state(RequestState::PoolPending);
        let handle = self.pool.new_connection(self.clone());
        if let Some(handle) = handle {
            if matches!(&*self.state.borrow(), RequestState::PoolPending) {
                *self.cancel_handle.borrow_mut() = Some(handle);
            }
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(&*self.state.borrow(), RequestState::Connected)
    }

    /// Appends to the encoder buffer through the upstream protocol.
    pub(crate) fn encode<F>(&self, f: F)
    where
        F: FnOnce(&dyn Protocol, &mut BytesMut),
    {
        f(self.protocol.as_ref(), &mut self.buffer.borrow_mut());
    }

    /// Finishes the message, frames it, writes the frame upstream, and
    /// either recycles the connection (oneway) or starts waiting for the
    /// reply (two-way).
    pub(crate) fn complete_request(&self) {
        self.encode(|p, b| p.write_message_end(b));
        let message = self.buffer.borrow_mut().split();
        let mut frame = BytesMut::new();
        self.transport.encode_frame(&mut frame, &self.metadata, message);
        self.connection().write(frame, false);

        match self.release_at {
            ReleaseAt::AfterWrite => self.release_connection(),
            ReleaseAt::AfterResponse => {
                self.set_state(RequestState::AwaitingResponse { started: false })
            }
        }
    }

    /// Router teardown. Cancels a pending checkout; closes (never recycles)
    /// a held connection, including one in the middle of an upgrade.
    pub(crate) fn on_router_destroy(&self) {
        if let Some(handle) = self.cancel_handle.borrow_mut().take() {
            handle.cancel();
            self.set_state(RequestState::Closed);
            return;
        }
        if self.conn_data.borrow().is_some() {
            self.close_connection();
        }
    }

    /// Immediate close requested by the downstream filter chain.
    pub(crate) fn reset_connection(&self) {
        if self.conn_data.borrow().is_some() {
            self.close_connection();
        }
    }

    pub(crate) fn on_connection_event(&self, event: ConnectionEvent) {
        self.on_event(event);
    }

    fn set_state(&self, next: RequestState) {
        trace!(
            from = self.state.borrow().name(),
            to = next.name(),
            "upstream request state"
        );
        *self.state.borrow_mut() = next;
    }

    fn connection(&self) -> Rc<dyn Connection> {
        self.conn_data
            .borrow()
            .as_ref()
            .expect("upstream connection not ready")
            .connection()
    }

    /// Hands the connection back to the pool. Safe to reach twice; only the
    /// first call still holds the connection.
    fn release_connection(&self) {
        self.set_state(RequestState::Released);
        if let Some(conn) = self.conn_data.borrow_mut().take() {
            self.pool.released(conn);
        }
    }

    /// Closes the connection without recycling it.
    fn close_connection(&self) {
        self.set_state(RequestState::Closed);
        if let Some(conn) = self.conn_data.borrow_mut().take() {
            conn.connection().close(CloseType::NoFlush);
        }
    }

    /// Emits the deferred `write_message_begin` and, when the checkout or
    /// upgrade ran asynchronously, resumes the suspended decoder.
    fn start_request(&self, resume: bool) {
        self.set_state(RequestState::Connected);
        self.encode(|p, b| p.write_message_begin(b, &self.metadata));
        if resume {
            self.callbacks.continue_decoding();
        }
    }

    fn on_upgrade_data(&self, buffer: &mut BytesMut) {
        let complete = {
            let mut state = self.state.borrow_mut();
            match &mut *state {
                RequestState::Upgrading { response, .. } => response.on_data(buffer),
                _ => return,
            }
        };
        if !complete {
            return;
        }

        let (response, conn_state) = {
            let mut state = self.state.borrow_mut();
            match std::mem::replace(&mut *state, RequestState::Connected) {
                RequestState::Upgrading {
                    response,
                    conn_state,
                } => (response, conn_state),
                other => {
                    *state = other;
                    return;
                }
            }
        };
        debug!("upstream protocol upgrade complete");
        self.protocol
            .complete_upgrade(&conn_state, response.as_ref());
        // The upgrade always suspends the decoder, so always resume here.
        self.start_request(true);
    }

    fn on_response_data(&self, buffer: &mut BytesMut, end_stream: bool, started: bool) {
        if !started {
            self.set_state(RequestState::AwaitingResponse { started: true });
            self.callbacks.start_upstream_response(
                self.transport.transport_type(),
                self.protocol.protocol_type(),
            );
        }

        // The downstream decoder may reenter `reset_upstream_connection`
        // while consuming this buffer; no state borrow is held across it.
        let complete = self.callbacks.upstream_data(buffer);
        if complete {
            if matches!(&*self.state.borrow(), RequestState::Closed) {
                return;
            }
            debug!("upstream response complete");
            self.release_connection();
            return;
        }

        if end_stream {
            // Half-closed before a full reply. Partial response bytes may
            // already have reached the caller, so the downstream connection
            // cannot carry a local reply; drop it instead.
            warn!("upstream response truncated");
            self.release_connection();
            self.callbacks.reset_downstream_connection();
        }
    }

    fn fail_request(&self, reply: AppException) {
        self.set_state(RequestState::Failed);
        match self.release_at {
            ReleaseAt::AfterResponse => self.callbacks.send_local_reply(reply),
            // A oneway caller expects no reply; the only failure signal left
            // is dropping the downstream connection.
            ReleaseAt::AfterWrite => self.callbacks.reset_downstream_connection(),
        }
    }
}

impl PoolCallbacks for UpstreamRequest {
    fn pool_ready(self: Rc<Self>, conn: Box<dyn ConnectionData>) {
        // A cancel handle is only held for asynchronous checkouts, and those
        // are the ones that suspended the decoder.
        let resume = self.cancel_handle.borrow_mut().take().is_some();
        conn.set_upstream_callbacks(self.clone());
        *self.conn_data.borrow_mut() = Some(conn);
        debug!(
            method = self.metadata.method_name(),
            "upstream connection ready"
        );

        if self.protocol.supports_upgrade() {
            let conn_state = {
                let guard = self.conn_data.borrow();
                let conn = guard.as_ref().expect("connection just installed");
                match conn.connection_state() {
                    Some(state) => state,
                    None => {
                        let state = Rc::new(ThriftConnectionState::default());
                        conn.set_connection_state(state.clone());
                        state
                    }
                }
            };
            let mut upgrade_buffer = BytesMut::new();
            if let Some(response) = self.protocol.attempt_upgrade(
                self.transport.as_ref(),
                &conn_state,
                &mut upgrade_buffer,
            ) {
                debug!("starting upstream protocol upgrade");
                self.set_state(RequestState::Upgrading {
                    response,
                    conn_state,
                });
                self.connection().write(upgrade_buffer, false);
                return;
            }
        }

        self.start_request(resume);
    }

    fn pool_failure(&self, reason: PoolFailureReason) {
        self.cancel_handle.borrow_mut().take();
        warn!(
            method = self.metadata.method_name(),
            ?reason,
            "upstream connection pool failure"
        );
        self.fail_request(pool_failure_reply(reason, self.metadata.method_name()));
    }
}

impl UpstreamCallbacks for UpstreamRequest {
    fn on_upstream_data(&self, buffer: &mut BytesMut, end_stream: bool) {
        enum Phase {
            Upgrade,
            Response { started: bool },
            Other,
        }
        let phase = match &*self.state.borrow() {
            RequestState::Upgrading { .. } => Phase::Upgrade,
            RequestState::AwaitingResponse { started } => Phase::Response { started: *started },
            _ => Phase::Other,
        };
        match phase {
            Phase::Upgrade => self.on_upgrade_data(buffer),
            Phase::Response { started } => self.on_response_data(buffer, end_stream, started),
            Phase::Other => {
                trace!(
                    state = self.state.borrow().name(),
                    "dropping upstream data outside of a response"
                );
            }
        }
    }

    fn on_event(&self, event: ConnectionEvent) {
        if matches!(event, ConnectionEvent::Connected) {
            return;
        }
        // A close after release or completion is benign; before that it
        // kills the in-flight request.
        let in_flight = matches!(
            &*self.state.borrow(),
            RequestState::Upgrading { .. }
                | RequestState::Connected
                | RequestState::AwaitingResponse { .. }
        );
        if !in_flight {
            trace!(
                ?event,
                state = self.state.borrow().name(),
                "ignoring connection event"
            );
            return;
        }
        warn!(?event, "upstream connection closed mid-request");
        // The connection is already gone; drop the handle without recycling.
        self.conn_data.borrow_mut().take();
        self.fail_request(AppException::new(
            AppExceptionKind::InternalError,
            format!(
                "connection failure before response completed for method '{}'",
                self.metadata.method_name()
            ),
        ));
    }
}

/// Maps a checkout failure to the application exception the downstream
/// caller sees. The message substrings are part of the caller-visible
/// contract.
fn pool_failure_reply(reason: PoolFailureReason, method: &str) -> AppException {
    let message = match reason {
        PoolFailureReason::Overflow => {
            format!("too many connections for method '{method}'")
        }
        PoolFailureReason::LocalConnectionFailure
        | PoolFailureReason::RemoteConnectionFailure
        | PoolFailureReason::Timeout => {
            format!("connection failure for method '{method}'")
        }
    };
    AppException::new(AppExceptionKind::InternalError, message)
}

#[cfg(test)]
mod reply_tests {
    use super::*;

    #[test]
    fn connect_failures_share_a_stable_substring() {
        for reason in [
            PoolFailureReason::LocalConnectionFailure,
            PoolFailureReason::RemoteConnectionFailure,
            PoolFailureReason::Timeout,
        ] {
            let reply = pool_failure_reply(reason, "method");
            assert_eq!(reply.kind, AppExceptionKind::InternalError);
            assert!(reply.message.contains("connection failure"));
        }
    }

    #[test]
    fn overflow_maps_to_too_many_connections() {
        let reply = pool_failure_reply(PoolFailureReason::Overflow, "method");
        assert_eq!(reply.kind, AppExceptionKind::InternalError);
        assert!(reply.message.contains("too many connections"));
    }
}
