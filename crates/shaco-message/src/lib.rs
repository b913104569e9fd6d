//! Message envelopes and the process-wide dispatcher FIFO.
//!
//! Grounded on `lunatic-process/src/message.rs` (the `Message`/`DataMessage`
//! split) and `libshaco/shaco_context.c`'s `shaco_context_send`, generalized
//! to the spec's four message categories (`TEXT`, `SOCKET`, `REMOTE`, user
//! codes) and the dispatcher draining contract in spec.md §4.4.

use std::collections::VecDeque;

use bytes::Bytes;
use shaco_handle::{Handle, HandleRegistry};

/// Sender-chosen correlation id, echoed in replies.
pub type Session = i32;

/// A message destined for another node, produced locally and translated to
/// a wire frame by the harbor service.
#[derive(Debug, Clone)]
pub struct RemoteEnvelope {
    pub dest: Handle,
    pub type_tag: u8,
    pub payload: Bytes,
}

/// A socket-reactor event, delivered to whichever service owns the fd
/// (normally the harbor).
#[derive(Debug, Clone)]
pub enum SocketEvent {
    Accepted { id: u32, addr: String },
    Data { id: u32, bytes: Bytes },
    SockErr { id: u32, reason: String },
}

/// Message payload, tagged by category. The wire byte for each category is
/// fixed so `shaco-harbor` can translate to/from frames without consulting
/// this crate.
#[derive(Debug, Clone)]
pub enum MessageKind {
    Text(Bytes),
    Socket(SocketEvent),
    Remote(RemoteEnvelope),
    User(u8, Bytes),
}

pub const TYPE_TEXT: u8 = 0;
pub const TYPE_SOCKET: u8 = 1;
pub const TYPE_REMOTE: u8 = 2;

/// Reserved user-defined code for timer-expiry messages (spec.md §3: "Type
/// tags include at least TEXT, SOCKET, REMOTE, and user-defined codes" —
/// the timer wheel's expiry notifications are carried as this user code
/// rather than a new built-in variant, so the four-category wire contract
/// does not grow).
pub const TYPE_TIMEOUT: u8 = 3;

impl MessageKind {
    pub fn type_tag(&self) -> u8 {
        match self {
            MessageKind::Text(_) => TYPE_TEXT,
            MessageKind::Socket(_) => TYPE_SOCKET,
            MessageKind::Remote(_) => TYPE_REMOTE,
            MessageKind::User(tag, _) => *tag,
        }
    }
}

/// Flattens a [`SocketEvent`] into the `(discriminant, id, trailing bytes)`
/// shape a narrow `(source, session, type, payload: Vec<u8>)` service
/// callback can receive — the original C `struct socket_message` is itself
/// just such a flattened payload behind a `void*`. `shaco-context` uses
/// this to encode events before handing them to a service's callback;
/// `shaco-harbor` decodes it back on the way in.
pub fn encode_socket_event(event: &SocketEvent) -> Vec<u8> {
    let mut out = Vec::new();
    match event {
        SocketEvent::Accepted { id, addr } => {
            out.push(0);
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(addr.as_bytes());
        }
        SocketEvent::Data { id, bytes } => {
            out.push(1);
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(bytes);
        }
        SocketEvent::SockErr { id, reason } => {
            out.push(2);
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(reason.as_bytes());
        }
    }
    out
}

/// Inverse of [`encode_socket_event`]. Returns `None` on a malformed
/// encoding (too short to hold even the discriminant and id).
pub fn decode_socket_event(bytes: &[u8]) -> Option<SocketEvent> {
    if bytes.len() < 5 {
        return None;
    }
    let id = u32::from_be_bytes(bytes[1..5].try_into().unwrap());
    let rest = &bytes[5..];
    match bytes[0] {
        0 => Some(SocketEvent::Accepted {
            id,
            addr: String::from_utf8_lossy(rest).into_owned(),
        }),
        1 => Some(SocketEvent::Data {
            id,
            bytes: Bytes::copy_from_slice(rest),
        }),
        2 => Some(SocketEvent::SockErr {
            id,
            reason: String::from_utf8_lossy(rest).into_owned(),
        }),
        _ => None,
    }
}

/// Flattens a [`RemoteEnvelope`] into the `(dest: 4 bytes, inner type: 1
/// byte, payload)` shape the narrow callback ABI can carry: `dest` would
/// otherwise be lost when [`MessageKind::type_tag`] collapses the envelope
/// down to a single outer type tag (`TYPE_REMOTE`). `shaco-context` encodes
/// with this before handing a `REMOTE` message to a callback; `shaco-harbor`
/// decodes it back out to learn where to actually send the frame.
pub fn encode_remote_envelope(env: &RemoteEnvelope) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + env.payload.len());
    out.extend_from_slice(&env.dest.as_raw().to_be_bytes());
    out.push(env.type_tag);
    out.extend_from_slice(&env.payload);
    out
}

/// Inverse of [`encode_remote_envelope`]. Returns `None` if `bytes` is too
/// short to hold the 4-byte dest handle and the 1-byte inner type tag.
pub fn decode_remote_envelope(bytes: &[u8]) -> Option<RemoteEnvelope> {
    if bytes.len() < 5 {
        return None;
    }
    let dest = Handle::from_raw(u32::from_be_bytes(bytes[0..4].try_into().unwrap()));
    let type_tag = bytes[4];
    let payload = Bytes::copy_from_slice(&bytes[5..]);
    Some(RemoteEnvelope { dest, type_tag, payload })
}

/// A fully addressed message sitting in the dispatcher queue.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub source: Handle,
    pub dest: Handle,
    pub session: Session,
    pub kind: MessageKind,
}

#[derive(Debug, thiserror::Error)]
#[error("callback failed with code {0}")]
pub struct DeliveryError(pub i32);

/// Implemented by whatever a handle resolves to (`shaco-context::Context`
/// at runtime). Kept as a trait here so `shaco-message` does not need to
/// depend on `shaco-context` — the dispatcher only needs to know how to
/// hand an envelope to *something*.
pub trait Deliver: Send + Sync {
    fn deliver(&self, source: Handle, session: Session, kind: MessageKind) -> Result<(), DeliveryError>;

    /// Used only for diagnostic logging on failed delivery.
    fn debug_name(&self) -> &str {
        "?"
    }
}

/// The process-wide FIFO. Single producer, single consumer from the
/// standpoint of the main thread (spec.md §4.4/§5).
pub struct Dispatcher {
    queue: VecDeque<Envelope>,
    batch_size: usize,
}

impl Dispatcher {
    /// `batch_size` bounds how many messages a single `dispatch` call
    /// drains; the teacher's mailbox draining (`lunatic-process`) uses a
    /// similarly bounded batch rather than draining to empty, so a single
    /// noisy sender cannot starve the main loop's socket polling.
    pub fn new(batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch_size must be positive");
        Self {
            queue: VecDeque::new(),
            batch_size,
        }
    }

    pub fn push(&mut self, source: Handle, dest: Handle, session: Session, kind: MessageKind) {
        self.queue.push_back(Envelope {
            source,
            dest,
            session,
            kind,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Drains at most `batch_size` messages, resolving each destination
    /// through `registry`. Messages enqueued by callbacks invoked during
    /// this call are not drained until a subsequent call (non-recursive
    /// draining, per spec.md §4.4). Returns the number of messages
    /// delivered (including callback failures, which still count as
    /// "delivered" — only unresolved handles do not).
    pub fn dispatch<C>(&mut self, registry: &HandleRegistry<C>) -> usize
    where
        C: Deliver + ?Sized,
    {
        let mut delivered = 0;
        for _ in 0..self.batch_size {
            let Some(envelope) = self.queue.pop_front() else {
                break;
            };
            match registry.lookup(envelope.dest) {
                Some(ctx) => {
                    let type_tag = envelope.kind.type_tag();
                    if let Err(err) = ctx.deliver(envelope.source, envelope.session, envelope.kind) {
                        log::error!(
                            "Context callback fail:{} : {:x}->{}:{} session:{} type:{}",
                            err.0,
                            envelope.source.as_raw(),
                            ctx.debug_name(),
                            envelope.dest,
                            envelope.session,
                            type_tag,
                        );
                    }
                    delivered += 1;
                }
                None => {
                    log::error!("Handle not found {}", envelope.dest);
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Recorder {
        received: Mutex<Vec<(Handle, Session, u8)>>,
        fail_after: AtomicUsize,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                received: Mutex::new(Vec::new()),
                fail_after: AtomicUsize::new(usize::MAX),
            }
        }
    }

    impl Deliver for Recorder {
        fn deliver(&self, source: Handle, session: Session, kind: MessageKind) -> Result<(), DeliveryError> {
            self.received.lock().unwrap().push((source, session, kind.type_tag()));
            if self.fail_after.fetch_sub(1, Ordering::SeqCst) == 0 {
                return Err(DeliveryError(1));
            }
            Ok(())
        }
    }

    #[test]
    fn per_pair_fifo_order_preserved() {
        let mut registry: HandleRegistry<Recorder> = HandleRegistry::new(0);
        let b = registry.register(std::sync::Arc::new(Recorder::new()), "b");
        let a = Handle::new(0, 99);

        let mut dispatcher = Dispatcher::new(256);
        for session in 0..5 {
            dispatcher.push(a, b, session, MessageKind::Text(Bytes::from_static(b"hi")));
        }
        dispatcher.dispatch(&registry);

        let ctx = registry.lookup(b).unwrap();
        let sessions: Vec<_> = ctx.received.lock().unwrap().iter().map(|(_, s, _)| *s).collect();
        assert_eq!(sessions, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn unresolved_handle_is_dropped_and_logged() {
        let registry: HandleRegistry<Recorder> = HandleRegistry::new(0);
        let mut dispatcher = Dispatcher::new(256);
        let ghost = Handle::from_raw(0xdead_beef);
        dispatcher.push(Handle::NONE, ghost, 0, MessageKind::Text(Bytes::new()));
        assert_eq!(dispatcher.dispatch(&registry), 0);
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn dispatch_after_failed_handle_continues_normally() {
        let mut registry: HandleRegistry<Recorder> = HandleRegistry::new(0);
        let b = registry.register(std::sync::Arc::new(Recorder::new()), "b");
        let mut dispatcher = Dispatcher::new(256);
        dispatcher.push(Handle::NONE, Handle::from_raw(0xdead_beef), 0, MessageKind::Text(Bytes::new()));
        dispatcher.push(Handle::NONE, b, 1, MessageKind::Text(Bytes::new()));
        dispatcher.dispatch(&registry);
        let ctx = registry.lookup(b).unwrap();
        assert_eq!(ctx.received.lock().unwrap().len(), 1);
    }

    #[test]
    fn bounded_batch_requires_multiple_dispatch_calls() {
        let mut registry: HandleRegistry<Recorder> = HandleRegistry::new(0);
        let b = registry.register(std::sync::Arc::new(Recorder::new()), "b");
        let mut dispatcher = Dispatcher::new(2);
        for session in 0..5 {
            dispatcher.push(Handle::NONE, b, session, MessageKind::Text(Bytes::new()));
        }
        assert_eq!(dispatcher.dispatch(&registry), 2);
        assert_eq!(dispatcher.dispatch(&registry), 2);
        assert_eq!(dispatcher.dispatch(&registry), 1);
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn remote_envelope_round_trips_through_its_flattened_encoding() {
        let env = RemoteEnvelope {
            dest: Handle::new(5, 0x11),
            type_tag: 9,
            payload: Bytes::from_static(b"payload"),
        };
        let encoded = encode_remote_envelope(&env);
        let decoded = decode_remote_envelope(&encoded).unwrap();
        assert_eq!(decoded.dest, env.dest);
        assert_eq!(decoded.type_tag, env.type_tag);
        assert_eq!(decoded.payload, env.payload);
    }

    #[test]
    fn decode_remote_envelope_rejects_truncated_bytes() {
        assert!(decode_remote_envelope(&[0, 0, 0, 1]).is_none());
    }

    #[test]
    fn callback_failure_is_logged_but_does_not_stop_draining() {
        let mut registry: HandleRegistry<Recorder> = HandleRegistry::new(0);
        let recorder = Recorder::new();
        recorder.fail_after.store(0, Ordering::SeqCst);
        let b = registry.register(std::sync::Arc::new(recorder), "b");
        let mut dispatcher = Dispatcher::new(256);
        dispatcher.push(Handle::NONE, b, 0, MessageKind::Text(Bytes::new()));
        dispatcher.push(Handle::NONE, b, 1, MessageKind::Text(Bytes::new()));
        assert_eq!(dispatcher.dispatch(&registry), 2);
        let ctx = registry.lookup(b).unwrap();
        assert_eq!(ctx.received.lock().unwrap().len(), 2);
    }
}
