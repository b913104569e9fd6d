//! The harbor service: cross-node message bridge.
//!
//! Grounded on spec.md §3 ("Harbor state"), §4.5 ("Harbor Service"), and
//! `src-mod/mod_harbor.c`'s overall shape (a service that owns a fixed-size
//! slave table and a socket reactor, bridging local `REMOTE` dispatch to
//! framed TCP streams). Implemented as an ordinary `shaco_module::
//! ServiceClass` so it installs and is addressed exactly like any other
//! service; it isn't special-cased in the registry, only in what shared
//! runtime state (`Reactor`, `Dispatcher`) it is handed at construction.

mod frame;
mod slave;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use shaco_handle::Handle;
use shaco_message::{
    Dispatcher, MessageKind, Session, SocketEvent, TYPE_REMOTE, TYPE_SOCKET, TYPE_TEXT, decode_remote_envelope,
    decode_socket_event,
};
use shaco_module::{Callback, Instance, ServiceClass};
use shaco_socket::{ConnId, Reactor};

pub use frame::{Frame, FrameError};
pub use slave::{SlaveError, SlaveState, SlaveTable};

#[derive(Debug, thiserror::Error)]
pub enum HarborError {
    #[error(transparent)]
    Slave(#[from] SlaveError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Per-instance harbor state: the slave table, the handle everything is
/// addressed at, and the supervisor to notify on disconnect (spec.md §3:
/// "a handle identifying the control service that the harbor reports
/// connection losses to").
struct HarborState {
    self_node_id: u8,
    self_handle: Handle,
    supervisor: Handle,
    slaves: SlaveTable,
    reactor: Arc<Mutex<Reactor>>,
    dispatcher: Arc<Mutex<Dispatcher>>,
}

/// The capability shared across every harbor instance. In practice there is
/// only ever one (spec.md's node process runs a single harbor), but the
/// `ServiceClass` contract doesn't assume that. Holds the process-wide
/// reactor and dispatcher handles every instance clones into its state on
/// `create`.
pub struct HarborClass {
    self_node_id: u8,
    reactor: Arc<Mutex<Reactor>>,
    dispatcher: Arc<Mutex<Dispatcher>>,
}

impl HarborClass {
    pub fn new(self_node_id: u8, reactor: Arc<Mutex<Reactor>>, dispatcher: Arc<Mutex<Dispatcher>>) -> Self {
        Self { self_node_id, reactor, dispatcher }
    }
}

impl ServiceClass for HarborClass {
    fn create(&self) -> Instance {
        Box::new(Arc::new(Mutex::new(HarborState {
            self_node_id: self.self_node_id,
            self_handle: Handle::NONE,
            supervisor: Handle::NONE,
            slaves: SlaveTable::new(),
            reactor: Arc::clone(&self.reactor),
            dispatcher: Arc::clone(&self.dispatcher),
        })))
    }

    /// `args`, if non-empty, names the supervisor handle in hex (matching
    /// `Handle`'s `Display`). An empty `args` leaves disconnect
    /// notifications with nowhere to go; they are logged and dropped (see
    /// `teardown_and_notify`).
    fn init(
        &self,
        instance: &mut Instance,
        handle: u32,
        args: &str,
        install_callback: &mut dyn FnMut(Callback),
    ) -> Result<(), String> {
        let shared = instance
            .downcast_ref::<Arc<Mutex<HarborState>>>()
            .ok_or_else(|| "instance is not a harbor instance".to_string())?;

        {
            let mut state = shared.lock().unwrap();
            state.self_handle = Handle::from_raw(handle);
            let args = args.trim();
            if !args.is_empty() {
                let raw = u32::from_str_radix(args, 16).map_err(|e| format!("bad supervisor handle '{args}': {e}"))?;
                state.supervisor = Handle::from_raw(raw);
            }
        }

        let shared = Arc::clone(shared);
        install_callback(Box::new(move |source, session, type_tag, payload| {
            handle_message(&shared, Handle::from_raw(source), session, type_tag, payload)
        }));
        Ok(())
    }
}

/// Entry point for every message addressed to the harbor, whether it
/// arrived as a local `REMOTE` send, a `TEXT` control command, or a
/// socket-reactor event (spec.md §4.5 routes all three through one
/// service). Returns 0 on success, matching the callback ABI.
fn handle_message(state: &Arc<Mutex<HarborState>>, source: Handle, session: Session, type_tag: u8, payload: Vec<u8>) -> i32 {
    match type_tag {
        TYPE_REMOTE => handle_outbound_remote(state, source, session, &payload),
        TYPE_TEXT => handle_control_text(state, &payload),
        TYPE_SOCKET => handle_socket_event(state, &payload),
        other => {
            log::error!("harbor: unexpected message type {other}");
            -1
        }
    }
}

/// Outbound path: a local `REMOTE` send arrives flattened as `(dest, inner
/// type, payload)`; locate the slave for `dest`'s node id and emit one
/// frame (spec.md §4.5 "Outbound path": "Failure to locate the slave logs
/// at ERROR and drops the message").
fn handle_outbound_remote(state: &Arc<Mutex<HarborState>>, source: Handle, session: Session, payload: &[u8]) -> i32 {
    let Some(env) = decode_remote_envelope(payload) else {
        log::error!("harbor: malformed remote envelope from {source}");
        return -1;
    };

    let guard = state.lock().unwrap();
    let self_node_id = guard.self_node_id;
    let Some(conn) = guard.slaves.conn_for(env.dest.node_id() as u32) else {
        log::error!("harbor: no slave for node {} (dest {})", env.dest.node_id(), env.dest);
        return -1;
    };

    let frame = frame::encode(self_node_id, source.local_id(), env.dest.local_id() as u8, env.type_tag, session, &env.payload);
    guard.reactor.lock().unwrap().send(conn, frame.freeze());
    0
}

/// Control-command path: only `S <sock_fd> <slave_id> <addr> <bufp>
/// <bufsz>` (attach) is ever received; `D <slave_id>` is only ever *sent*,
/// to the supervisor (spec.md §6).
fn handle_control_text(state: &Arc<Mutex<HarborState>>, payload: &[u8]) -> i32 {
    let text = String::from_utf8_lossy(payload);
    let mut fields = text.split_whitespace();
    match fields.next() {
        Some("S") => {
            let rest: Vec<&str> = fields.collect();
            match parse_attach(&rest) {
                Ok((sock_fd, slave_id, prebuffered)) => {
                    let mut guard = state.lock().unwrap();
                    if let Err(err) = guard.slaves.attach(slave_id, ConnId::from_raw(sock_fd), &prebuffered) {
                        log::error!("harbor: attach slave {slave_id} failed: {err}");
                        return -1;
                    }
                    deliver_prebuffered_frames(&mut guard, slave_id);
                    0
                }
                Err(err) => {
                    log::error!("harbor: bad S command: {err}");
                    -1
                }
            }
        }
        other => {
            log::error!("harbor: unknown control command: {other:?}");
            -1
        }
    }
}

/// Parses `S`'s fields, the opcode already consumed. `addr` is parsed but
/// intentionally unused (spec.md §9: "preserve acceptance, treat it as
/// opaque" — `mod_harbor.c`'s own `// todo drop addr field`). `bufp` is
/// taken as a hex-encoded byte string rather than a raw pointer: the
/// original's handoff-by-pointer has no meaningful Rust translation across
/// a `TEXT` command boundary, so this reinterprets the same two fields
/// (pre-buffered bytes, their length) without the pointer (see DESIGN.md).
fn parse_attach(fields: &[&str]) -> Result<(u32, u32, Vec<u8>), String> {
    if fields.len() != 5 {
        return Err(format!("expected 5 fields, got {}", fields.len()));
    }
    let sock_fd: u32 = fields[0].parse().map_err(|_| format!("bad sock_fd '{}'", fields[0]))?;
    let slave_id: u32 = fields[1].parse().map_err(|_| format!("bad slave_id '{}'", fields[1]))?;
    let bufp = fields[3];
    let bufsz: usize = fields[4].parse().map_err(|_| format!("bad bufsz '{}'", fields[4]))?;

    let prebuffered = if bufp == "0" && bufsz == 0 {
        Vec::new()
    } else {
        hex::decode(bufp).map_err(|e| format!("bad bufp hex '{bufp}': {e}"))?
    };
    if prebuffered.len() != bufsz {
        log::warn!("harbor: S command bufsz {bufsz} does not match decoded length {}", prebuffered.len());
    }
    Ok((sock_fd, slave_id, prebuffered))
}

fn deliver_prebuffered_frames(state: &mut HarborState, slave_id: u32) {
    match state.slaves.feed(slave_id, &[]) {
        Ok(frames) => dispatch_inbound_frames(state, frames),
        Err(err) => teardown_and_notify(state, slave_id, err.to_string()),
    }
}

/// Inbound path: socket-reactor events addressed to the harbor (data,
/// disconnect). A listener `Accepted` event is not expected here — slaves
/// are attached explicitly via the `S` command, not accepted by a listener
/// the harbor itself owns — and is logged and ignored.
fn handle_socket_event(state: &Arc<Mutex<HarborState>>, payload: &[u8]) -> i32 {
    let Some(event) = decode_socket_event(payload) else {
        log::error!("harbor: malformed socket event");
        return -1;
    };

    let mut guard = state.lock().unwrap();
    match event {
        SocketEvent::Accepted { id, addr } => {
            log::warn!("harbor: unexpected accept on connection {id} ({addr}), ignoring");
            0
        }
        SocketEvent::Data { id, bytes } => {
            let conn = ConnId::from_raw(id);
            let Some(slave_id) = guard.slaves.slave_for_conn(conn) else {
                log::error!("harbor: data on unattached connection {id}");
                return -1;
            };
            match guard.slaves.feed(slave_id, &bytes) {
                Ok(frames) => {
                    dispatch_inbound_frames(&mut guard, frames);
                    0
                }
                Err(err) => {
                    teardown_and_notify(&mut guard, slave_id, err.to_string());
                    -1
                }
            }
        }
        SocketEvent::SockErr { id, reason } => {
            let conn = ConnId::from_raw(id);
            if let Some(slave_id) = guard.slaves.slave_for_conn(conn) {
                teardown_and_notify(&mut guard, slave_id, reason);
            }
            0
        }
    }
}

/// Translates each decoded frame into a local dispatch and pushes it
/// (spec.md §4.5 "Inbound path": "each frame is translated into a local
/// dispatch whose source = header.source, dest = header.dest, session =
/// header.session, type = header.type, payload = bytes after header").
fn dispatch_inbound_frames(state: &mut HarborState, frames: Vec<Frame>) {
    let self_node_id = state.self_node_id;
    let mut dispatcher = state.dispatcher.lock().unwrap();
    for frame in frames {
        let dest = Handle::new(self_node_id, frame.dest as u32);
        let kind = decode_inbound_kind(frame.type_tag, Bytes::copy_from_slice(&frame.payload));
        dispatcher.push(frame.source_handle(), dest, frame.session, kind);
    }
}

/// Reconstructs a [`MessageKind`] from a decoded frame's raw `(type,
/// bytes)` pair, so the receiving service sees the same shape it would from
/// a local send of that type. Any tag this crate does not otherwise
/// recognize — including `TYPE_REMOTE`, which never arises from the wire
/// since this format does not chain harbors — is delivered as a raw `User`
/// code.
fn decode_inbound_kind(type_tag: u8, payload: Bytes) -> MessageKind {
    match type_tag {
        TYPE_TEXT => MessageKind::Text(payload),
        TYPE_SOCKET => match decode_socket_event(&payload) {
            Some(event) => MessageKind::Socket(event),
            None => MessageKind::User(TYPE_SOCKET, payload),
        },
        other => MessageKind::User(other, payload),
    }
}

fn teardown_and_notify(state: &mut HarborState, slave_id: u32, reason: String) {
    state.slaves.teardown(slave_id);
    log::error!("harbor: slave {slave_id} torn down: {reason}");
    if state.supervisor.is_none() {
        return;
    }
    let source = state.self_handle;
    let supervisor = state.supervisor;
    state
        .dispatcher
        .lock()
        .unwrap()
        .push(source, supervisor, 0, MessageKind::Text(Bytes::from(format!("D {slave_id}"))));
}
