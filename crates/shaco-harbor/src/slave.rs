//! Slave table: per-remote-node connection bookkeeping and frame
//! reassembly.
//!
//! Grounded on spec.md §3 ("Harbor state": "fixed-size table of 256 slave
//! slots indexed by node id... socket descriptor, receive reassembly
//! buffer") and §4.5 ("Slave lifecycle states": empty → attached → broken →
//! empty). Slot 0 is permanently reserved (spec.md §9 open question,
//! resolved here and in DESIGN.md): attaching slave id 0 is always
//! rejected, and it is never assigned a connection.

use bytes::BytesMut;
use shaco_socket::ConnId;

use crate::frame::{self, Frame, FrameError};

const SLAVE_COUNT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveState {
    Empty,
    Attached,
    Broken,
}

struct Slave {
    state: SlaveState,
    conn: Option<ConnId>,
    recv_buf: BytesMut,
}

impl Slave {
    fn empty() -> Self {
        Self { state: SlaveState::Empty, conn: None, recv_buf: BytesMut::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SlaveError {
    #[error("slave id 0 is reserved")]
    ReservedSlaveId,
    #[error("slave id {0} is out of range")]
    OutOfRange(u32),
}

/// The 256-slot table. Slots are addressed by the remote node id they are
/// assigned to (spec.md: "indexed by node id").
pub struct SlaveTable {
    slots: Vec<Slave>,
}

impl Default for SlaveTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SlaveTable {
    pub fn new() -> Self {
        Self {
            slots: (0..SLAVE_COUNT).map(|_| Slave::empty()).collect(),
        }
    }

    fn slot_mut(&mut self, slave_id: u32) -> Result<&mut Slave, SlaveError> {
        if slave_id == 0 {
            return Err(SlaveError::ReservedSlaveId);
        }
        self.slots.get_mut(slave_id as usize).ok_or(SlaveError::OutOfRange(slave_id))
    }

    /// Attaches `conn` to `slave_id`, ingesting any pre-buffered bytes
    /// before the next socket read (spec.md §4.5: "carries an optional
    /// pre-buffered payload... that must be ingested before any socket
    /// reads"). Any frames already complete in `prebuffered` are left for
    /// the caller to extract with a follow-up [`SlaveTable::feed`] call with
    /// an empty `bytes` argument.
    pub fn attach(&mut self, slave_id: u32, conn: ConnId, prebuffered: &[u8]) -> Result<(), SlaveError> {
        let slot = self.slot_mut(slave_id)?;
        slot.state = SlaveState::Attached;
        slot.conn = Some(conn);
        slot.recv_buf.clear();
        slot.recv_buf.extend_from_slice(prebuffered);
        Ok(())
    }

    pub fn conn_for(&self, slave_id: u32) -> Option<ConnId> {
        self.slots.get(slave_id as usize).filter(|s| s.state == SlaveState::Attached).and_then(|s| s.conn)
    }

    pub fn slave_for_conn(&self, conn: ConnId) -> Option<u32> {
        self.slots.iter().position(|s| s.conn == Some(conn)).map(|i| i as u32)
    }

    pub fn state(&self, slave_id: u32) -> Option<SlaveState> {
        self.slots.get(slave_id as usize).map(|s| s.state)
    }

    /// Appends freshly read bytes to `slave_id`'s reassembly buffer and
    /// extracts every complete frame now available, in order, preserving
    /// any unconsumed partial frame for the next call (spec.md §8 property
    /// 4: "preserving order, losing no bytes, and never delivering partial
    /// frames"). On a malformed frame the slave is torn down to `Broken`
    /// immediately and the error is returned; the caller notifies the
    /// supervisor.
    pub fn feed(&mut self, slave_id: u32, bytes: &[u8]) -> Result<Vec<Frame>, FrameError> {
        let Some(slot) = self.slots.get_mut(slave_id as usize) else {
            return Ok(Vec::new());
        };
        slot.recv_buf.extend_from_slice(bytes);

        let mut frames = Vec::new();
        loop {
            match frame::try_decode(&slot.recv_buf) {
                Ok(Some((frame, consumed))) => {
                    frames.push(frame);
                    let _ = slot.recv_buf.split_to(consumed);
                }
                Ok(None) => break,
                Err(err) => {
                    slot.state = SlaveState::Broken;
                    slot.conn = None;
                    slot.recv_buf.clear();
                    return Err(err);
                }
            }
        }
        Ok(frames)
    }

    /// Tears a slave down to `Empty` (spec.md §4.5's lifecycle: `broken` →
    /// `empty`), e.g. after a socket error has already been reported.
    pub fn teardown(&mut self, slave_id: u32) {
        if let Some(slot) = self.slots.get_mut(slave_id as usize) {
            slot.state = SlaveState::Empty;
            slot.conn = None;
            slot.recv_buf.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slave_id_zero_is_permanently_reserved() {
        let mut table = SlaveTable::new();
        assert_eq!(table.attach(0, ConnId::from_raw(1), &[]), Err(SlaveError::ReservedSlaveId));
    }

    #[test]
    fn out_of_range_slave_id_is_rejected() {
        let mut table = SlaveTable::new();
        assert_eq!(table.attach(9999, ConnId::from_raw(1), &[]), Err(SlaveError::OutOfRange(9999)));
    }

    #[test]
    fn attach_then_lookup_by_conn_and_by_slave_id() {
        let mut table = SlaveTable::new();
        let conn = ConnId::from_raw(7);
        table.attach(3, conn, &[]).unwrap();
        assert_eq!(table.conn_for(3), Some(conn));
        assert_eq!(table.slave_for_conn(conn), Some(3));
        assert_eq!(table.state(3), Some(SlaveState::Attached));
    }

    #[test]
    fn prebuffered_bytes_yield_frames_on_an_empty_feed() {
        let mut table = SlaveTable::new();
        let conn = ConnId::from_raw(1);
        let frame_bytes = frame::encode(0, 1, 2, 0, 5, b"hi");
        table.attach(4, conn, &frame_bytes).unwrap();

        let frames = table.feed(4, &[]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].session, 5);
    }

    #[test]
    fn split_frame_feed_across_two_calls() {
        let mut table = SlaveTable::new();
        table.attach(1, ConnId::from_raw(1), &[]).unwrap();
        let whole = frame::encode(0, 1, 2, 0, 9, b"hello");
        let (first, second) = whole.split_at(5);

        assert!(table.feed(1, first).unwrap().is_empty());
        let frames = table.feed(1, second).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], b"hello");
    }

    #[test]
    fn malformed_frame_breaks_the_slave() {
        let mut table = SlaveTable::new();
        table.attach(2, ConnId::from_raw(1), &[]).unwrap();
        let bad = [0u8, 0, 0, 5, 0, 0, 0, 0, 0];

        assert!(table.feed(2, &bad).is_err());
        assert_eq!(table.state(2), Some(SlaveState::Broken));
        assert_eq!(table.conn_for(2), None);
    }

    #[test]
    fn teardown_returns_slot_to_empty() {
        let mut table = SlaveTable::new();
        table.attach(5, ConnId::from_raw(1), &[]).unwrap();
        table.teardown(5);
        assert_eq!(table.state(5), Some(SlaveState::Empty));
        assert_eq!(table.conn_for(5), None);
    }
}
