//! 32-bit handle registry with name aliasing.
//!
//! Grounded on `libshaco/shaco_handle.c`: two parallel dynamic arrays, one of
//! contexts indexed by `local_id - 1`, one of name/handle aliases appended in
//! registration order. The growth policy (capacity doubling, starting at 1)
//! is reproduced explicitly rather than left to `Vec`'s own amortized growth,
//! because the doubling points themselves are a testable property of the
//! original design.

use std::fmt;
use std::sync::Arc;

/// A 32-bit routable address. The high 8 bits are the node id, the low 24
/// bits are the local id. `Handle::NONE` (value 0) denotes "no addressee".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Handle(u32);

impl Handle {
    /// The "no addressee" sentinel.
    pub const NONE: Handle = Handle(0);

    pub const fn from_raw(raw: u32) -> Self {
        Handle(raw)
    }

    pub const fn new(node_id: u8, local_id: u32) -> Self {
        Handle(((node_id as u32) << 24) | (local_id & 0x00ff_ffff))
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }

    pub const fn node_id(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub const fn local_id(self) -> u32 {
        self.0 & 0x00ff_ffff
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:x})", self.0)
    }
}

impl From<u32> for Handle {
    fn from(raw: u32) -> Self {
        Handle(raw)
    }
}

impl From<Handle> for u32 {
    fn from(handle: Handle) -> Self {
        handle.0
    }
}

/// A handle registry, generic over the context type it stores so that
/// `shaco-handle` does not need to depend on `shaco-context` (the original
/// C translation unit has a circular include; the Rust layering resolves it
/// by making the registry agnostic to what a "context" actually is).
pub struct HandleRegistry<C: ?Sized> {
    self_node_id: u8,
    contexts: Vec<Option<Arc<C>>>,
    contexts_cap: usize,
    aliases: Vec<(String, Handle)>,
    aliases_cap: usize,
}

impl<C: ?Sized> HandleRegistry<C> {
    /// Both arrays start at capacity 1, matching `shaco_handle_init`.
    pub fn new(self_node_id: u8) -> Self {
        Self {
            self_node_id,
            contexts: Vec::with_capacity(1),
            contexts_cap: 1,
            aliases: Vec::with_capacity(1),
            aliases_cap: 1,
        }
    }

    pub fn self_node_id(&self) -> u8 {
        self.self_node_id
    }

    /// Appends the context and returns its freshly assigned handle, then
    /// registers `class_name` as an alias for it (the first instance of a
    /// class is discoverable by class name, per `shaco_handle_register`).
    pub fn register(&mut self, context: Arc<C>, class_name: &str) -> Handle {
        if self.contexts.len() == self.contexts_cap {
            self.contexts_cap *= 2;
        }
        self.contexts.push(Some(context));
        let local_id = self.contexts.len() as u32;
        let handle = Handle::new(self.self_node_id, local_id);
        self.bind_name(handle, class_name);
        handle
    }

    /// Current capacity of the contexts array (for testing the growth
    /// policy independent of the live count).
    pub fn contexts_capacity(&self) -> usize {
        self.contexts_cap
    }

    pub fn aliases_capacity(&self) -> usize {
        self.aliases_cap
    }

    /// Out-of-range or zero handles return `None` and log at `ERROR`, as
    /// `shaco_handle_context` does.
    pub fn lookup(&self, handle: Handle) -> Option<Arc<C>> {
        if handle.is_none() {
            log::error!("Handle not found {handle}");
            return None;
        }
        let idx = handle.local_id().checked_sub(1)? as usize;
        match self.contexts.get(idx) {
            Some(Some(ctx)) => Some(Arc::clone(ctx)),
            _ => {
                log::error!("Handle not found {handle}");
                None
            }
        }
    }

    /// Removes the registry entry, leaving a tombstone so later lookups
    /// resolve to "gone" instead of silently reusing the slot — the explicit
    /// contract chosen for the "deferred context destruction" open question
    /// (see DESIGN.md).
    pub fn kill(&mut self, handle: Handle) -> Option<Arc<C>> {
        let idx = handle.local_id().checked_sub(1)? as usize;
        self.contexts.get_mut(idx).and_then(|slot| slot.take())
    }

    /// Adds a `name -> handle` alias. Multiple names may map to the same
    /// handle.
    pub fn bind_name(&mut self, handle: Handle, name: impl Into<String>) {
        if self.aliases.len() == self.aliases_cap {
            self.aliases_cap *= 2;
        }
        self.aliases.push((name.into(), handle));
    }

    /// Scans aliases in insertion order and returns the first match — ties
    /// are broken by earliest binding.
    pub fn query(&self, name: &str) -> Option<Handle> {
        self.aliases
            .iter()
            .find(|(alias, _)| alias == name)
            .map(|(_, handle)| *handle)
    }

    pub fn context_count(&self) -> usize {
        self.contexts.iter().filter(|c| c.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(u32);

    #[test]
    fn first_service_gets_local_id_one() {
        let mut reg: HandleRegistry<Dummy> = HandleRegistry::new(0);
        let h = reg.register(Arc::new(Dummy(1)), "alpha");
        assert_eq!(h.local_id(), 1);
        assert_eq!(h.node_id(), 0);
    }

    #[test]
    fn handle_stability_across_registrations() {
        let mut reg: HandleRegistry<Dummy> = HandleRegistry::new(3);
        let h1 = reg.register(Arc::new(Dummy(1)), "a");
        let h2 = reg.register(Arc::new(Dummy(2)), "b");
        assert_ne!(h1, h2);
        assert_eq!(reg.lookup(h1).unwrap().0, 1);
        reg.register(Arc::new(Dummy(3)), "c");
        // h1 must still resolve to the same context after further registrations.
        assert_eq!(reg.lookup(h1).unwrap().0, 1);
        assert_eq!(h2.node_id(), 3);
    }

    #[test]
    fn lookup_none_handle_is_none() {
        let reg: HandleRegistry<Dummy> = HandleRegistry::new(0);
        assert!(reg.lookup(Handle::NONE).is_none());
    }

    #[test]
    fn lookup_out_of_range_is_none() {
        let reg: HandleRegistry<Dummy> = HandleRegistry::new(0);
        assert!(reg.lookup(Handle::new(0, 99)).is_none());
    }

    #[test]
    fn query_returns_first_binding_on_ties() {
        let mut reg: HandleRegistry<Dummy> = HandleRegistry::new(0);
        let h1 = reg.register(Arc::new(Dummy(1)), "shared");
        let h2 = reg.register(Arc::new(Dummy(2)), "other");
        reg.bind_name(h2, "shared");
        assert_eq!(reg.query("shared"), Some(h1));
    }

    #[test]
    fn query_missing_name_returns_none() {
        let reg: HandleRegistry<Dummy> = HandleRegistry::new(0);
        assert_eq!(reg.query("nope"), None);
    }

    #[test]
    fn capacity_doubles_on_overflow() {
        let mut reg: HandleRegistry<Dummy> = HandleRegistry::new(0);
        assert_eq!(reg.contexts_capacity(), 1);
        reg.register(Arc::new(Dummy(1)), "a");
        assert_eq!(reg.contexts_capacity(), 2);
        reg.register(Arc::new(Dummy(2)), "b");
        assert_eq!(reg.contexts_capacity(), 2);
        reg.register(Arc::new(Dummy(3)), "c");
        assert_eq!(reg.contexts_capacity(), 4);
    }

    #[test]
    fn kill_tombstones_slot() {
        let mut reg: HandleRegistry<Dummy> = HandleRegistry::new(0);
        let h = reg.register(Arc::new(Dummy(1)), "a");
        assert!(reg.lookup(h).is_some());
        assert!(reg.kill(h).is_some());
        assert!(reg.lookup(h).is_none());
        assert!(reg.kill(h).is_none());
    }

    #[test]
    fn handle_encoding_roundtrip() {
        let h = Handle::new(0x05, 0x11);
        assert_eq!(h.as_raw(), 0x0500_0011);
        assert_eq!(h.node_id(), 0x05);
        assert_eq!(h.local_id(), 0x11);
    }

    #[test]
    fn display_matches_c_hex_format() {
        let h = Handle::from_raw(0xdead_beef);
        assert_eq!(format!("{h}"), "deadbeef");
    }
}
