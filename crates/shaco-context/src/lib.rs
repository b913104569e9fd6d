//! Per-service context: module, instance, callback, handle.
//!
//! Grounded on `libshaco/shaco_context.c` (`shaco_context_new`, `_send`,
//! `shaco_context_callback`) and spec.md §4.3. `Context::create` follows the
//! source's four-step sequence exactly: resolve module, instantiate, register
//! (obtaining a handle), then run `init` — and, per the documented design
//! weakness in spec.md §4.3/§9, a failing `init` still leaves the context
//! registered rather than rolling back the handle assignment.

use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use shaco_handle::{Handle, HandleRegistry};
use shaco_message::{
    DeliveryError, Deliver, MessageKind, Session, TYPE_REMOTE, TYPE_SOCKET, TYPE_TEXT, encode_remote_envelope,
    encode_socket_event,
};
use shaco_module::{Callback, Instance, ModuleError, ModuleLoader, ServiceClass};

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Module(#[from] ModuleError),
}

/// One per live service instance. `handle` is set exactly once, during
/// `ContextRegistry::create`, and never changes afterward (spec.md §3's
/// "once registered, a context's handle never changes" invariant).
pub struct Context {
    module: Arc<dyn ServiceClass>,
    service_name: String,
    handle: OnceLock<Handle>,
    instance: Mutex<Instance>,
    callback: Mutex<Option<Callback>>,
}

impl Context {
    pub fn handle(&self) -> Handle {
        *self.handle.get().expect("handle is set during ContextRegistry::create")
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Installs a new callback, overwriting any previous one without
    /// notification (spec.md §4.3 `SetCallback`: "latest-wins").
    pub fn set_callback(&self, cb: Callback) {
        *self.callback.lock().unwrap() = Some(cb);
    }

    pub fn has_callback(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }

    /// Delivers an OS signal to the instance (`<name>_signal`, spec.md §6's
    /// `SIGUSR1`/`SIGINT`/`SIGTERM` are routed to the runtime, not to
    /// individual services, but user-defined classes may still want this
    /// for their own teardown).
    pub fn signal(&self, signo: i32) {
        let mut instance = self.instance.lock().unwrap();
        self.module.signal(&mut instance, signo);
    }
}

/// Encodes a [`MessageKind`] into the `(type_tag, payload)` pair a
/// service-class callback receives, matching the original's "payload is
/// whatever bytes correspond to the type tag" contract (spec.md §3: TEXT is
/// a byte string, SOCKET is an event struct, REMOTE is an envelope). Neither
/// socket events nor remote envelopes have a native C struct counterpart in
/// this narrow ABI, so both are flattened to a small tagged encoding the
/// receiving service decodes on the other side (`shaco-harbor`, the only
/// consumer of either, via `decode_socket_event`/`decode_remote_envelope`).
fn encode(kind: MessageKind) -> (u8, Vec<u8>) {
    match kind {
        MessageKind::Text(bytes) => (TYPE_TEXT, bytes.to_vec()),
        MessageKind::Remote(env) => (TYPE_REMOTE, encode_remote_envelope(&env)),
        MessageKind::User(tag, bytes) => (tag, bytes.to_vec()),
        MessageKind::Socket(event) => (TYPE_SOCKET, encode_socket_event(&event)),
    }
}

impl Deliver for Context {
    fn deliver(&self, source: Handle, session: Session, kind: MessageKind) -> Result<(), DeliveryError> {
        let (type_tag, payload) = encode(kind);
        let mut guard = self.callback.lock().unwrap();
        match guard.as_mut() {
            Some(cb) => {
                let rc = cb(source.as_raw(), session, type_tag, payload);
                if rc == 0 { Ok(()) } else { Err(DeliveryError(rc)) }
            }
            // No callback installed yet (init hasn't run or didn't install
            // one): the message is accepted and silently dropped, matching
            // a null `context->cb` in the C source (`shaco_context_send`
            // only invokes the callback if non-null).
            None => Ok(()),
        }
    }

    fn debug_name(&self) -> &str {
        &self.service_name
    }
}

/// Owns the handle registry together with the bookkeeping
/// `Context::create` needs (module resolution, instance construction,
/// callback wiring).
pub struct ContextRegistry {
    handles: HandleRegistry<Context>,
}

impl ContextRegistry {
    pub fn new(self_node_id: u8) -> Self {
        Self {
            handles: HandleRegistry::new(self_node_id),
        }
    }

    /// `Context::create` per spec.md §4.3: resolve → instantiate → register
    /// → init.
    pub fn create(
        &mut self,
        loader: &mut ModuleLoader,
        requested_name: &str,
        args: &str,
    ) -> Result<Arc<Context>, ContextError> {
        let (class, service_name) = loader.resolve(requested_name)?;
        let instance = class.create();
        let ctx = Arc::new(Context {
            module: class,
            service_name,
            handle: OnceLock::new(),
            instance: Mutex::new(instance),
            callback: Mutex::new(None),
        });

        let handle = self.handles.register(Arc::clone(&ctx), ctx.service_name());
        ctx.handle
            .set(handle)
            .unwrap_or_else(|_| unreachable!("handle is only ever set once, here"));

        let mut installed: Option<Callback> = None;
        let init_result = {
            let mut instance = ctx.instance.lock().unwrap();
            ctx.module
                .init(&mut instance, handle.as_raw(), args, &mut |cb| installed = Some(cb))
        };
        if let Some(cb) = installed {
            ctx.set_callback(cb);
        }
        if let Err(err) = init_result {
            log::error!(
                "service '{}' init failed, context stays registered at {handle}: {err}",
                ctx.service_name()
            );
        }

        Ok(ctx)
    }

    pub fn lookup(&self, handle: Handle) -> Option<Arc<Context>> {
        self.handles.lookup(handle)
    }

    pub fn query(&self, name: &str) -> Option<Handle> {
        self.handles.query(name)
    }

    pub fn bind_name(&mut self, handle: Handle, name: impl Into<String>) {
        self.handles.bind_name(handle, name)
    }

    pub fn context_count(&self) -> usize {
        self.handles.context_count()
    }

    /// Explicit teardown (spec.md §9 open question (b)): removes the
    /// registry entry, runs `free` on the reclaimed instance, and leaves a
    /// tombstone so later sends resolve to "gone". Returns `false` if the
    /// handle was already dead or never existed.
    pub fn kill(&mut self, handle: Handle) -> bool {
        let Some(ctx) = self.handles.kill(handle) else {
            return false;
        };
        match Arc::try_unwrap(ctx) {
            Ok(ctx) => {
                let instance = ctx.instance.into_inner().unwrap();
                ctx.module.free(instance);
            }
            Err(still_shared) => {
                log::error!(
                    "kill({}): instance for '{}' still has outstanding references, free() skipped",
                    handle,
                    still_shared.service_name()
                );
            }
        }
        true
    }

    pub fn underlying(&self) -> &HandleRegistry<Context> {
        &self.handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shaco_module::ServiceClass as _;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Echo {
        freed: Arc<AtomicBool>,
    }

    impl ServiceClass for Echo {
        fn create(&self) -> Instance {
            Box::new(Vec::<(u32, i32, u8, Vec<u8>)>::new())
        }

        fn init(
            &self,
            _instance: &mut Instance,
            _handle: u32,
            _args: &str,
            install_callback: &mut dyn FnMut(Callback),
        ) -> Result<(), String> {
            install_callback(Box::new(|_src, _session, _ty, _payload| 0));
            Ok(())
        }

        fn free(&self, _instance: Instance) {
            self.freed.store(true, Ordering::SeqCst);
        }
    }

    struct FailingInit;
    impl ServiceClass for FailingInit {
        fn create(&self) -> Instance {
            Box::new(())
        }
        fn init(
            &self,
            _instance: &mut Instance,
            _handle: u32,
            _args: &str,
            _install_callback: &mut dyn FnMut(Callback),
        ) -> Result<(), String> {
            Err("boom".to_string())
        }
    }

    fn loader_with(name: &str, class: Arc<dyn ServiceClass>) -> ModuleLoader {
        let mut loader = ModuleLoader::new(std::env::temp_dir());
        loader.register(name, class);
        loader
    }

    #[test]
    fn create_resolves_instantiates_registers_and_inits() {
        let mut loader = loader_with("echo", Arc::new(Echo { freed: Arc::new(AtomicBool::new(false)) }));
        let mut registry = ContextRegistry::new(0);
        let ctx = registry.create(&mut loader, "echo", "").unwrap();
        assert!(ctx.has_callback());
        assert_eq!(registry.lookup(ctx.handle()).unwrap().handle(), ctx.handle());
    }

    #[test]
    fn failing_init_still_leaves_context_registered() {
        let mut loader = loader_with("bad", Arc::new(FailingInit));
        let mut registry = ContextRegistry::new(0);
        let ctx = registry.create(&mut loader, "bad", "").unwrap();
        assert!(!ctx.has_callback());
        assert!(registry.lookup(ctx.handle()).is_some());
    }

    #[test]
    fn kill_runs_free_and_tombstones_handle() {
        let freed = Arc::new(AtomicBool::new(false));
        let mut loader = loader_with("echo", Arc::new(Echo { freed: freed.clone() }));
        let mut registry = ContextRegistry::new(0);
        let ctx = registry.create(&mut loader, "echo", "").unwrap();
        let handle = ctx.handle();
        drop(ctx);

        assert!(registry.kill(handle));
        assert!(freed.load(Ordering::SeqCst));
        assert!(registry.lookup(handle).is_none());
        assert!(!registry.kill(handle));
    }

    #[test]
    fn deliver_with_no_callback_is_a_quiet_noop() {
        let mut loader = loader_with("bad", Arc::new(FailingInit));
        let mut registry = ContextRegistry::new(0);
        let ctx = registry.create(&mut loader, "bad", "").unwrap();
        let result = ctx.deliver(Handle::NONE, 0, MessageKind::Text(Bytes::from_static(b"hi")));
        assert!(result.is_ok());
    }

    #[test]
    fn deliver_routes_type_tag_and_payload_to_callback() {
        let mut loader = loader_with("echo", Arc::new(Echo { freed: Arc::new(AtomicBool::new(false)) }));
        let mut registry = ContextRegistry::new(0);
        let ctx = registry.create(&mut loader, "echo", "").unwrap();
        let result = ctx.deliver(Handle::new(0, 9), 3, MessageKind::User(42, Bytes::from_static(b"x")));
        assert!(result.is_ok());
    }
}
