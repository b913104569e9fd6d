//! Dynamic service-class loader, cached by name.
//!
//! Grounded on `libshaco/shaco_module.c` (`dlopen`/`dlsym` of
//! `<name>_create/_init/_free/_signal`) and the §9 design note recommending
//! a capability interface `{Create, Init, Free, Signal}` in place of the
//! "function pointer struct per module" idiom — mirrored after
//! `lunatic-plugin::Capability`/`PluginRegistry`'s shape (a registry keyed
//! by name, `Arc`-shared entries, insertion-order caching).
//!
//! `shaco-module` intentionally does not depend on `shaco-context` or
//! `shaco-handle`: the C translation units have a circular include
//! (`shaco_module.h` ⇄ `shaco_context.h`) that the Rust layering resolves by
//! keeping the loader agnostic to what a "context" or "handle" is — it
//! hands `init` a raw `u32` handle and a generic callback installer.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("module '{0}' not found")]
    NotFound(String),
    #[error("init failed for module '{0}': {1}")]
    InitFailed(String, String),
    #[cfg(feature = "dylib")]
    #[error("failed to load dylib for module '{0}': {1}")]
    LoadFailed(String, #[source] libloading::Error),
    #[cfg(feature = "dylib")]
    #[error("module '{0}' is missing required symbol '{1}'")]
    MissingSymbol(String, &'static str),
}

/// Per-instance state a service owns. Classes may downcast this back to
/// their concrete type inside `init`/`signal`.
pub type Instance = Box<dyn Any + Send + Sync>;

/// A message delivery callback a class installs during `init`. Parameters
/// mirror spec.md §3's Message tuple minus the destination (always "this
/// context"): source handle, session, type tag, payload. Returns non-zero
/// to signal failure, logged by the dispatcher (spec.md §4.3).
pub type Callback = Box<dyn FnMut(u32, i32, u8, Vec<u8>) -> i32 + Send>;

/// Capability interface a loaded service class exposes. One implementation
/// per class, shared (`Arc`) across every instance of that class.
pub trait ServiceClass: Send + Sync {
    /// Allocates fresh per-instance state. Always succeeds — failures are
    /// reported from `init`, matching `<name>_create`'s `void*` return
    /// (never null in the original) versus `<name>_init`'s `int` status.
    fn create(&self) -> Instance;

    /// Runs synchronously during `Context::create`. May install a callback
    /// via `install_callback`. A non-zero/`Err` result is logged by the
    /// caller; the instance and its (possibly absent) callback are kept
    /// regardless (spec.md §4.3's documented "init may fail, context stays
    /// registered" weakness).
    fn init(
        &self,
        instance: &mut Instance,
        handle: u32,
        args: &str,
        install_callback: &mut dyn FnMut(Callback),
    ) -> Result<(), String>;

    /// Optional teardown, run by `Kill`/process shutdown. Default: no-op.
    fn free(&self, _instance: Instance) {}

    /// Optional signal delivery (matches `<name>_signal`). Default: no-op.
    fn signal(&self, _instance: &mut Instance, _signo: i32) {}
}

/// Name under which `shaco-script` registers itself; any class name
/// beginning with `.` is rewritten to this, per spec.md §4.2.
pub const SCRIPTING_CLASS: &str = "lua";

enum Loaded {
    Registered(Arc<dyn ServiceClass>),
    #[cfg(feature = "dylib")]
    Dylib(Arc<DylibServiceClass>),
}

impl Loaded {
    fn as_class(&self) -> Arc<dyn ServiceClass> {
        match self {
            Loaded::Registered(c) => Arc::clone(c),
            #[cfg(feature = "dylib")]
            Loaded::Dylib(c) => c.clone() as Arc<dyn ServiceClass>,
        }
    }
}

/// Loads named service classes, caching by name, with an in-process
/// registration path (used by the bundled `shaco-harbor`/`shaco-script`
/// classes and by tests) and an optional `dylib` path that mirrors the
/// original plugin-directory `dlopen` model.
pub struct ModuleLoader {
    // Kept regardless of the `dylib` feature so downstream crates have one
    // constructor signature to call; only consulted by `load_dylib`.
    modpath: std::path::PathBuf,
    cache: HashMap<String, Loaded>,
    insertion_order: Vec<String>,
}

impl ModuleLoader {
    /// `modpath` is the plugin directory (`modpath` option, spec.md §6);
    /// it is inert unless the `dylib` feature is enabled.
    pub fn new(modpath: impl Into<std::path::PathBuf>) -> Self {
        Self {
            modpath: modpath.into(),
            cache: HashMap::new(),
            insertion_order: Vec::new(),
        }
    }

    /// Registers an in-process class under `name`, available immediately
    /// without touching the plugin directory.
    pub fn register(&mut self, name: impl Into<String>, class: Arc<dyn ServiceClass>) {
        let name = name.into();
        if !self.cache.contains_key(&name) {
            self.insertion_order.push(name.clone());
        }
        self.cache.insert(name, Loaded::Registered(class));
    }

    /// Resolves a class name, rewriting a leading `.` to [`SCRIPTING_CLASS`]
    /// per spec.md §4.2. Returns the resolved class and the *original*
    /// requested name (the caller preserves this as the context's service
    /// name even when the module was rewritten).
    pub fn resolve(&mut self, requested: &str) -> Result<(Arc<dyn ServiceClass>, String), ModuleError> {
        let lookup_name = if let Some(rest) = requested.strip_prefix('.') {
            let _ = rest; // the suffix after `.` is the script's own name, not a second class
            SCRIPTING_CLASS
        } else {
            requested
        };

        if let Some(loaded) = self.cache.get(lookup_name) {
            return Ok((loaded.as_class(), requested.to_string()));
        }

        #[cfg(feature = "dylib")]
        {
            let class = self.load_dylib(lookup_name)?;
            let class_dyn = class.clone() as Arc<dyn ServiceClass>;
            self.cache.insert(lookup_name.to_string(), Loaded::Dylib(class));
            self.insertion_order.push(lookup_name.to_string());
            return Ok((class_dyn, requested.to_string()));
        }

        #[cfg(not(feature = "dylib"))]
        {
            Err(ModuleError::NotFound(lookup_name.to_string()))
        }
    }

    pub fn loaded_names(&self) -> &[String] {
        &self.insertion_order
    }

    #[cfg(feature = "dylib")]
    fn load_dylib(&self, name: &str) -> Result<Arc<DylibServiceClass>, ModuleError> {
        DylibServiceClass::load(&self.modpath, name).map(Arc::new)
    }
}

#[cfg(feature = "dylib")]
mod dylib {
    use super::*;
    use libloading::{Library, Symbol};
    use std::ffi::{CString, c_char, c_int, c_void};

    type CreateFn = unsafe extern "C" fn() -> *mut c_void;
    type InitFn = unsafe extern "C" fn(*mut c_void, u32, *const c_char) -> c_int;
    type FreeFn = unsafe extern "C" fn(*mut c_void);
    type SignalFn = unsafe extern "C" fn(*mut c_void, c_int);

    /// A raw `void*` handed to us by a loaded `.so`/`.dylib`. Sending it
    /// across threads is only safe because the runtime's concurrency model
    /// (spec.md §5) guarantees a single-threaded caller; we uphold that by
    /// never exposing `Instance` outside of `ModuleLoader::resolve`'s
    /// single-threaded callers.
    struct RawInstance(*mut c_void);
    unsafe impl Send for RawInstance {}
    unsafe impl Sync for RawInstance {}

    pub struct DylibServiceClass {
        // Kept alive for the process lifetime; dropping it would invalidate
        // the resolved symbols.
        _library: Library,
        create: CreateFn,
        init: InitFn,
        free: Option<FreeFn>,
        signal: Option<SignalFn>,
    }

    impl DylibServiceClass {
        pub fn load(modpath: &std::path::Path, name: &str) -> Result<Self, super::ModuleError> {
            let file_name = format!("{name}{}", std::env::consts::DLL_SUFFIX);
            let path = modpath.join(file_name);
            let library = unsafe { Library::new(&path) }
                .map_err(|e| super::ModuleError::LoadFailed(name.to_string(), e))?;

            let create_sym = format!("{name}_create\0");
            let init_sym = format!("{name}_init\0");
            let free_sym = format!("{name}_free\0");
            let signal_sym = format!("{name}_signal\0");

            let create: Symbol<CreateFn> = unsafe { library.get(create_sym.as_bytes()) }
                .map_err(|_| super::ModuleError::MissingSymbol(name.to_string(), "create"))?;
            let init: Symbol<InitFn> = unsafe { library.get(init_sym.as_bytes()) }
                .map_err(|_| super::ModuleError::MissingSymbol(name.to_string(), "init"))?;
            let free: Option<Symbol<FreeFn>> = unsafe { library.get(free_sym.as_bytes()) }.ok();
            let signal: Option<Symbol<SignalFn>> = unsafe { library.get(signal_sym.as_bytes()) }.ok();

            let create = *create;
            let init = *init;
            let free = free.map(|f| *f);
            let signal = signal.map(|f| *f);

            Ok(Self {
                _library: library,
                create,
                init,
                free,
                signal,
            })
        }
    }

    impl super::ServiceClass for DylibServiceClass {
        fn create(&self) -> super::Instance {
            let ptr = unsafe { (self.create)() };
            Box::new(RawInstance(ptr))
        }

        fn init(
            &self,
            instance: &mut super::Instance,
            handle: u32,
            args: &str,
            _install_callback: &mut dyn FnMut(super::Callback),
        ) -> Result<(), String> {
            let raw = instance
                .downcast_ref::<RawInstance>()
                .ok_or_else(|| "instance is not a dylib instance".to_string())?;
            let c_args = CString::new(args).map_err(|e| e.to_string())?;
            let rc = unsafe { (self.init)(raw.0, handle, c_args.as_ptr()) };
            if rc == 0 { Ok(()) } else { Err(format!("init returned {rc}")) }
        }

        fn free(&self, instance: super::Instance) {
            if let Ok(raw) = instance.downcast::<RawInstance>() {
                if let Some(free) = self.free {
                    unsafe { free(raw.0) };
                }
            }
        }

        fn signal(&self, instance: &mut super::Instance, signo: i32) {
            if let (Some(signal), Some(raw)) = (self.signal, instance.downcast_ref::<RawInstance>()) {
                unsafe { signal(raw.0, signo) };
            }
        }
    }

}

#[cfg(feature = "dylib")]
pub use dylib::DylibServiceClass;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Echo {
        inits: Mutex<Vec<String>>,
    }

    impl ServiceClass for Echo {
        fn create(&self) -> Instance {
            Box::new(0u32)
        }

        fn init(
            &self,
            instance: &mut Instance,
            handle: u32,
            args: &str,
            install_callback: &mut dyn FnMut(Callback),
        ) -> Result<(), String> {
            *instance.downcast_mut::<u32>().unwrap() = handle;
            self.inits.lock().unwrap().push(args.to_string());
            install_callback(Box::new(|_src, _session, _ty, _payload| 0));
            Ok(())
        }
    }

    #[test]
    fn register_then_resolve_returns_same_class() {
        let mut loader = loader_without_dylib();
        loader.register("echo", Arc::new(Echo { inits: Mutex::new(vec![]) }));
        let (class, name) = loader.resolve("echo").unwrap();
        assert_eq!(name, "echo");
        let mut instance = class.create();
        let mut installed = None;
        class
            .init(&mut instance, 7, "hello", &mut |cb| installed = Some(cb))
            .unwrap();
        assert!(installed.is_some());
    }

    #[test]
    fn dot_prefixed_name_rewrites_to_scripting_class_but_keeps_original_name() {
        let mut loader = loader_without_dylib();
        loader.register(SCRIPTING_CLASS, Arc::new(Echo { inits: Mutex::new(vec![]) }));
        let (_, name) = loader.resolve(".myapp").unwrap();
        assert_eq!(name, ".myapp");
    }

    #[test]
    fn unresolvable_name_is_not_found() {
        let mut loader = loader_without_dylib();
        assert!(matches!(loader.resolve("nope"), Err(ModuleError::NotFound(_))));
    }

    #[test]
    fn classes_are_cached_by_name_in_insertion_order() {
        let mut loader = loader_without_dylib();
        loader.register("a", Arc::new(Echo { inits: Mutex::new(vec![]) }));
        loader.register("b", Arc::new(Echo { inits: Mutex::new(vec![]) }));
        loader.resolve("a").unwrap();
        assert_eq!(loader.loaded_names(), &["a".to_string(), "b".to_string()]);
    }

    fn loader_without_dylib() -> ModuleLoader {
        ModuleLoader::new(std::env::temp_dir())
    }
}
