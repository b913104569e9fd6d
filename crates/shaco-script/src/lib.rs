//! Scripting-service bridge: embeds a Lua interpreter as an ordinary leaf
//! service.
//!
//! Grounded on `src-mod/mod_lua.c` (`lua_create`/`lua_init`: allocate a bare
//! struct, defer building the actual interpreter state to `init`, set
//! `LUA_PATH`/`LUA_CPATH`/`LUA_MODPATH` from options, then load and run a
//! bootstrap loader file with the service's `args` string). spec.md treats
//! the scripting-language embedding as a boundary only (§1's excluded
//! list), so `lua_packer`'s custom bytecode-loading convention is not
//! reproduced; the interpreter uses `mlua`'s own `require` machinery
//! instead, the idiomatic way to embed Lua from Rust (no crate in the
//! example pack covers this, so the crate choice is grounded in spec.md's
//! own naming of `mlua` for this boundary rather than in any one example).

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use mlua::{Function, Lua, RegistryKey};
use shaco_handle::Handle;
use shaco_message::{Dispatcher, MessageKind, Session};
use shaco_module::{Callback, Instance, ServiceClass};
use shaco_options::Options;
use shaco_timer::Timer;

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("failed to read loader file {0}: {1}")]
    LoaderRead(String, std::io::Error),
    #[error(transparent)]
    Lua(#[from] mlua::Error),
}

/// Resolves a service name to its handle, without `shaco-script` needing to
/// depend on `shaco-context`'s registry type directly — the same layering
/// reason `shaco-module` stays agnostic of "what a context is".
pub type QueryHandle = Arc<dyn Fn(&str) -> Option<Handle> + Send + Sync>;
pub type BindName = Arc<dyn Fn(Handle, &str) + Send + Sync>;

/// The capability shared across every scripting instance. In practice
/// there is one (spec.md's default bootstrap class is `lua bootstrap`), but
/// nothing here assumes that.
pub struct ScriptClass {
    options: Arc<Options>,
    dispatcher: Arc<Mutex<Dispatcher>>,
    timer: Arc<Mutex<Timer>>,
    query_handle: QueryHandle,
    bind_name: BindName,
}

impl ScriptClass {
    pub fn new(
        options: Arc<Options>,
        dispatcher: Arc<Mutex<Dispatcher>>,
        timer: Arc<Mutex<Timer>>,
        query_handle: QueryHandle,
        bind_name: BindName,
    ) -> Self {
        Self { options, dispatcher, timer, query_handle, bind_name }
    }

    /// Builds the `shaco` bridge table and the `LUA_PATH`/`LUA_CPATH`/
    /// `LUA_MODPATH` globals `mod_lua.c` sets before running the loader.
    fn install_bridge(&self, lua: &Lua, self_handle: Handle, state: Arc<Mutex<ScriptState>>) -> Result<(), ScriptError> {
        let table = lua.create_table()?;

        let dispatcher = Arc::clone(&self.dispatcher);
        table.set(
            "send",
            lua.create_function(move |_, (dest, session, type_tag, payload): (u32, i32, u8, mlua::String)| {
                let dest = Handle::from_raw(dest);
                let bytes = Bytes::copy_from_slice(payload.as_bytes());
                dispatcher.lock().unwrap().push(self_handle, dest, session, MessageKind::User(type_tag, bytes));
                Ok(())
            })?,
        )?;

        let register_state = Arc::clone(&state);
        table.set(
            "register_callback",
            lua.create_function(move |lua, f: Function| {
                let key = lua.create_registry_value(f)?;
                register_state.lock().unwrap().callback = Some(key);
                Ok(())
            })?,
        )?;

        let query_handle = Arc::clone(&self.query_handle);
        table.set(
            "query_handle",
            lua.create_function(move |_, name: String| Ok((*query_handle)(&name).map(Handle::as_raw)))?,
        )?;

        let bind_name = Arc::clone(&self.bind_name);
        table.set(
            "bind_name",
            lua.create_function(move |_, (raw, name): (u32, String)| {
                (*bind_name)(Handle::from_raw(raw), &name);
                Ok(())
            })?,
        )?;

        let timer = Arc::clone(&self.timer);
        table.set("now", lua.create_function(move |_, ()| Ok(timer.lock().unwrap().now_ms()))?)?;

        table.set(
            "log",
            lua.create_function(move |_, (level, msg): (String, String)| {
                match level.as_str() {
                    "error" => log::error!("{msg}"),
                    "warn" => log::warn!("{msg}"),
                    "debug" => log::debug!("{msg}"),
                    _ => log::info!("{msg}"),
                }
                Ok(())
            })?,
        )?;

        lua.globals().set("shaco", table)?;
        lua.globals().set("LUA_PATH", self.options.get_str("luapath", "./lua-shaco/?.lua"))?;
        lua.globals().set("LUA_CPATH", self.options.get_str("luacpath", "./lib-l/?.so"))?;
        lua.globals().set("LUA_MODPATH", self.options.get_str("luamodpath", "./lua-mod/?.lua"))?;
        Ok(())
    }

    /// Loads and runs the `lualoader` file, passing the service's `args`
    /// string as its sole argument (`mod_lua.c`'s `lua_pcall(L, 1, 0, 1)`).
    fn run_loader(&self, lua: &Lua, args: &str) -> Result<(), ScriptError> {
        let loader_path = self.options.get_str("lualoader", "./lua-shaco/loader.lua");
        let source = std::fs::read_to_string(loader_path).map_err(|e| ScriptError::LoaderRead(loader_path.to_string(), e))?;
        lua.load(&source).set_name(loader_path).call::<()>(args)?;
        Ok(())
    }
}

/// Per-instance state. `lua` is `None` until `init` runs, mirroring
/// `struct lua { L: NULL }` between `lua_create` and `lua_init`.
struct ScriptState {
    lua: Option<Lua>,
    callback: Option<RegistryKey>,
}

impl ServiceClass for ScriptClass {
    fn create(&self) -> Instance {
        Box::new(Arc::new(Mutex::new(ScriptState { lua: None, callback: None })))
    }

    fn init(
        &self,
        instance: &mut Instance,
        handle: u32,
        args: &str,
        install_callback: &mut dyn FnMut(Callback),
    ) -> Result<(), String> {
        let shared = instance
            .downcast_ref::<Arc<Mutex<ScriptState>>>()
            .ok_or_else(|| "instance is not a script instance".to_string())?;
        let shared = Arc::clone(shared);

        let self_handle = Handle::from_raw(handle);
        let lua = Lua::new();
        self.install_bridge(&lua, self_handle, Arc::clone(&shared)).map_err(|e| e.to_string())?;
        self.run_loader(&lua, args).map_err(|e| e.to_string())?;

        shared.lock().unwrap().lua = Some(lua);

        install_callback(Box::new(move |source, session, type_tag, payload| {
            dispatch_to_lua(&shared, source, session, type_tag, payload)
        }));
        Ok(())
    }
}

/// Invokes the service's registered Lua callback, if any (`shaco.
/// register_callback`'s counterpart; spec.md §4.3's callback ABI: non-zero
/// return signals failure, logged by the caller).
fn dispatch_to_lua(state: &Arc<Mutex<ScriptState>>, source: u32, session: Session, type_tag: u8, payload: Vec<u8>) -> i32 {
    let guard = state.lock().unwrap();
    let Some(lua) = guard.lua.as_ref() else {
        log::error!("script: message delivered before init completed");
        return -1;
    };
    let Some(key) = guard.callback.as_ref() else {
        log::debug!("script: no callback registered, dropping message");
        return 0;
    };
    let callback: Function = match lua.registry_value(key) {
        Ok(f) => f,
        Err(err) => {
            log::error!("script: failed to resolve registered callback: {err}");
            return -1;
        }
    };
    let payload = match lua.create_string(&payload) {
        Ok(p) => p,
        Err(err) => {
            log::error!("script: failed to build payload string: {err}");
            return -1;
        }
    };
    match callback.call::<()>((source, session, type_tag, payload)) {
        Ok(()) => 0,
        Err(err) => {
            log::error!("script: callback error: {err}");
            -1
        }
    }
}
