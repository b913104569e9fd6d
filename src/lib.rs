//! Main loop composition for the shaco runtime.
//!
//! Grounded on `src-shaco/shaco.c` (`shaco_init`/`shaco_start`/`shaco_fini`):
//! the initialization order, per-iteration step order, and the shutdown
//! flag/reason-string contract are all reproduced here, bin-side state
//! (signal handlers, pidfile, daemonization) included rather than left
//! distilled away.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result, anyhow, bail};
use shaco_context::ContextRegistry;
use shaco_harbor::HarborClass;
use shaco_message::Dispatcher;
use shaco_module::ModuleLoader;
use shaco_options::Options;
use shaco_script::ScriptClass;
use shaco_socket::Reactor;
use shaco_timer::Timer;

/// Default batch size a single `Dispatcher::dispatch` call drains, matching
/// `shaco-message`'s own teacher-grounded default.
const DISPATCH_BATCH: usize = 256;

/// Default timeout the main loop blocks on socket I/O when no timer and no
/// pending message demand a shorter wait.
const IDLE_TIMEOUT: Duration = Duration::from_millis(100);

/// Set from a `SIGINT`/`SIGTERM` handler; `Runtime::run` checks it once per
/// iteration (`shaco.c`'s `static bool RUN`).
static RUN: AtomicBool = AtomicBool::new(true);
/// Set from a `SIGUSR1` handler; only honored when daemonized (spec.md §6).
static REOPENING: AtomicBool = AtomicBool::new(false);

/// Registers `SIGINT`/`SIGTERM`/`SIGUSR1` handlers that flip the process-wide
/// flags above. `shaco_stop`'s C comment ("not signal-safe to log here")
/// applies equally to Rust: the handlers only ever touch the flags.
#[cfg(unix)]
fn install_signal_handlers() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigint.recv() => RUN.store(false, Ordering::SeqCst),
                _ = sigterm.recv() => RUN.store(false, Ordering::SeqCst),
                _ = sigusr1.recv() => REOPENING.store(true, Ordering::SeqCst),
            }
            if !RUN.load(Ordering::SeqCst) {
                break;
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn install_signal_handlers() -> Result<()> {
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        RUN.store(false, Ordering::SeqCst);
    });
    Ok(())
}

/// Raises `RLIMIT_NOFILE` to `maxsocket + 32` on Unix (`shaco.c:rlimit_check`).
/// A no-op elsewhere — the option still exists, it just has nothing to
/// enforce against.
#[cfg(unix)]
fn rlimit_check(maxsocket: i64) -> Result<()> {
    let want = maxsocket.max(0) as u64 + 32;
    let (soft, hard) = rlimit::Resource::NOFILE.get().context("getrlimit nofile failed")?;
    if soft < want {
        rlimit::Resource::NOFILE
            .set(want, want.max(hard))
            .context("setrlimit nofile failed")?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn rlimit_check(_maxsocket: i64) -> Result<()> {
    Ok(())
}

/// `shaco.c:get_pidfile` — a daemonized process always gets a pidfile path
/// (default `./shaco.pid`); a foreground process only gets one if the
/// caller set the `pidfile` option explicitly (there is no env fallback in
/// this port; `shaco_getenv` read from the same Lua-populated option table
/// `pidfile` itself comes from here).
fn pidfile_path(options: &Options, daemon: bool) -> Option<PathBuf> {
    if daemon {
        Some(PathBuf::from(options.get_str("pidfile", "./shaco.pid")))
    } else {
        options.get_opt_str("pidfile").map(PathBuf::from)
    }
}

/// `shaco.c:check_pid` — a stale pidfile naming a process that is no longer
/// alive is not an error; only a live, *other* process blocks startup.
fn check_pid(path: &std::path::Path) -> Option<u32> {
    let content = std::fs::read_to_string(path).ok()?;
    let pid: u32 = content.trim().parse().ok()?;
    if pid == 0 || pid == std::process::id() {
        return None;
    }
    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if rc != 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH) {
            return None;
        }
    }
    Some(pid)
}

/// `shaco.c:write_pid` — held under an advisory exclusive whole-file lock
/// for the process lifetime; the returned `File` must stay alive (dropping
/// it releases the lock).
fn write_pid(path: &std::path::Path) -> Result<std::fs::File> {
    use fs4::fs_std::FileExt;
    use std::io::Write;

    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .with_context(|| format!("can't create {}", path.display()))?;
    file.try_lock_exclusive()
        .with_context(|| format!("can't lock {}", path.display()))?;
    file.set_len(0)?;
    (&file).write_all(format!("{}\n", std::process::id()).as_bytes())?;
    (&file).flush()?;
    Ok(file)
}

/// `shaco.c:daemonize` — fork + setsid + redirect standard fds to
/// `/dev/null`. Only available when the `daemonize` feature is enabled.
#[cfg(all(unix, feature = "daemonize"))]
fn daemonize() -> Result<()> {
    daemonize::Daemonize::new().start().map_err(|e| anyhow!("daemonize failed: {e}"))
}

#[cfg(not(all(unix, feature = "daemonize")))]
fn daemonize() -> Result<()> {
    bail!("daemon=1 requires the `daemonize` feature (unix only)")
}

/// Resolved startup configuration and the live state the loop needs across
/// iterations. Built by [`Runtime::start`], driven by [`Runtime::run`].
pub struct Runtime {
    registry: Arc<Mutex<ContextRegistry>>,
    loader: ModuleLoader,
    dispatcher: Arc<Mutex<Dispatcher>>,
    timer: Arc<Mutex<Timer>>,
    reactor: Arc<Mutex<Reactor>>,
    logfile: Option<PathBuf>,
    daemon: bool,
    pidfile: Option<PathBuf>,
    _pidfile_lock: Option<std::fs::File>,
}

impl Runtime {
    /// `shaco_init`: timer, log, module loader path, handle registry,
    /// signal handlers, rlimit check, socket reactor, dispatcher, then
    /// bootstrap. A bootstrap failure is fatal (spec.md §4.6/§7).
    pub async fn start(options: Options) -> Result<Self> {
        let daemon = options.get_bool("daemon", false);

        let timer = Arc::new(Mutex::new(Timer::new(IDLE_TIMEOUT)));

        let logfile = if daemon {
            Some(PathBuf::from(options.get_str("logfile", "./shaco.log")))
        } else {
            None
        };
        shaco_log::init(logfile.as_deref()).context("failed to open log")?;
        if !options.get_str("loglevel", "").is_empty() {
            let _ = shaco_log::global().set_level(options.get_str("loglevel", ""));
        }

        let pidfile = pidfile_path(&options, daemon);
        if let Some(path) = &pidfile {
            if let Some(pid) = check_pid(path) {
                shaco_log::global().exit(format_args!("Shaco is already running, pid = {pid}"));
            }
        }
        if daemon {
            daemonize()?;
        }
        let pidfile_lock = match &pidfile {
            Some(path) => Some(write_pid(path)?),
            None => None,
        };

        let mut loader = ModuleLoader::new(options.get_str("modpath", "./lib-mod"));
        let self_node_id = options.get_int("slaveid", 0) as u8;
        let registry = Arc::new(Mutex::new(ContextRegistry::new(self_node_id)));

        install_signal_handlers()?;
        rlimit_check(options.get_int("maxsocket", 0))?;

        let reactor = Arc::new(Mutex::new(Reactor::new()));
        let dispatcher = Arc::new(Mutex::new(Dispatcher::new(DISPATCH_BATCH)));

        loader.register(
            "harbor",
            Arc::new(HarborClass::new(self_node_id, Arc::clone(&reactor), Arc::clone(&dispatcher))),
        );

        let options = Arc::new(options);
        let query_handle: shaco_script::QueryHandle = {
            let registry = Arc::clone(&registry);
            Arc::new(move |name: &str| registry.lock().unwrap().query(name))
        };
        let bind_name: shaco_script::BindName = {
            let registry = Arc::clone(&registry);
            Arc::new(move |handle, name: &str| registry.lock().unwrap().bind_name(handle, name))
        };
        loader.register(
            shaco_module::SCRIPTING_CLASS,
            Arc::new(ScriptClass::new(
                Arc::clone(&options),
                Arc::clone(&dispatcher),
                Arc::clone(&timer),
                query_handle,
                bind_name,
            )),
        );

        let bootstrap = options.get_str("bootstrap", "lua bootstrap").to_string();
        let (class_name, args) = bootstrap.split_once(' ').unwrap_or((bootstrap.as_str(), ""));
        let bootstrap_result = registry.lock().unwrap().create(&mut loader, class_name, args).map(|_| ());
        if let Err(err) = bootstrap_result {
            shaco_log::global().exit(format_args!("bootstrap fail: {err}"));
        }

        Ok(Self {
            registry,
            loader,
            dispatcher,
            timer,
            reactor,
            logfile,
            daemon,
            pidfile,
            _pidfile_lock: pidfile_lock,
        })
    }

    /// `shaco_start`: the per-iteration loop, exactly spec.md §4.6 steps
    /// 1-5, until a signal clears [`RUN`].
    pub async fn run(&mut self) -> Result<()> {
        log::info!("Shaco start");
        while RUN.load(Ordering::SeqCst) {
            let mut timeout = self.timer.lock().unwrap().max_timeout();
            if !self.dispatcher.lock().unwrap().is_empty() {
                timeout = Duration::ZERO;
            }

            {
                let mut reactor = self.reactor.lock().unwrap();
                let mut dispatcher = self.dispatcher.lock().unwrap();
                reactor.poll(timeout, &mut dispatcher).await;
            }

            {
                let mut timer = self.timer.lock().unwrap();
                let mut dispatcher = self.dispatcher.lock().unwrap();
                timer.trigger(&mut dispatcher);
            }

            {
                let mut dispatcher = self.dispatcher.lock().unwrap();
                let registry = self.registry.lock().unwrap();
                dispatcher.dispatch(registry.underlying());
            }

            if REOPENING.swap(false, Ordering::SeqCst) {
                self.reopen_log()?;
            }
        }
        log::info!("Shaco stop");
        Ok(())
    }

    /// `shaco.c:reopenlog` — only meaningful for a daemonized, file-backed
    /// logger; a foreground stdout logger has nothing to reopen.
    fn reopen_log(&self) -> Result<()> {
        if self.daemon && self.logfile.is_some() {
            shaco_log::global().reopen()?;
        }
        Ok(())
    }

    pub fn loaded_modules(&self) -> &[String] {
        self.loader.loaded_names()
    }
}

impl Drop for Runtime {
    /// `shaco_fini`'s one externally-visible effect this port preserves:
    /// the pidfile is removed on clean shutdown (the advisory lock itself
    /// is released by `_pidfile_lock`'s own `Drop`).
    fn drop(&mut self) {
        if let Some(path) = &self.pidfile {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Requests a graceful stop, mirroring `shaco_stop`. Exposed for services
/// that want to shut the runtime down programmatically (e.g. a scripted
/// admin command) rather than waiting for a signal.
pub fn request_stop() {
    RUN.store(false, Ordering::SeqCst);
}
