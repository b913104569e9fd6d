//! CLI entry point.
//!
//! Grounded on the teacher's own `clap`-derived `Args` convention
//! (`src/mode/control.rs`) and spec.md §6's option table, mapped 1:1 onto
//! `--flag` arguments rather than left as an undifferentiated config blob.

use anyhow::Result;
use clap::Parser;
use shaco_options::Options;
use shaco_runtime::Runtime;

/// A small actor-style service runtime for distributed, multi-node
/// back-ends.
#[derive(Parser, Debug)]
#[command(name = "shaco", version, about)]
struct Args {
    /// Optional TOML config file layered under the CLI flags below (CLI
    /// wins on conflict).
    #[arg(long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Run as a background daemon (fork + setsid).
    #[arg(long)]
    daemon: bool,

    /// Pidfile path; defaults to `./shaco.pid` when `--daemon` is set.
    #[arg(long, value_name = "PATH")]
    pidfile: Option<String>,

    /// Log file path; stdout when unset and not daemonized.
    #[arg(long, value_name = "PATH")]
    logfile: Option<String>,

    /// One of DEBUG, TRACE, INFO, WARNING, ERROR, EXIT, PANIC (case
    /// insensitive).
    #[arg(long, value_name = "LEVEL")]
    loglevel: Option<String>,

    /// Directory service classes are loaded from.
    #[arg(long, value_name = "DIR", default_value = "./lib-mod")]
    modpath: String,

    /// Resource limit floor for open file descriptors (raised by +32).
    #[arg(long, value_name = "N", default_value_t = 0)]
    maxsocket: i64,

    /// `<class> [args...]` of the first service to launch.
    #[arg(long, value_name = "CLASS ARGS", default_value = "lua bootstrap")]
    bootstrap: String,

    /// This node's id (high byte of every handle it registers); required
    /// non-zero for the harbor to accept slave attachments.
    #[arg(long, value_name = "N", default_value_t = 0)]
    slaveid: i64,

    #[arg(long, value_name = "PATH")]
    packagepath: Option<String>,
    #[arg(long, value_name = "PATTERN")]
    luapath: Option<String>,
    #[arg(long, value_name = "PATTERN")]
    luacpath: Option<String>,
    #[arg(long, value_name = "PATTERN")]
    luamodpath: Option<String>,
    #[arg(long, value_name = "PATH")]
    lualoader: Option<String>,
}

impl Args {
    fn into_options(self) -> Options {
        let mut options = self
            .config
            .as_deref()
            .map(Options::from_file)
            .transpose()
            .unwrap_or_else(|err| {
                eprintln!("warning: failed to load {:?}: {err}", self.config);
                None
            })
            .unwrap_or_default();

        options.set("daemon", if self.daemon { "1" } else { "0" });
        if let Some(v) = self.pidfile {
            options.set("pidfile", v);
        }
        if let Some(v) = self.logfile {
            options.set("logfile", v);
        }
        if let Some(v) = self.loglevel {
            options.set("loglevel", v);
        }
        options.set("modpath", self.modpath);
        options.set("maxsocket", self.maxsocket.to_string());
        options.set("bootstrap", self.bootstrap);
        options.set("slaveid", self.slaveid.to_string());
        if let Some(v) = self.packagepath {
            options.set("packagepath", v);
        }
        if let Some(v) = self.luapath {
            options.set("luapath", v);
        }
        if let Some(v) = self.luacpath {
            options.set("luacpath", v);
        }
        if let Some(v) = self.luamodpath {
            options.set("luamodpath", v);
        }
        if let Some(v) = self.lualoader {
            options.set("lualoader", v);
        }
        options
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let options = args.into_options();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let mut rt = Runtime::start(options).await?;
        rt.run().await
    })
}
