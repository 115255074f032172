//! `dimmon` process entrypoint: parses `dimmon.conf`, registers the built-in
//! node types it names, creates the starter node and delivers it `STARTUP`,
//! then runs the main loop until it terminates with an error (the runtime
//! never exits cleanly on its own, §7).

use anyhow::{Context, Result};
use clap::Parser;
use dimmon_message::{generic, ControlMessage, MessageFlags, StartupPayload, TYPE_GENERIC, SYSTEM_SRC};
use dimmon_registry::TypeRegistry;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;
use std::sync::Once;
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser, Debug)]
#[command(name = "dimmon", version, about = "Monitoring data pipeline runtime")]
struct Args {
    /// Path to the config file.
    #[arg(short = 'c', long = "config", default_value = "dimmon.conf")]
    config: PathBuf,
}

fn main() -> ExitCode {
    let _guard = configure_logging();
    install_panic_hook();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "dimmon exiting");
            eprintln!("dimmon: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn configure_logging() -> Option<WorkerGuard> {
    let log_dir = Path::new(".");
    let appender = tracing_appender::rolling::never(log_dir, "dimmon.log");
    let (nb_writer, guard) = tracing_appender::non_blocking(appender);
    match tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(nb_writer)
        .try_init()
    {
        Ok(()) => Some(guard),
        Err(_) => None, // a subscriber is already installed (e.g. under a test harness)
    }
}

fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            tracing::error!(target: "runtime.panic", %info, "panic");
            default_hook(info);
        }));
    });
}

fn run(args: Args) -> Result<()> {
    let contents = std::fs::read_to_string(&args.config)
        .with_context(|| format!("cannot open config file {}", args.config.display()))?;
    let parsed = dimmon_config::parse_config(&contents)
        .with_context(|| format!("malformed config file {}", args.config.display()))?;

    for module in &parsed.modules {
        tracing::info!(module, "module loaded");
    }

    let registry = Rc::new(RefCell::new(TypeRegistry::new()));
    dimmon_config::register_builtin_types(&mut registry.borrow_mut())
        .context("registering built-in node types")?;

    let mut graph = dimmon_graph::GraphRuntime::new(registry.clone())
        .context("initializing event runtime")?;

    let starter = graph
        .create_node(&parsed.starter_type)
        .with_context(|| format!("unknown starter type {}", parsed.starter_type))?;

    let startup = ControlMessage::create(
        SYSTEM_SRC,
        generic::STARTUP,
        TYPE_GENERIC,
        0,
        MessageFlags::empty(),
        StartupPayload {
            descriptor: parsed.descriptor,
            lineno: parsed.lineno,
        }
        .encode(),
    );
    graph
        .dispatch_message(starter, startup)
        .context("starter rejected STARTUP")?;

    let err = dimmon_runtime::run(&mut graph);
    Err(anyhow::Error::new(err).context("main loop terminated"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Exercises the same file-read → parse → register path `run` takes,
    /// against a real temp file rather than an in-memory string, so the
    /// `std::fs::read_to_string` error-context wiring gets covered too.
    #[test]
    fn loads_config_from_a_real_file_and_registers_its_modules() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "source\nsink\n==\nstarter\n==\ncreate src source\ncreate dst sink\nconnect src:out -> dst:in\n"
        )
        .unwrap();

        let contents = std::fs::read_to_string(file.path()).unwrap();
        let parsed = dimmon_config::parse_config(&contents).unwrap();
        assert_eq!(parsed.modules, vec!["source", "sink"]);
        assert_eq!(parsed.starter_type, "starter");

        let mut registry = TypeRegistry::new();
        dimmon_config::register_builtin_types(&mut registry).unwrap();
        assert!(registry.lookup(&parsed.starter_type).is_some());
    }

    #[test]
    fn missing_config_file_is_a_readable_error() {
        let args = Args {
            config: PathBuf::from("/nonexistent/dimmon.conf"),
        };
        let err = run(args).unwrap_err();
        assert!(format!("{err:#}").contains("cannot open config file"));
    }
}
