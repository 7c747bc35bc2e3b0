//! Log output for the daemon and the client commands.
//!
//! Console lines go to stderr so that `parked pending` and friends keep a
//! clean stdout. Setting `PARKED_TRACE_FILE` adds a JSONL trace with span
//! context, which is where one parked call can be followed from
//! registration to delivery.

use std::ffi::OsString;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

pub(crate) const TRACE_FILE_ENV: &str = "PARKED_TRACE_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Flushes the trace file when dropped. Hold it until `main` returns.
pub(crate) struct TracingGuard {
    _trace_file: Option<WorkerGuard>,
}

/// `daemon` selects the console default when `RUST_LOG` is unset: `info`
/// for `parked start`, `warn` for one-shot commands.
pub(crate) fn init(daemon: bool) -> TracingGuard {
    let console_default = if daemon { "info" } else { "warn" };
    let mut layers: Vec<BoxedLayer> = vec![
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(env_filter(console_default))
            .boxed(),
    ];

    let trace_file = std::env::var_os(TRACE_FILE_ENV).map(|path| {
        let (layer, guard) = jsonl_layer(Path::new(&path), env_filter("debug"));
        layers.push(layer);
        guard
    });

    Registry::default().with(layers).init();
    TracingGuard {
        _trace_file: trace_file,
    }
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// JSONL layer writing to `path` off the calling thread. Span open and close
/// events are included so turn and delivery durations can be read back.
fn jsonl_layer(path: &Path, filter: EnvFilter) -> (BoxedLayer, WorkerGuard) {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .map_or_else(|| OsString::from("parked-traces.jsonl"), ToOwned::to_owned);

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
    let layer = fmt::layer()
        .json()
        .with_writer(writer)
        .with_span_list(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_filter(filter)
        .boxed();
    (layer, guard)
}
