//! Optional JSON trace logging. Stdout belongs to the bridge, so traces go to a file.

use crate::config::AppConfig;
use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_subscriber::fmt::time::UtcTime;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Resolve the trace file: `--log-path`, then `NIGHTSHIELD_TRACE_LOG`, then the temp dir.
pub fn tracing_log_path(config: &AppConfig) -> PathBuf {
    if let Some(path) = config.log_path.clone() {
        return path;
    }
    env::var("NIGHTSHIELD_TRACE_LOG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| env::temp_dir().join("nightshield_trace.jsonl"))
}

fn init_tracing_once(config: &AppConfig, once: &OnceLock<()>) {
    if !config.tracing_enabled() {
        return;
    }

    let _ = once.get_or_init(|| {
        let path = tracing_log_path(config);
        let file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => file,
            Err(_) => return,
        };
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_max_level(tracing::Level::DEBUG)
            .with_timer(UtcTime::rfc_3339())
            .with_writer(file)
            .with_thread_names(true)
            .with_current_span(false)
            .with_span_list(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Install the global subscriber once, if logging is enabled.
pub fn init_tracing(config: &AppConfig) {
    init_tracing_once(config, &TRACING_INIT);
}
