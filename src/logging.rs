//! Subscriber setup for binaries.

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{Result, TreeError};

/// Installs a global `fmt` subscriber writing to stderr.
///
/// `level` is an `EnvFilter` directive such as `info` or `nodetree=debug`.
/// The CLI passes its `--log-level` flag here, which defaults to `warn` and
/// can also be set through `NODETREE_LOG`.
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| TreeError::Invalid(format!("invalid log level: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|_| TreeError::Invalid("logging already initialized".into()))
}
