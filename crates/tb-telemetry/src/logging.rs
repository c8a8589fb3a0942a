use std::fmt;
use std::str::FromStr;

use tracing_subscriber::EnvFilter;

/// Transport crates that flood `debug` with per-frame noise.
const QUIET_TARGETS: &[&str] = &["hyper=warn", "tungstenite=warn", "tokio_tungstenite=warn"];

/// Output format, as named by `general.log_format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    /// One JSON object per event (Vector / Loki / ELK).
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Human => "human",
            LogFormat::Json => "json",
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

/// Filter directives used when `RUST_LOG` is unset: `default_level` for
/// everything, transport crates held at `warn` unless named explicitly.
pub fn default_directives(default_level: &str) -> String {
    let mut directives = default_level.to_string();
    for quiet in QUIET_TARGETS {
        let target = quiet.split('=').next().unwrap_or(quiet);
        if !default_level.contains(target) {
            directives.push(',');
            directives.push_str(quiet);
        }
    }
    directives
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `default_level` (e.g. "info", "tb_session=debug,warn").
/// JSON events are flattened and carry the current span's fields, so
/// per-connection `logical_key`, `connection_id` and `session_id` land on
/// every line logged inside a connection.
///
/// Safe to call multiple times (e.g. in tests) -- subsequent calls are no-ops.
pub fn init_logging(service_name: &str, default_level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(default_level)));

    let installed = match format {
        LogFormat::Human => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .try_init(),
    };

    if installed.is_ok() {
        tracing::info!(service = service_name, format = %format, "logging initialised");
    }
}
