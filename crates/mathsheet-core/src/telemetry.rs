//! Tracing setup for mathsheet binaries.
//!
//! Events emitted inside a generation run sit under the `mathsheet.run` span
//! (see [`crate::obs::run_span`]). The JSON formatter flattens that span onto
//! every line, so each record of a run carries its `run_id`.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "MATHSHEET_LOG";

/// Crates whose events follow the requested level. Everything else
/// (HTTP client, runtime) stays at `warn`.
const MATHSHEET_TARGETS: [&str; 3] = ["mathsheet_core", "mathsheet_typeset", "mathsheet"];

/// Filter directives used when neither `MATHSHEET_LOG` nor `RUST_LOG` is set.
pub fn default_directives(level: Level) -> String {
    let level = level.to_string().to_ascii_lowercase();
    let mut directives = vec!["warn".to_string()];
    directives.extend(MATHSHEET_TARGETS.iter().map(|t| format!("{}={}", t, level)));
    directives.join(",")
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)))
}

/// Install the global subscriber; later calls are ignored.
///
/// Output goes to stderr so stdout stays free for command output. With
/// `json`, run span fields are inlined into each record instead of the
/// nested span list.
pub fn init_tracing(json: bool, level: Level) {
    let filter = env_filter(level);
    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json().with_current_span(true).with_span_list(false))
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_scope_mathsheet_crates() {
        assert_eq!(
            default_directives(Level::DEBUG),
            "warn,mathsheet_core=debug,mathsheet_typeset=debug,mathsheet=debug"
        );
        let filter = EnvFilter::new(default_directives(Level::INFO));
        assert!(filter.to_string().contains("mathsheet_core=info"));
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing(false, Level::WARN);
        init_tracing(true, Level::DEBUG);
        tracing::info!("still alive");
    }
}
