use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter::EnvFilter, fmt};

use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

/// Routes panics through `tracing` so they end up as a single structured log line on stderr.
fn report_panic(panic_info: &PanicHookInfo<'_>) {
    // noop if the RUST_BACKTRACE or RUST_LIB_BACKTRACE backtrace variables are both not set
    let backtrace = Backtrace::capture();
    let backtrace_captured = backtrace.status() == BacktraceStatus::Captured;
    let payload = panic_info
        .payload()
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<String>()
                .map(String::as_str)
        });

    match (panic_info.location(), payload, backtrace_captured) {
        (Some(location), Some(payload), false) => {
            tracing::error!(
                "{}:{}:{}: {}",
                location.file(),
                location.line(),
                location.column(),
                payload,
            );
        }
        _ => {
            tracing::error!("{}\n{}", panic_info, backtrace);
        }
    };
}

/// Crates that drown out everything else at debug level.
const NOISY_DIRECTIVES: &[&str] = &["hyper_util=info", "aws_smithy_runtime=info", "h2=info"];

/// Builds the filter from `RUST_LOG`, falling back to the default level when it holds no valid
/// directive. The noisy crate overrides are only added in debug mode.
fn build_filter(debug_mode: bool, rust_log: &str) -> EnvFilter {
    let default_level = if debug_mode { Level::DEBUG } else { Level::INFO };
    let mut filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .parse_lossy(rust_log);

    if debug_mode {
        for directive in NOISY_DIRECTIVES {
            if let Ok(directive) = directive.parse() {
                filter = filter.add_directive(directive);
            }
        }
    }
    filter
}

pub fn register() {
    // Logs are written to stderr, stdout carries the shipped records.
    let debug_mode =
        std::env::var("AUDITSHIP_DEBUG").is_ok_and(|v| v.eq_ignore_ascii_case("true"));
    let filter = build_filter(
        debug_mode,
        &std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default(),
    );

    let layer = if debug_mode {
        fmt::layer().with_writer(std::io::stderr).boxed()
    } else {
        // JSON format, flattened
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .init();

    std::panic::set_hook(Box::new(report_panic));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directives(filter: &EnvFilter) -> Vec<String> {
        filter
            .to_string()
            .to_lowercase()
            .split(',')
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_debug_mode_enables_debug_level() {
        let directives = directives(&build_filter(true, ""));
        assert!(directives.iter().any(|d| d == "debug"));
        assert!(directives.iter().any(|d| d == "hyper_util=info"));
        assert!(directives.iter().any(|d| d == "aws_smithy_runtime=info"));
    }

    #[test]
    fn test_default_level_is_info() {
        let directives = directives(&build_filter(false, ""));
        assert_eq!(directives, vec!["info".to_string()]);
    }

    #[test]
    fn test_rust_log_directives_are_kept() {
        let directives = directives(&build_filter(false, "auditship_core=trace"));
        assert!(directives.iter().any(|d| d == "auditship_core=trace"));
    }
}
