//! Log filter selection shared by the CLI entry points.
//!
//! Subscriber installation lives in `mirage-app`; this module only decides
//! which `tracing` filter string applies for a given invocation.

pub const DEFAULT_LOG_FILTER: &str = "info";

/// Keeps the ONNX Runtime's own logging quiet unless explicitly requested.
pub const DEFAULT_NOISE_FILTER: &str = "ort=error";

/// Select the effective tracing filter with the following precedence:
/// 1. Explicit `--log-filter` value
/// 2. `-v` / `-vv` verbosity flags (debug / trace)
/// 3. `RUST_LOG` environment value
/// 4. Default: `info` with runtime noise suppressed
pub fn select_log_filter(
    verbose: u8,
    rust_log_env: Option<&str>,
    cli_filter: Option<&str>,
) -> String {
    if let Some(filter) = cli_filter {
        let trimmed = filter.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    match verbose {
        0 => {}
        1 => return format!("debug,{DEFAULT_NOISE_FILTER}"),
        _ => return "trace".to_string(),
    }

    if let Some(env) = rust_log_env {
        let trimmed = env.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    format!("{DEFAULT_LOG_FILTER},{DEFAULT_NOISE_FILTER}")
}
