//! Tracing setup shared by every meridian crate, test harness and tool.
//!
//! Binaries call [`init_global_tracing`] once with a [`TracingConfig`];
//! libraries only emit events through `tracing` and the helpers in
//! [`performance`]. Keeping subscriber construction here means the
//! provider runtime, the graph passes and the benchmarks all log with the
//! same filter semantics and output formats.
//!
//! ```text
//!  MERIDIAN_* env ──► TracingConfig::from_env ──► subscriber_layers
//!                                                   │
//!                          EnvFilter + fmt layer ◄──┘
//!                                   │
//!                         init_global_tracing (Registry)
//! ```

pub mod performance;

#[macro_use]
pub mod macros;

use std::env;

pub use tracing::{debug, error, info, trace, warn};

use thiserror::Error;
use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Registry};

/// Environment variable selecting the preset (`local`, `ci`, `performance`).
pub const ENV_PROFILE: &str = "MERIDIAN_TRACING_PROFILE";
/// Environment variable overriding the filter directives.
pub const ENV_DIRECTIVES: &str = "MERIDIAN_TRACING_DIRECTIVES";
/// Environment variable selecting the output format (`pretty`, `compact`, `json`).
pub const ENV_FORMAT: &str = "MERIDIAN_TRACING_FORMAT";
/// Environment variable toggling performance spans.
pub const ENV_PERF_TRACING: &str = "MERIDIAN_PERF_TRACING";
/// Environment variable setting the performance span threshold in microseconds.
pub const ENV_PERF_THRESHOLD_US: &str = "MERIDIAN_PERF_THRESHOLD_US";

/// How the process-wide subscriber should behave.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Filter directives such as `meridian_backends=debug,info`. When absent,
    /// `RUST_LOG` is consulted and then [`TracingConfig::default_directive`].
    pub directives: Option<String>,
    /// Directive used when nothing else resolves to a valid filter.
    pub default_directive: String,
    /// Show event targets (module paths).
    pub include_targets: bool,
    /// ANSI colouring. Always off for JSON.
    pub ansi: bool,
    /// Span lifecycle events to emit.
    pub span_events: FmtSpan,
    /// Formatter layer flavour.
    pub output: TracingOutput,
    /// When false, `perf_span!` guards still time but never log.
    pub enable_performance_tracing: bool,
    /// Minimum duration for a `perf_span!` guard to be logged.
    pub performance_threshold_us: Option<u64>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::for_local()
    }
}

impl TracingConfig {
    /// Pretty, coloured output for a developer terminal.
    pub fn for_local() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: true,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Pretty,
            enable_performance_tracing: cfg!(debug_assertions),
            performance_threshold_us: None,
        }
    }

    /// JSON lines without colour, for CI and log collectors.
    pub fn for_ci() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: false,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Json,
            enable_performance_tracing: false,
            performance_threshold_us: None,
        }
    }

    /// JSON output with span lifecycle events and debug-level runtime crates.
    ///
    /// Intended for profiling copy traffic and run lifecycles: every
    /// `perf_span!` around a transfer shows up with its duration.
    pub fn for_performance() -> Self {
        Self {
            directives: Some("meridian_backends=debug,meridian_graph=debug,info".to_string()),
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: false,
            span_events: FmtSpan::ENTER | FmtSpan::EXIT | FmtSpan::CLOSE,
            output: TracingOutput::Json,
            enable_performance_tracing: true,
            performance_threshold_us: None,
        }
    }

    /// Build a configuration from `MERIDIAN_*` environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `MERIDIAN_TRACING_PROFILE` - `local` (default), `ci` or `performance`
    /// - `MERIDIAN_TRACING_DIRECTIVES` - overrides the filter directives
    /// - `MERIDIAN_TRACING_FORMAT` - `pretty`, `compact` or `json`
    /// - `MERIDIAN_PERF_TRACING` - `true`/`1`/`yes` enables performance spans
    /// - `MERIDIAN_PERF_THRESHOLD_US` - minimum span duration to log
    pub fn from_env() -> Self {
        let profile = env::var(ENV_PROFILE)
            .unwrap_or_else(|_| "local".to_string())
            .to_ascii_lowercase();

        let mut config = match profile.as_str() {
            "ci" => Self::for_ci(),
            "performance" => Self::for_performance(),
            _ => Self::for_local(),
        };

        if let Ok(directives) = env::var(ENV_DIRECTIVES) {
            if !directives.trim().is_empty() {
                config.directives = Some(directives);
            }
        }

        if let Ok(format) = env::var(ENV_FORMAT) {
            if let Some(parsed) = TracingOutput::from_env_value(&format) {
                config.output = parsed;
                if config.output == TracingOutput::Json {
                    config.ansi = false;
                }
            }
        }

        if let Ok(flag) = env::var(ENV_PERF_TRACING) {
            config.enable_performance_tracing =
                flag.eq_ignore_ascii_case("true") || flag == "1" || flag.eq_ignore_ascii_case("yes");
        }

        if let Ok(threshold) = env::var(ENV_PERF_THRESHOLD_US) {
            if let Ok(threshold_us) = threshold.trim().parse::<u64>() {
                config.performance_threshold_us = Some(threshold_us);
            }
        }

        config
    }

    /// Settings [`init_global_tracing`] installs for `perf_span!` guards.
    pub fn performance_settings(&self) -> performance::PerformanceSettings {
        performance::PerformanceSettings {
            enabled: self.enable_performance_tracing,
            threshold_us: self.performance_threshold_us,
        }
    }

    fn resolve_filter(&self) -> Result<EnvFilter, TracingSetupError> {
        match &self.directives {
            Some(directives) => {
                EnvFilter::try_new(directives).map_err(|err| TracingSetupError::InvalidFilter(err.to_string()))
            }
            None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_directive))),
        }
    }
}

/// Output format choices for the formatter layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingOutput {
    Compact,
    Pretty,
    Json,
}

impl TracingOutput {
    fn from_env_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Failures while installing the subscriber.
#[derive(Debug, Error)]
pub enum TracingSetupError {
    #[error("invalid tracing directive: {0}")]
    InvalidFilter(String),

    /// Usually means a global subscriber is already installed.
    #[error("failed to install global tracing subscriber: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Build a subscriber without installing it.
pub fn build_subscriber(config: &TracingConfig) -> Result<impl Subscriber + Send + Sync, TracingSetupError> {
    let (filter, fmt_layer) = subscriber_layers(config)?;
    Ok(Registry::default().with(fmt_layer).with(filter))
}

/// Filter and formatter layers for callers composing their own registry.
pub fn subscriber_layers(
    config: &TracingConfig,
) -> Result<(EnvFilter, Box<dyn Layer<Registry> + Send + Sync>), TracingSetupError> {
    let filter = config.resolve_filter()?;
    let span_events = config.span_events.clone();

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.output {
        TracingOutput::Compact => Box::new(
            tracing_fmt::layer()
                .compact()
                .with_target(config.include_targets)
                .with_ansi(config.ansi)
                .with_span_events(span_events),
        ),
        TracingOutput::Pretty => Box::new(
            tracing_fmt::layer()
                .pretty()
                .with_target(config.include_targets)
                .with_ansi(config.ansi)
                .with_span_events(span_events),
        ),
        TracingOutput::Json => Box::new(
            tracing_fmt::layer()
                .json()
                .with_target(config.include_targets)
                .with_span_events(span_events)
                .with_ansi(false),
        ),
    };

    Ok((filter, layer))
}

/// Install the configured subscriber as the process-wide default and apply
/// the performance span settings.
pub fn init_global_tracing(config: &TracingConfig) -> Result<(), TracingSetupError> {
    build_subscriber(config)?.try_init()?;
    performance::configure(config.performance_settings());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn reset_env() {
        for key in [
            ENV_PROFILE,
            ENV_DIRECTIVES,
            ENV_FORMAT,
            ENV_PERF_TRACING,
            ENV_PERF_THRESHOLD_US,
            "RUST_LOG",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn rejects_invalid_directive() {
        reset_env();
        let config = TracingConfig {
            directives: Some("=::invalid".to_string()),
            ..TracingConfig::default()
        };
        assert!(matches!(build_subscriber(&config), Err(TracingSetupError::InvalidFilter(_))));
    }

    #[test]
    #[serial]
    fn builds_with_defaults() {
        reset_env();
        assert!(build_subscriber(&TracingConfig::default()).is_ok());
    }

    #[test]
    #[serial]
    fn from_env_respects_profile_and_format() {
        reset_env();
        env::set_var(ENV_PROFILE, "ci");
        env::set_var(ENV_FORMAT, "compact");
        env::set_var(ENV_DIRECTIVES, "meridian_graph=debug");

        let config = TracingConfig::from_env();
        reset_env();

        assert_eq!(config.directives.as_deref(), Some("meridian_graph=debug"));
        assert!(!config.ansi);
        assert_eq!(config.output, TracingOutput::Compact);
    }

    #[test]
    #[serial]
    fn json_format_disables_ansi() {
        reset_env();
        env::set_var(ENV_FORMAT, "JSON");

        let config = TracingConfig::from_env();
        reset_env();

        assert_eq!(config.output, TracingOutput::Json);
        assert!(!config.ansi);
    }

    #[test]
    #[serial]
    fn from_env_respects_performance_settings() {
        reset_env();
        env::set_var(ENV_PERF_TRACING, "yes");
        env::set_var(ENV_PERF_THRESHOLD_US, "250");

        let config = TracingConfig::from_env();
        reset_env();

        assert!(config.enable_performance_tracing);
        assert_eq!(config.performance_threshold_us, Some(250));
        assert_eq!(
            config.performance_settings(),
            performance::PerformanceSettings {
                enabled: true,
                threshold_us: Some(250),
            }
        );
    }

    #[test]
    #[serial]
    fn global_init_applies_performance_settings() {
        reset_env();
        let config = TracingConfig {
            directives: Some("off".to_string()),
            enable_performance_tracing: false,
            performance_threshold_us: Some(900),
            ..TracingConfig::for_ci()
        };
        // Only the first install in the test binary can succeed.
        if init_global_tracing(&config).is_ok() {
            assert_eq!(performance::settings(), config.performance_settings());
        }
        performance::configure(performance::PerformanceSettings::default());
    }

    #[test]
    #[serial]
    fn unparseable_threshold_is_ignored() {
        reset_env();
        env::set_var(ENV_PERF_THRESHOLD_US, "soon");

        let config = TracingConfig::from_env();
        reset_env();

        assert_eq!(config.performance_threshold_us, None);
    }

    #[test]
    fn performance_preset_traces_runtime_crates() {
        let config = TracingConfig::for_performance();
        assert!(config.enable_performance_tracing);
        assert_eq!(config.output, TracingOutput::Json);
        assert!(config
            .directives
            .as_deref()
            .is_some_and(|d| d.contains("meridian_backends=debug")));
    }
}
