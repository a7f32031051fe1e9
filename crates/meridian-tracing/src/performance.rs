//! Timing guards and standard events for data-movement instrumentation.
//!
//! ```rust
//! use meridian_tracing::performance::{record_transfer, PerformanceSpan};
//!
//! let span = PerformanceSpan::new("stage_weights", Some(50));
//! record_transfer(4096, "H2D", 12);
//! drop(span); // logged only when it took 50us or more
//! ```
//!
//! Spans opened through `perf_span!` follow the process-wide settings that
//! [`crate::init_global_tracing`] installs from [`crate::TracingConfig`], see
//! [`configure`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::span::EnteredSpan;
use tracing::Level;

static ENABLED: AtomicBool = AtomicBool::new(true);
/// Zero means no threshold.
static THRESHOLD_US: AtomicU64 = AtomicU64::new(0);

/// Settings applied to every span opened with [`PerformanceSpan::configured`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PerformanceSettings {
    pub enabled: bool,
    pub threshold_us: Option<u64>,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_us: None,
        }
    }
}

/// Replace the process-wide performance span settings.
pub fn configure(settings: PerformanceSettings) {
    ENABLED.store(settings.enabled, Ordering::Relaxed);
    THRESHOLD_US.store(settings.threshold_us.unwrap_or(0), Ordering::Relaxed);
}

/// Current process-wide performance span settings.
pub fn settings() -> PerformanceSettings {
    let threshold = THRESHOLD_US.load(Ordering::Relaxed);
    PerformanceSettings {
        enabled: ENABLED.load(Ordering::Relaxed),
        threshold_us: (threshold > 0).then_some(threshold),
    }
}

/// RAII timer. Logs `performance_span_complete` on drop when enabled and the
/// elapsed time reaches the threshold (or always, when there is none).
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    enabled: bool,
    start: Instant,
    span: tracing::Span,
    /// Field-carrying span kept entered for the guard's whole lifetime.
    entered: Option<EnteredSpan>,
}

impl PerformanceSpan {
    pub fn new(name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, name, threshold_us)
    }

    /// A span following the process-wide [`settings`].
    pub fn configured(name: impl Into<String>) -> Self {
        let current = settings();
        let mut span = Self::new(name, current.threshold_us);
        span.enabled = current.enabled;
        span
    }

    /// Same as [`PerformanceSpan::new`] but the backing span uses `level`.
    pub fn with_level(level: Level, name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let name = name.into();
        let span = match level {
            Level::TRACE => tracing::trace_span!("perf", name = %name),
            Level::DEBUG => tracing::debug_span!("perf", name = %name),
            Level::INFO => tracing::info_span!("perf", name = %name),
            Level::WARN => tracing::warn_span!("perf", name = %name),
            Level::ERROR => tracing::error_span!("perf", name = %name),
        };

        Self {
            name,
            threshold_us,
            enabled: true,
            start: Instant::now(),
            span,
            entered: None,
        }
    }

    /// Use `span` as the backing span and keep it entered until drop.
    pub fn entered(mut self, span: tracing::Span) -> Self {
        self.span = span.clone();
        self.entered = Some(span.entered());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threshold_us(&self) -> Option<u64> {
        self.threshold_us
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The backing span.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }

    fn should_log(&self, elapsed_us: u64) -> bool {
        self.enabled && self.threshold_us.is_none_or(|t| elapsed_us >= t)
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        let elapsed_us = self.elapsed_us();
        if !self.should_log(elapsed_us) {
            return;
        }
        let _entered = self.entered.is_none().then(|| self.span.enter());
        tracing::debug!(
            duration_us = elapsed_us,
            duration_ms = elapsed_us as f64 / 1000.0,
            "performance_span_complete"
        );
    }
}

/// Megabytes per second for `bytes` moved in `duration_us`. Zero when the
/// duration rounds to nothing.
pub fn bandwidth_mbps(bytes: usize, duration_us: u64) -> f64 {
    if duration_us == 0 {
        return 0.0;
    }
    (bytes as f64 / duration_us as f64) * 1_000_000.0 / (1024.0 * 1024.0)
}

/// Emit a `data_transfer` event.
///
/// `direction` is one of `H2D`, `D2H`, `D2D` or `H2H`.
pub fn record_transfer(bytes: usize, direction: &str, duration_us: u64) {
    let mbps = bandwidth_mbps(bytes, duration_us);
    tracing::debug!(
        event = "transfer",
        bytes = bytes,
        direction = direction,
        duration_us = duration_us,
        bandwidth_mbps = mbps,
        bandwidth_gbps = mbps / 1024.0,
        "data_transfer"
    );
}

/// Emit a `memory_allocation` event for an allocator of the given name.
pub fn record_allocation(size_bytes: usize, allocator: &str, duration_us: u64) {
    tracing::trace!(
        event = "allocation",
        size_bytes = size_bytes,
        allocator = allocator,
        duration_us = duration_us,
        "memory_allocation"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    /// Run `f` under a debug-level subscriber and return what it logged.
    fn capture(f: impl FnOnce()) -> String {
        let out = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(out.clone())
            .with_max_level(Level::DEBUG)
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        out.text()
    }

    #[test]
    #[serial]
    fn span_under_configured_threshold_is_not_logged() {
        configure(PerformanceSettings {
            enabled: true,
            threshold_us: Some(60_000_000),
        });
        let quiet = capture(|| drop(PerformanceSpan::configured("fast_copy")));
        configure(PerformanceSettings::default());
        assert!(!quiet.contains("performance_span_complete"), "{quiet}");

        let logged = capture(|| drop(PerformanceSpan::configured("fast_copy")));
        assert!(logged.contains("performance_span_complete"), "{logged}");
    }

    #[test]
    #[serial]
    fn disabled_spans_still_time_but_never_log() {
        configure(PerformanceSettings {
            enabled: false,
            threshold_us: None,
        });
        let out = capture(|| {
            let span = PerformanceSpan::configured("copy_out");
            assert!(!span.is_enabled());
            thread::sleep(Duration::from_millis(1));
            assert!(span.elapsed_us() >= 1_000);
        });
        configure(PerformanceSettings::default());
        assert!(!out.contains("performance_span_complete"), "{out}");
    }

    #[test]
    #[serial]
    fn settings_round_trip() {
        let custom = PerformanceSettings {
            enabled: false,
            threshold_us: Some(250),
        };
        configure(custom);
        assert_eq!(settings(), custom);
        configure(PerformanceSettings::default());
        assert_eq!(settings(), PerformanceSettings::default());
    }

    #[test]
    fn span_keeps_name_and_threshold() {
        let span = PerformanceSpan::new("copy_in", Some(100));
        assert_eq!(span.name(), "copy_in");
        assert_eq!(span.threshold_us(), Some(100));
    }

    #[test]
    fn span_measures_elapsed_time() {
        let span = PerformanceSpan::with_level(Level::INFO, "sleepy", None);
        thread::sleep(Duration::from_millis(5));
        assert!(span.elapsed_us() >= 5_000);
    }

    #[test]
    fn bandwidth_of_one_megabyte_per_millisecond() {
        let mbps = bandwidth_mbps(1024 * 1024, 1000);
        assert!((mbps - 1000.0).abs() < 0.01);
    }

    #[test]
    fn zero_duration_reports_zero_bandwidth() {
        assert_eq!(bandwidth_mbps(4096, 0), 0.0);
    }

    #[test]
    fn recording_events_without_subscriber_is_harmless() {
        record_transfer(4096, "H2D", 250);
        record_allocation(512, "DeviceAllocator", 3);
    }
}
