//! Instrumentation macros built on [`crate::performance`].

/// Start a [`crate::performance::PerformanceSpan`] following the
/// process-wide performance settings. With fields, the returned guard keeps a
/// `perf` span carrying them entered until it is dropped.
///
/// ```rust
/// use meridian_tracing::perf_span;
///
/// let _span = perf_span!("copy_tensor", bytes = 4096usize);
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::configured($name)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        let name = $name;
        let fields = tracing::debug_span!("perf", name = %name, $($field = $value),+);
        $crate::performance::PerformanceSpan::configured(name).entered(fields)
    }};
}

/// Emit a debug event tagged with `event = $name`.
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        tracing::debug!(event = $name, $($field = $value),+)
    };
}

/// Run a block and return `(result, elapsed_us)`, logging the duration.
///
/// ```rust
/// use meridian_tracing::timed_block;
///
/// let (sum, _us) = timed_block!("sum", { (1..=10).sum::<u32>() });
/// assert_eq!(sum, 55);
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = std::time::Instant::now();
        let result = $block;
        let duration_us = start.elapsed().as_micros() as u64;
        tracing::debug!(operation = $name, duration_us = duration_us, "timed_block_complete");
        (result, duration_us)
    }};
}
