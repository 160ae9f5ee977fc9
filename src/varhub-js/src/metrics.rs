/*!
Definitions and implementations of the metrics emitted by programs.
*/

// Gauge, programs currently alive
static METRIC_ACTIVE_PROGRAMS: &str = "active_programs";

// Counter, total programs created during the lifetime of the process
static METRIC_TOTAL_PROGRAMS: &str = "programs_total";

// Counter, programs terminated by the quota watchdog
pub(crate) static METRIC_WATCHDOG_TERMINATIONS: &str = "watchdog_terminations_total";
pub(crate) static METRIC_WATCHDOG_REASON_LABEL: &str = "reason";

/// RAII guard tying the active-program gauge to the `Program` handle.
pub(crate) struct ProgramMetricsGuard(());

impl ProgramMetricsGuard {
    pub(crate) fn new() -> Self {
        metrics::gauge!(METRIC_ACTIVE_PROGRAMS).increment(1);
        metrics::counter!(METRIC_TOTAL_PROGRAMS).increment(1);
        Self(())
    }
}

impl Drop for ProgramMetricsGuard {
    fn drop(&mut self) {
        metrics::gauge!(METRIC_ACTIVE_PROGRAMS).decrement(1);
    }
}
