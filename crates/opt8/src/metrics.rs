//! Metrics descriptions, recording helpers and an in-memory recorder.
//!
//! The passes and the checker emit counters through the `metrics` facade;
//! the CLI installs [`CliRecorder`] to print them after a run.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use metrics::{
    Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit, counter,
    describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use parking_lot::RwLock;

// ============================================================================
// Metric descriptions
// ============================================================================

/// Register metric descriptions. Call once at startup.
pub fn init() {
    describe_counter!(
        "opt8_candidates_proposed_total",
        Unit::Count,
        "Rewrite candidates submitted for equivalence checking"
    );
    describe_counter!(
        "opt8_candidates_accepted_total",
        Unit::Count,
        "Candidates proven equivalent and committed"
    );
    describe_counter!(
        "opt8_candidates_rejected_total",
        Unit::Count,
        "Candidates rejected as not equivalent or unknown"
    );
    describe_counter!("opt8_solver_calls_total", Unit::Count, "Solver invocations");
    describe_counter!(
        "opt8_proof_cache_hits_total",
        Unit::Count,
        "Verdicts served from the proof cache"
    );
    describe_counter!(
        "opt8_functions_optimized_total",
        Unit::Count,
        "Functions run through the pipeline"
    );
    describe_counter!(
        "opt8_instructions_removed_total",
        Unit::Count,
        "Instructions removed across all functions"
    );

    describe_gauge!(
        "opt8_proof_cache_entries",
        Unit::Count,
        "Verdicts held in the proof cache"
    );

    describe_histogram!(
        "opt8_function_duration_seconds",
        Unit::Seconds,
        "Wall-clock time to optimize one function"
    );
}

// ============================================================================
// Metric recording functions
// ============================================================================

/// Record one optimized function.
pub fn record_function(duration: Duration, before: usize, after: usize) {
    counter!("opt8_functions_optimized_total").increment(1);
    counter!("opt8_instructions_removed_total").increment(before.saturating_sub(after) as u64);
    histogram!("opt8_function_duration_seconds").record(duration.as_secs_f64());
}

/// Record the size of the proof cache.
pub fn record_cache_size(entries: usize) {
    gauge!("opt8_proof_cache_entries").set(entries as f64);
}

// ============================================================================
// CLI Recorder for terminal output
// ============================================================================

/// Everything a [`CliRecorder`] has seen, keyed by rendered metric key.
#[derive(Default)]
struct Store {
    counters: RwLock<HashMap<String, u64>>,
    gauges: RwLock<HashMap<String, f64>>,
    histograms: RwLock<HashMap<String, Vec<f64>>>,
}

/// One registered metric: its rendered key and the shared store.
struct Slot {
    key: String,
    store: Arc<Store>,
}

impl metrics::CounterFn for Slot {
    fn increment(&self, value: u64) {
        *self.store.counters.write().entry(self.key.clone()).or_insert(0) += value;
    }

    fn absolute(&self, value: u64) {
        self.store.counters.write().insert(self.key.clone(), value);
    }
}

impl metrics::GaugeFn for Slot {
    fn increment(&self, value: f64) {
        *self.store.gauges.write().entry(self.key.clone()).or_insert(0.0) += value;
    }

    fn decrement(&self, value: f64) {
        metrics::GaugeFn::increment(self, -value);
    }

    fn set(&self, value: f64) {
        self.store.gauges.write().insert(self.key.clone(), value);
    }
}

impl metrics::HistogramFn for Slot {
    fn record(&self, value: f64) {
        self.store.histograms.write().entry(self.key.clone()).or_default().push(value);
    }
}

/// Recorder that keeps metrics in memory for a summary at exit.
#[derive(Default)]
pub struct CliRecorder {
    store: Arc<Store>,
}

impl CliRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install as the global recorder. Returns `None` if another recorder
    /// is already installed.
    #[must_use]
    pub fn install(self) -> Option<CliRecorderHandle> {
        let handle = self.handle();
        metrics::set_global_recorder(self).ok()?;
        Some(handle)
    }

    /// Handle reading this recorder's storage.
    #[must_use]
    pub fn handle(&self) -> CliRecorderHandle {
        CliRecorderHandle {
            store: Arc::clone(&self.store),
        }
    }

    fn slot(&self, key: &Key) -> Arc<Slot> {
        Arc::new(Slot {
            key: key_to_string(key),
            store: Arc::clone(&self.store),
        })
    }
}

/// `name{label=value,...}`, or just `name` without labels.
fn key_to_string(key: &Key) -> String {
    let labels: Vec<String> = key
        .labels()
        .map(|label| format!("{}={}", label.key(), label.value()))
        .collect();
    if labels.is_empty() {
        key.name().to_string()
    } else {
        format!("{}{{{}}}", key.name(), labels.join(","))
    }
}

impl Recorder for CliRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::from_arc(self.slot(key))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(self.slot(key))
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(self.slot(key))
    }
}

/// Read access to the metrics collected by a [`CliRecorder`].
#[derive(Clone)]
pub struct CliRecorderHandle {
    store: Arc<Store>,
}

impl CliRecorderHandle {
    #[must_use]
    pub fn get_counter(&self, key: &str) -> Option<u64> {
        self.store.counters.read().get(key).copied()
    }

    #[must_use]
    pub fn get_gauge(&self, key: &str) -> Option<f64> {
        self.store.gauges.read().get(key).copied()
    }

    #[must_use]
    pub fn get_histogram(&self, key: &str) -> Option<Vec<f64>> {
        self.store.histograms.read().get(key).cloned()
    }

    /// Sum of a counter over all label sets.
    #[must_use]
    pub fn counter_total(&self, name: &str) -> u64 {
        let labelled = format!("{name}{{");
        self.store
            .counters
            .read()
            .iter()
            .filter(|(key, _)| key.as_str() == name || key.starts_with(&labelled))
            .map(|(_, value)| value)
            .sum()
    }

    /// Render all collected metrics, sorted by key, plus the share of
    /// proposed candidates that were committed.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let counters = sorted(&self.store.counters.read(), |value| value.to_string());
        let gauges = sorted(&self.store.gauges.read(), |value| format!("{value:.0}"));
        let histograms = sorted(&self.store.histograms.read(), |values| {
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let avg = values.iter().sum::<f64>() / values.len().max(1) as f64;
            format!("count={}, min={min:.6}, max={max:.6}, avg={avg:.6}", values.len())
        });
        if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
            return "No metrics collected.\n".to_string();
        }

        let _ = writeln!(out, "\n## Metrics Summary\n");
        let sections = [
            ("Counters", counters),
            ("Gauges", gauges),
            ("Histograms", histograms),
        ];
        for (title, lines) in sections {
            if lines.is_empty() {
                continue;
            }
            let _ = writeln!(out, "### {title}");
            for (key, value) in lines {
                let _ = writeln!(out, "  {key}: {value}");
            }
            let _ = writeln!(out);
        }

        let proposed = self.counter_total("opt8_candidates_proposed_total");
        if proposed > 0 {
            let accepted = self.counter_total("opt8_candidates_accepted_total");
            let _ = writeln!(
                out,
                "accepted {accepted}/{proposed} candidates ({:.1}%)",
                accepted as f64 * 100.0 / proposed as f64
            );
        }
        out
    }

    /// Print [`Self::summary`] to stdout.
    pub fn print_summary(&self) {
        print!("{}", self.summary());
    }
}

fn sorted<V>(map: &HashMap<String, V>, render: impl Fn(&V) -> String) -> Vec<(String, String)> {
    let mut lines: Vec<(String, String)> = map
        .iter()
        .map(|(key, value)| (key.clone(), render(value)))
        .collect();
    lines.sort();
    lines
}
