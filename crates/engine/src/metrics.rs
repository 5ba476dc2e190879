//! Query timers and instrumentation counters.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde_json::Value;

pub const TIMER_QUERY_PARSE: &str = "timer_rego_query_parse_ns";
pub const TIMER_QUERY_COMPILE: &str = "timer_rego_query_compile_ns";
pub const TIMER_QUERY_EVAL: &str = "timer_rego_query_eval_ns";
pub const TIMER_PARTIAL_EVAL: &str = "timer_rego_partial_eval_ns";

pub const COUNTER_RULE_EVAL: &str = "counter_eval_op_rule_eval";
pub const COUNTER_VIRTUAL_CACHE_HIT: &str = "counter_eval_op_virtual_cache_hit";
pub const COUNTER_VIRTUAL_CACHE_MISS: &str = "counter_eval_op_virtual_cache_miss";
pub const COUNTER_BUILTIN_CALL: &str = "counter_eval_op_builtin_call";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metrics {
    timers: BTreeMap<String, u64>,
    counters: BTreeMap<String, u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `elapsed` to the named timer.
    pub fn record(&mut self, name: &str, elapsed: Duration) {
        let ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        *self.timers.entry(name.to_string()).or_default() += ns;
    }

    /// Run `f`, recording its duration under `name`.
    pub fn time<T>(&mut self, name: &str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.record(name, start.elapsed());
        out
    }

    pub fn incr(&mut self, name: &str, by: u64) {
        *self.counters.entry(name.to_string()).or_default() += by;
    }

    pub fn timer(&self, name: &str) -> Option<u64> {
        self.timers.get(name).copied()
    }

    pub fn counter(&self, name: &str) -> Option<u64> {
        self.counters.get(name).copied()
    }

    /// Timers only, or timers plus counters when `instrumentation` is set.
    pub fn to_map(&self, instrumentation: bool) -> BTreeMap<String, Value> {
        let mut out: BTreeMap<String, Value> = self
            .timers
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(*v)))
            .collect();
        if instrumentation {
            out.extend(self.counters.iter().map(|(k, v)| (k.clone(), Value::from(*v))));
        }
        out
    }
}
