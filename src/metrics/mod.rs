//! Prometheus metrics for the 3scale Operator
//!
//! Counters and histograms for reconciliations, admin API calls, sync tasks
//! and pipeline steps, plus the HTTP endpoint serving them.

mod prometheus;

pub use prometheus::*;
