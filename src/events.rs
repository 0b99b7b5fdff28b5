//! Anomaly event hooks.
//!
//! Hooks let callers react to anomalies as they are emitted (pushing
//! metrics, alerting, or logging) without polling per-packet reports.
//! Reports are still returned in-band from `analyze`; hooks are an
//! additional tap, not a replacement.
//!
//! # Examples
//!
//! ```rust
//! use packet_engine::AnalysisEngine;
//! use packet_engine::anomaly::Severity;
//!
//! let engine = AnalysisEngine::builder()
//!     .on_anomaly(|report| {
//!         if report.severity >= Severity::High {
//!             eprintln!("{}: {}", report.kind, report.description);
//!         }
//!     })
//!     .build()
//!     .unwrap();
//! # let _ = engine;
//! ```

use crate::anomaly::AnomalyReport;

use std::sync::Arc;

/// Type alias for anomaly hooks.
///
/// Hooks must be `Send + Sync + 'static` so engines can move across
/// threads.
pub type AnomalyHook = Arc<dyn Fn(&AnomalyReport) + Send + Sync + 'static>;

/// Container for registered anomaly hooks.
#[derive(Clone, Default)]
pub struct AnomalyHooks {
    hooks: Vec<AnomalyHook>,
}

// Custom Debug implementation to avoid printing closures
impl std::fmt::Debug for AnomalyHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnomalyHooks")
            .field("hook_count", &self.hooks.len())
            .finish()
    }
}

impl AnomalyHooks {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Registers a new hook.
    pub fn register<F>(&mut self, hook: F)
    where
        F: Fn(&AnomalyReport) + Send + Sync + 'static,
    {
        self.hooks.push(Arc::new(hook));
    }

    /// Triggers all registered hooks with the given report.
    pub fn trigger(&self, report: &AnomalyReport) {
        for hook in &self.hooks {
            hook(report);
        }
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}
