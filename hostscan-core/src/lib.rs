pub mod error;
pub mod exec;
pub mod intel;
pub mod modules;
pub mod platform;
pub mod types;

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;

pub use error::{KnowledgeBaseError, KnowledgeBaseResult};
pub use exec::{CommandOutput, CommandRunner, CommandStatus, SystemCommandRunner};
pub use intel::ThreatIntel;
pub use modules::{Analyzer, Collector, ModuleRegistry};
use types::*;

/// Progress callbacks, one pair per executed module
pub trait ScanObserver: Send + Sync {
    fn module_started(&self, _module: ModuleName) {}
    fn module_finished(&self, _result: &ModuleResult) {}
}

struct SilentObserver;

impl ScanObserver for SilentObserver {}

/// Runs detection modules and assembles the scan result
pub struct Scanner {
    intel: Arc<ThreatIntel>,
    runner: Arc<dyn CommandRunner>,
    registry: ModuleRegistry,
    observer: Arc<dyn ScanObserver>,
}

impl Scanner {
    pub fn new(intel: Arc<ThreatIntel>, runner: Arc<dyn CommandRunner>, registry: ModuleRegistry) -> Self {
        Self {
            intel,
            runner,
            registry,
            observer: Arc::new(SilentObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ScanObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Run the requested modules in order. An empty request runs all of them.
    ///
    /// Never fails: module errors and panics are recorded on their `ModuleResult`.
    pub fn run(&self, requested: &[ModuleName]) -> ScanResult {
        let started = Instant::now();
        let platform = platform::detect(self.runner.as_ref());
        tracing::info!(
            hostname = %platform.hostname,
            os = %platform.os,
            kernel = %platform.kernel,
            "starting scan"
        );

        let mut seen = HashSet::new();
        let plan: Vec<ModuleName> = if requested.is_empty() {
            ModuleName::ALL.to_vec()
        } else {
            requested.iter().copied().filter(|m| seen.insert(*m)).collect()
        };

        let mut modules = Vec::with_capacity(plan.len());
        for name in plan {
            self.observer.module_started(name);
            let result = self.run_module(name);
            self.observer.module_finished(&result);
            modules.push(result);
        }

        let findings: Vec<Finding> = modules.iter().flat_map(|m| m.findings.iter().cloned()).collect();
        let summary = Summary::calculate(&findings);
        tracing::info!(total = summary.total, status = %summary.status, "scan complete");

        ScanResult {
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            hostname: platform.hostname,
            os: platform.os,
            ip: platform.ip,
            modules,
            findings,
            summary,
            duration_ms: elapsed_ms(started),
        }
    }

    fn run_module(&self, name: ModuleName) -> ModuleResult {
        let span = tracing::info_span!("module", module = %name);
        let _enter = span.enter();
        let started = Instant::now();

        let mut records = serde_json::Value::Null;
        let outcome = self.collect(name).and_then(|data| {
            records = data.records.clone();
            self.analyze(name, &data)
        });

        let duration_ms = elapsed_ms(started);
        match outcome {
            Ok(findings) => {
                tracing::debug!(findings = findings.len(), duration_ms, "module finished");
                ModuleResult {
                    module: name,
                    findings,
                    records,
                    duration_ms,
                    error: None,
                }
            }
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::warn!(error = %message, duration_ms, "module failed");
                ModuleResult {
                    module: name,
                    findings: Vec::new(),
                    records,
                    duration_ms,
                    error: Some(message),
                }
            }
        }
    }

    fn collect(&self, name: ModuleName) -> Result<CollectedData> {
        let collector = self
            .registry
            .collector(name)
            .ok_or_else(|| anyhow!("no collector registered"))?;
        isolate(|| collector.collect(self.runner.as_ref())).context("collection failed")
    }

    fn analyze(&self, name: ModuleName, data: &CollectedData) -> Result<Vec<Finding>> {
        let analyzer = self
            .registry
            .analyzer(name)
            .ok_or_else(|| anyhow!("no analyzer registered"))?;
        isolate(|| analyzer.analyze(data, &self.intel)).context("analysis failed")
    }
}

/// Turn a panic inside `f` into an error
fn isolate<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(anyhow!("panicked: {}", message))
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
