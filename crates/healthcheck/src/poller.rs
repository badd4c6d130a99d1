//! Background health polling.

use crate::prober::Prober;
use crate::stats::{self, HealthStatistics, MonitorReport};
use crate::types::{HealthCheckResult, PollerConfig, ProbeOutcome};
use chrono::Utc;
use common::{Error, Result};
use dashmap::DashMap;
use rulestore::{Rule, RuleSource};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Receives every fresh probe result.
pub trait ResultObserver: Send + Sync {
    fn observe(&self, result: &HealthCheckResult);
}

struct Shared {
    rules: Arc<dyn RuleSource>,
    prober: Arc<dyn Prober>,
    config: PollerConfig,
    results: DashMap<String, HealthCheckResult>,
    semaphore: Option<Arc<Semaphore>>,
    observer: Option<Arc<dyn ResultObserver>>,
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Health poller.
///
/// Probes every enabled rule's backend concurrently on a fixed interval and
/// keeps the latest result per rule id. Readers never wait on the network.
pub struct HealthPoller {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl HealthPoller {
    /// Create a new health poller
    pub fn new(rules: Arc<dyn RuleSource>, prober: Arc<dyn Prober>, config: PollerConfig) -> Self {
        let semaphore = config
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        Self {
            shared: Arc::new(Shared {
                rules,
                prober,
                config,
                results: DashMap::new(),
                semaphore,
                observer: None,
            }),
            running: Mutex::new(None),
        }
    }

    /// Attach an observer. Must be called before the poller is shared.
    pub fn with_observer(mut self, observer: Arc<dyn ResultObserver>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.observer = Some(observer);
        } else {
            warn!("Observer ignored: poller already shared");
        }
        self
    }

    pub fn config(&self) -> &PollerConfig {
        &self.shared.config
    }

    /// Start the polling loop. Returns false if it was already running.
    ///
    /// If a stopped loop is still finishing its last cycle, the new loop
    /// waits for it so cycles never overlap.
    pub fn start(&self) -> bool {
        let mut running = self.lock_running();
        if running
            .as_ref()
            .is_some_and(|r| !r.token.is_cancelled() && !r.handle.is_finished())
        {
            debug!("Health poller already running");
            return false;
        }

        let previous = running.take().map(|r| r.handle);
        let token = CancellationToken::new();
        let shared = self.shared.clone();
        let child = token.clone();
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(e) = previous.await {
                    error!(error = %e, "Previous poll loop failed");
                }
            }
            if child.is_cancelled() {
                return;
            }
            shared.run(child).await;
        });

        info!(
            interval_ms = self.shared.config.interval.as_millis(),
            timeout_ms = self.shared.config.timeout.as_millis(),
            "Health poller started"
        );
        *running = Some(Running { token, handle });
        true
    }

    /// Stop the polling loop. An in-flight cycle finishes; the next wait is
    /// cancelled.
    pub fn stop(&self) {
        if let Some(running) = self.lock_running().as_ref() {
            if !running.token.is_cancelled() {
                running.token.cancel();
                info!("Health poller stopping");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_running()
            .as_ref()
            .is_some_and(|r| !r.token.is_cancelled() && !r.handle.is_finished())
    }

    /// Probe every enabled rule now. Returns fresh results in rule order.
    pub async fn check_all(&self) -> Result<Vec<HealthCheckResult>> {
        self.shared.check_all().await
    }

    /// Latest result for an enabled rule. A rule that has not been probed
    /// since it was created or retargeted has none.
    pub fn status_of(&self, rule_id: &str) -> Result<HealthCheckResult> {
        let rules = self.shared.rules.enabled_rules()?;
        rules
            .iter()
            .find(|rule| rule.id == rule_id)
            .and_then(|rule| {
                self.shared
                    .results
                    .get(rule_id)
                    .filter(|entry| entry.value().describes(rule))
                    .map(|entry| entry.value().clone())
            })
            .ok_or_else(|| Error::not_found(format!("no health result for rule {rule_id}")))
    }

    /// Latest results for the enabled rules, keyed by rule id.
    pub fn status_all(&self) -> Result<HashMap<String, HealthCheckResult>> {
        let rules = self.shared.rules.enabled_rules()?;
        let results = self.snapshot();
        Ok(rules
            .iter()
            .filter_map(|rule| stats::current_result(rule, &results))
            .map(|result| (result.rule_id.clone(), result.clone()))
            .collect())
    }

    /// Aggregate counts over the currently enabled rules.
    pub fn statistics(&self) -> Result<HealthStatistics> {
        let rules = self.shared.rules.enabled_rules()?;
        Ok(stats::summarize(&rules, &self.snapshot()))
    }

    pub fn monitor_report(&self) -> Result<MonitorReport> {
        let rules = self.shared.rules.enabled_rules()?;
        Ok(stats::monitor_report(&rules, &self.snapshot()))
    }

    fn snapshot(&self) -> HashMap<String, HealthCheckResult> {
        self.shared
            .results
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for HealthPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    async fn run(&self, token: CancellationToken) {
        loop {
            match self.check_all().await {
                Ok(results) => {
                    let healthy = results.iter().filter(|r| r.is_healthy()).count();
                    debug!(
                        probed = results.len(),
                        healthy,
                        unhealthy = results.len() - healthy,
                        "Health cycle complete"
                    );
                }
                Err(e) => error!(error = %e, "Health cycle failed"),
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
        info!("Health poller stopped");
    }

    async fn check_all(&self) -> Result<Vec<HealthCheckResult>> {
        let rules = self.rules.enabled_rules()?;
        let enabled: HashSet<String> = rules.iter().map(|r| r.id.clone()).collect();

        let mut set = JoinSet::new();
        for (idx, rule) in rules.into_iter().enumerate() {
            let prober = self.prober.clone();
            let semaphore = self.semaphore.clone();
            let timeout = self.config.timeout;
            set.spawn(async move {
                let _permit = match semaphore {
                    Some(sem) => sem.acquire_owned().await.ok(),
                    None => None,
                };
                (idx, probe_rule(prober.as_ref(), &rule, timeout).await)
            });
        }

        let mut fresh = Vec::with_capacity(enabled.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, result)) => {
                    if let Some(observer) = &self.observer {
                        observer.observe(&result);
                    }
                    self.results.insert(result.rule_id.clone(), result.clone());
                    fresh.push((idx, result));
                }
                // The rule keeps its previous result.
                Err(e) => error!(error = %e, "Probe task failed"),
            }
        }

        self.results.retain(|id, _| enabled.contains(id));

        fresh.sort_by_key(|(idx, _)| *idx);
        Ok(fresh.into_iter().map(|(_, result)| result).collect())
    }
}

async fn probe_rule(
    prober: &dyn Prober,
    rule: &Rule,
    timeout: std::time::Duration,
) -> HealthCheckResult {
    // Bound the probe even if the prober ignores its timeout.
    let outcome = tokio::time::timeout(
        timeout,
        prober.probe(&rule.target_host, rule.target_port, timeout),
    )
    .await
    .unwrap_or_else(|_| ProbeOutcome::timeout());

    if let ProbeOutcome::Unreachable(cause) = &outcome {
        debug!(rule_id = %rule.id, target = %rule.target(), %cause, "Backend unreachable");
    }

    HealthCheckResult::from_probe(rule, outcome, Utc::now())
}
