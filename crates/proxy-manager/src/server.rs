//! Process wiring.

use crate::config::Config;
use crate::http_server::{ApiServer, AppState};
use crate::metrics::MetricsRegistry;
use crate::notifier::{AlertPolicy, Notifier, NtfySink};
use healthcheck::{HealthPoller, ResultObserver, TcpProber};
use reconciler::{Reconciler, build_control};
use rulestore::RuleStore;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Proxy manager daemon
pub struct ProxyManager {
    config: Config,
}

impl ProxyManager {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Construct the long-lived components. Deployment mode is resolved
    /// here, once.
    pub fn build(&self) -> common::Result<AppState> {
        let config = &self.config;

        let store = Arc::new(RuleStore::open(
            config.rules_path(),
            config.snapshot_dir(),
            config.store.snapshot_retention,
        )?);

        let mode = config.deployment_mode();
        let control = build_control(mode, config.proxy_commands(), config.container_target());
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            control,
            config.reconciler_paths(),
        ));

        let metrics = config
            .metrics
            .enabled
            .then(|| Arc::new(MetricsRegistry::new()));

        let mut poller = HealthPoller::new(
            store.clone(),
            Arc::new(TcpProber::new()),
            config.poller_config(),
        );
        if let Some(registry) = &metrics {
            poller = poller.with_observer(registry.clone() as Arc<dyn ResultObserver>);
        }

        info!(
            mode = %mode,
            rules_path = %config.rules_path().display(),
            config_path = %config.proxy.config_path,
            metrics_enabled = metrics.is_some(),
            "Components initialized"
        );

        Ok(AppState {
            store,
            reconciler,
            poller: Arc::new(poller),
            metrics,
            reconcile_on_change: config.proxy.reconcile_on_change,
        })
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), BoxError> {
        info!("Starting proxy manager");
        let state = self.build()?;

        state.poller.start();
        let notifier_handle = self.spawn_notifier(&state, shutdown.child_token())?;

        let server = ApiServer::new(state.clone(), self.config.server.listen_addr.clone());
        let served = server.run(shutdown.clone()).await;

        // Stop background work whether the server exited cleanly or not
        shutdown.cancel();
        state.poller.stop();
        if let Some(handle) = notifier_handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Notifier task failed");
            }
        }

        served?;
        info!("Proxy manager stopped");
        Ok(())
    }

    fn spawn_notifier(
        &self,
        state: &AppState,
        token: CancellationToken,
    ) -> Result<Option<JoinHandle<()>>, BoxError> {
        let settings = &self.config.notifier;
        if !settings.enabled {
            info!("Notifier disabled");
            return Ok(None);
        }

        let sink = NtfySink::new(&settings.ntfy_url, &settings.topic)?;
        info!(url = %sink.url(), "Notifier enabled");

        let notifier = Notifier::new(
            state.poller.clone(),
            Arc::new(sink),
            AlertPolicy::new(settings.alert_interval, settings.healthy_interval),
            settings.check_interval,
        );
        Ok(Some(tokio::spawn(notifier.run(token))))
    }
}

/// Resolve when Ctrl-C or SIGTERM arrives
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
