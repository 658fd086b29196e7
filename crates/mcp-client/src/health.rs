//! Periodic liveness probing with reconnect-or-remove on failure.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use tm_domain::trace::TraceEvent;

use crate::composite::CompositeClient;

/// Outcome of one probe round.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    pub healthy: Vec<String>,
    pub reconnected: Vec<String>,
    pub removed: Vec<String>,
}

impl HealthReport {
    pub fn is_clean(&self) -> bool {
        self.reconnected.is_empty() && self.removed.is_empty()
    }
}

/// Observes the composite client's connections and triggers reconnection
/// through it. Never owns a connection itself.
pub struct HealthMonitor {
    client: Arc<CompositeClient>,
    interval: Duration,
    probe_timeout: Duration,
}

impl HealthMonitor {
    /// Interval and probe timeout come from the client's `[mcp.health]`
    /// settings and per-server overrides.
    pub fn new(client: Arc<CompositeClient>) -> Self {
        let health = &client.config().health;
        let interval = health.effective_interval(&client.config().servers);
        let probe_timeout = health.probe_timeout();
        Self {
            client,
            interval,
            probe_timeout,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Probe every connection that has probing enabled, concurrently.
    ///
    /// A failed probe (including one that cannot be attempted because the
    /// process is gone) marks the connection unhealthy, then either
    /// reconnects it or removes it, per its `auto_reconnect` flag.
    pub async fn probe_all(&self, cancel: &CancellationToken) -> HealthReport {
        let targets: Vec<_> = self
            .client
            .connections()
            .into_iter()
            .filter(|c| c.descriptor().probing_enabled())
            .collect();

        let results = join_all(
            targets
                .iter()
                .map(|conn| conn.probe(self.probe_timeout, cancel)),
        )
        .await;

        let mut report = HealthReport::default();
        let mut failed = Vec::new();
        for (conn, result) in targets.iter().zip(results) {
            self.client.record_probe(conn.name());
            match result {
                Ok(()) => {
                    let recovered = conn.restore_connected();
                    self.client.note_healthy(conn, recovered);
                    report.healthy.push(conn.name().to_owned());
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    conn.mark_unhealthy();
                    tracing::warn!(server_id = %conn.name(), error = %e, "MCP health probe failed");
                    self.client.sink().emit(TraceEvent::HealthProbeFailed {
                        server_id: conn.name().to_owned(),
                        reason: e.to_string(),
                    });
                    failed.push((conn.clone(), e));
                }
            }
        }

        let recoveries = failed.iter().map(|(conn, err)| async move {
            let id = conn.name().to_owned();
            if !conn.descriptor().auto_reconnect {
                self.client.remove(&id, &format!("health probe failed: {err}")).await;
                return (id, false);
            }
            let ok = self.client.reconnect(&id, cancel).await.is_ok();
            (id, ok)
        });
        for (id, reconnected) in join_all(recoveries).await {
            if reconnected {
                report.reconnected.push(id);
            } else {
                report.removed.push(id);
            }
        }

        if !report.is_clean() {
            tracing::info!(
                healthy = report.healthy.len(),
                reconnected = ?report.reconnected,
                removed = ?report.removed,
                "MCP health round complete"
            );
        }
        report
    }

    /// Run until `cancel` fires or the client shuts down. Wakes early when
    /// the client observes a transport failure on the call path.
    pub async fn run(self, cancel: CancellationToken) {
        if !self.client.config().health.enabled {
            tracing::info!("MCP health monitor disabled");
            return;
        }
        let lifetime = self.client.lifetime();

        tracing::info!(
            interval_secs = self.interval.as_secs_f64(),
            probe_timeout_ms = self.probe_timeout.as_millis() as u64,
            "MCP health monitor started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; servers were just initialized.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = lifetime.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.client.transport_failure() => {
                    tracing::debug!("health monitor woken by transport failure");
                }
            }
            self.probe_all(&cancel).await;
        }

        tracing::info!("MCP health monitor stopped");
    }

    /// Spawn [`HealthMonitor::run`] on the current runtime.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
