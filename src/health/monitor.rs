//! Periodic device health monitoring.
//!
//! # Responsibilities
//! - Probe every registered device on an interval
//! - Bound probes in flight and the time each may take
//! - Publish one snapshot per pass

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures_util::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tokio::time;

use crate::config::HealthCheckConfig;
use crate::connection::state::unix_millis;
use crate::devices::{DeviceDescriptor, DeviceRegistry};
use crate::health::probe::DeviceProbe;
use crate::health::state::{HealthRecord, HealthSnapshot, HealthStats};
use crate::observability::metrics;
use crate::resilience::with_timeout;

pub struct HealthMonitor {
    devices: Arc<DeviceRegistry>,
    prober: Arc<dyn DeviceProbe>,
    config: HealthCheckConfig,
    snapshot: ArcSwap<HealthSnapshot>,
    passes_started: AtomicU64,
    total_checks: AtomicU64,
    total_errors: AtomicU64,
}

impl HealthMonitor {
    pub fn new(devices: Arc<DeviceRegistry>, prober: Arc<dyn DeviceProbe>, config: HealthCheckConfig) -> Self {
        Self {
            devices,
            prober,
            config,
            snapshot: ArcSwap::from_pointee(HealthSnapshot::default()),
            passes_started: AtomicU64::new(0),
            total_checks: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
        }
    }

    /// Last committed snapshot. Never blocks.
    pub fn snapshot(&self) -> Arc<HealthSnapshot> {
        self.snapshot.load_full()
    }

    pub fn stats(&self) -> HealthStats {
        let snapshot = self.snapshot.load();
        HealthStats {
            total_devices: snapshot.total,
            healthy: snapshot.healthy,
            unhealthy: snapshot.unhealthy,
            total_checks: self.total_checks.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            last_pass: snapshot.pass,
            last_completed_at: (snapshot.pass > 0).then_some(snapshot.completed_at),
        }
    }

    /// Probe every registered device and commit the results as one snapshot.
    ///
    /// Returns this pass's snapshot. It is only committed if no pass that started later
    /// has already committed.
    pub async fn run_health_check(&self) -> Arc<HealthSnapshot> {
        let pass = self.passes_started.fetch_add(1, Ordering::AcqRel) + 1;
        let started_at = unix_millis();
        let devices = self.devices.all();
        let timeout = self.config.probe_timeout();
        let prober = &self.prober;

        tracing::debug!(pass, devices = devices.len(), "Health check pass started");

        let records: Vec<HealthRecord> = stream::iter(devices)
            .map(move |descriptor: DeviceDescriptor| async move {
                let operation = format!("health probe of {}", descriptor.id);
                let result = with_timeout(&operation, timeout, prober.probe(&descriptor, timeout)).await;

                match result {
                    Ok(latency) => HealthRecord {
                        device_id: descriptor.id,
                        last_check: unix_millis(),
                        healthy: true,
                        latency_ms: Some(latency.as_millis() as u64),
                        error: None,
                    },
                    Err(e) => {
                        tracing::warn!(device_id = %descriptor.id, error = %e, "Health probe failed");
                        HealthRecord {
                            device_id: descriptor.id,
                            last_check: unix_millis(),
                            healthy: false,
                            latency_ms: None,
                            error: Some(e.to_string()),
                        }
                    }
                }
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        let snapshot = Arc::new(HealthSnapshot::from_records(pass, started_at, unix_millis(), records));
        self.total_checks.fetch_add(snapshot.total as u64, Ordering::Relaxed);
        self.total_errors.fetch_add(snapshot.unhealthy as u64, Ordering::Relaxed);
        for record in snapshot.records.values() {
            metrics::record_device_health(&record.device_id, record.healthy);
        }

        let previous = self.snapshot.rcu(|current| {
            if current.pass > pass {
                Arc::clone(current)
            } else {
                Arc::clone(&snapshot)
            }
        });

        if previous.pass > pass {
            tracing::debug!(pass, newer = previous.pass, "Discarding health results from an older pass");
        } else {
            metrics::record_health_pass(snapshot.healthy, snapshot.unhealthy);
            tracing::info!(
                pass,
                total = snapshot.total,
                healthy = snapshot.healthy,
                unhealthy = snapshot.unhealthy,
                "Health check pass committed"
            );
        }

        snapshot
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            tracing::info!("Health monitoring disabled");
            return;
        }

        tracing::info!(
            interval_secs = self.config.interval_secs,
            max_concurrency = self.config.max_concurrency,
            "Health monitor starting"
        );

        let mut ticker = time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_health_check().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::error::{ConnectionError, LinkError};
    use crate::protocol::ProtocolKind;

    #[derive(Default)]
    struct ScriptedProbe {
        down: HashSet<String>,
        hang: HashSet<String>,
        delay: Mutex<Duration>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl DeviceProbe for ScriptedProbe {
        async fn probe(&self, descriptor: &DeviceDescriptor, _timeout: Duration) -> Result<Duration, LinkError> {
            let delay = *self.delay.lock().unwrap();
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if self.hang.contains(&descriptor.id) {
                std::future::pending::<()>().await;
            }
            time::sleep(delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.down.contains(&descriptor.id) {
                Err(LinkError::Connection {
                    device_id: descriptor.id.clone(),
                    source: ConnectionError::Refused {
                        address: descriptor.address.clone(),
                    },
                })
            } else {
                Ok(delay)
            }
        }
    }

    fn registry(count: usize) -> Arc<DeviceRegistry> {
        Arc::new(DeviceRegistry::new((0..count).map(|i| {
            DeviceDescriptor::new(format!("tv-{}", i), format!("10.0.1.{}:5555", i), ProtocolKind::ADB_SHELL)
        })))
    }

    fn config(max_concurrency: usize) -> HealthCheckConfig {
        HealthCheckConfig {
            enabled: true,
            interval_secs: 60,
            probe_timeout_ms: 200,
            max_concurrency,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_abort_the_pass() {
        let probe = ScriptedProbe {
            down: ["tv-1".to_string()].into_iter().collect(),
            hang: ["tv-2".to_string()].into_iter().collect(),
            delay: Mutex::new(Duration::from_millis(10)),
            ..Default::default()
        };
        let monitor = HealthMonitor::new(registry(4), Arc::new(probe), config(4));

        let snapshot = monitor.run_health_check().await;
        assert_eq!(snapshot.total, 4);
        assert_eq!(snapshot.healthy, 2);
        assert!(!snapshot.records["tv-1"].healthy);
        assert!(snapshot.records["tv-2"].error.as_deref().unwrap().contains("timed out"));
        assert_eq!(snapshot.records["tv-0"].latency_ms, Some(10));

        let stats = monitor.stats();
        assert_eq!(stats.total_checks, 4);
        assert_eq!(stats.total_errors, 2);
        assert_eq!(stats.last_pass, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn probes_in_flight_are_bounded() {
        let probe = Arc::new(ScriptedProbe {
            delay: Mutex::new(Duration::from_millis(50)),
            ..Default::default()
        });
        let monitor = HealthMonitor::new(registry(12), probe.clone(), config(3));

        let snapshot = monitor.run_health_check().await;
        assert_eq!(snapshot.healthy, 12);
        assert_eq!(probe.max_in_flight.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn older_pass_never_overwrites_newer() {
        let probe = Arc::new(ScriptedProbe {
            delay: Mutex::new(Duration::from_millis(150)),
            ..Default::default()
        });
        let monitor = HealthMonitor::new(registry(2), probe.clone(), config(4));

        let slow = monitor.run_health_check();
        let fast = async {
            time::sleep(Duration::from_millis(1)).await;
            *probe.delay.lock().unwrap() = Duration::from_millis(5);
            monitor.run_health_check().await
        };
        let (slow, fast) = tokio::join!(slow, fast);

        assert_eq!(slow.pass, 1);
        assert_eq!(fast.pass, 2);
        assert_eq!(monitor.snapshot().pass, 2);
        assert_eq!(monitor.snapshot().records["tv-0"].latency_ms, Some(5));
    }

    #[tokio::test]
    async fn snapshot_is_empty_before_first_pass() {
        let monitor = HealthMonitor::new(registry(1), Arc::new(ScriptedProbe::default()), config(1));
        assert_eq!(monitor.snapshot().pass, 0);
        assert_eq!(monitor.stats().last_completed_at, None);
    }
}
