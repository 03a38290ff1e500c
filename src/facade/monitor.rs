use super::IdentitySubsystem;
use crate::core::{IdentityError, Result};
use crate::detector::LossReport;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Level, event};

/// Clears the in-flight flag when a pass ends or its future is dropped.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One loss-detection pass that refuses to overlap with itself.
pub struct LossScan {
    subsystem: Arc<IdentitySubsystem>,
    running: AtomicBool,
    latest: watch::Sender<Option<LossReport>>,
}

impl LossScan {
    fn new(subsystem: Arc<IdentitySubsystem>) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            subsystem,
            running: AtomicBool::new(false),
            latest,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns `None` when another pass is still in flight.
    pub async fn pass(&self) -> Option<LossReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            event!(Level::DEBUG, "loss scan skipped, previous pass still running");
            return None;
        }
        let _guard = RunningGuard(&self.running);

        self.subsystem.ready().await;
        let report = self.subsystem.detector().detect().await;
        if report.has_data_loss {
            let outcome = self.subsystem.recover(&report).await;
            event!(
                Level::WARN,
                probability = report.probability,
                recovery_state = ?outcome.state,
                "loss scan flagged data loss"
            );
        }
        self.latest.send_replace(Some(report.clone()));
        Some(report)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<LossReport>> {
        self.latest.subscribe()
    }
}

/// Handle to the periodic loss scan.
pub struct LossMonitor {
    scan: Arc<LossScan>,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl LossMonitor {
    pub fn scan(&self) -> &Arc<LossScan> {
        &self.scan
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<LossReport>> {
        self.scan.subscribe()
    }

    /// Signals the monitor to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| IdentityError::Background(format!("loss monitor join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for LossMonitor {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Re-runs loss detection every `interval` until stopped.
pub fn spawn_loss_monitor(subsystem: Arc<IdentitySubsystem>, interval: Duration) -> LossMonitor {
    let scan = Arc::new(LossScan::new(subsystem));
    let interval = interval.max(Duration::from_millis(10));
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let scan_for_worker = scan.clone();

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(interval) => {
                    scan_for_worker.pass().await;
                }
            }
        }
    });

    LossMonitor {
        scan,
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}
