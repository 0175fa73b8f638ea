//! Quality Monitor
//!
//! Tastet während eines verbundenen Anrufs periodisch die Transport-Statistik
//! ab, bewertet sie und schickt das Ergebnis an die Call Engine.

use super::grade::{QualityReport, TransportStats};
use crate::media::MediaError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Quelle für Transport-Statistiken (in der Regel die Media-Pipeline)
#[async_trait]
pub trait StatsProvider: Send + Sync {
    async fn sample_stats(&self) -> Result<TransportStats, MediaError>;
}

// ============================================================================
// QUALITY MONITOR
// ============================================================================

/// Handle auf den Sampling-Task; `stop` oder Drop beendet ihn sofort
pub struct QualityMonitor {
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl QualityMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Startet das Sampling; ein laufender Task wird vorher beendet
    pub fn start<P>(&mut self, provider: Arc<P>, report_tx: mpsc::Sender<QualityReport>)
    where
        P: StatsProvider + ?Sized + 'static,
    {
        self.stop();

        let period = self.interval;
        tracing::debug!("Starting quality monitor ({:?} interval)", period);

        self.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                let stats = match provider.sample_stats().await {
                    Ok(stats) => stats,
                    Err(e) => {
                        tracing::warn!("Failed to sample transport stats: {}", e);
                        continue;
                    }
                };

                let report = QualityReport::from_stats(stats);
                tracing::trace!(
                    "Quality sample: {} (loss {:.1}%, rtt {} ms, {:.0} kbps)",
                    report.grade,
                    stats.packet_loss(),
                    stats.round_trip_ms,
                    stats.bitrate_kbps()
                );

                if report_tx.send(report).await.is_err() {
                    break;
                }
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!("Quality monitor stopped");
        }
    }
}

impl Drop for QualityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for QualityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QualityMonitor")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::CallQualityGrade;
    use parking_lot::Mutex;

    /// Liefert vorgegebene Messungen der Reihe nach, danach Fehler
    struct ScriptedStats {
        samples: Mutex<Vec<TransportStats>>,
    }

    #[async_trait]
    impl StatsProvider for ScriptedStats {
        async fn sample_stats(&self) -> Result<TransportStats, MediaError> {
            let mut samples = self.samples.lock();
            if samples.is_empty() {
                Err(MediaError::NoSession)
            } else {
                Ok(samples.remove(0))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_on_interval() {
        let provider = Arc::new(ScriptedStats {
            samples: Mutex::new(vec![
                TransportStats::uniform(0.5, 100, 200.0),
                TransportStats::uniform(8.0, 600, 100.0),
            ]),
        });
        let (tx, mut rx) = mpsc::channel(8);
        let mut monitor = QualityMonitor::new(Duration::from_secs(2));
        monitor.start(provider, tx);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.grade, CallQualityGrade::Excellent);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.grade, CallQualityGrade::Poor);
        assert_eq!(second.issues.len(), 3);

        assert!(monitor.is_running());
        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_sample_waits_one_interval() {
        let provider = Arc::new(ScriptedStats {
            samples: Mutex::new(vec![TransportStats::uniform(0.5, 100, 200.0)]),
        });
        let (tx, mut rx) = mpsc::channel(8);
        let mut monitor = QualityMonitor::new(Duration::from_secs(5));
        let started = Instant::now();
        monitor.start(provider, tx);

        rx.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_channel() {
        let provider = Arc::new(ScriptedStats {
            samples: Mutex::new(Vec::new()),
        });
        let (tx, mut rx) = mpsc::channel(8);
        let mut monitor = QualityMonitor::new(Duration::from_millis(100));
        monitor.start(provider, tx);
        monitor.stop();

        // Task ist abgebrochen, der einzige Sender damit gedroppt
        assert!(rx.recv().await.is_none());
    }
}
