//! Klassifikation von Transport-Statistiken
//!
//! Reine Funktionen: gleiche Statistik, gleiche Note, gleiche Issues.
//! Keine Glättung, jede Messung wird für sich bewertet.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

// ============================================================================
// THRESHOLDS
// ============================================================================

const EXCELLENT_MAX_LOSS: f64 = 1.0;
const EXCELLENT_MAX_LATENCY_MS: u32 = 150;
const EXCELLENT_MIN_BITRATE_KBPS: f64 = 150.0;

const GOOD_MAX_LOSS: f64 = 3.0;
const GOOD_MAX_LATENCY_MS: u32 = 250;
const GOOD_MIN_BITRATE_KBPS: f64 = 30.0;

const FAIR_MAX_LOSS: f64 = 5.0;
const FAIR_MAX_LATENCY_MS: u32 = 400;

const ISSUE_LATENCY_MS: u32 = 500;
const ISSUE_LOSS: f64 = 7.0;
const ISSUE_BITRATE_KBPS: f64 = 150.0;

// ============================================================================
// TRANSPORT STATS
// ============================================================================

/// Eine Rohmessung der Transport-Statistik
///
/// Paketverlust in Prozent (0-100), Bitraten in kbps.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct TransportStats {
    pub tx_bitrate_kbps: f64,
    pub rx_bitrate_kbps: f64,
    pub tx_packet_loss: f64,
    pub rx_packet_loss: f64,
    pub round_trip_ms: u32,
    pub cpu_usage: Option<f32>,
    pub memory_usage: Option<f32>,
    /// Kumulierte Bytes seit Beginn der Media-Verbindung
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl TransportStats {
    /// Symmetrische Messung, beide Richtungen mit denselben Werten
    pub fn uniform(packet_loss: f64, round_trip_ms: u32, bitrate_kbps: f64) -> Self {
        Self {
            tx_bitrate_kbps: bitrate_kbps,
            rx_bitrate_kbps: bitrate_kbps,
            tx_packet_loss: packet_loss,
            rx_packet_loss: packet_loss,
            round_trip_ms,
            ..Default::default()
        }
    }

    /// Verlust der schlechteren Richtung
    pub fn packet_loss(&self) -> f64 {
        self.tx_packet_loss.max(self.rx_packet_loss)
    }

    /// Bitrate der schwächeren Richtung
    pub fn bitrate_kbps(&self) -> f64 {
        self.tx_bitrate_kbps.min(self.rx_bitrate_kbps)
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_sent.saturating_add(self.bytes_received)
    }
}

// ============================================================================
// GRADE & ISSUES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CallQualityGrade {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl fmt::Display for CallQualityGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallQualityGrade::Excellent => write!(f, "excellent"),
            CallQualityGrade::Good => write!(f, "good"),
            CallQualityGrade::Fair => write!(f, "fair"),
            CallQualityGrade::Poor => write!(f, "poor"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CallQualityIssue {
    HighLatency,
    PacketLoss,
    LowBitrate,
}

impl CallQualityIssue {
    /// Rang für die Reihenfolge von Benachrichtigungen, höher ist wichtiger
    pub const fn severity(self) -> u8 {
        match self {
            CallQualityIssue::PacketLoss => 3,
            CallQualityIssue::HighLatency => 2,
            CallQualityIssue::LowBitrate => 1,
        }
    }
}

/// Note einer Messung; Excellent → Good → Fair, erster Treffer gewinnt
pub fn classify(stats: &TransportStats) -> CallQualityGrade {
    let loss = stats.packet_loss();
    let latency = stats.round_trip_ms;
    let bitrate = stats.bitrate_kbps();

    if loss <= EXCELLENT_MAX_LOSS
        && latency <= EXCELLENT_MAX_LATENCY_MS
        && bitrate >= EXCELLENT_MIN_BITRATE_KBPS
    {
        CallQualityGrade::Excellent
    } else if loss <= GOOD_MAX_LOSS
        && latency <= GOOD_MAX_LATENCY_MS
        && bitrate >= GOOD_MIN_BITRATE_KBPS
    {
        CallQualityGrade::Good
    } else if loss <= FAIR_MAX_LOSS && latency <= FAIR_MAX_LATENCY_MS {
        CallQualityGrade::Fair
    } else {
        CallQualityGrade::Poor
    }
}

/// Alle Issues einer Messung, nach Schwere absteigend sortiert
pub fn detect_issues(stats: &TransportStats) -> Vec<CallQualityIssue> {
    let mut issues = Vec::new();

    if stats.packet_loss() > ISSUE_LOSS {
        issues.push(CallQualityIssue::PacketLoss);
    }
    if stats.round_trip_ms > ISSUE_LATENCY_MS {
        issues.push(CallQualityIssue::HighLatency);
    }
    if stats.bitrate_kbps() < ISSUE_BITRATE_KBPS {
        issues.push(CallQualityIssue::LowBitrate);
    }

    issues.sort_by_key(|issue| std::cmp::Reverse(issue.severity()));
    issues
}

/// Bewertete Messung, wie sie an die Call State Machine geht
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub stats: TransportStats,
    pub grade: CallQualityGrade,
    pub issues: Vec<CallQualityIssue>,
    pub sampled_at: DateTime<Utc>,
}

impl QualityReport {
    pub fn from_stats(stats: TransportStats) -> Self {
        Self {
            grade: classify(&stats),
            issues: detect_issues(&stats),
            stats,
            sampled_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excellent_sample() {
        let stats = TransportStats::uniform(0.5, 100, 200.0);
        assert_eq!(classify(&stats), CallQualityGrade::Excellent);
        assert!(detect_issues(&stats).is_empty());
    }

    #[test]
    fn test_poor_sample_raises_all_issues() {
        let stats = TransportStats::uniform(8.0, 600, 100.0);
        assert_eq!(classify(&stats), CallQualityGrade::Poor);
        assert_eq!(
            detect_issues(&stats),
            vec![
                CallQualityIssue::PacketLoss,
                CallQualityIssue::HighLatency,
                CallQualityIssue::LowBitrate,
            ]
        );
    }

    #[test]
    fn test_tier_boundaries_are_inclusive() {
        assert_eq!(
            classify(&TransportStats::uniform(1.0, 150, 150.0)),
            CallQualityGrade::Excellent
        );
        assert_eq!(
            classify(&TransportStats::uniform(3.0, 250, 30.0)),
            CallQualityGrade::Good
        );
        assert_eq!(
            classify(&TransportStats::uniform(5.0, 400, 0.0)),
            CallQualityGrade::Fair
        );
        assert_eq!(
            classify(&TransportStats::uniform(5.1, 100, 500.0)),
            CallQualityGrade::Poor
        );
        assert_eq!(
            classify(&TransportStats::uniform(0.0, 401, 500.0)),
            CallQualityGrade::Poor
        );
    }

    #[test]
    fn test_low_bitrate_drops_to_fair_not_poor() {
        // Fair prüft keine Bitrate
        let stats = TransportStats::uniform(0.2, 80, 10.0);
        assert_eq!(classify(&stats), CallQualityGrade::Fair);
        assert_eq!(detect_issues(&stats), vec![CallQualityIssue::LowBitrate]);
    }

    #[test]
    fn test_worst_direction_counts() {
        let stats = TransportStats {
            tx_bitrate_kbps: 300.0,
            rx_bitrate_kbps: 120.0,
            tx_packet_loss: 0.1,
            rx_packet_loss: 2.5,
            round_trip_ms: 90,
            ..Default::default()
        };
        assert_eq!(stats.packet_loss(), 2.5);
        assert_eq!(stats.bitrate_kbps(), 120.0);
        assert_eq!(classify(&stats), CallQualityGrade::Good);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let stats = TransportStats::uniform(4.0, 300, 64.0);
        let first = QualityReport::from_stats(stats);
        let second = QualityReport::from_stats(stats);
        assert_eq!(first.grade, second.grade);
        assert_eq!(first.issues, second.issues);
        assert_eq!(first.grade, CallQualityGrade::Fair);
    }

    #[test]
    fn test_severity_order() {
        assert!(CallQualityIssue::PacketLoss.severity() > CallQualityIssue::HighLatency.severity());
        assert!(CallQualityIssue::HighLatency.severity() > CallQualityIssue::LowBitrate.severity());
    }
}
