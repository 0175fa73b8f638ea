//! Quality Module - Bewertung der Verbindungsqualität
//!
//! - reine Klassifikation einer Messung in Note und Issues
//! - periodischer Sampling-Task während `Connected`

mod grade;
mod monitor;

pub use grade::{
    classify, detect_issues, CallQualityGrade, CallQualityIssue, QualityReport, TransportStats,
};
pub use monitor::{QualityMonitor, StatsProvider};
