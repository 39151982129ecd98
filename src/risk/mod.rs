//! Risk management: liquidation-distance monitoring and emergency closing.

pub mod closer;
pub mod monitor;

pub use closer::{CloseReport, CloseTrigger, EmergencyCloser};
pub use monitor::{assess, RiskAssessment, RiskMonitor, Severity};
