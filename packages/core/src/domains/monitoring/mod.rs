//! Monitoring subsystem (§4.7): metrics, alerts, and the periodic health
//! checks that feed them.

pub mod effects;
pub mod models;
pub mod monitor;

pub use effects::MonitoringRepository;
pub use models::{Alert, AlertSeverity, AlertType, Metric};
pub use monitor::Monitor;
