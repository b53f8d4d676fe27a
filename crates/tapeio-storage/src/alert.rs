//! Operator alerts.

use std::fmt;
use tracing::{error, warn};

/// Severity of an alert
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertLevel {
    Warn,
    Error,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        })
    }
}

/// Sink for conditions an operator has to act on (cache sizing, failed
/// background passes)
pub trait AlertService: Send + Sync {
    fn create_alert(&self, level: AlertLevel, message: &str);
}

/// Emits alerts as `tracing` events on the `alert` target
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAlertService;

impl AlertService for TracingAlertService {
    fn create_alert(&self, level: AlertLevel, message: &str) {
        match level {
            AlertLevel::Warn => warn!(target: "alert", "{}", message),
            AlertLevel::Error => error!(target: "alert", "{}", message),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Keeps every alert for assertions
    #[derive(Default)]
    pub(crate) struct RecordingAlertService {
        alerts: Mutex<Vec<(AlertLevel, String)>>,
    }

    impl RecordingAlertService {
        pub(crate) fn alerts(&self) -> Vec<(AlertLevel, String)> {
            self.alerts.lock().clone()
        }
    }

    impl AlertService for RecordingAlertService {
        fn create_alert(&self, level: AlertLevel, message: &str) {
            self.alerts.lock().push((level, message.to_string()));
        }
    }

    #[test]
    fn test_recording_alerts() {
        let service = RecordingAlertService::default();
        service.create_alert(AlertLevel::Warn, "critical cache level");
        TracingAlertService.create_alert(AlertLevel::Error, "not recorded");
        assert_eq!(
            service.alerts(),
            vec![(AlertLevel::Warn, "critical cache level".to_string())]
        );
        assert_eq!(AlertLevel::Error.to_string(), "ERROR");
    }
}
