//! Alert sinks: a `tracing` sink, an in-memory recorder and a gate that
//! silences kinds or acknowledged ids.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use tracevault_core::collab::{Alert, AlertKind, AlertSink, Severity};
use tracing::{debug, error, warn};

/// Emits alerts as log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn trigger_alert(&self, alert: Alert) {
        match alert.severity {
            Severity::Critical => error!(
                id = %alert.id,
                kind = %alert.kind,
                message = %alert.message,
                "alert"
            ),
            Severity::Warning => warn!(
                id = %alert.id,
                kind = %alert.kind,
                message = %alert.message,
                "alert"
            ),
        }
    }
}

/// Keeps every alert it receives.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn count_of(&self, kind: AlertKind) -> usize {
        self.alerts.lock().iter().filter(|a| a.kind == kind).count()
    }
}

impl AlertSink for MemoryAlertSink {
    fn trigger_alert(&self, alert: Alert) {
        self.alerts.lock().push(alert);
    }
}

pub struct AlertGate {
    inner: Arc<dyn AlertSink>,
    silenced: RwLock<HashMap<AlertKind, SystemTime>>,
    acknowledged: DashSet<String>,
}

impl AlertGate {
    pub fn new(inner: Arc<dyn AlertSink>) -> Self {
        Self {
            inner,
            silenced: RwLock::new(HashMap::new()),
            acknowledged: DashSet::new(),
        }
    }

    /// Drop alerts of `kind` until `until`.
    pub fn silence_kind(&self, kind: AlertKind, until: SystemTime) {
        self.silenced.write().insert(kind, until);
    }

    pub fn unsilence_kind(&self, kind: AlertKind) {
        self.silenced.write().remove(&kind);
    }

    /// Drop further alerts with this id until it is cleared.
    pub fn acknowledge(&self, id: impl Into<String>) {
        self.acknowledged.insert(id.into());
    }

    pub fn clear_acknowledgement(&self, id: &str) -> bool {
        self.acknowledged.remove(id).is_some()
    }

    pub fn should_trigger(&self, alert: &Alert) -> bool {
        if self.acknowledged.contains(&alert.id) {
            return false;
        }
        match self.silenced.read().get(&alert.kind) {
            Some(until) => alert.raised_at >= *until,
            None => true,
        }
    }
}

impl AlertSink for AlertGate {
    fn trigger_alert(&self, alert: Alert) {
        if self.should_trigger(&alert) {
            self.inner.trigger_alert(alert);
        } else {
            debug!(id = %alert.id, kind = %alert.kind, "alert gated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tracevault_core::collab::AlertSubject;

    fn failover(provider: &str) -> Alert {
        Alert::new(
            AlertKind::StorageFailover,
            AlertSubject::Provider(provider.to_string()),
            Severity::Critical,
            "down",
        )
    }

    fn gate() -> (Arc<MemoryAlertSink>, AlertGate) {
        let sink = Arc::new(MemoryAlertSink::default());
        let gate = AlertGate::new(sink.clone());
        (sink, gate)
    }

    #[test]
    fn test_ungated_alerts_pass_through() {
        let (sink, gate) = gate();
        gate.trigger_alert(failover("s3"));
        assert_eq!(sink.alerts().len(), 1);
        assert_eq!(sink.alerts()[0].id, "storage_failover/s3");
    }

    #[test]
    fn test_silenced_kind_is_dropped_until_deadline() {
        let (sink, gate) = gate();
        let now = SystemTime::now();
        gate.silence_kind(AlertKind::StorageFailover, now + Duration::from_secs(3600));
        gate.trigger_alert(failover("s3"));
        assert!(sink.alerts().is_empty());

        let mut late = failover("s3");
        late.raised_at = now + Duration::from_secs(7200);
        gate.trigger_alert(late);
        assert_eq!(sink.count_of(AlertKind::StorageFailover), 1);
    }

    #[test]
    fn test_acknowledged_id_is_dropped() {
        let (sink, gate) = gate();
        gate.acknowledge("storage_failover/s3");
        gate.trigger_alert(failover("s3"));
        gate.trigger_alert(failover("gcs"));
        assert_eq!(sink.alerts().len(), 1);

        assert!(gate.clear_acknowledgement("storage_failover/s3"));
        gate.trigger_alert(failover("s3"));
        assert_eq!(sink.alerts().len(), 2);
    }
}
