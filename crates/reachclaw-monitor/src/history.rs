//! Fixed-capacity alert history.

use arc_swap::ArcSwap;
use reachclaw_core::types::Alert;
use std::collections::VecDeque;
use std::sync::Arc;

/// Most recent alerts, oldest evicted first.
///
/// Readers take a snapshot without locking. A push builds the next buffer
/// and swaps it in; it never mutates a buffer a reader may hold.
pub struct AlertHistory {
    buf: ArcSwap<VecDeque<Alert>>,
    capacity: usize,
}

impl AlertHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: ArcSwap::from_pointee(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, alert: Alert) {
        self.extend(std::iter::once(alert));
    }

    /// Append in order, evicting from the front once full.
    pub fn extend(&self, alerts: impl IntoIterator<Item = Alert>) {
        let alerts: Vec<Alert> = alerts.into_iter().collect();
        if alerts.is_empty() || self.capacity == 0 {
            return;
        }
        self.buf.rcu(|current| {
            let mut next = VecDeque::clone(current);
            for alert in &alerts {
                if next.len() == self.capacity {
                    next.pop_front();
                }
                next.push_back(alert.clone());
            }
            next
        });
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Arc<VecDeque<Alert>> {
        self.buf.load_full()
    }

    /// Up to `n` alerts, newest first.
    pub fn recent(&self, n: usize) -> Vec<Alert> {
        self.buf.load().iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buf.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use reachclaw_core::types::Severity;

    fn alert(n: usize) -> Alert {
        Alert {
            rule_id: format!("r{n}"),
            rule_name: format!("rule {n}"),
            fired_at: Utc::now(),
            message: format!("firing {n}"),
            severity: Severity::Info,
            tenant_id: None,
        }
    }

    #[test]
    fn test_keeps_last_n_in_order() {
        let n = 10;
        let history = AlertHistory::new(n);
        for i in 0..n + 5 {
            history.push(alert(i));
        }
        let snap = history.snapshot();
        assert_eq!(snap.len(), n);
        let ids: Vec<&str> = snap.iter().map(|a| a.rule_id.as_str()).collect();
        let expected: Vec<String> = (5..n + 5).map(|i| format!("r{i}")).collect();
        assert_eq!(ids, expected.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[test]
    fn test_capacity_five_after_ten_firings() {
        let history = AlertHistory::new(5);
        history.extend((0..10).map(alert));
        let ids: Vec<String> = history.snapshot().iter().map(|a| a.rule_id.clone()).collect();
        assert_eq!(ids, vec!["r5", "r6", "r7", "r8", "r9"]);
        assert_eq!(history.recent(2)[0].rule_id, "r9");
    }

    #[test]
    fn test_snapshot_unaffected_by_later_push() {
        let history = AlertHistory::new(2);
        history.push(alert(1));
        let before = history.snapshot();
        history.push(alert(2));
        history.push(alert(3));
        assert_eq!(before.len(), 1);
        assert_eq!(history.len(), 2);
    }
}
