//! In-process synchronous publish/subscribe
//!
//! Receivers are called on the dispatching task, in registration order, and
//! must not block.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::warn;

use crate::protocol::InMethod;

/// A signal receiver
pub type Receiver<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

/// A named signal with zero or more receivers
pub struct Signal<T> {
    receivers: Mutex<Vec<(String, Receiver<T>)>>,
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self {
            receivers: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a receiver. A receiver whose dispatch uid is already connected
    /// is ignored. Returns the uid to disconnect with.
    pub fn connect(&self, receiver: Receiver<T>, dispatch_uid: Option<&str>) -> String {
        let uid = dispatch_uid
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        let mut receivers = self.lock();
        if !receivers.iter().any(|(id, _)| *id == uid) {
            receivers.push((uid.clone(), receiver));
        }
        uid
    }

    /// Returns true if a receiver was removed
    pub fn disconnect(&self, dispatch_uid: &str) -> bool {
        let mut receivers = self.lock();
        let before = receivers.len();
        receivers.retain(|(id, _)| id != dispatch_uid);
        receivers.len() != before
    }

    pub fn receiver_count(&self) -> usize {
        self.lock().len()
    }

    /// Call every receiver, stopping at the first failure
    pub fn send(&self, data: &T) -> anyhow::Result<usize> {
        let receivers = self.snapshot();
        for receiver in &receivers {
            receiver(data)?;
        }
        Ok(receivers.len())
    }

    /// Call every receiver; failures are collected rather than propagated
    pub fn send_robust(&self, data: &T) -> Vec<(String, anyhow::Result<()>)> {
        self.snapshot_with_ids()
            .into_iter()
            .map(|(id, receiver)| {
                let result = receiver(data);
                (id, result)
            })
            .collect()
    }

    // Receivers are called outside the lock so they may connect/disconnect.
    fn snapshot(&self) -> Vec<Receiver<T>> {
        self.lock().iter().map(|(_, r)| Arc::clone(r)).collect()
    }

    fn snapshot_with_ids(&self) -> Vec<(String, Receiver<T>)> {
        self.lock()
            .iter()
            .map(|(id, r)| (id.clone(), Arc::clone(r)))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(String, Receiver<T>)>> {
        self.receivers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One signal per inbound broker method
pub struct SignalBus {
    signals: HashMap<InMethod, Signal<Value>>,
}

impl Default for SignalBus {
    fn default() -> Self {
        Self {
            signals: InMethod::ALL.iter().map(|m| (*m, Signal::new())).collect(),
        }
    }
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self, method: InMethod) -> Option<&Signal<Value>> {
        self.signals.get(&method)
    }

    pub fn connect(&self, method: InMethod, receiver: Receiver<Value>) -> Option<String> {
        self.signal(method).map(|s| s.connect(receiver, None))
    }

    /// Dispatch inbound data to the method's receivers; returns how many ran
    pub fn dispatch(&self, method: InMethod, data: &Value) -> usize {
        let Some(signal) = self.signal(method) else {
            return 0;
        };

        let results = signal.send_robust(data);
        for (id, result) in &results {
            if let Err(e) = result {
                warn!("Signal receiver {} for {} failed: {:#}", id, method, e);
            }
        }
        results.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_receiver(counter: Arc<AtomicUsize>) -> Receiver<Value> {
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_connect_is_deduplicated_by_uid() {
        let signal = Signal::<Value>::new();
        let counter = Arc::new(AtomicUsize::new(0));

        signal.connect(counter_receiver(counter.clone()), Some("cancel"));
        signal.connect(counter_receiver(counter.clone()), Some("cancel"));
        assert_eq!(signal.receiver_count(), 1);

        assert_eq!(signal.send(&Value::Null).unwrap(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disconnect() {
        let signal = Signal::<Value>::new();
        let uid = signal.connect(Arc::new(|_| Ok(())), None);
        assert!(signal.disconnect(&uid));
        assert!(!signal.disconnect(&uid));
        assert_eq!(signal.receiver_count(), 0);
    }

    #[test]
    fn test_send_robust_collects_failures() {
        let signal = Signal::<Value>::new();
        let counter = Arc::new(AtomicUsize::new(0));

        signal.connect(Arc::new(|_| anyhow::bail!("boom")), Some("bad"));
        signal.connect(counter_receiver(counter.clone()), Some("good"));

        let results = signal.send_robust(&Value::Null);
        assert_eq!(results.len(), 2);
        assert!(results[0].1.is_err());
        assert!(results[1].1.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // plain send stops at the first failure
        assert!(signal.send(&Value::Null).is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bus_dispatch_routes_by_method() {
        let bus = SignalBus::new();
        let cancels = Arc::new(AtomicUsize::new(0));
        bus.connect(InMethod::Cancel, counter_receiver(cancels.clone()));

        assert_eq!(bus.dispatch(InMethod::Cancel, &Value::Null), 1);
        assert_eq!(bus.dispatch(InMethod::GetStatus, &Value::Null), 0);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }
}
