//! Alarm lifecycle manager
//!
//! Single coarse lock over the registry. Every operation resolves its alarm,
//! applies the transition and enqueues the resulting snapshot while holding the
//! lock, so queue order equals transition order. The lock is released before
//! "changed" listeners run and never spans I/O.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::dispatcher::{Dispatcher, DispatcherOptions};
use crate::domain::{Alarm, AlarmChange, AlarmEntry, AlarmKey, AlarmRef, AlarmState, Transition};
use crate::error::{AlarmError, Result};
use crate::registry::AlarmRegistry;

/// Synchronous reaction to a change, run in the producer's context.
/// Must be quick and must not do I/O.
pub type ChangedListener = Arc<dyn Fn(&AlarmChange) + Send + Sync>;

struct Table {
    registry: AlarmRegistry,
    seq: u64,
    /// Last connectivity reported per source
    connected: HashMap<String, bool>,
}

impl Table {
    fn record(&mut self, idx: usize, transition: Transition) -> Option<AlarmChange> {
        let entry = self.registry.get(idx)?;
        self.seq += 1;
        Some(AlarmChange {
            seq: self.seq,
            kind: transition.kind,
            test_cancelled: transition.test_cancelled,
            alarm: entry.alarm.clone(),
            at: Utc::now(),
        })
    }
}

pub struct AlarmManager {
    table: Mutex<Table>,
    changed: RwLock<Vec<ChangedListener>>,
    dispatcher: Arc<Dispatcher>,
}

impl AlarmManager {
    pub fn new(options: DispatcherOptions) -> Self {
        Self::with_registry(AlarmRegistry::new(), options)
    }

    pub fn with_registry(registry: AlarmRegistry, options: DispatcherOptions) -> Self {
        Self {
            table: Mutex::new(Table {
                registry,
                seq: 0,
                connected: HashMap::new(),
            }),
            changed: RwLock::new(Vec::new()),
            dispatcher: Arc::new(Dispatcher::new(options)),
        }
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn on_changed(&self, listener: ChangedListener) {
        self.changed.write().push(listener);
    }

    fn notify(&self, changes: &[AlarmChange]) {
        if changes.is_empty() {
            return;
        }
        let listeners = self.changed.read().clone();
        for change in changes {
            for listener in &listeners {
                listener(change);
            }
        }
    }

    /// Apply one transition to one alarm under the lock
    fn apply<F>(&self, target: AlarmRef<'_>, op: F) -> Result<Option<AlarmChange>>
    where
        F: FnOnce(&mut AlarmEntry) -> Result<Option<Transition>>,
    {
        let change = {
            let mut table = self.table.lock();
            let idx = table.registry.resolve(target)?;
            let entry = table
                .registry
                .get_mut(idx)
                .ok_or_else(|| AlarmError::internal(format!("dangling index for {}", target)))?;

            let Some(transition) = op(entry)? else {
                return Ok(None);
            };
            let Some(change) = table.record(idx, transition) else {
                return Ok(None);
            };
            self.dispatcher.enqueue(change.clone());
            change
        };

        debug!("{} {:?} -> {}", change.key(), change.kind, change.alarm.state);
        self.notify(std::slice::from_ref(&change));
        Ok(Some(change))
    }

    /// Apply a transition to every alarm of a source under one lock
    fn apply_source<F>(&self, source: &str, connected: bool, mut op: F) -> Vec<AlarmChange>
    where
        F: FnMut(&mut AlarmEntry) -> Option<Transition>,
    {
        let changes = {
            let mut table = self.table.lock();
            table.connected.insert(source.to_string(), connected);

            let mut changes = Vec::new();
            for idx in table.registry.indices_of(source) {
                let Some(transition) = table.registry.get_mut(idx).and_then(&mut op) else {
                    continue;
                };
                if let Some(change) = table.record(idx, transition) {
                    self.dispatcher.enqueue(change.clone());
                    changes.push(change);
                }
            }
            changes
        };

        self.notify(&changes);
        changes
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Create or return the alarm for (source, sid)
    ///
    /// A new alarm of a source that is currently disconnected starts DISABLED,
    /// like its siblings, and comes back LOWERED on connect.
    pub fn register_alarm(&self, source: &str, sid: &str, name: &str) -> Result<Alarm> {
        let (alarm, change) = {
            let mut table = self.table.lock();
            let connected = table.connected.get(source).copied();
            let (idx, created) = table.registry.register(source, sid, name)?;
            let entry = table.registry.get_mut(idx).ok_or_else(|| {
                AlarmError::internal(format!("dangling index for {}:{}", source, sid))
            })?;

            if !created {
                return Ok(entry.alarm.clone());
            }
            info!("Alarm registered: {} '{}' id={}", entry.alarm.key(), name, entry.alarm.id);

            entry.alarm.connected = connected.unwrap_or(false);
            if connected != Some(false) {
                (entry.alarm.clone(), None)
            } else {
                let transition = entry.disconnect(Utc::now());
                let change = transition.and_then(|t| table.record(idx, t));
                if let Some(change) = &change {
                    self.dispatcher.enqueue(change.clone());
                }
                let alarm = table
                    .registry
                    .get(idx)
                    .map(|e| e.alarm.clone())
                    .ok_or_else(|| {
                        AlarmError::internal(format!("dangling index for {}:{}", source, sid))
                    })?;
                (alarm, change)
            }
        };

        if let Some(change) = change {
            debug!("{} registered while {} is disconnected", change.key(), source);
            self.notify(std::slice::from_ref(&change));
        }
        Ok(alarm)
    }

    pub fn get_alarm<'a>(&self, target: impl Into<AlarmRef<'a>>) -> Result<Alarm> {
        let table = self.table.lock();
        let idx = table.registry.resolve(target.into())?;
        table
            .registry
            .get(idx)
            .map(|e| e.alarm.clone())
            .ok_or_else(|| AlarmError::internal("dangling registry index"))
    }

    /// Snapshot of every alarm in registration order
    pub fn list_alarms(&self) -> Vec<Alarm> {
        self.table.lock().registry.list()
    }

    /// Alarms of one source in registration order
    pub fn alarms_of(&self, source: &str) -> Vec<Alarm> {
        let table = self.table.lock();
        table
            .registry
            .indices_of(source)
            .into_iter()
            .filter_map(|idx| table.registry.get(idx).map(|e| e.alarm.clone()))
            .collect()
    }

    /// Known sources with their connectivity
    pub fn sources(&self) -> BTreeMap<String, bool> {
        let table = self.table.lock();
        table
            .registry
            .sources()
            .into_iter()
            .map(|source| {
                let connected = table.connected.get(&source).copied().unwrap_or(false);
                (source, connected)
            })
            .collect()
    }

    pub fn is_connected(&self, source: &str) -> bool {
        self.table.lock().connected.get(source).copied().unwrap_or(false)
    }

    /// Alarm currently under test
    pub fn testing_alarm(&self) -> Option<Alarm> {
        let table = self.table.lock();
        table
            .registry
            .testing()
            .and_then(|idx| table.registry.get(idx))
            .map(|e| e.alarm.clone())
    }

    // ========================================================================
    // State machine operations
    // ========================================================================

    pub fn raise<'a>(
        &self,
        target: impl Into<AlarmRef<'a>>,
        state: AlarmState,
        message: &str,
        code: Option<i32>,
    ) -> Result<Option<AlarmChange>> {
        let now = Utc::now();
        self.apply(target.into(), |entry| entry.raise(state, message, code, now))
    }

    pub fn lower<'a>(
        &self,
        target: impl Into<AlarmRef<'a>>,
        message: &str,
    ) -> Result<Option<AlarmChange>> {
        let now = Utc::now();
        self.apply(target.into(), |entry| Ok(entry.lower(message, now)))
    }

    /// Bring every disabled alarm of `source` back to its last real reading
    pub fn connect(&self, source: &str) -> Vec<AlarmChange> {
        let changes = self.apply_source(source, true, |entry| entry.connect());
        info!("Source connected: {} ({} restored)", source, changes.len());
        changes
    }

    /// Disable every alarm of `source`; never implies lowered
    pub fn disconnect(&self, source: &str) -> Vec<AlarmChange> {
        let now = Utc::now();
        let changes = self.apply_source(source, false, |entry| entry.disconnect(now));
        info!("Source disconnected: {} ({} disabled)", source, changes.len());
        changes
    }

    /// Put one alarm under test. Only one test may be active manager-wide.
    pub fn start_test<'a>(
        &self,
        target: impl Into<AlarmRef<'a>>,
        state: AlarmState,
        message: &str,
    ) -> Result<AlarmChange> {
        let target = target.into();
        let now = Utc::now();

        let change = {
            let mut table = self.table.lock();
            let idx = table.registry.resolve(target)?;
            if let Some(active) = table.registry.testing().and_then(|i| table.registry.get(i)) {
                return Err(AlarmError::conflict(format!(
                    "test already active on {}",
                    active.alarm.key()
                )));
            }

            let entry = table
                .registry
                .get_mut(idx)
                .ok_or_else(|| AlarmError::internal(format!("dangling index for {}", target)))?;
            let transition = entry.start_test(state, message, now)?;
            let change = table
                .record(idx, transition)
                .ok_or_else(|| AlarmError::internal(format!("dangling index for {}", target)))?;
            self.dispatcher.enqueue(change.clone());
            change
        };

        info!("Test started: {} {}", change.key(), change.alarm.state);
        self.notify(std::slice::from_ref(&change));
        Ok(change)
    }

    /// End a test; no-op when the alarm is not testing
    pub fn end_test<'a>(&self, target: impl Into<AlarmRef<'a>>) -> Result<Option<AlarmChange>> {
        let change = self.apply(target.into(), |entry| Ok(entry.end_test()))?;
        if let Some(change) = &change {
            info!("Test ended: {} back to {}", change.key(), change.alarm.state);
        }
        Ok(change)
    }

    pub fn key_of<'a>(&self, target: impl Into<AlarmRef<'a>>) -> Result<AlarmKey> {
        self.get_alarm(target).map(|a| a.key())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::domain::ChangeKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> AlarmManager {
        let manager = AlarmManager::new(DispatcherOptions::default());
        manager.register_alarm("local", "gs", "Gensets").unwrap();
        manager.register_alarm("local", "iv", "Inverter").unwrap();
        manager.connect("local");
        manager
    }

    #[test]
    fn test_raise_enqueues_and_notifies() {
        let manager = manager();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            manager.on_changed(Arc::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let change = manager
            .raise("gs", AlarmState::Critical, "fuel low", None)
            .unwrap()
            .unwrap();
        assert_eq!(change.kind, ChangeKind::Raised);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(manager.dispatcher().depth(), 1);
    }

    #[test]
    fn test_registration_while_disconnected_reads_disabled() {
        let manager = AlarmManager::new(DispatcherOptions::default());
        manager.register_alarm("remote1", "gs", "Gensets").unwrap();
        manager.connect("remote1");
        manager.disconnect("remote1");
        let depth = manager.dispatcher().depth();

        let iv = manager.register_alarm("remote1", "iv", "Inverter").unwrap();
        assert_eq!(iv.state, AlarmState::Disabled);
        assert!(!iv.connected);
        assert!(iv.last_disabled.is_some());
        assert_eq!(manager.dispatcher().depth(), depth + 1);

        // Readings for the new alarm are dropped like its siblings'
        assert!(manager
            .raise(("remote1", "iv"), AlarmState::Critical, "on", None)
            .unwrap()
            .is_none());

        manager.connect("remote1");
        let iv = manager.get_alarm(("remote1", "iv")).unwrap();
        assert_eq!(iv.state, AlarmState::Lowered);
        assert!(iv.connected);
    }

    #[test]
    fn test_registration_of_unseen_source_stays_lowered() {
        let manager = AlarmManager::new(DispatcherOptions::default());
        let gs = manager.register_alarm("local", "gs", "Gensets").unwrap();
        assert_eq!(gs.state, AlarmState::Lowered);
        assert!(manager.connect("local").is_empty());
        assert_eq!(manager.dispatcher().depth(), 0);
    }

    #[test]
    fn test_lower_when_lowered_is_silent() {
        let manager = manager();
        assert!(manager.lower("gs", "ok").unwrap().is_none());
        assert_eq!(manager.dispatcher().depth(), 0);
    }

    #[test]
    fn test_unknown_alarm() {
        let manager = manager();
        let err = manager.raise("xx", AlarmState::Critical, "", None).unwrap_err();
        assert!(matches!(err, AlarmError::NotFound { .. }));
    }

    #[test]
    fn test_single_test_slot() {
        let manager = manager();
        manager.start_test("gs", AlarmState::Critical, "test").unwrap();

        let err = manager.start_test("iv", AlarmState::Moderate, "test").unwrap_err();
        assert!(matches!(err, AlarmError::Conflict(_)));
        assert!(manager.get_alarm("gs").unwrap().is_testing);
        assert!(!manager.get_alarm("iv").unwrap().is_testing);
        assert_eq!(manager.testing_alarm().unwrap().sid, "gs");
    }

    #[test]
    fn test_registration_inherits_connectivity() {
        let manager = manager();
        let alarm = manager.register_alarm("local", "hw", "High Water").unwrap();
        assert!(alarm.connected);

        let alarm = manager.register_alarm("remote1", "gs", "Gensets").unwrap();
        assert!(!alarm.connected);
        assert_eq!(manager.sources().get("remote1"), Some(&false));
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let manager = manager();
        let a = manager.raise("gs", AlarmState::Moderate, "a", None).unwrap().unwrap();
        let b = manager.raise("iv", AlarmState::Moderate, "b", None).unwrap().unwrap();
        let changes = manager.disconnect("local");
        assert!(a.seq < b.seq);
        assert!(changes.iter().all(|c| c.seq > b.seq));
    }
}
