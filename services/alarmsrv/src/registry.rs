//! Alarm registry
//!
//! Canonical set of alarm entries keyed by (source, sid), kept in registration
//! order. Not synchronised; the manager owns it behind its lock.

use std::collections::{BTreeSet, HashMap};

use crate::domain::{Alarm, AlarmEntry, AlarmKey, AlarmRef};
use crate::error::{AlarmError, Result};

#[derive(Debug, Default)]
pub struct AlarmRegistry {
    entries: Vec<AlarmEntry>,
    index: HashMap<AlarmKey, usize>,
    /// Ids remembered from storage, reused when the same key registers again
    known_ids: HashMap<AlarmKey, i64>,
    next_id: i64,
}

impl AlarmRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    /// Seed ids loaded from storage. New registrations continue after the
    /// highest known id.
    pub fn with_known_ids<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = (AlarmKey, i64)>,
    {
        let mut registry = Self::new();
        for (key, id) in ids {
            registry.next_id = registry.next_id.max(id + 1);
            registry.known_ids.insert(key, id);
        }
        registry
    }

    /// Create the entry for (source, sid) or return the existing one.
    ///
    /// Returns the index and whether the entry was created.
    pub fn register(&mut self, source: &str, sid: &str, name: &str) -> Result<(usize, bool)> {
        if source.trim().is_empty() || sid.trim().is_empty() {
            return Err(AlarmError::validation("alarm source and sid must not be empty"));
        }

        let key = AlarmKey::new(source, sid);
        if let Some(&idx) = self.index.get(&key) {
            let existing = &self.entries[idx].alarm;
            if existing.name != name {
                return Err(AlarmError::conflict(format!(
                    "alarm {} already registered as '{}', not '{}'",
                    key, existing.name, name
                )));
            }
            return Ok((idx, false));
        }

        let id = match self.known_ids.get(&key) {
            Some(&id) => id,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                id
            },
        };

        let idx = self.entries.len();
        self.entries.push(AlarmEntry::new(Alarm::new(id, source, sid, name)));
        self.index.insert(key, idx);
        Ok((idx, true))
    }

    /// Resolve a lookup target to an entry index
    pub fn resolve(&self, target: AlarmRef<'_>) -> Result<usize> {
        if let Some(source) = target.source {
            return self
                .index
                .get(&AlarmKey::new(source, target.sid))
                .copied()
                .ok_or_else(|| AlarmError::not_found(format!("Alarm {}", target)));
        }

        let mut matches = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.alarm.sid == target.sid)
            .map(|(idx, _)| idx);

        match (matches.next(), matches.next()) {
            (Some(idx), None) => Ok(idx),
            (None, _) => Err(AlarmError::not_found(format!("Alarm {}", target.sid))),
            (Some(_), Some(_)) => Err(AlarmError::validation(format!(
                "sid '{}' is registered by more than one source, give the source too",
                target.sid
            ))),
        }
    }

    pub fn get(&self, idx: usize) -> Option<&AlarmEntry> {
        self.entries.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut AlarmEntry> {
        self.entries.get_mut(idx)
    }

    /// Indices of every entry owned by `source`, in registration order
    pub fn indices_of(&self, source: &str) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.alarm.source == source)
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Index of the alarm currently under test, if any
    pub fn testing(&self) -> Option<usize> {
        self.entries.iter().position(|e| e.alarm.is_testing)
    }

    pub fn list(&self) -> Vec<Alarm> {
        self.entries.iter().map(|e| e.alarm.clone()).collect()
    }

    pub fn sources(&self) -> BTreeSet<String> {
        self.entries.iter().map(|e| e.alarm.source.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
