//! In-memory backend. Test builds can make it fail on purpose.

use dashmap::DashMap;
#[cfg(test)]
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{KvBackend, KvError, KvHandle, OpenMode, check_name, check_value};

/// Operation at which [`MemoryKvStore`] fails on purpose.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    Open,
    Write,
    Commit,
}

/// Volatile backend. Contents are lost when the process exits.
#[derive(Default)]
pub struct MemoryKvStore {
    namespaces: DashMap<String, HashMap<String, String>>,
    #[cfg(test)]
    fault: Mutex<Option<FaultPoint>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following operation of the given kind fail until cleared with `None`.
    #[cfg(test)]
    pub fn inject_fault(&self, fault: Option<FaultPoint>) {
        *self.fault.lock() = fault;
    }

    #[cfg(test)]
    fn trip(&self, point: FaultPoint) -> Result<(), KvError> {
        match *self.fault.lock() {
            Some(fault) if fault == point => Err(KvError::Fault(point)),
            _ => Ok(()),
        }
    }
}

impl KvBackend for MemoryKvStore {
    fn open(&self, namespace: &str, mode: OpenMode) -> Result<Box<dyn KvHandle + '_>, KvError> {
        check_name(namespace)?;
        #[cfg(test)]
        self.trip(FaultPoint::Open)?;
        match mode {
            OpenMode::ReadOnly if !self.namespaces.contains_key(namespace) => {
                return Err(KvError::NotFound);
            }
            OpenMode::ReadOnly => {}
            OpenMode::ReadWrite => {
                self.namespaces.entry(namespace.to_string()).or_default();
            }
        }
        Ok(Box::new(MemoryHandle {
            store: self,
            namespace: namespace.to_string(),
            mode,
            staged: Vec::new(),
        }))
    }
}

struct MemoryHandle<'a> {
    store: &'a MemoryKvStore,
    namespace: String,
    mode: OpenMode,
    staged: Vec<(String, String)>,
}

impl KvHandle for MemoryHandle<'_> {
    fn get_str(&self, key: &str) -> Result<String, KvError> {
        check_name(key)?;
        self.store
            .namespaces
            .get(self.namespace.as_str())
            .and_then(|entries| entries.get(key).cloned())
            .ok_or(KvError::NotFound)
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), KvError> {
        if self.mode == OpenMode::ReadOnly {
            return Err(KvError::ReadOnly);
        }
        check_name(key)?;
        check_value(value)?;
        #[cfg(test)]
        self.store.trip(FaultPoint::Write)?;
        self.staged.push((key.to_string(), value.to_string()));
        Ok(())
    }

    fn commit(&mut self) -> Result<(), KvError> {
        #[cfg(test)]
        self.store.trip(FaultPoint::Commit)?;
        if self.staged.is_empty() {
            return Ok(());
        }
        // The entry guard keeps the shard locked, readers see all staged values or none.
        let mut entries = self
            .store
            .namespaces
            .entry(self.namespace.clone())
            .or_default();
        for (key, value) in self.staged.drain(..) {
            entries.insert(key, value);
        }
        Ok(())
    }
}
