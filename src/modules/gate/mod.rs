//! Per-domain admission control.
//!
//! One semaphore per normalized domain. Capacity follows the value passed on
//! each acquisition: growth adds permits, shrinking forgets free permits and
//! records the remainder as a debt paid off by permits released later.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Error)]
pub enum GateError {
    #[error("concurrency gate for {0} was closed")]
    Closed(String),
    #[error("concurrency gate registry lock poisoned")]
    Poisoned,
}

/// Slot held for the duration of one attempt. Dropping it frees the slot.
#[derive(Debug)]
pub struct GatePermit {
    domain: String,
    _permit: OwnedSemaphorePermit,
}

impl GatePermit {
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

#[derive(Debug)]
struct DomainSlot {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    /// Permits still owed after a shrink while slots were held.
    debt: usize,
}

impl DomainSlot {
    fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            debt: 0,
        }
    }

    fn resize(&mut self, domain: &str, capacity: usize) {
        if capacity == self.capacity {
            return;
        }
        if capacity > self.capacity {
            let grow = capacity - self.capacity;
            let settled = grow.min(self.debt);
            self.debt -= settled;
            self.semaphore.add_permits(grow - settled);
        } else {
            let shrink = self.capacity - capacity;
            let forgotten = self.semaphore.forget_permits(shrink);
            self.debt += shrink - forgotten;
        }
        log::debug!(
            "concurrency gate for {domain} resized {} -> {capacity} slots",
            self.capacity
        );
        self.capacity = capacity;
    }
}

#[derive(Debug, Default)]
pub struct ConcurrencyGate {
    slots: Mutex<HashMap<String, DomainSlot>>,
}

impl ConcurrencyGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for a slot on `domain`, bounding it to `capacity` in-flight holders.
    pub async fn acquire(&self, domain: &str, capacity: usize) -> Result<GatePermit, GateError> {
        loop {
            let semaphore = self.slot(domain, capacity)?;
            let permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| GateError::Closed(domain.to_string()))?;
            if self.settle_debt(domain)? {
                permit.forget();
                continue;
            }
            return Ok(GatePermit {
                domain: domain.to_string(),
                _permit: permit,
            });
        }
    }

    /// Slots currently free on `domain`, if it has been seen.
    pub fn available(&self, domain: &str) -> Option<usize> {
        self.slots
            .lock()
            .ok()?
            .get(domain)
            .map(|slot| slot.semaphore.available_permits().saturating_sub(slot.debt))
    }

    /// Current capacity of `domain`, if it has been seen.
    pub fn capacity(&self, domain: &str) -> Option<usize> {
        self.slots.lock().ok()?.get(domain).map(|slot| slot.capacity)
    }

    fn slot(&self, domain: &str, capacity: usize) -> Result<Arc<Semaphore>, GateError> {
        let capacity = capacity.max(1);
        let mut slots = self.slots.lock().map_err(|_| GateError::Poisoned)?;
        let slot = slots.entry(domain.to_string()).or_insert_with(|| {
            log::debug!("concurrency gate for {domain} created with {capacity} slots");
            DomainSlot::new(capacity)
        });
        slot.resize(domain, capacity);
        Ok(slot.semaphore.clone())
    }

    /// Consume one unit of shrink debt, if any is outstanding.
    fn settle_debt(&self, domain: &str) -> Result<bool, GateError> {
        let mut slots = self.slots.lock().map_err(|_| GateError::Poisoned)?;
        Ok(match slots.get_mut(domain) {
            Some(slot) if slot.debt > 0 => {
                slot.debt -= 1;
                true
            }
            _ => false,
        })
    }
}
