//! The shared, ordered list of monitored endpoints.

mod persist;

pub use persist::*;

use crate::endpoint::{Endpoint, EndpointRecord};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, RwLock};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Endpoint index {0} is already in use")]
    DuplicateIndex(u32),
}

/// One endpoint plus its in-flight marker.
///
/// The mutex is only held to snapshot or commit, never across network I/O.
#[derive(Debug)]
pub struct Slot {
    index: u32,
    endpoint: Mutex<Endpoint>,
    busy: AtomicBool,
}

/// Exclusive right to run a round for a slot. Released on drop.
#[derive(Debug)]
pub struct Claim {
    slot: Arc<Slot>,
}

impl Slot {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            index: endpoint.index(),
            endpoint: Mutex::new(endpoint),
            busy: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub async fn lock(&self) -> MutexGuard<'_, Endpoint> {
        self.endpoint.lock().await
    }

    /// Mark the slot busy, or `None` if a round is already outstanding.
    pub fn try_claim(self: &Arc<Self>) -> Option<Claim> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Claim { slot: self.clone() })
    }
}

impl Claim {
    pub fn slot(&self) -> &Arc<Slot> {
        &self.slot
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}

/// Ordered endpoint list shared between the scheduler and its callers.
#[derive(Debug, Default)]
pub struct Registry {
    slots: RwLock<Vec<Arc<Slot>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<EndpointRecord>) -> Result<Self, RegistryError> {
        Self::from_endpoints(records.into_iter().map(Endpoint::from))
    }

    pub fn from_endpoints<I>(endpoints: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = Endpoint>,
    {
        let mut slots: Vec<Arc<Slot>> = Vec::new();
        for endpoint in endpoints {
            if slots.iter().any(|s| s.index == endpoint.index()) {
                return Err(RegistryError::DuplicateIndex(endpoint.index()));
            }
            slots.push(Arc::new(Slot::new(endpoint)));
        }
        Ok(Self {
            slots: RwLock::new(slots),
        })
    }

    /// Append an endpoint.
    pub async fn add(&self, endpoint: Endpoint) -> Result<Arc<Slot>, RegistryError> {
        let mut slots = self.slots.write().await;
        if slots.iter().any(|s| s.index == endpoint.index()) {
            return Err(RegistryError::DuplicateIndex(endpoint.index()));
        }

        let slot = Arc::new(Slot::new(endpoint));
        slots.push(slot.clone());
        tracing::info!("Registry: Added endpoint {}", slot.index);
        Ok(slot)
    }

    /// Remove an endpoint. Its statistics are discarded; an outstanding round
    /// still finishes against the detached slot.
    pub async fn remove(&self, index: u32) -> Option<Arc<Slot>> {
        let mut slots = self.slots.write().await;
        let pos = slots.iter().position(|s| s.index == index)?;
        tracing::info!("Registry: Removed endpoint {}", index);
        Some(slots.remove(pos))
    }

    pub async fn get(&self, index: u32) -> Option<Arc<Slot>> {
        self.slots
            .read()
            .await
            .iter()
            .find(|s| s.index == index)
            .cloned()
    }

    /// The next unused index, one past the highest in use. `None` once
    /// `u32::MAX` is taken.
    pub async fn next_index(&self) -> Option<u32> {
        match self.slots.read().await.iter().map(|s| s.index).max() {
            Some(highest) => highest.checked_add(1),
            None => Some(0),
        }
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    /// Cheap copy of the current list for one scheduler round.
    pub async fn snapshot(&self) -> Vec<Arc<Slot>> {
        self.slots.read().await.clone()
    }

    /// Configuration of every endpoint, in list order.
    pub async fn records(&self) -> Vec<EndpointRecord> {
        let mut records = Vec::new();
        for slot in self.snapshot().await {
            records.push(EndpointRecord::from(&*slot.lock().await));
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::parse_address;

    fn endpoint(token: &str, index: u32) -> Endpoint {
        parse_address(token, index).unwrap()
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let registry = Registry::new();
        registry.add(endpoint("example.com", 0)).await.unwrap();
        registry.add(endpoint("192.0.2.1:22", 1)).await.unwrap();

        assert_eq!(registry.len().await, 2);
        assert_eq!(registry.next_index().await, Some(2));

        let slot = registry.get(1).await.unwrap();
        assert_eq!(slot.lock().await.port(), 22);

        assert!(registry.remove(0).await.is_some());
        assert!(registry.remove(0).await.is_none());
        assert!(registry.get(0).await.is_none());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_index_rejected() {
        let registry = Registry::new();
        registry.add(endpoint("example.com", 4)).await.unwrap();
        let err = registry.add(endpoint("example.net", 4)).await.unwrap_err();
        assert_eq!(err, RegistryError::DuplicateIndex(4));

        let res = Registry::from_endpoints(vec![
            endpoint("a.example", 1),
            endpoint("b.example", 1),
        ]);
        assert!(matches!(res, Err(RegistryError::DuplicateIndex(1))));
    }

    #[tokio::test]
    async fn test_records_round_trip_through_registry() {
        let registry = Registry::from_endpoints(vec![
            endpoint("example.com:8443", 0),
            endpoint("192.0.2.7", 3),
        ])
        .unwrap();
        let records = registry.records().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].port, 8443);
        assert_eq!(records[1].index, 3);

        let restored = Registry::from_records(records.clone()).unwrap();
        assert_eq!(restored.records().await, records);
        assert_eq!(restored.next_index().await, Some(4));
    }

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let slot = Arc::new(Slot::new(Endpoint::new(0)));
        let claim = slot.try_claim().unwrap();
        assert!(slot.try_claim().is_none());

        drop(claim);
        assert!(slot.try_claim().is_some());
    }

    #[tokio::test]
    async fn test_next_index_at_end_of_range() {
        let registry = Registry::from_endpoints(vec![Endpoint::new(u32::MAX)]).unwrap();
        assert_eq!(registry.next_index().await, None);

        registry.remove(u32::MAX).await.unwrap();
        registry.add(Endpoint::new(u32::MAX - 1)).await.unwrap();
        assert_eq!(registry.next_index().await, Some(u32::MAX));
    }

    #[test]
    fn test_empty_registry() {
        tokio_test::block_on(async {
            let registry = Registry::new();
            assert!(registry.is_empty().await);
            assert_eq!(registry.next_index().await, Some(0));
            assert!(registry.snapshot().await.is_empty());
        });
    }
}
