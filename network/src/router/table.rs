//! Routing table: destination prefix to next-hop network prefix.

use std::collections::HashMap;
use std::sync::Mutex;

use common::{Error, Result};

/// Next-hop prefix meaning "deliver locally".
pub const LOCAL_PREFIX: u32 = 0;

/// Prefix-keyed routing table. A route maps a destination prefix to the
/// prefix of the neighbor network it is reachable through, or to
/// [`LOCAL_PREFIX`] for local delivery.
#[derive(Default)]
pub struct RoutingTable {
    table: Mutex<HashMap<u32, u32>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with `address_in_use` on a duplicate prefix.
    pub fn add_route(&self, prefix: u32, via_prefix: u32) -> Result<()> {
        let mut table = self.table.lock().unwrap();
        if table.contains_key(&prefix) {
            return Err(Error::AddressInUse);
        }
        tracing::trace!("routing table: add route {} via {}", prefix, via_prefix);
        table.insert(prefix, via_prefix);
        Ok(())
    }

    pub fn remove_route(&self, prefix: u32) -> Result<()> {
        let removed = self.table.lock().unwrap().remove(&prefix);
        match removed {
            Some(_) => Ok(()),
            None => Err(Error::AddressNotAvailable),
        }
    }

    /// Drops every route reachable through `via_prefix`.
    pub fn remove_routes_via(&self, via_prefix: u32) {
        self.table
            .lock()
            .unwrap()
            .retain(|_, via| *via != via_prefix);
    }

    /// Resolves a destination prefix to its next-hop prefix.
    pub fn resolve(&self, prefix: u32) -> Result<u32> {
        self.table
            .lock()
            .unwrap()
            .get(&prefix)
            .copied()
            .ok_or(Error::AddressNotAvailable)
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_resolve_remove() {
        let table = RoutingTable::new();
        table.add_route(5, LOCAL_PREFIX).unwrap();
        table.add_route(7, 5).unwrap();
        assert_eq!(table.resolve(5).unwrap(), LOCAL_PREFIX);
        assert_eq!(table.resolve(7).unwrap(), 5);
        assert_eq!(table.resolve(9), Err(Error::AddressNotAvailable));
        assert_eq!(table.add_route(5, 1), Err(Error::AddressInUse));
        table.remove_route(5).unwrap();
        assert_eq!(table.resolve(5), Err(Error::AddressNotAvailable));
        assert_eq!(table.remove_route(5), Err(Error::AddressNotAvailable));
    }

    #[test]
    fn test_remove_routes_via() {
        let table = RoutingTable::new();
        table.add_route(1, LOCAL_PREFIX).unwrap();
        table.add_route(2, 1).unwrap();
        table.add_route(3, 1).unwrap();
        table.remove_routes_via(1);
        assert_eq!(table.len(), 1);
        assert!(table.resolve(1).is_ok());
    }
}
