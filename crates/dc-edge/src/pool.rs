// SPDX-License-Identifier: AGPL-3.0-only

//! Prozessweite Registry aktiver Port-Streams und Veröffentlichungs-
//! Policies. Grober Lock über den Map-Spine, Stream-Zustand liegt im
//! jeweiligen [`PortStream`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dc_types::Address;

use crate::port::PortStream;
use crate::{EdgeError, PortMode};

/// Statische Veröffentlichung eines lokalen Ports ins Overlay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedPort {
    pub local_port: u16,
    pub remote_port: u16,
    pub mode: PortMode,
    /// Nur für `private`: erlaubte Gegenstellen.
    pub access_list: Vec<Address>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Traffic {
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub connections: u64,
}

#[derive(Default)]
pub struct DataPool {
    ports: Mutex<HashMap<u64, Arc<PortStream>>>,
    published: Mutex<HashMap<u16, PublishedPort>>,
    traffic: Mutex<HashMap<Address, Traffic>>,
}

impl DataPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_port(&self, stream: Arc<PortStream>) {
        if let Ok(mut guard) = self.ports.lock() {
            guard.insert(stream.port_id(), stream);
        }
    }

    pub fn get_port(&self, port_id: u64) -> Option<Arc<PortStream>> {
        self.ports.lock().ok()?.get(&port_id).cloned()
    }

    /// Entfernt und schließt den Stream; explizite Eviction.
    pub fn remove_port(&self, port_id: u64) -> Option<Arc<PortStream>> {
        let stream = self.ports.lock().ok()?.remove(&port_id)?;
        stream.close();
        Some(stream)
    }

    pub fn active_ports(&self) -> usize {
        self.ports.lock().map(|g| g.len()).unwrap_or(0)
    }

    /// Session-Teardown: alle Streams mit EOF schließen.
    pub fn close_all(&self) {
        if let Ok(mut guard) = self.ports.lock() {
            for (_, stream) in guard.drain() {
                stream.close();
            }
        }
    }

    /// Registriert eine Veröffentlichung. Ein Remote-Port darf nicht in
    /// zwei Modi gleichzeitig erscheinen.
    pub fn publish(&self, port: PublishedPort) -> Result<(), EdgeError> {
        let mut guard = self
            .published
            .lock()
            .map_err(|_| EdgeError::Config("pool lock poisoned".to_string()))?;
        if let Some(existing) = guard.get(&port.remote_port) {
            if existing.mode != port.mode {
                return Err(EdgeError::Config(format!(
                    "port {} already published as {}",
                    port.remote_port,
                    existing.mode.as_atom()
                )));
            }
        }
        guard.insert(port.remote_port, port);
        Ok(())
    }

    pub fn published_for(&self, remote_port: u16) -> Option<PublishedPort> {
        self.published.lock().ok()?.get(&remote_port).cloned()
    }

    pub fn published_ports(&self) -> Vec<PublishedPort> {
        let Ok(guard) = self.published.lock() else {
            return Vec::new();
        };
        let mut list: Vec<PublishedPort> = guard.values().cloned().collect();
        list.sort_by_key(|p| p.remote_port);
        list
    }

    pub fn record_connection(&self, peer: Address) {
        if let Ok(mut guard) = self.traffic.lock() {
            guard.entry(peer).or_default().connections += 1;
        }
    }

    pub fn record_up(&self, peer: Address, n: u64) {
        if let Ok(mut guard) = self.traffic.lock() {
            guard.entry(peer).or_default().bytes_up += n;
        }
    }

    pub fn record_down(&self, peer: Address, n: u64) {
        if let Ok(mut guard) = self.traffic.lock() {
            guard.entry(peer).or_default().bytes_down += n;
        }
    }

    /// Schnappschuss für Logging und Rate-Hooks.
    pub fn traffic_snapshot(&self) -> Vec<(Address, Traffic)> {
        let Ok(guard) = self.traffic.lock() else {
            return Vec::new();
        };
        let mut list: Vec<(Address, Traffic)> = guard.iter().map(|(a, t)| (*a, *t)).collect();
        list.sort_by_key(|(a, _)| *a);
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Direction;
    use crate::PortProtocol;

    fn stream(id: u64) -> Arc<PortStream> {
        let (stream, _rx) = PortStream::new(
            id,
            Address([1u8; 20]),
            Direction::Outbound,
            PortProtocol::Tcp,
            PortMode::Public,
        );
        stream
    }

    #[test]
    fn ports_register_and_evict() {
        let pool = DataPool::new();
        pool.insert_port(stream(5));
        assert!(pool.get_port(5).is_some());
        assert_eq!(pool.active_ports(), 1);
        let removed = pool.remove_port(5).expect("present");
        assert!(removed.is_closed());
        assert!(pool.get_port(5).is_none());
    }

    #[test]
    fn close_all_drains() {
        let pool = DataPool::new();
        pool.insert_port(stream(1));
        pool.insert_port(stream(2));
        pool.close_all();
        assert_eq!(pool.active_ports(), 0);
    }

    #[test]
    fn publish_rejects_mode_conflict() {
        let pool = DataPool::new();
        pool.publish(PublishedPort {
            local_port: 8080,
            remote_port: 80,
            mode: PortMode::Public,
            access_list: Vec::new(),
        })
        .expect("first publish");
        let conflict = pool.publish(PublishedPort {
            local_port: 8081,
            remote_port: 80,
            mode: PortMode::Private,
            access_list: Vec::new(),
        });
        assert!(matches!(conflict, Err(EdgeError::Config(_))));
        // gleiche Mode darf überschreiben (z. B. neue Access-List)
        pool.publish(PublishedPort {
            local_port: 8082,
            remote_port: 80,
            mode: PortMode::Public,
            access_list: Vec::new(),
        })
        .expect("same mode");
        assert_eq!(
            pool.published_for(80).map(|p| p.local_port),
            Some(8082)
        );
    }

    #[test]
    fn traffic_counters_accumulate() {
        let pool = DataPool::new();
        let peer = Address([9u8; 20]);
        pool.record_connection(peer);
        pool.record_up(peer, 10);
        pool.record_down(peer, 20);
        pool.record_down(peer, 5);
        let snapshot = pool.traffic_snapshot();
        assert_eq!(
            snapshot,
            vec![(
                peer,
                Traffic {
                    bytes_up: 10,
                    bytes_down: 25,
                    connections: 1
                }
            )]
        );
    }
}
