//! Channel pairs: which client-facing connection belongs to which upstream connection.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;

/// Handle for a connection owned by the proxy loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side of the proxy a connection faces. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Peer is the external caller (the add-in).
    Client,
    /// Peer is the local citation server.
    Upstream,
}

/// Bidirectional 1:1 pairing plus the set of remote addresses known to be clients.
///
/// Every registered id has exactly one partner; `unpair` removes both directions.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    next_id: u64,
    partners: HashMap<ConnId, ConnId>,
    /// Client id -> its remote address, so teardown can drop the address too.
    client_addrs: HashMap<ConnId, SocketAddr>,
    clients: HashSet<SocketAddr>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh id for a new connection. Never reused within a run.
    pub fn allocate(&mut self) -> ConnId {
        let id = ConnId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Register a pair once the upstream dial has succeeded.
    pub fn pair(&mut self, client: ConnId, client_addr: SocketAddr, upstream: ConnId) {
        debug_assert_ne!(client, upstream);
        self.partners.insert(client, upstream);
        self.partners.insert(upstream, client);
        self.client_addrs.insert(client, client_addr);
        self.clients.insert(client_addr);
    }

    pub fn partner(&self, id: ConnId) -> Option<ConnId> {
        self.partners.get(&id).copied()
    }

    #[cfg(test)]
    fn contains(&self, id: ConnId) -> bool {
        self.partners.contains_key(&id)
    }

    /// Whether messages from `addr` travel client -> upstream.
    pub fn is_client(&self, addr: &SocketAddr) -> bool {
        self.clients.contains(addr)
    }

    /// Remove `id` and its partner. Returns the partner, if `id` was paired.
    pub fn unpair(&mut self, id: ConnId) -> Option<ConnId> {
        let partner = self.partners.remove(&id)?;
        self.partners.remove(&partner);
        for side in [id, partner] {
            if let Some(addr) = self.client_addrs.remove(&side) {
                self.clients.remove(&addr);
            }
        }
        Some(partner)
    }

    pub fn pair_count(&self) -> usize {
        self.partners.len() / 2
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn clear(&mut self) {
        self.partners.clear();
        self.client_addrs.clear();
        self.clients.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn ids_are_unique() {
        let mut reg = ChannelRegistry::new();
        let a = reg.allocate();
        let b = reg.allocate();
        assert_ne!(a, b);
    }

    #[test]
    fn pair_is_symmetric() {
        let mut reg = ChannelRegistry::new();
        let (c, u) = (reg.allocate(), reg.allocate());
        reg.pair(c, addr(50000), u);
        assert_eq!(reg.partner(c), Some(u));
        assert_eq!(reg.partner(u), Some(c));
        assert!(reg.is_client(&addr(50000)));
        assert!(!reg.is_client(&addr(23119)));
        assert_eq!(reg.pair_count(), 1);
    }

    #[test]
    fn unpair_from_either_side_leaves_nothing() {
        for close_client in [true, false] {
            let mut reg = ChannelRegistry::new();
            let (c, u) = (reg.allocate(), reg.allocate());
            reg.pair(c, addr(50001), u);
            let closing = if close_client { c } else { u };
            let expected_partner = if close_client { u } else { c };
            assert_eq!(reg.unpair(closing), Some(expected_partner));
            assert!(!reg.contains(c));
            assert!(!reg.contains(u));
            assert_eq!(reg.pair_count(), 0);
            assert_eq!(reg.client_count(), 0);
            assert_eq!(reg.unpair(expected_partner), None);
        }
    }

    #[test]
    fn unpair_only_touches_its_own_pair() {
        let mut reg = ChannelRegistry::new();
        let (c1, u1) = (reg.allocate(), reg.allocate());
        let (c2, u2) = (reg.allocate(), reg.allocate());
        reg.pair(c1, addr(50010), u1);
        reg.pair(c2, addr(50011), u2);
        reg.unpair(u1);
        assert_eq!(reg.partner(c2), Some(u2));
        assert!(reg.is_client(&addr(50011)));
        assert!(!reg.is_client(&addr(50010)));
        assert_eq!(reg.pair_count(), 1);
    }

    #[test]
    fn clear_empties_everything() {
        let mut reg = ChannelRegistry::new();
        let (c, u) = (reg.allocate(), reg.allocate());
        reg.pair(c, addr(50020), u);
        reg.clear();
        assert_eq!(reg.pair_count(), 0);
        assert_eq!(reg.client_count(), 0);
        assert_eq!(reg.partner(c), None);
    }
}
