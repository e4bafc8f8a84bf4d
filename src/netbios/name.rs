//! NetBIOS name identity and the local/remote name tables.

use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Raw NetBIOS name length: 15 significant bytes, space-padded, plus a
/// 1-byte type suffix (RFC 1001 §14.1).
pub const NAME_LEN: usize = 15;

/// Well-known suffix for the file server service.
pub const SUFFIX_FILE_SERVER: u8 = 0x20;
/// Well-known suffix for the workstation service.
pub const SUFFIX_WORKSTATION: u8 = 0x00;
/// Well-known suffix for the domain master browser / domain name.
pub const SUFFIX_DOMAIN: u8 = 0x1C;
/// Adapter status well-known name suffix query uses `*` padded name with
/// this type to request the local adapter status.
pub const SUFFIX_ADAPTER_STATUS: u8 = 0x00;

/// Role a name plays; only affects wire encoding constants, not behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameKind {
    FileServer,
    Workstation,
    Domain,
}

impl NameKind {
    pub fn suffix(self) -> u8 {
        match self {
            NameKind::FileServer => SUFFIX_FILE_SERVER,
            NameKind::Workstation => SUFFIX_WORKSTATION,
            NameKind::Domain => SUFFIX_DOMAIN,
        }
    }
}

/// Identity of a NetBIOS endpoint: 15-byte padded name, type suffix, and
/// whether it names a group (broadcast to every owner) or a unique host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetBiosName {
    pub name: [u8; NAME_LEN],
    pub suffix: u8,
    pub is_group: bool,
}

impl NetBiosName {
    /// Builds a name from an ASCII string, space-padded/truncated to 15
    /// bytes and upper-cased, matching the RFC's encoding convention.
    pub fn new(name: &str, suffix: u8, is_group: bool) -> Self {
        let mut bytes = [b' '; NAME_LEN];
        for (slot, byte) in bytes.iter_mut().zip(name.as_bytes().iter().take(NAME_LEN)) {
            *slot = byte.to_ascii_uppercase();
        }
        Self { name: bytes, suffix, is_group }
    }

    /// Trimmed, human-readable form, e.g. `"JFILESRV"`.
    pub fn display_name(&self) -> String {
        String::from_utf8_lossy(&self.name).trim_end().to_owned()
    }
}

impl std::fmt::Display for NetBiosName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}<{:02X}>", self.display_name(), self.suffix)
    }
}

/// A name this host owns, with its registration lifecycle state.
#[derive(Debug, Clone)]
pub struct OwnedName {
    pub name: NetBiosName,
    pub addresses: Vec<IpAddr>,
    pub ttl: Duration,
    pub expiry: Instant,
}

impl OwnedName {
    pub fn new(name: NetBiosName, addresses: Vec<IpAddr>, ttl: Duration) -> Self {
        Self { expiry: Instant::now() + ttl, name, addresses, ttl }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expiry
    }

    /// True if `now` falls inside the next `window` before expiry — the
    /// refresh scheduler's trigger condition.
    pub fn due_for_refresh(&self, now: Instant, window: Duration) -> bool {
        self.expiry.saturating_duration_since(now) <= window
    }

    pub fn renew(&mut self, now: Instant) {
        self.expiry = now + self.ttl;
    }
}

/// Local table: the set of names this host owns. Ordered, idempotent
/// inserts.
#[derive(Debug, Default)]
pub struct LocalNameTable {
    entries: Vec<OwnedName>,
}

impl LocalNameTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the entry for `(name.name, name.suffix)`.
    pub fn upsert(&mut self, owned: OwnedName) {
        if let Some(existing) = self.find_mut(&owned.name) {
            *existing = owned;
        } else {
            self.entries.push(owned);
        }
    }

    pub fn remove(&mut self, name: &NetBiosName) -> Option<OwnedName> {
        let idx = self.entries.iter().position(|e| &e.name == name)?;
        Some(self.entries.remove(idx))
    }

    pub fn find(&self, name: &NetBiosName) -> Option<&OwnedName> {
        self.entries.iter().find(|e| &e.name == name)
    }

    fn find_mut(&mut self, name: &NetBiosName) -> Option<&mut OwnedName> {
        self.entries.iter_mut().find(|e| &e.name == name)
    }

    /// Snapshot of all owned names, used both for shutdown (queue deletes
    /// for every name) and for firing listeners without holding the lock.
    pub fn snapshot(&self) -> Vec<OwnedName> {
        self.entries.clone()
    }

    /// Names whose expiry falls inside the refresh scheduler's next
    /// wakeup window.
    pub fn due_for_refresh(&self, now: Instant, window: Duration) -> Vec<NetBiosName> {
        self.entries
            .iter()
            .filter(|e| e.due_for_refresh(now, window))
            .map(|e| e.name.clone())
            .collect()
    }

    pub fn mark_refreshed(&mut self, name: &NetBiosName, now: Instant) {
        if let Some(entry) = self.find_mut(name) {
            entry.renew(now);
        }
    }
}

/// Default time a remote table entry survives without being refreshed by
/// another NameRegister/Refresh datagram before it's evicted.
pub const DEFAULT_REMOTE_TTL: Duration = Duration::from_secs(600);

/// Remote table: advisory, not persisted, mapping of last-seen owners for
/// names other hosts registered or queried. Backed by a `moka` sync cache
/// so stale entries from hosts that went away without a NameRelease age
/// out on their own rather than growing unbounded.
pub struct RemoteNameTable {
    entries: moka::sync::Cache<NetBiosName, Vec<IpAddr>>,
}

impl RemoteNameTable {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_REMOTE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self { entries: moka::sync::Cache::builder().time_to_live(ttl).build() }
    }

    pub fn upsert(&mut self, name: NetBiosName, owners: Vec<IpAddr>) {
        self.entries.insert(name, owners);
    }

    pub fn remove(&mut self, name: &NetBiosName) {
        self.entries.invalidate(name);
    }

    pub fn owners(&self, name: &NetBiosName) -> Option<Vec<IpAddr>> {
        self.entries.get(name)
    }
}

impl Default for RemoteNameTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RemoteNameTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteNameTable").field("entry_count", &self.entries.entry_count()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn upsert_is_idempotent() {
        let mut table = LocalNameTable::new();
        let name = NetBiosName::new("JFILESRV", SUFFIX_FILE_SERVER, false);
        let owned = OwnedName::new(name.clone(), vec![], Duration::from_secs(300));
        table.upsert(owned.clone());
        table.upsert(owned);
        assert_eq!(table.snapshot().len(), 1);
    }

    #[test]
    fn add_delete_add_leaves_one_entry() {
        let mut table = LocalNameTable::new();
        let name = NetBiosName::new("JFILESRV", SUFFIX_FILE_SERVER, false);
        let owned = OwnedName::new(name.clone(), vec![], Duration::from_secs(300));
        table.upsert(owned.clone());
        table.remove(&name);
        table.upsert(owned);
        assert_eq!(table.snapshot().len(), 1);
        assert!(table.find(&name).is_some());
    }

    #[test]
    fn due_for_refresh_respects_window() {
        let mut table = LocalNameTable::new();
        let name = NetBiosName::new("JFILESRV", SUFFIX_FILE_SERVER, false);
        table.upsert(OwnedName::new(name.clone(), vec![], Duration::from_secs(1)));
        let soon = Instant::now();
        // The TTL is short, so it should already be inside any reasonable window.
        assert_eq!(table.due_for_refresh(soon, Duration::from_secs(300)), vec![name]);
    }

    #[test]
    fn remote_table_upsert_and_remove() {
        let mut table = RemoteNameTable::new();
        let name = NetBiosName::new("OTHERSRV", SUFFIX_FILE_SERVER, false);
        table.upsert(name.clone(), vec![IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 5))]);
        assert_eq!(table.owners(&name), Some(vec![IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 5))]));
        table.remove(&name);
        assert_eq!(table.owners(&name), None);
    }
}
