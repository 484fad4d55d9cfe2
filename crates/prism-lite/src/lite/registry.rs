use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    sync::{
        RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::SystemTime,
};

/// Snapshot of one running forward. Readers always get their own clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveForward {
    pub connection_id: String,
    /// `None` when no usable client IP was known.
    pub client_ip: Option<IpAddr>,
    pub client_addr: SocketAddr,
    pub backend_addr: SocketAddr,
    pub host: String,
    pub route_id: String,
    pub started_at: SystemTime,
}

#[derive(Debug, Default)]
struct Indices {
    by_id: HashMap<String, ActiveForward>,
    by_client_ip: HashMap<IpAddr, HashSet<String>>,
}

impl Indices {
    fn unlink(&mut self, fwd: &ActiveForward) {
        let Some(ip) = fwd.client_ip else {
            return;
        };
        if let Some(ids) = self.by_client_ip.get_mut(&ip) {
            ids.remove(&fwd.connection_id);
            if ids.is_empty() {
                self.by_client_ip.remove(&ip);
            }
        }
    }
}

/// Active forwards indexed by connection id and by client IP.
#[derive(Debug, Default)]
pub struct ActiveForwardTracker {
    next_id: AtomicU64,
    inner: RwLock<Indices>,
}

impl ActiveForwardTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_connection_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("lfwd-{n}")
    }

    fn read(&self) -> RwLockReadGuard<'_, Indices> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Indices> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Stores `fwd`, replacing any entry with the same id.
    pub fn add(&self, fwd: ActiveForward) {
        let mut g = self.write();
        if let Some(old) = g.by_id.remove(&fwd.connection_id) {
            g.unlink(&old);
        }
        if let Some(ip) = fwd.client_ip {
            g.by_client_ip
                .entry(ip)
                .or_default()
                .insert(fwd.connection_id.clone());
        }
        g.by_id.insert(fwd.connection_id.clone(), fwd);
    }

    pub fn remove(&self, connection_id: &str) -> Option<ActiveForward> {
        let mut g = self.write();
        let fwd = g.by_id.remove(connection_id)?;
        g.unlink(&fwd);
        Some(fwd)
    }

    pub fn get(&self, connection_id: &str) -> Option<ActiveForward> {
        self.read().by_id.get(connection_id).cloned()
    }

    /// Forwards for `ip`, oldest first.
    pub fn list_by_client_ip(&self, ip: IpAddr) -> Vec<ActiveForward> {
        let g = self.read();
        let mut out: Vec<ActiveForward> = g
            .by_client_ip
            .get(&ip)
            .into_iter()
            .flatten()
            .filter_map(|id| g.by_id.get(id).cloned())
            .collect();
        out.sort_by_key(|f| f.started_at);
        out
    }

    pub fn list(&self) -> Vec<ActiveForward> {
        let mut out: Vec<ActiveForward> = self.read().by_id.values().cloned().collect();
        out.sort_by_key(|f| f.started_at);
        out
    }

    pub fn len(&self) -> usize {
        self.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let g = self.read();
        for (id, fwd) in &g.by_id {
            assert_eq!(id, &fwd.connection_id);
            if let Some(ip) = fwd.client_ip {
                assert!(g.by_client_ip.get(&ip).is_some_and(|ids| ids.contains(id)));
            }
        }
        for (ip, ids) in &g.by_client_ip {
            assert!(!ids.is_empty());
            for id in ids {
                let fwd = g.by_id.get(id).expect("indexed id must exist");
                assert_eq!(fwd.client_ip, Some(*ip));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    fn forward(id: &str, ip: Option<&str>, offset_ms: u64) -> ActiveForward {
        ActiveForward {
            connection_id: id.to_string(),
            client_ip: ip.map(|s| s.parse().expect("ip")),
            client_addr: "203.0.113.2:51000".parse().expect("addr"),
            backend_addr: "10.0.0.1:25565".parse().expect("addr"),
            host: "play.example.com".into(),
            route_id: "*.example.com".into(),
            started_at: SystemTime::UNIX_EPOCH + Duration::from_millis(offset_ms),
        }
    }

    #[test]
    fn ids_are_sequential() {
        let t = ActiveForwardTracker::new();
        assert_eq!(t.next_connection_id(), "lfwd-1");
        assert_eq!(t.next_connection_id(), "lfwd-2");
    }

    #[test]
    fn add_get_remove_and_index_by_ip() {
        let t = ActiveForwardTracker::new();
        t.add(forward("lfwd-2", Some("198.51.100.5"), 20));
        t.add(forward("lfwd-1", Some("198.51.100.5"), 10));
        t.add(forward("lfwd-3", None, 30));

        let ip: IpAddr = "198.51.100.5".parse().expect("ip");
        let ids: Vec<String> = t
            .list_by_client_ip(ip)
            .into_iter()
            .map(|f| f.connection_id)
            .collect();
        assert_eq!(ids, vec!["lfwd-1", "lfwd-2"]);
        assert_eq!(t.get("lfwd-3").expect("present").client_ip, None);
        assert_eq!(t.len(), 3);
        t.assert_consistent();

        assert!(t.remove("lfwd-1").is_some());
        assert!(t.remove("lfwd-1").is_none());
        assert!(t.remove("lfwd-2").is_some());
        assert!(t.list_by_client_ip(ip).is_empty());
        t.assert_consistent();
    }

    #[test]
    fn add_replaces_and_reindexes() {
        let t = ActiveForwardTracker::new();
        t.add(forward("lfwd-1", Some("198.51.100.5"), 0));
        t.add(forward("lfwd-1", Some("198.51.100.6"), 0));

        assert!(t.list_by_client_ip("198.51.100.5".parse().expect("ip")).is_empty());
        assert_eq!(t.list_by_client_ip("198.51.100.6".parse().expect("ip")).len(), 1);
        assert_eq!(t.len(), 1);
        t.assert_consistent();
    }

    #[test]
    fn snapshots_are_detached() {
        let t = ActiveForwardTracker::new();
        t.add(forward("lfwd-1", Some("198.51.100.5"), 0));
        let mut snap = t.get("lfwd-1").expect("present");
        snap.host = "mutated".into();
        snap.backend_addr = "10.9.9.9:1".parse().expect("addr");
        let fresh = t.get("lfwd-1").expect("present");
        assert_eq!(fresh.host, "play.example.com");
        assert_eq!(fresh.backend_addr, "10.0.0.1:25565".parse().expect("addr"));
    }

    #[test]
    fn concurrent_add_remove_keeps_indices_consistent() {
        let t = Arc::new(ActiveForwardTracker::new());
        let handles: Vec<_> = (0..8)
            .map(|w| {
                let t = t.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let id = t.next_connection_id();
                        let ip = format!("10.0.{}.{}", w, i % 4);
                        t.add(forward(&id, Some(&ip), i));
                        let _ = t.list_by_client_ip(ip.parse().expect("ip"));
                        if i % 3 != 0 {
                            assert!(t.remove(&id).is_some());
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("worker");
        }
        t.assert_consistent();
        assert_eq!(t.len(), 8 * 67);
    }
}
