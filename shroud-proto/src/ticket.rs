/// Per-host cache of the most recent NewSessionTicket observed on a relay,
/// kept for future resumption. In-memory only; entries expire after 24h.
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::time::{Duration, Instant};

pub const TICKET_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
struct TicketEntry {
    data: Vec<u8>,
    stored_at: Instant,
    sni: String,
}

/// Hostname → latest ticket. Reads dominate (every OOB reply consults it),
/// writes only happen when a relay sniffs a fresh ticket, so a reader/writer
/// lock fits.
#[derive(Debug, Default)]
pub struct TicketCache {
    entries: RwLock<HashMap<String, TicketEntry>>,
}

impl TicketCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the ticket for `hostname`. Empty hostnames and
    /// empty payloads are ignored. The bytes are copied; the caller's
    /// buffer is reused by the relay loop.
    pub fn store(&self, hostname: &str, data: &[u8]) {
        if hostname.is_empty() || data.is_empty() {
            return;
        }
        let entry = TicketEntry {
            data: data.to_vec(),
            stored_at: Instant::now(),
            sni: hostname.to_string(),
        };
        let mut entries = self.entries.write().unwrap();
        entries.insert(hostname.to_string(), entry);
        tracing::debug!("Cached session ticket for {} ({} bytes)", hostname, data.len());
    }

    /// Latest ticket for `hostname`, or None when absent or older than 24h.
    pub fn lookup(&self, hostname: &str) -> Option<Vec<u8>> {
        let entries = self.entries.read().unwrap();
        let entry = entries.get(hostname)?;
        if entry.stored_at.elapsed() > TICKET_TTL {
            return None;
        }
        debug_assert_eq!(entry.sni, hostname);
        Some(entry.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_then_lookup() {
        let cache = TicketCache::new();
        cache.store("example.com", &[1, 2, 3]);
        assert_eq!(cache.lookup("example.com"), Some(vec![1, 2, 3]));
        assert_eq!(cache.lookup("other.com"), None);
    }

    #[tokio::test]
    async fn latest_store_wins() {
        let cache = TicketCache::new();
        cache.store("example.com", &[1]);
        cache.store("example.com", &[2, 2]);
        assert_eq!(cache.lookup("example.com"), Some(vec![2, 2]));
    }

    #[tokio::test]
    async fn empty_host_or_data_ignored() {
        let cache = TicketCache::new();
        cache.store("", &[1, 2, 3]);
        cache.store("example.com", &[]);
        assert_eq!(cache.lookup(""), None);
        assert_eq!(cache.lookup("example.com"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = TicketCache::new();
        cache.store("example.com", &[7, 7]);

        tokio::time::advance(TICKET_TTL - Duration::from_secs(1)).await;
        assert_eq!(cache.lookup("example.com"), Some(vec![7, 7]));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.lookup("example.com"), None);
    }
}
