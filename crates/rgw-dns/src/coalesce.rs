//! In-flight query coalescing (§4.4 LAN-no-SOA forwarding): multiple client
//! retransmits of the same question while a resolution is outstanding join the
//! same upstream round trip instead of issuing one each, mirroring the original's
//! `activequeries` map keyed by `(query_id, qname, qtype, client_addr)`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub id: u16,
    pub qname: String,
    pub qtype: u16,
    pub client: SocketAddr,
}

/// What the caller should do after registering interest in a key.
pub enum Slot {
    /// No resolution for this key is in flight; the caller must perform it and
    /// call [`ActiveQueries::complete`] when done.
    Lead,
    /// A resolution is already in flight; await this receiver for its result.
    Follow(oneshot::Receiver<Arc<Vec<u8>>>),
}

#[derive(Default)]
pub struct ActiveQueries {
    inner: Mutex<HashMap<QueryKey, Vec<oneshot::Sender<Arc<Vec<u8>>>>>>,
}

impl ActiveQueries {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, key: QueryKey) -> Slot {
        let mut map = self.inner.lock().await;
        if let Some(waiters) = map.get_mut(&key) {
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            Slot::Follow(rx)
        } else {
            map.insert(key, Vec::new());
            Slot::Lead
        }
    }

    /// The leader's resolution finished; wake every follower with the same bytes.
    pub async fn complete(&self, key: &QueryKey, response: Vec<u8>) {
        let waiters = self.inner.lock().await.remove(key);
        let response = Arc::new(response);
        if let Some(waiters) = waiters {
            for tx in waiters {
                let _ = tx.send(response.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> QueryKey {
        QueryKey {
            id: 42,
            qname: "host.local.".to_string(),
            qtype: 1,
            client: "127.0.0.1:5000".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn first_joiner_leads_second_follows() {
        let queries = ActiveQueries::new();
        assert!(matches!(queries.join(key()).await, Slot::Lead));
        assert!(matches!(queries.join(key()).await, Slot::Follow(_)));
    }

    #[tokio::test]
    async fn followers_receive_the_leaders_result() {
        let queries = ActiveQueries::new();
        let _lead = queries.join(key()).await;
        let Slot::Follow(rx) = queries.join(key()).await else {
            panic!("expected follower slot");
        };

        queries.complete(&key(), vec![1, 2, 3]).await;
        let got = rx.await.unwrap();
        assert_eq!(*got, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_collide() {
        let queries = ActiveQueries::new();
        assert!(matches!(queries.join(key()).await, Slot::Lead));
        let mut other = key();
        other.client = "127.0.0.1:6000".parse().unwrap();
        assert!(matches!(queries.join(other).await, Slot::Lead));
    }
}
