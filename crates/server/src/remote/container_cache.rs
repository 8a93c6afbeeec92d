use std::time::Duration;

use tokio::sync::mpsc;

use super::request_cache::{DEFAULT_TIMEOUT, Fetch, RequestCache, WaitOutcome};
use crate::containers::{ContainerContent, ContainerKey};
use crate::net::protocol::ClientMessage;

/// Client-side view of server-owned containers.
///
/// Every entry is short-lived: once its window passes, the next `fetch`
/// asks the server again, so the mirror never drifts far from the server.
pub struct ContainerSyncCache {
    requests: RequestCache<ContainerKey, ContainerContent>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
}

impl ContainerSyncCache {
    pub fn new(outbound: mpsc::UnboundedSender<ClientMessage>) -> Self {
        Self::with_timeout(outbound, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(outbound: mpsc::UnboundedSender<ClientMessage>, timeout: Duration) -> Self {
        Self {
            requests: RequestCache::new(timeout),
            outbound,
        }
    }

    /// Expired owners are dropped on every fetch, so the cache only holds
    /// what was asked for within the last window.
    pub fn fetch(&self, owner: &ContainerKey) -> Fetch<ContainerContent> {
        self.requests.purge_expired();
        self.requests.fetch_with(owner, |owner| {
            let request = ClientMessage::RequestContainer {
                owner: owner.clone(),
            };
            if self.outbound.send(request).is_err() {
                tracing::warn!("Connection closed, container request for {:?} dropped", owner);
            }
        })
    }

    pub async fn load(&self, owner: &ContainerKey) -> WaitOutcome<ContainerContent> {
        match self.fetch(owner) {
            Fetch::Ready(value) => WaitOutcome::Resolved(value),
            Fetch::Pending(pending) => pending.wait().await,
        }
    }

    /// Apply a `ContainerSnapshot` reply; `false` when nobody asked.
    pub fn handle_snapshot(&self, owner: &ContainerKey, content: Option<ContainerContent>) -> bool {
        let matched = self.requests.complete(owner, content);
        if !matched {
            tracing::debug!("Ignoring unrequested container snapshot for {:?}", owner);
        }
        matched
    }

    /// Forget what we know about `owner`, e.g. after editing it locally.
    pub fn invalidate(&self, owner: &ContainerKey) {
        self.requests.invalidate(owner);
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_engine::world::position::BlockPos;

    #[test]
    fn owners_are_requested_independently() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cache = ContainerSyncCache::new(tx);
        let ana = ContainerKey::player("ana");
        let chest = ContainerKey::block(BlockPos::new(4, 40));

        cache.fetch(&ana);
        cache.fetch(&ana);
        cache.fetch(&chest);
        let mut sent = Vec::new();
        while let Ok(m) = rx.try_recv() {
            sent.push(m);
        }
        assert_eq!(
            sent,
            vec![
                ClientMessage::RequestContainer { owner: ana.clone() },
                ClientMessage::RequestContainer { owner: chest.clone() },
            ]
        );

        let mut inventory = ContainerContent::empty(ana.slot_count());
        inventory.add(3, 5);
        assert!(cache.handle_snapshot(&ana, Some(inventory.clone())));
        assert!(cache.handle_snapshot(&chest, None));
        assert!(matches!(cache.fetch(&ana), Fetch::Ready(Some(c)) if c == inventory));
        assert!(matches!(cache.fetch(&chest), Fetch::Ready(None)));
    }

    #[test]
    fn invalidate_forces_a_new_request() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cache = ContainerSyncCache::new(tx);
        let ana = ContainerKey::player("ana");
        cache.fetch(&ana);
        cache.handle_snapshot(&ana, None);
        cache.invalidate(&ana);
        assert!(cache.fetch(&ana).is_pending());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn expired_owners_are_dropped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cache = ContainerSyncCache::with_timeout(tx, Duration::from_millis(20));
        for x in 0..50 {
            let chest = ContainerKey::block(BlockPos::new(x, 0));
            cache.fetch(&chest);
            if x % 2 == 0 {
                cache.handle_snapshot(&chest, None);
            }
        }
        assert_eq!(cache.requests.tracked(), 50);

        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.fetch(&ContainerKey::player("ana")).is_pending());
        assert_eq!(cache.requests.tracked(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn unanswered_load_times_out() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cache = ContainerSyncCache::with_timeout(tx, Duration::from_millis(20));
        let outcome = cache.load(&ContainerKey::player("bo")).await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }
}
