//! Fan-out of server pushes to every connected session.

use std::collections::HashMap;

use super::demand::SessionId;
use crate::network::ConnectionSender;
use crate::protocol::Push;

/// Push statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PushStats {
    /// Frames handed to a session's writer.
    pub pushes_sent: u64,
    /// Sessions that were gone when a push reached them.
    pub push_errors: u64,
}

/// Sessions that asked to receive pushes, by session id.
#[derive(Debug, Default)]
pub struct PushRouter {
    routes: HashMap<SessionId, ConnectionSender>,
    stats: PushStats,
}

impl PushRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route future pushes to `session`. Re-registering replaces the route.
    pub fn register(&mut self, session: SessionId, tx: ConnectionSender) {
        self.routes.insert(session, tx);
    }

    pub fn unregister(&mut self, session: SessionId) {
        self.routes.remove(&session);
    }

    pub fn is_registered(&self, session: SessionId) -> bool {
        self.routes.contains_key(&session)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Senders for every route, so a broadcast can run without holding
    /// the router.
    pub fn targets(&self) -> Vec<(SessionId, ConnectionSender)> {
        self.routes.iter().map(|(id, tx)| (*id, tx.clone())).collect()
    }

    /// Record the outcome of a broadcast and drop routes that failed.
    pub fn record(&mut self, delivered: u64, failed: &[SessionId]) {
        self.stats.pushes_sent += delivered;
        self.stats.push_errors += failed.len() as u64;
        for session in failed {
            self.routes.remove(session);
        }
    }

    pub fn stats(&self) -> &PushStats {
        &self.stats
    }
}

/// Send `push` to every target. Returns how many sessions got it and
/// which ones were already closed.
pub async fn broadcast(push: Push, targets: Vec<(SessionId, ConnectionSender)>) -> (u64, Vec<SessionId>) {
    let frame = match push.into_frame() {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, "could not encode push");
            return (0, Vec::new());
        }
    };

    let mut delivered = 0;
    let mut failed = Vec::new();
    for (session, tx) in targets {
        if tx.send(frame.clone()).await.is_ok() {
            delivered += 1;
        } else {
            failed.push(session);
        }
    }
    (delivered, failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Method;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn broadcast_reaches_all_and_prunes_closed() {
        let mut router = PushRouter::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        let (tx3, rx3) = mpsc::channel(4);
        router.register(1, tx1);
        router.register(2, tx2);
        router.register(3, tx3);
        drop(rx3);

        let (delivered, failed) = broadcast(Push::RefreshInterface, router.targets()).await;
        router.record(delivered, &failed);

        assert_eq!(delivered, 2);
        assert_eq!(failed, vec![3]);
        assert_eq!(router.route_count(), 2);
        assert_eq!(router.stats().push_errors, 1);
        assert_eq!(rx1.recv().await.unwrap().method(), Method::OnRefreshInterface);
        assert_eq!(rx2.recv().await.unwrap().method(), Method::OnRefreshInterface);
    }

    #[test]
    fn unregister_removes_route() {
        let mut router = PushRouter::new();
        let (tx, _rx) = mpsc::channel(1);
        router.register(7, tx);
        assert!(router.is_registered(7));
        router.unregister(7);
        assert!(!router.is_registered(7));
    }
}
