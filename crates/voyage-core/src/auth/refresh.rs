use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;

/// Outcome published to everyone waiting on a refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshSignal {
    Token(String),
    Failed,
    TimedOut,
}

/// What a request that hit a 401 should do next.
#[derive(Debug)]
pub(crate) enum RefreshTicket {
    /// Run the refresh, then wait on the receiver like everyone else.
    Leader(watch::Receiver<Option<RefreshSignal>>),
    /// A refresh is already running; wait for it.
    Follower(watch::Receiver<Option<RefreshSignal>>),
    /// A refresh finished after this request was sent; reuse its token.
    Replay(String),
}

/// Single-flight gate for token refresh: an in-flight flag plus a latch holding the next token.
#[derive(Debug)]
pub struct RefreshLatch {
    in_flight: Mutex<bool>,
    latest: watch::Sender<Option<RefreshSignal>>,
}

impl Default for RefreshLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshLatch {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            in_flight: Mutex::new(false),
            latest,
        }
    }

    fn flag(&self) -> MutexGuard<'_, bool> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_refreshing(&self) -> bool {
        *self.flag()
    }

    /// Decide the role of a request whose credential was rejected.
    ///
    /// `sent` is the token the request carried; `current` yields the currently valid stored
    /// token and is evaluated under the latch so it cannot race a finishing refresh.
    pub(crate) fn enter<F>(&self, sent: Option<&str>, current: F) -> RefreshTicket
    where
        F: FnOnce() -> Option<String>,
    {
        let mut in_flight = self.flag();
        if *in_flight {
            return RefreshTicket::Follower(self.latest.subscribe());
        }
        if let Some(current) = current() {
            if sent != Some(current.as_str()) {
                return RefreshTicket::Replay(current);
            }
        }
        *in_flight = true;
        self.latest.send_replace(None);
        RefreshTicket::Leader(self.latest.subscribe())
    }

    /// Publish the refresh result and reopen the gate.
    pub(crate) fn finish(&self, signal: RefreshSignal) {
        let mut in_flight = self.flag();
        self.latest.send_replace(Some(signal));
        *in_flight = false;
    }
}

/// Resolve once the in-flight refresh publishes its outcome.
pub(crate) async fn wait_for_signal(
    mut receiver: watch::Receiver<Option<RefreshSignal>>,
) -> RefreshSignal {
    match receiver.wait_for(Option::is_some).await {
        Ok(signal) => signal.clone().unwrap_or(RefreshSignal::Failed),
        Err(_) => RefreshSignal::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn followers_share_leader_outcome() {
        let latch = RefreshLatch::new();
        let leader = match latch.enter(Some("tok1"), || None) {
            RefreshTicket::Leader(rx) => rx,
            other => panic!("expected leader, got {other:?}"),
        };
        assert!(latch.is_refreshing());
        let follower = match latch.enter(Some("tok1"), || None) {
            RefreshTicket::Follower(rx) => rx,
            other => panic!("expected follower, got {other:?}"),
        };

        latch.finish(RefreshSignal::Token("tok2".into()));
        assert!(!latch.is_refreshing());
        assert_eq!(
            wait_for_signal(leader).await,
            RefreshSignal::Token("tok2".into())
        );
        assert_eq!(
            wait_for_signal(follower).await,
            RefreshSignal::Token("tok2".into())
        );
    }

    #[tokio::test]
    async fn timeout_is_published() {
        let latch = RefreshLatch::new();
        let RefreshTicket::Leader(rx) = latch.enter(None, || None) else {
            panic!("expected leader");
        };
        latch.finish(RefreshSignal::TimedOut);
        assert_eq!(wait_for_signal(rx).await, RefreshSignal::TimedOut);
    }

    #[test]
    fn stale_request_replays_current_token() {
        let latch = RefreshLatch::new();
        match latch.enter(Some("tok1"), || Some("tok2".into())) {
            RefreshTicket::Replay(token) => assert_eq!(token, "tok2"),
            other => panic!("expected replay, got {other:?}"),
        }
        assert!(!latch.is_refreshing());
    }

    #[tokio::test]
    async fn new_round_does_not_see_previous_outcome() {
        let latch = RefreshLatch::new();
        let RefreshTicket::Leader(_) = latch.enter(None, || None) else {
            panic!("expected leader");
        };
        latch.finish(RefreshSignal::Failed);
        let RefreshTicket::Leader(rx) = latch.enter(Some("tok1"), || Some("tok1".into())) else {
            panic!("expected leader");
        };
        assert!(rx.borrow().is_none());
    }
}
