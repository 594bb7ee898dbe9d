// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Live subscription to a source's changes feed.
//!
//! A [`LiveFeed`] wraps the source's update-sequence notifications and
//! turns them into "wake up, there is something after `since`" signals.
//! A session opens exactly one feed and re-arms it with [`LiveFeed::rebind`]
//! after every batch, so the number of subscriptions held on the source
//! never changes while the session is alive.
//!
//! ```text
//! source update seq ──► watch::Receiver ──► LiveFeed::wait()
//!                                             │
//!                         seq > since ────────┼──► Changed(seq)
//!                         heartbeat elapsed ──┼──► Heartbeat
//!                         sender dropped ─────┴──► Closed
//! ```

use crate::model::Sequence;
use std::time::Duration;
use tokio::sync::watch;

/// Why [`LiveFeed::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedWake {
    /// The source has changes up to this sequence (newer than `since`).
    Changed(Sequence),
    /// Nothing new within the heartbeat interval.
    Heartbeat,
    /// The source stopped publishing notifications.
    Closed,
}

/// A re-armable live subscription.
#[derive(Debug)]
pub struct LiveFeed {
    rx: watch::Receiver<Sequence>,
    since: Sequence,
    heartbeat: Duration,
}

impl LiveFeed {
    pub fn new(rx: watch::Receiver<Sequence>, since: Sequence, heartbeat: Duration) -> Self {
        Self { rx, since, heartbeat }
    }

    /// Sequence the feed is currently armed after.
    pub fn since(&self) -> Sequence {
        self.since
    }

    /// Re-arm the feed after `since` without re-subscribing.
    pub fn rebind(&mut self, since: Sequence) {
        self.since = since;
    }

    /// Latest sequence the source has announced.
    pub fn latest(&self) -> Sequence {
        *self.rx.borrow()
    }

    /// Whether the source already announced something after `since`.
    pub fn has_pending(&self) -> bool {
        self.latest() > self.since
    }

    /// Wait for a change after `since` or for the heartbeat.
    ///
    /// Cancel-safe: dropping the future loses no notification, the next
    /// call sees the same pending sequence.
    pub async fn wait(&mut self) -> FeedWake {
        if self.has_pending() {
            return FeedWake::Changed(self.latest());
        }

        let heartbeat = tokio::time::sleep(self.heartbeat);
        tokio::pin!(heartbeat);

        loop {
            tokio::select! {
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        return FeedWake::Closed;
                    }
                    let latest = *self.rx.borrow_and_update();
                    if latest > self.since {
                        return FeedWake::Changed(latest);
                    }
                }
                _ = &mut heartbeat => return FeedWake::Heartbeat,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pending_change_returns_immediately() {
        let (tx, rx) = watch::channel(5);
        let mut feed = LiveFeed::new(rx, 3, Duration::from_secs(60));
        assert!(feed.has_pending());
        assert_eq!(feed.wait().await, FeedWake::Changed(5));
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_when_idle() {
        let (_tx, rx) = watch::channel(3);
        let mut feed = LiveFeed::new(rx, 3, Duration::from_millis(100));
        assert_eq!(feed.wait().await, FeedWake::Heartbeat);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wakes_on_newer_sequence() {
        let (tx, rx) = watch::channel(0);
        let mut feed = LiveFeed::new(rx, 0, Duration::from_secs(60));

        let waiter = tokio::spawn(async move { feed.wait().await });
        tokio::task::yield_now().await;
        tx.send(7).unwrap();

        assert_eq!(waiter.await.unwrap(), FeedWake::Changed(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignores_stale_sequence() {
        let (tx, rx) = watch::channel(10);
        let mut feed = LiveFeed::new(rx, 10, Duration::from_millis(50));

        // Republishing an already-seen sequence is not a change
        tx.send(10).unwrap();
        assert_eq!(feed.wait().await, FeedWake::Heartbeat);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebind_past_announced_sequence_waits_for_heartbeat() {
        // Announced 10, but nothing after 0 turned up in the feed
        let (_tx, rx) = watch::channel(10);
        let mut feed = LiveFeed::new(rx, 0, Duration::from_millis(100));
        assert!(feed.has_pending());

        feed.rebind(10);
        assert_eq!(feed.wait().await, FeedWake::Heartbeat);
    }

    #[tokio::test]
    async fn test_closed_when_sender_dropped() {
        let (tx, rx) = watch::channel(0);
        let mut feed = LiveFeed::new(rx, 0, Duration::from_secs(60));
        drop(tx);
        assert_eq!(feed.wait().await, FeedWake::Closed);
    }

    #[tokio::test]
    async fn test_rebind_keeps_single_subscription() {
        let (tx, rx) = watch::channel(4);
        let mut feed = LiveFeed::new(rx, 0, Duration::from_secs(60));
        assert_eq!(tx.receiver_count(), 1);

        feed.rebind(4);
        assert!(!feed.has_pending());
        assert_eq!(feed.since(), 4);
        assert_eq!(tx.receiver_count(), 1);
    }
}
