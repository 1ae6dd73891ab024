//! Outbound delta queue with a trailing debounce window.
//!
//! Every local change is pushed as a binary delta. The queue decides when
//! the pending deltas go out:
//!
//! On push d:
//!   Q = Q ++ [d]
//!   if now - last_flush < window: (re)arm trailing timer for `window`
//!   else: flush now
//!
//! On flush:
//!   send merge(Q); Q = []; last_flush = now
//!
//! The window opens when the queue is created, so a burst right after
//! creation is held back until the trailing timer fires.

use tokio::time::{Duration, Instant};

/// What the caller should do after a push.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flush {
    /// The window has elapsed: merge and publish now.
    Now,
    /// Arm (or re-arm) the trailing timer for this long.
    Deferred(Duration),
}

/// Buffer for outgoing deltas.
#[derive(Debug)]
pub struct OutboundQueue {
    pending: Vec<Vec<u8>>,
    window: Duration,
    last_flush: Instant,
}

impl OutboundQueue {
    pub fn new(window: Duration) -> Self {
        Self {
            pending: Vec::new(),
            window,
            last_flush: Instant::now(),
        }
    }

    /// Queue a delta and decide whether to flush.
    pub fn push(&mut self, delta: Vec<u8>) -> Flush {
        self.pending.push(delta);
        if self.last_flush.elapsed() < self.window {
            Flush::Deferred(self.window)
        } else {
            Flush::Now
        }
    }

    /// Drain the queue and restart the window.
    pub fn take(&mut self) -> Vec<Vec<u8>> {
        self.last_flush = Instant::now();
        std::mem::take(&mut self.pending)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_inside_window_is_deferred() {
        let mut queue = OutboundQueue::new(Duration::from_millis(100));
        assert_eq!(queue.push(vec![1]), Flush::Deferred(Duration::from_millis(100)));
        assert_eq!(queue.push(vec![2]), Flush::Deferred(Duration::from_millis(100)));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.take(), vec![vec![1], vec![2]]);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_after_window_flushes_now() {
        let mut queue = OutboundQueue::new(Duration::from_millis(100));
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(queue.push(vec![1]), Flush::Now);
        queue.take();

        assert!(matches!(queue.push(vec![2]), Flush::Deferred(_)));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(queue.push(vec![3]), Flush::Now);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_window_never_defers() {
        let mut queue = OutboundQueue::new(Duration::ZERO);
        assert_eq!(queue.push(vec![1]), Flush::Now);
        queue.take();
        assert_eq!(queue.push(vec![2]), Flush::Now);
    }
}
