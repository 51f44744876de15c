// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Cancellable one-shot timer service.
//!
//! Every timer in the core goes through this service: entities hold opaque
//! [`TimerToken`]s rather than task handles, so shutting an entity down is a
//! predictable token sweep. Callbacks run on the tokio runtime and must
//! re-check entity state; a fired or cancelled token is inert forever.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// RFC 3261 T1: RTT estimate, 500 ms.
pub const T1: Duration = Duration::from_millis(500);
/// RFC 3261 T2: maximum retransmit interval, 4 s.
pub const T2: Duration = Duration::from_secs(4);
/// RFC 3261 T4: maximum time a message stays in the network, 5 s.
pub const T4: Duration = Duration::from_secs(5);
/// Timer F / Timer H: 64×T1.
pub const TIMER_64T1: Duration = Duration::from_secs(32);

/// Opaque handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

/// Schedules cancellable one-shot callbacks on a monotonic clock.
#[derive(Clone, Default)]
pub struct TimerService {
    inner: Arc<TimerServiceInner>,
}

#[derive(Default)]
struct TimerServiceInner {
    next_id: AtomicU64,
    tasks: DashMap<TimerToken, mpsc::Sender<()>>,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `f` to run after `delay`. Returns a token that cancels it.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> TimerToken
    where
        F: FnOnce() + Send + 'static,
    {
        let token = TimerToken(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (cancel_tx, mut cancel_rx) = mpsc::channel(1);
        self.inner.tasks.insert(token, cancel_tx);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(delay) => {
                    // Removing the entry first makes cancel-after-fire a no-op.
                    if inner.tasks.remove(&token).is_some() {
                        f();
                    }
                }
                _ = cancel_rx.recv() => {}
            }
        });

        token
    }

    /// Cancels a pending timer. Returns false if it already fired or was
    /// cancelled before.
    pub fn cancel(&self, token: TimerToken) -> bool {
        match self.inner.tasks.remove(&token) {
            Some((_, cancel_tx)) => {
                let _ = cancel_tx.try_send(());
                true
            }
            None => false,
        }
    }

    /// Cancels an optional token in place, clearing the slot.
    pub fn clear(&self, slot: &mut Option<TimerToken>) {
        if let Some(token) = slot.take() {
            self.cancel(token);
        }
    }

    /// Cancels every pending timer.
    pub fn cancel_all(&self) {
        let tokens: Vec<TimerToken> = self.inner.tasks.iter().map(|e| *e.key()).collect();
        for token in tokens {
            self.cancel(token);
        }
    }

    /// Number of timers currently armed.
    pub fn active_count(&self) -> usize {
        self.inner.tasks.len()
    }
}
