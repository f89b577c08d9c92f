//! Bounded per-subscriber token queue.
//!
//! The dispatch loop is the only producer and the subscriber's forwarding
//! task the only consumer. Once closed, a mailbox discards everything queued
//! and refuses new tokens.

use super::config::OverflowPolicy;
use crate::types::Token;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

/// Result of offering a token to a mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after discarding the oldest token
    Displaced,
    Closed,
}

struct MailboxState {
    tokens: VecDeque<Token>,
    closed: bool,
}

pub struct Mailbox {
    state: Mutex<MailboxState>,
    capacity: usize,
    policy: OverflowPolicy,
    readable: Notify,
    writable: Notify,
    dropped: AtomicU64,
}

impl Mailbox {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(MailboxState {
                tokens: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            capacity,
            policy,
            readable: Notify::new(),
            writable: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Offer a token without waiting. Hands the token back when the mailbox
    /// is full under `OverflowPolicy::Block`.
    pub fn try_push(&self, token: Token) -> Result<PushOutcome, Token> {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(PushOutcome::Closed);
            }
            if state.tokens.len() < self.capacity {
                state.tokens.push_back(token);
                PushOutcome::Queued
            } else {
                match self.policy {
                    OverflowPolicy::Block => return Err(token),
                    OverflowPolicy::DropOldest => {
                        state.tokens.pop_front();
                        state.tokens.push_back(token);
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        PushOutcome::Displaced
                    }
                }
            }
        };
        self.readable.notify_one();
        Ok(outcome)
    }

    /// Offer a token, waiting for room if the policy says so.
    pub async fn push(&self, token: Token) -> PushOutcome {
        let mut token = token;
        loop {
            match self.try_push(token) {
                Ok(outcome) => return outcome,
                Err(rejected) => token = rejected,
            }
            self.writable.notified().await;
        }
    }

    /// Next queued token. `None` once the mailbox is closed.
    pub async fn pop(&self) -> Option<Token> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(token) = state.tokens.pop_front() {
                    drop(state);
                    self.writable.notify_one();
                    return Some(token);
                }
                if state.closed {
                    return None;
                }
            }
            self.readable.notified().await;
        }
    }

    /// Close and discard queued tokens. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            state.tokens.clear();
        }
        self.readable.notify_one();
        self.writable.notify_one();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tokens discarded under `OverflowPolicy::DropOldest`
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
