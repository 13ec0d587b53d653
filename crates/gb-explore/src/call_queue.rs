//! Ordering of in-flight recomputation calls.
//!
//! Requests are never cancelled. Each call takes a token from its stage's
//! queue and applies its result only if that token is still the newest one
//! when the result arrives.

/// Identifies one recomputation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallToken(u64);

impl CallToken {
    /// Creates a token with an explicit value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Per-stage queue of call tokens.
///
/// # Example
///
/// ```rust
/// use gb_explore::{CallQueue, CallToken};
///
/// let mut queue = CallQueue::new();
/// for t in 1..=3 {
///     queue.push(CallToken::new(t));
/// }
/// assert_eq!(queue.calls(), &[CallToken::new(3)]);
/// assert!(!queue.is_latest(CallToken::new(1)));
/// assert!(queue.is_latest(CallToken::new(3)));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CallQueue {
    calls: Vec<CallToken>,
    issued: u64,
}

impl CallQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a fresh token and makes it the only entry.
    pub fn issue(&mut self) -> CallToken {
        self.issued += 1;
        let token = CallToken(self.issued);
        self.push(token);
        token
    }

    /// Drops every older entry, then records `token`.
    pub fn push(&mut self, token: CallToken) {
        self.calls.clear();
        self.calls.push(token);
        self.issued = self.issued.max(token.0);
    }

    /// Returns true if `token` is the last entry.
    pub fn is_latest(&self, token: CallToken) -> bool {
        self.calls.last() == Some(&token)
    }

    /// Current entries, oldest first.
    pub fn calls(&self) -> &[CallToken] {
        &self.calls
    }
}
