//! Per-call correlation context
//!
//! Each intercepted call gets an [`InvocationContext`]. By default the id is a
//! random 128-bit hex string, unique across processes. Callers that already
//! carry a correlation id (a request id, a test case name) can pin it for the
//! current thread with [`scope`]:
//!
//! ```
//! use shadowstack::context::{self, InvocationContext};
//!
//! {
//!     let _scope = context::scope("request-42");
//!     assert_eq!(InvocationContext::current().context_id(), "request-42");
//! }
//! assert_ne!(InvocationContext::current().context_id(), "request-42");
//! ```

use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::time::{SystemTime, UNIX_EPOCH};

thread_local! {
    static SCOPED_IDS: RefCell<Vec<(u64, String)>> = const { RefCell::new(Vec::new()) };
    static NEXT_SCOPE: Cell<u64> = const { Cell::new(0) };
}

/// Correlation token attached to one invocation record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationContext {
    context_id: String,
    /// Creation time, nanoseconds since the Unix epoch
    created_at_nanos: u64,
}

impl InvocationContext {
    /// Context with a freshly generated id
    pub fn generate() -> Self {
        Self::with_id(hex::encode(rand::random::<[u8; 16]>()))
    }

    /// Context with a caller-supplied id
    pub fn with_id(context_id: impl Into<String>) -> Self {
        InvocationContext {
            context_id: context_id.into(),
            created_at_nanos: now_nanos(),
        }
    }

    /// Context for a call made right now on this thread
    ///
    /// Uses the innermost active [`scope`] id, or generates one.
    pub fn current() -> Self {
        SCOPED_IDS
            .with(|ids| ids.borrow().last().map(|(_, id)| id.clone()))
            .map(Self::with_id)
            .unwrap_or_else(Self::generate)
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn created_at_nanos(&self) -> u64 {
        self.created_at_nanos
    }

    /// A context is valid when it carries a non-empty id
    pub fn is_valid(&self) -> bool {
        !self.context_id.trim().is_empty()
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Guard returned by [`scope`]; the id is released when it drops
#[must_use = "the correlation id is only active while the guard lives"]
#[derive(Debug)]
pub struct ContextScope {
    token: u64,
    // Guards are tied to the thread whose stack they pushed onto.
    _not_send: std::marker::PhantomData<*const ()>,
}

/// Pin `context_id` for every call intercepted on this thread until the
/// returned guard drops. Scopes nest; the innermost live scope wins, even
/// when guards drop out of order.
pub fn scope(context_id: impl Into<String>) -> ContextScope {
    let id = context_id.into();
    let token = NEXT_SCOPE.with(|next| {
        let token = next.get();
        next.set(token.wrapping_add(1));
        token
    });
    SCOPED_IDS.with(|ids| ids.borrow_mut().push((token, id)));
    ContextScope {
        token,
        _not_send: std::marker::PhantomData,
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        SCOPED_IDS.with(|ids| {
            let mut ids = ids.borrow_mut();
            if let Some(index) = ids.iter().rposition(|(token, _)| *token == self.token) {
                ids.remove(index);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique_and_valid() {
        let a = InvocationContext::generate();
        let b = InvocationContext::generate();
        assert!(a.is_valid());
        assert_eq!(a.context_id().len(), 32);
        assert_ne!(a.context_id(), b.context_id());
        assert!(a.created_at_nanos() > 0);
    }

    #[test]
    fn test_empty_id_is_invalid() {
        assert!(!InvocationContext::with_id("").is_valid());
        assert!(!InvocationContext::with_id("   ").is_valid());
    }

    #[test]
    fn test_scopes_nest() {
        let _outer = scope("outer");
        assert_eq!(InvocationContext::current().context_id(), "outer");
        {
            let _inner = scope("inner");
            assert_eq!(InvocationContext::current().context_id(), "inner");
        }
        assert_eq!(InvocationContext::current().context_id(), "outer");
    }

    #[test]
    fn test_out_of_order_drop_keeps_inner_scope() {
        let outer = scope("outer");
        let inner = scope("inner");
        drop(outer);
        assert_eq!(InvocationContext::current().context_id(), "inner");

        drop(inner);
        let current = InvocationContext::current();
        assert_ne!(current.context_id(), "inner");
        assert_ne!(current.context_id(), "outer");
    }

    #[test]
    fn test_same_id_scoped_twice_releases_one_at_a_time() {
        let first = scope("dup");
        let second = scope("dup");
        drop(first);
        assert_eq!(InvocationContext::current().context_id(), "dup");
        drop(second);
        assert_ne!(InvocationContext::current().context_id(), "dup");
    }

    #[test]
    fn test_scope_is_thread_local() {
        let _scope = scope("main-thread");
        let other = std::thread::spawn(|| InvocationContext::current().context_id().to_string())
            .join()
            .unwrap();
        assert_ne!(other, "main-thread");
    }
}
