use std::cell::RefCell;
use std::marker::PhantomData;

use domobj_core::DomainError;
use tracing::warn;

use crate::transaction::TransactionId;

/// Caller-owned stack of active transaction scopes.
///
/// The engine never looks at a scope stack on its own; code that wants a
/// "current transaction" keeps one of these and asks [`current`](Self::current).
/// It is neither `Send` nor `Sync`, so a stack stays on the thread that made it.
#[derive(Debug, Default)]
pub struct ScopeStack {
    entries: RefCell<Vec<TransactionId>>,
    _not_send: PhantomData<*const ()>,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Innermost transaction, if any scope is open.
    pub fn current(&self) -> Option<TransactionId> {
        self.entries.borrow().last().copied()
    }

    pub fn depth(&self) -> usize {
        self.entries.borrow().len()
    }

    pub(crate) fn enter(&self, id: TransactionId) -> ScopeGuard<'_> {
        self.entries.borrow_mut().push(id);
        ScopeGuard {
            stack: self,
            id,
            left: false,
        }
    }

    /// Remove `id`; fails when it is not the innermost entry.
    fn pop(&self, id: TransactionId) -> Result<(), DomainError> {
        let mut entries = self.entries.borrow_mut();
        match entries.iter().rposition(|e| *e == id) {
            Some(index) if index + 1 == entries.len() => {
                entries.pop();
                Ok(())
            }
            Some(index) => {
                entries.remove(index);
                Err(DomainError::InvalidOperation(format!(
                    "Scope of transaction {} was left while inner scopes were still open.",
                    id
                )))
            }
            None => Err(DomainError::InvalidOperation(format!(
                "Scope of transaction {} is not on the stack.",
                id
            ))),
        }
    }
}

/// Keeps a transaction current on a [`ScopeStack`] until dropped.
#[must_use = "the scope ends when the guard is dropped"]
pub struct ScopeGuard<'s> {
    stack: &'s ScopeStack,
    id: TransactionId,
    left: bool,
}

impl ScopeGuard<'_> {
    pub fn transaction_id(&self) -> TransactionId {
        self.id
    }

    /// Leave the scope explicitly and learn whether it was left in order.
    pub fn leave(mut self) -> Result<(), DomainError> {
        self.left = true;
        self.stack.pop(self.id)
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if self.left {
            return;
        }
        if let Err(e) = self.stack.pop(self.id) {
            warn!("ScopeGuard: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use std::sync::Arc;

    #[test]
    fn scopes_nest_and_unwind() {
        let store = Arc::new(testing::seeded_store());
        let outer = testing::root(&store);
        let inner = testing::root(&store);
        let stack = ScopeStack::new();
        assert_eq!(stack.current(), None);
        {
            let _a = outer.enter_scope(&stack).unwrap();
            assert_eq!(stack.current(), Some(outer.id()));
            {
                let _b = inner.enter_scope(&stack).unwrap();
                assert_eq!(stack.current(), Some(inner.id()));
                assert_eq!(stack.depth(), 2);
            }
            assert_eq!(stack.current(), Some(outer.id()));
        }
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn leaving_out_of_order_is_reported() {
        let store = Arc::new(testing::seeded_store());
        let outer = testing::root(&store);
        let inner = testing::root(&store);
        let stack = ScopeStack::new();
        let a = outer.enter_scope(&stack).unwrap();
        let b = inner.enter_scope(&stack).unwrap();
        assert!(matches!(a.leave(), Err(DomainError::InvalidOperation(_))));
        assert_eq!(stack.current(), Some(inner.id()));
        b.leave().unwrap();
        assert_eq!(stack.current(), None);
    }

    #[test]
    fn discarded_transaction_cannot_enter() {
        let store = Arc::new(testing::seeded_store());
        let mut tx = testing::root(&store);
        tx.discard();
        assert!(tx.enter_scope(&ScopeStack::new()).is_err());
    }
}
