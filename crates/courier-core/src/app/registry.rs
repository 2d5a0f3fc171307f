use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::UserId;
use crate::ports::TaskHandler;

/// Registry of handlers (user_id -> handler).
///
/// Design:
/// - Owned by the drain actor, so no lock.
/// - Last registration wins: a re-login hands over a fresh session.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: HashMap<UserId, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register under the handler's own user id. Returns the replaced handler.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> Option<Arc<dyn TaskHandler>> {
        let user_id = handler.user_id().clone();
        self.handlers.insert(user_id, handler)
    }

    pub fn unregister(&mut self, user_id: &UserId) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.remove(user_id)
    }

    pub fn get(&self, user_id: &UserId) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
