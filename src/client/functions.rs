//! Client-side function-call registry.
//!
//! The bot can ask the client to run a named function and report the
//! result. Handlers are registered by name; the last registration for a
//! name wins.
//!
//! | Outcome | Client reply |
//! |---------|--------------|
//! | [`DispatchOutcome::Handled`] | `llm-function-call-result` (`{}` when the handler returned `None`) |
//! | [`DispatchOutcome::Unhandled`] | nothing, the call is still surfaced as events |

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use tracing::debug;

use crate::protocol::FunctionCallParams;

// ============================================================================
// Constants
// ============================================================================

/// Tool calls remembered for at-most-once dispatch; the oldest is evicted first.
pub const MAX_DISPATCHED_CALLS: usize = 256;

// ============================================================================
// Types
// ============================================================================

/// Future returned by a function-call handler.
pub type FunctionCallFuture = Pin<Box<dyn Future<Output = Option<Value>> + Send>>;

/// Async handler for one function name.
///
/// Resolves to the result reported back to the bot.
pub type FunctionCallHandler = Arc<dyn Fn(FunctionCallParams) -> FunctionCallFuture + Send + Sync>;

/// Result of dispatching a call to the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A handler ran and produced this result.
    Handled(Option<Value>),
    /// No handler is registered for the function name.
    Unhandled,
}

// ============================================================================
// FunctionCallRegistry
// ============================================================================

/// Name → handler map plus the set of tool calls already dispatched.
#[derive(Default)]
pub struct FunctionCallRegistry {
    handlers: Mutex<FxHashMap<String, FunctionCallHandler>>,
    dispatched: Mutex<DispatchedCalls>,
}

/// Bounded FIFO of claimed tool call ids.
#[derive(Default)]
struct DispatchedCalls {
    ids: FxHashSet<String>,
    order: VecDeque<String>,
}

impl DispatchedCalls {
    fn insert(&mut self, tool_call_id: &str) -> bool {
        if !self.ids.insert(tool_call_id.to_string()) {
            return false;
        }
        self.order.push_back(tool_call_id.to_string());

        if self.order.len() > MAX_DISPATCHED_CALLS {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.order.clear();
    }
}

impl FunctionCallRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing any previous handler.
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(FunctionCallParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Value>> + Send + 'static,
    {
        let name = name.into();
        let handler: FunctionCallHandler =
            Arc::new(move |params| -> FunctionCallFuture { Box::pin(handler(params)) });

        if self.handlers.lock().insert(name.clone(), handler).is_some() {
            debug!(function = %name, "Function call handler replaced");
        } else {
            debug!(function = %name, "Function call handler registered");
        }
    }

    /// Removes the handler for `name`.
    ///
    /// Returns `true` if a handler was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.handlers.lock().remove(name).is_some()
    }

    /// Removes every handler.
    pub fn clear(&self) {
        self.handlers.lock().clear();
    }

    /// Returns `true` if a handler is registered for `name`.
    #[inline]
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.lock().contains_key(name)
    }

    /// Number of registered handlers.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Returns `true` if no handler is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }

    /// Runs the handler registered for `params.function_name`.
    ///
    /// The handler is looked up once; the registry is not locked while
    /// it runs.
    pub async fn dispatch(&self, params: FunctionCallParams) -> DispatchOutcome {
        let handler = self.handlers.lock().get(&params.function_name).cloned();

        match handler {
            Some(handler) => DispatchOutcome::Handled(handler(params).await),
            None => {
                debug!(function = %params.function_name, "No handler for function call");
                DispatchOutcome::Unhandled
            }
        }
    }

    /// Records `tool_call_id` as dispatched.
    ///
    /// Returns `false` if it was already recorded, so each tool call is
    /// dispatched at most once among the last [`MAX_DISPATCHED_CALLS`].
    pub(crate) fn claim(&self, tool_call_id: &str) -> bool {
        self.dispatched.lock().insert(tool_call_id)
    }

    /// Forgets dispatched tool calls at session end.
    pub(crate) fn reset_claims(&self) {
        self.dispatched.lock().clear();
    }
}

// ============================================================================
// Tests
// ============================================================================
