//! Execution contexts for thread-affine allocation

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

type ExitHook = Box<dyn FnOnce(u64)>;

/// Per-thread context state; runs the registered hooks when the thread exits
struct ThreadContext {
    id: Cell<u64>,
    exit_hooks: RefCell<Vec<(u64, ExitHook)>>,
}

impl ThreadContext {
    const fn new() -> Self {
        Self {
            id: Cell::new(0),
            exit_hooks: RefCell::new(Vec::new()),
        }
    }

    fn id(&self) -> u64 {
        let id = self.id.get();
        if id != 0 {
            return id;
        }
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        self.id.set(id);
        id
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        let id = self.id.get();
        for (_, hook) in self.exit_hooks.get_mut().drain(..) {
            hook(id);
        }
    }
}

thread_local! {
    static CURRENT: ThreadContext = const { ThreadContext::new() };
}

/// Identifies who is allocating
///
/// Thread-local buffers and the thread-local shard policy key their state on
/// the context id. `current()` gives every OS thread its own stable id;
/// callers multiplexing work over threads can pass explicit contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationContext {
    id: u64,
}

impl AllocationContext {
    pub const fn new(id: u64) -> Self {
        Self { id }
    }

    /// Context of the calling thread
    ///
    /// During thread teardown, after the thread's context is gone, every
    /// call returns a fresh id.
    pub fn current() -> Self {
        let id = CURRENT
            .try_with(ThreadContext::id)
            .unwrap_or_else(|_| NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed));
        Self { id }
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    /// True when this is the calling thread's own context
    pub fn is_current(&self) -> bool {
        CURRENT
            .try_with(|context| context.id.get() == self.id)
            .unwrap_or(false)
    }

    /// Run `hook` with this context's id when the calling thread exits
    ///
    /// Only the thread's own context can be watched, and one hook is kept per
    /// `owner`. Returns whether a hook for `owner` is now registered.
    pub(crate) fn at_thread_exit<F>(&self, owner: u64, hook: F) -> bool
    where
        F: FnOnce(u64) + 'static,
    {
        CURRENT
            .try_with(|context| {
                if context.id.get() != self.id {
                    return false;
                }
                let mut hooks = context.exit_hooks.borrow_mut();
                if !hooks.iter().any(|(registered, _)| *registered == owner) {
                    hooks.push((owner, Box::new(hook)));
                }
                true
            })
            .unwrap_or(false)
    }
}
