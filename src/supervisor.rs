//! Fiber Supervision
//!
//! Two supervision modes exist, chosen by the daemon mask at fork
//! time:
//!
//! - **Supervised**: the child registers in its parent's child set.
//!   When the child completes, its own children are adopted by the
//!   parent; interruption of an ancestor reaches every descendant.
//! - **Daemon**: the child has no parent and is tracked in a
//!   process-wide registry instead.
//!
//! All references here are weak. A fiber is kept alive by its pending
//! work: the queued turn, the timer entry, or the async callback that
//! will resume it, never by the supervision links, so completed
//! fibers cannot pin their ancestors.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::fiber::{Fiber, FiberId};
use crate::node::DynCause;

/// Process-wide registry of daemon fibers.
static DAEMON_REGISTRY: OnceLock<Mutex<HashMap<FiberId, Weak<Fiber>>>> = OnceLock::new();

fn daemon_registry() -> &'static Mutex<HashMap<FiberId, Weak<Fiber>>> {
    DAEMON_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Track a daemon fiber.
pub(crate) fn register_daemon(fiber: &Arc<Fiber>) {
    daemon_registry()
        .lock()
        .insert(fiber.id(), Arc::downgrade(fiber));
}

/// Stop tracking a daemon fiber.
pub(crate) fn unregister_daemon(id: FiberId) {
    daemon_registry().lock().remove(&id);
}

/// Number of live daemon fibers.
pub fn daemon_count() -> usize {
    daemon_registry()
        .lock()
        .values()
        .filter(|w| w.strong_count() > 0)
        .count()
}

/// Register a supervised child under its parent.
pub(crate) fn adopt(parent: &Arc<Fiber>, child: &Arc<Fiber>) {
    *child.parent.lock() = Some(Arc::downgrade(parent));
    parent
        .children
        .lock()
        .insert(child.id(), Arc::downgrade(child));
}

/// Supervision bookkeeping at fiber completion.
///
/// Clears the parent pointer, removes the fiber from its parent's
/// child set, and hands the fiber's own children to the grandparent.
/// Daemon fibers leave the registry.
pub(crate) fn on_fiber_done(fiber: &Arc<Fiber>) {
    let parent = fiber.parent.lock().take();
    let orphans: Vec<(FiberId, Weak<Fiber>)> = fiber.children.lock().drain().collect();

    match parent.and_then(|weak| weak.upgrade()) {
        Some(grandparent) => {
            let mut gp_children = grandparent.children.lock();
            gp_children.remove(&fiber.id());
            for (id, weak) in orphans {
                if let Some(child) = weak.upgrade() {
                    *child.parent.lock() = Some(Arc::downgrade(&grandparent));
                    gp_children.insert(id, weak);
                }
            }
        }
        None => {
            for (_, weak) in orphans {
                if let Some(child) = weak.upgrade() {
                    *child.parent.lock() = None;
                }
            }
        }
    }

    if fiber.daemon {
        unregister_daemon(fiber.id());
    }
}

/// Interrupt a fiber and, recursively, its supervised descendants.
///
/// Each fiber accumulates `Interrupt(by)`; a fiber suspended
/// interruptible is woken with a synthetic failure and resubmitted.
/// Fibers that are running observe the interruption cooperatively at
/// their next checkpoint.
pub(crate) fn interrupt_tree(fiber: &Arc<Fiber>, by: FiberId) {
    if let Some(wakeup) = fiber.add_interrupt_cause(DynCause::interrupt(by)) {
        let executor = {
            let mut run = fiber.run.lock();
            run.as_mut().map(|rs| {
                rs.cur = Some(wakeup);
                rs.executor()
            })
        };
        if let Some(executor) = executor {
            crate::interpreter::submit_turn(fiber.clone(), executor);
        }
    }

    for child in fiber.children_snapshot() {
        interrupt_tree(&child, by);
    }
}

// ============================================================================
// Tests
// ============================================================================
