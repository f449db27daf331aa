use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use super::queue::{DeadlineNode, DeadlineQueue};
use crate::clock;


/// How long the watchdog lingers on an empty queue before terminating.
/// The next enqueue transparently starts a fresh one.
pub(crate) const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Process-wide queue state. The watchdog handle is a flag here rather
/// than a join handle: the thread owns itself and only this flag decides
/// whether an enqueue must spawn a replacement.
struct Registry {
    queue: DeadlineQueue,
    watchdog_alive: bool,
}

impl Registry {
    const fn new() -> Self {
        Self {
            queue: DeadlineQueue::new(),
            watchdog_alive: false,
        }
    }
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry::new());

/// Signalled when a pushed node becomes the new head and when the head is
/// removed.
static WAKE: Condvar = Condvar::new();

static GENERATION: AtomicU64 = AtomicU64::new(0);


/// Enqueue a node, waking the watchdog if the node became the head and
/// spawning a watchdog if none is alive.
pub(crate) fn enqueue(node: Arc<DeadlineNode>) {
    let mut registry = REGISTRY.lock();

    if registry.queue.push(node) {
        WAKE.notify_one();
    }
    trace!(pending = registry.queue.len(), "deadline registered");

    ensure_watchdog(&mut registry);
}

/// Remove a node. Returns `false` when the watchdog already claimed it,
/// i.e. the deadline fired.
pub(crate) fn dequeue(node: &DeadlineNode) -> bool {
    let mut registry = REGISTRY.lock();

    let was_head = node.index() == 1;
    let removed = registry.queue.remove(node);
    if removed && was_head {
        WAKE.notify_one();
    }

    removed
}

/// How many watchdog threads have been started over the process lifetime.
/// Observable through the `tidewatch-watchdog-{n}` thread names as well.
#[cfg(test)]
pub(crate) fn generation() -> u64 {
    GENERATION.load(Ordering::Relaxed)
}


fn ensure_watchdog(registry: &mut Registry) {
    if registry.watchdog_alive {
        return;
    }
    registry.watchdog_alive = true;

    let generation = GENERATION.fetch_add(1, Ordering::Relaxed) + 1;
    thread::Builder::new()
        .name(format!("tidewatch-watchdog-{generation}"))
        .spawn(watchdog_main)
        .expect("failed to spawn the watchdog thread");

    debug!(generation, "watchdog started");
}

enum Awaited {
    /// The head deadline elapsed; the node has been popped.
    Expired(Arc<DeadlineNode>),
    /// Woken early or a new head appeared; evaluate the queue again.
    Recheck,
    /// The queue stayed empty for the whole idle interval.
    Idle,
}

/// Wait for the next actionable queue event. Runs with the queue lock
/// held; waiting on the condition variable releases it.
fn await_expired(registry: &mut MutexGuard<'static, Registry>) -> Awaited {
    let Some(head) = registry.queue.peek() else {
        let result = WAKE.wait_for(registry, IDLE_TIMEOUT);
        if result.timed_out() && registry.queue.is_empty() {
            return Awaited::Idle;
        }
        return Awaited::Recheck;
    };

    let wait = clock::nanos_until(head.fire_at_nanos(), clock::now_nanos());
    if wait > 0 {
        WAKE.wait_for(registry, clock::duration_from_nanos(wait));
        return Awaited::Recheck;
    }

    match registry.queue.pop_head() {
        Some(node) => Awaited::Expired(node),
        None => Awaited::Recheck,
    }
}

fn watchdog_main() {
    loop {
        let mut registry = REGISTRY.lock();

        match await_expired(&mut registry) {
            Awaited::Idle => {
                registry.watchdog_alive = false;
                drop(registry);
                debug!("watchdog idle, terminating");
                return;
            }
            Awaited::Recheck => {}
            Awaited::Expired(node) => {
                // Never run user callbacks while holding the queue lock.
                drop(registry);

                if let Some(token) = node.token() {
                    token.cancel();
                }
                if let Err(error) = node.run_expiry() {
                    warn!(%error, "failed to close the resource after a timeout expiry");
                }
            }
        }
    }
}
