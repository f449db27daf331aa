use std::{
    io,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
};

use cancellation_scope::CancelToken;


/// Wrap-safe ordering of absolute fire-times: `a` fires no later than `b`.
fn fires_no_later(a: i64, b: i64) -> bool {
    a.wrapping_sub(b) <= 0
}


/// One registration in the deadline queue: an absolute fire-time plus the
/// effect to run when it elapses.
///
/// # Invariants
///
/// - `heap_index == -1` exactly when the node is not enqueued.
/// - `on_expire` runs at most once per enqueue; a node removed before
///   expiry never has its callback invoked.
pub(crate) struct DeadlineNode {
    fire_at_nanos: i64,

    /// Effect invoked by the watchdog on expiry, typically "shut the
    /// resource down". Must be short; a long-running callback starves
    /// every other timeout.
    on_expire: Arc<dyn Fn() -> io::Result<()> + Send + Sync>,

    /// The token whose budget produced this node. Cancelled by the
    /// watchdog when the node expires.
    token: Option<CancelToken>,

    /// Position in the queue. Only mutated under the queue lock.
    heap_index: AtomicI32,
}

impl DeadlineNode {
    pub(crate) fn new(
        fire_at_nanos: i64,
        on_expire: Arc<dyn Fn() -> io::Result<()> + Send + Sync>,
        token: Option<CancelToken>,
    ) -> Self {
        Self {
            fire_at_nanos,
            on_expire,
            token,
            heap_index: AtomicI32::new(-1),
        }
    }

    pub(crate) fn fire_at_nanos(&self) -> i64 {
        self.fire_at_nanos
    }

    pub(crate) fn token(&self) -> Option<&CancelToken> {
        self.token.as_ref()
    }

    pub(crate) fn run_expiry(&self) -> io::Result<()> {
        (self.on_expire)()
    }

    pub(crate) fn index(&self) -> i32 {
        self.heap_index.load(Ordering::Relaxed)
    }

    fn set_index(&self, index: i32) {
        self.heap_index.store(index, Ordering::Relaxed);
    }
}


/// Array-backed binary min-heap of pending deadlines, ordered by absolute
/// fire-time. The array is 1-indexed (slot 0 stays empty) and every node
/// tracks its own position, making removal of an arbitrary node O(log n).
///
/// All operations must run under the process-wide queue lock.
pub(crate) struct DeadlineQueue {
    slots: Vec<Option<Arc<DeadlineNode>>>,
    len: usize,
}

impl DeadlineQueue {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn peek(&self) -> Option<&Arc<DeadlineNode>> {
        self.slots.get(1).and_then(|slot| slot.as_ref())
    }

    fn fire_at(&self, index: usize) -> i64 {
        self.slots[index]
            .as_ref()
            .map(|node| node.fire_at_nanos)
            .unwrap_or(i64::MAX)
    }

    fn place(&mut self, index: usize, node: Arc<DeadlineNode>) {
        node.set_index(index as i32);
        self.slots[index] = Some(node);
    }

    fn swap(&mut self, a: usize, b: usize) {
        let node_a = self.slots[a].take();
        let node_b = self.slots[b].take();

        if let Some(node) = node_a {
            self.place(b, node);
        }
        if let Some(node) = node_b {
            self.place(a, node);
        }
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 1 {
            let parent = index / 2;
            if fires_no_later(self.fire_at(parent), self.fire_at(index)) {
                break;
            }
            self.swap(parent, index);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        loop {
            let left = index * 2;
            if left > self.len {
                break;
            }

            let right = left + 1;
            let smallest =
                if right <= self.len && !fires_no_later(self.fire_at(left), self.fire_at(right)) {
                    right
                } else {
                    left
                };

            if fires_no_later(self.fire_at(index), self.fire_at(smallest)) {
                break;
            }
            self.swap(index, smallest);
            index = smallest;
        }
    }

    /// Enqueue a node. Returns `true` when the node became the new head,
    /// in which case the caller must wake the watchdog.
    pub(crate) fn push(&mut self, node: Arc<DeadlineNode>) -> bool {
        debug_assert_eq!(node.index(), -1);

        self.len += 1;
        if self.slots.is_empty() {
            // Slot 0 is never used.
            self.slots.push(None);
        }
        while self.slots.len() <= self.len {
            self.slots.push(None);
        }

        let pushed = Arc::clone(&node);
        self.place(self.len, node);
        self.sift_up(self.len);

        pushed.index() == 1
    }

    /// Remove an arbitrary node. Returns `false` when the node is not
    /// enqueued (the watchdog already claimed it).
    pub(crate) fn remove(&mut self, node: &DeadlineNode) -> bool {
        let index = node.index();
        if index < 0 {
            return false;
        }
        let index = index as usize;

        let removed = self.slots[index]
            .take()
            .expect("heap_index pointed at an empty slot");
        removed.set_index(-1);

        let last = self.len;
        self.len -= 1;

        if index != last {
            let moved = self.slots[last].take().expect("last heap slot was empty");
            let moved_fires_later = !fires_no_later(moved.fire_at_nanos, removed.fire_at_nanos);
            self.place(index, moved);

            if moved_fires_later {
                self.sift_down(index);
            } else {
                self.sift_up(index);
            }
        }

        true
    }

    /// Remove and return the head of the queue.
    pub(crate) fn pop_head(&mut self) -> Option<Arc<DeadlineNode>> {
        let head = self.peek().cloned()?;
        self.remove(&head);
        Some(head)
    }
}


#[cfg(test)]
mod test {
    use super::*;

    fn node(fire_at_nanos: i64) -> Arc<DeadlineNode> {
        Arc::new(DeadlineNode::new(
            fire_at_nanos,
            Arc::new(|| Ok(())),
            None,
        ))
    }

    /// Walk the whole heap checking the min-heap ordering and that every
    /// node's tracked index matches its slot.
    fn assert_invariants(queue: &DeadlineQueue) {
        for index in 1..=queue.len {
            let node = queue.slots[index]
                .as_ref()
                .expect("slot within len was empty");
            assert_eq!(node.index(), index as i32);

            if index > 1 {
                assert!(
                    fires_no_later(queue.fire_at(index / 2), queue.fire_at(index)),
                    "heap property violated at index {index}"
                );
            }
        }
        for slot in queue.slots.iter().skip(queue.len + 1) {
            assert!(slot.is_none());
        }
    }

    #[test]
    fn push_reports_new_head() {
        let mut queue = DeadlineQueue::new();

        assert!(queue.push(node(500)));
        assert!(!queue.push(node(900)));
        assert!(queue.push(node(100)));

        assert_invariants(&queue);
        assert_eq!(queue.peek().unwrap().fire_at_nanos(), 100);
    }

    #[test]
    fn pop_head_drains_in_fire_time_order() {
        let mut queue = DeadlineQueue::new();
        for fire_at in [70, 10, 50, 30, 90, 20, 80, 40, 60] {
            queue.push(node(fire_at));
            assert_invariants(&queue);
        }

        let mut drained = Vec::new();
        while let Some(head) = queue.pop_head() {
            assert_eq!(head.index(), -1);
            drained.push(head.fire_at_nanos());
            assert_invariants(&queue);
        }

        assert_eq!(drained, vec![10, 20, 30, 40, 50, 60, 70, 80, 90]);
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_detaches_an_arbitrary_node() {
        let mut queue = DeadlineQueue::new();
        let nodes: Vec<_> = [70, 10, 50, 30, 90, 20].iter().map(|n| node(*n)).collect();
        for n in &nodes {
            queue.push(Arc::clone(n));
        }

        assert!(queue.remove(&nodes[2]));
        assert_eq!(nodes[2].index(), -1);
        assert_invariants(&queue);

        // A detached node cannot be removed again.
        assert!(!queue.remove(&nodes[2]));

        let mut drained = Vec::new();
        while let Some(head) = queue.pop_head() {
            drained.push(head.fire_at_nanos());
        }
        assert_eq!(drained, vec![10, 20, 30, 70, 90]);
    }

    #[test]
    fn removing_the_head_exposes_the_next_deadline() {
        let mut queue = DeadlineQueue::new();
        let first = node(10);
        let second = node(20);
        queue.push(Arc::clone(&first));
        queue.push(Arc::clone(&second));

        assert!(queue.remove(&first));
        assert_invariants(&queue);
        assert_eq!(queue.peek().unwrap().fire_at_nanos(), 20);
    }

    #[test]
    fn indices_stay_consistent_under_interleaved_push_and_remove() {
        let mut queue = DeadlineQueue::new();
        let mut live: Vec<Arc<DeadlineNode>> = Vec::new();

        // Deterministic interleaving: pushes with a scattered fire-time
        // pattern, removing from the middle every third step.
        let mut fire_at = 0i64;
        for step in 0..200 {
            fire_at = (fire_at * 31 + 17) % 1_000;
            let fresh = node(fire_at);
            queue.push(Arc::clone(&fresh));
            live.push(fresh);

            if step % 3 == 2 {
                let victim = live.remove(live.len() / 2);
                assert!(queue.remove(&victim));
            }
            assert_invariants(&queue);
        }

        assert_eq!(queue.len(), live.len());
        for victim in &live {
            assert!(queue.remove(victim));
            assert_invariants(&queue);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn equal_fire_times_are_tolerated() {
        let mut queue = DeadlineQueue::new();
        for _ in 0..5 {
            queue.push(node(42));
        }
        assert_invariants(&queue);

        let mut drained = 0;
        while queue.pop_head().is_some() {
            drained += 1;
        }
        assert_eq!(drained, 5);
    }
}
