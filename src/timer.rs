use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

pub type TimeoutCallback = Box<dyn FnOnce() + Send>;

struct TimerNode {
    id: RawFd,
    expires: Instant,
    cb: TimeoutCallback,
}

/// Min-heap of per-connection idle deadlines, keyed by fd.
///
/// A side index maps each id to its heap position so `adjust` and
/// `do_work` run in O(log n). Every swap updates the index for both
/// entries; after any public operation the heap property and the
/// id-to-position bijection both hold.
#[derive(Default)]
pub struct HeapTimer {
    heap: Vec<TimerNode>,
    index: HashMap<RawFd, usize>,
}

impl HeapTimer {
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(64),
            index: HashMap::with_capacity(64),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Insert a timer, or replace the deadline and callback of an
    /// existing one.
    pub fn add(&mut self, id: RawFd, timeout_ms: u64, cb: TimeoutCallback) {
        let expires = Instant::now() + Duration::from_millis(timeout_ms);
        match self.index.get(&id).copied() {
            None => {
                let i = self.heap.len();
                self.index.insert(id, i);
                self.heap.push(TimerNode { id, expires, cb });
                self.sift_up(i);
            }
            Some(i) => {
                self.heap[i].expires = expires;
                self.heap[i].cb = cb;
                if !self.sift_down(i) {
                    self.sift_up(i);
                }
            }
        }
    }

    /// Move an existing timer's deadline. Calling this for an unknown id
    /// is a programming error.
    pub fn adjust(&mut self, id: RawFd, new_timeout_ms: u64) {
        let i = *self
            .index
            .get(&id)
            .expect("adjust on a timer that was never added");
        self.heap[i].expires = Instant::now() + Duration::from_millis(new_timeout_ms);
        if !self.sift_down(i) {
            self.sift_up(i);
        }
    }

    /// Fire the callback of `id` now and remove it. Unknown ids are
    /// ignored.
    pub fn do_work(&mut self, id: RawFd) {
        if let Some(i) = self.index.get(&id).copied() {
            let node = self.remove_at(i);
            (node.cb)();
        }
    }

    /// Remove the root without firing it.
    pub fn pop(&mut self) {
        assert!(!self.heap.is_empty());
        self.remove_at(0);
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    /// Fire every expired timer, smallest deadline first.
    pub fn tick(&mut self) {
        let now = Instant::now();
        while let Some(root) = self.heap.first() {
            if root.expires > now {
                break;
            }
            let node = self.remove_at(0);
            (node.cb)();
        }
    }

    /// Tick, then report how long until the next deadline. `None` means
    /// the heap is empty (the reactor maps it to an infinite wait).
    pub fn next_tick_ms(&mut self) -> Option<u64> {
        self.tick();
        self.heap.first().map(|node| {
            node.expires
                .saturating_duration_since(Instant::now())
                .as_millis() as u64
        })
    }

    fn remove_at(&mut self, i: usize) -> TimerNode {
        let last = self.heap.len() - 1;
        if i < last {
            self.swap_nodes(i, last);
        }
        let node = self.heap.pop().unwrap();
        self.index.remove(&node.id);
        if i < self.heap.len() && !self.sift_down(i) {
            self.sift_up(i);
        }
        node
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap_nodes(i, parent);
            i = parent;
        }
    }

    /// Returns true if the node moved.
    fn sift_down(&mut self, start: usize) -> bool {
        let n = self.heap.len();
        let mut i = start;
        let mut child = i * 2 + 1;
        while child < n {
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
            child = i * 2 + 1;
        }
        i > start
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].id, i);
        self.index.insert(self.heap[j].id, j);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn noop() -> TimeoutCallback {
        Box::new(|| {})
    }

    fn assert_valid(timer: &HeapTimer) {
        for i in 1..timer.heap.len() {
            let parent = (i - 1) / 2;
            assert!(
                timer.heap[parent].expires <= timer.heap[i].expires,
                "heap property violated at {i}"
            );
        }
        assert_eq!(timer.index.len(), timer.heap.len());
        for (id, &pos) in &timer.index {
            assert_eq!(timer.heap[pos].id, *id, "index points at the wrong node");
        }
    }

    #[test]
    fn add_replace_pop_keep_heap_valid() {
        let mut timer = HeapTimer::new();
        for (id, ms) in [(5, 500), (1, 100), (9, 900), (3, 300), (7, 700)] {
            timer.add(id, ms, noop());
            assert_valid(&timer);
        }
        // Replacing an existing id re-heapifies in place.
        timer.add(9, 50, noop());
        assert_valid(&timer);
        assert_eq!(timer.heap[0].id, 9);

        while !timer.is_empty() {
            timer.pop();
            assert_valid(&timer);
        }
    }

    #[test]
    fn adjusting_the_root_past_its_sibling_restores_order() {
        let mut timer = HeapTimer::new();
        timer.add(1, 100, noop());
        timer.add(2, 200, noop());
        timer.add(3, 300, noop());
        assert_eq!(timer.heap[0].id, 1);

        timer.adjust(1, 10_000);
        assert_valid(&timer);
        assert_eq!(timer.heap[0].id, 2);
    }

    #[test]
    fn tick_fires_expired_callbacks_in_deadline_order() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let mut timer = HeapTimer::new();
        for id in [4, 2, 8, 6] {
            let fired = fired.clone();
            timer.add(
                id,
                id as u64, // already expired by the time tick runs below
                Box::new(move || fired.lock().unwrap().push(id)),
            );
        }
        std::thread::sleep(Duration::from_millis(20));
        timer.tick();
        assert_eq!(*fired.lock().unwrap(), vec![2, 4, 6, 8]);
        assert!(timer.is_empty());
        assert_eq!(timer.next_tick_ms(), None);
    }

    #[test]
    fn do_work_fires_once_and_ignores_unknown_ids() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut timer = HeapTimer::new();
        let c = count.clone();
        timer.add(42, 60_000, Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        timer.do_work(42);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(timer.is_empty());

        timer.do_work(42); // gone: silent no-op
        timer.do_work(7);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn next_tick_reports_remaining_time() {
        let mut timer = HeapTimer::new();
        timer.add(1, 5_000, noop());
        let ms = timer.next_tick_ms().unwrap();
        assert!(ms <= 5_000 && ms > 4_000);
    }
}
