use std::{
    cell::Cell,
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    rc::Rc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

/// Source of time for the guest and the event loop.
pub trait Clock {
    /// Monotonic time since an arbitrary origin, reported by `nanotime1`.
    fn monotonic(&self) -> Duration;
    /// Time since the Unix epoch, reported by `walltime` and `Date`.
    fn wall(&self) -> Duration;
    /// Block until `monotonic()` reaches `deadline`.
    fn sleep_until(&self, deadline: Duration);
}

pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }
    fn wall(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
    fn sleep_until(&self, deadline: Duration) {
        if let Some(d) = deadline.checked_sub(self.monotonic()) {
            std::thread::sleep(d);
        }
    }
}

/// Clock that only moves when told to. Sleeping jumps straight to the
/// deadline. Clones share the same time.
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<Duration>>,
    wall_base: Duration,
}

impl ManualClock {
    pub fn with_wall_base(wall_base: Duration) -> Self {
        Self {
            now: Rc::default(),
            wall_base,
        }
    }
    pub fn advance(&self, d: Duration) {
        self.now.set(self.now.get() + d);
    }
}

impl Clock for ManualClock {
    fn monotonic(&self) -> Duration {
        self.now.get()
    }
    fn wall(&self) -> Duration {
        self.wall_base + self.now.get()
    }
    fn sleep_until(&self, deadline: Duration) {
        if deadline > self.now.get() {
            self.now.set(deadline);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Timeout waiting to fire. Ordered by deadline, then by id.
struct Task {
    when: Duration,
    id: i32,
}

/// Timeouts requested through `runtime.scheduleTimeoutEvent`.
///
/// Cancelled entries stay in the heap and are skipped when they reach the top.
pub struct Timeouts {
    next_id: i32,
    tasks: BinaryHeap<Reverse<Task>>,
    active: HashMap<i32, Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            next_id: 1,
            tasks: BinaryHeap::new(),
            active: HashMap::new(),
        }
    }
}

impl Timeouts {
    /// Register a timeout `delay_ms` after `now` and return its id. Negative
    /// delays fire immediately.
    pub fn schedule(&mut self, now: Duration, delay_ms: i64) -> i32 {
        let id = self.next_id;
        self.next_id += 1;
        let when = now + Duration::from_millis(delay_ms.max(0) as u64);
        self.tasks.push(Reverse(Task { when, id }));
        self.active.insert(id, when);
        log::trace!("timeout {id} scheduled at {when:?}");
        id
    }

    /// Returns whether `id` was still pending.
    pub fn cancel(&mut self, id: i32) -> bool {
        self.active.remove(&id).is_some()
    }

    fn is_live(&self, task: &Task) -> bool {
        self.active.get(&task.id) == Some(&task.when)
    }

    fn discard_cancelled(&mut self) {
        while let Some(Reverse(task)) = self.tasks.peek() {
            if self.is_live(task) {
                break;
            }
            let _ = self.tasks.pop();
        }
    }

    pub fn next_deadline(&mut self) -> Option<Duration> {
        self.discard_cancelled();
        self.tasks.peek().map(|Reverse(t)| t.when)
    }

    /// Remove and return the earliest timeout due at `now`.
    pub fn pop_due(&mut self, now: Duration) -> Option<i32> {
        self.discard_cancelled();
        match self.tasks.peek() {
            Some(Reverse(Task { when, id })) if *when <= now => {
                let id = *id;
                let _ = self.tasks.pop();
                self.active.remove(&id);
                Some(id)
            }
            _ => None,
        }
    }

    pub fn is_pending(&self, id: i32) -> bool {
        self.active.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
        self.active.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn ids_start_at_one_and_increase() {
        let mut t = Timeouts::default();
        assert_eq!(t.schedule(Duration::ZERO, 10), 1);
        assert_eq!(t.schedule(Duration::ZERO, 10), 2);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut t = Timeouts::default();
        let slow = t.schedule(Duration::ZERO, 30);
        let fast = t.schedule(Duration::ZERO, 10);
        let negative = t.schedule(Duration::ZERO, -5);
        assert_eq!(t.next_deadline(), Some(Duration::ZERO));
        assert_eq!(t.pop_due(Duration::ZERO), Some(negative));
        assert_eq!(t.pop_due(5 * MS), None);
        assert_eq!(t.pop_due(30 * MS), Some(fast));
        assert_eq!(t.pop_due(30 * MS), Some(slow));
        assert!(t.is_empty());
        assert_eq!(t.next_deadline(), None);
    }

    #[test]
    fn cancelled_timeouts_never_fire() {
        let mut t = Timeouts::default();
        let a = t.schedule(Duration::ZERO, 10);
        let b = t.schedule(Duration::ZERO, 20);
        assert!(t.cancel(a));
        assert!(!t.cancel(a));
        assert!(!t.is_pending(a));
        assert_eq!(t.next_deadline(), Some(20 * MS));
        assert_eq!(t.pop_due(100 * MS), Some(b));
        assert_eq!(t.pop_due(100 * MS), None);
    }

    #[test]
    fn manual_clock_jumps_to_deadline() {
        let clock = ManualClock::with_wall_base(Duration::from_secs(1_000));
        let shared = clock.clone();
        clock.sleep_until(250 * MS);
        assert_eq!(shared.monotonic(), 250 * MS);
        clock.sleep_until(100 * MS);
        assert_eq!(shared.monotonic(), 250 * MS);
        shared.advance(MS);
        assert_eq!(clock.wall(), Duration::from_secs(1_000) + 251 * MS);
    }
}
