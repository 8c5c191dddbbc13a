//! Epoch fence between the adder workers and the synthetic engine.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct State {
    ready: usize,
    generation: u64,
    closed: bool,
}

/// A generational barrier released once per tick by the synthetic engine.
///
/// Every adder worker [arrives](Self::arrive) after swapping its shard and blocks until the
/// synthetic engine has [released](Self::release_after) the current generation. The engine waits
/// until all workers have arrived, runs its computation while they are blocked, then bumps the
/// generation and wakes them.
#[derive(Debug)]
pub struct TickBarrier {
    workers: usize,
    state: Mutex<State>,
    arrived: Condvar,
    released: Condvar,
}

impl TickBarrier {
    /// Creates a barrier for `workers` adder workers.
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            state: Mutex::new(State::default()),
            arrived: Condvar::new(),
            released: Condvar::new(),
        }
    }

    /// Number of workers the barrier waits for.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Signals that a worker finished its swap and waits for the release.
    ///
    /// Returns `false` if the barrier was closed instead of released.
    pub fn arrive(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }

        let generation = state.generation;
        state.ready += 1;
        self.arrived.notify_one();

        while state.generation == generation && !state.closed {
            self.released.wait(&mut state);
        }

        state.generation != generation
    }

    /// Waits for all workers, runs `f` and releases them.
    ///
    /// Returns `false` without running `f` if the barrier was closed while waiting.
    pub fn release_after<F: FnOnce()>(&self, f: F) -> bool {
        let mut state = self.state.lock();
        while state.ready < self.workers && !state.closed {
            self.arrived.wait(&mut state);
        }

        if state.closed {
            return false;
        }

        state.ready = 0;
        f();
        state.generation += 1;
        self.released.notify_all();
        true
    }

    /// Wakes all waiters permanently.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.arrived.notify_all();
        self.released.notify_all();
    }

    /// Returns `true` once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn test_release_happens_after_all_arrivals() {
        let barrier = Arc::new(TickBarrier::new(4));
        let swapped = Arc::new(AtomicUsize::new(0));
        let ticks = 50;

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let swapped = Arc::clone(&swapped);
                thread::spawn(move || {
                    for _ in 0..ticks {
                        swapped.fetch_add(1, Ordering::SeqCst);
                        assert!(barrier.arrive());
                    }
                })
            })
            .collect();

        for tick in 1..=ticks {
            assert!(barrier.release_after(|| {
                // Every worker swapped exactly once for this tick and none started the next.
                assert_eq!(swapped.load(Ordering::SeqCst), tick * 4);
            }));
        }

        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn test_close_unblocks_both_sides() {
        let barrier = Arc::new(TickBarrier::new(2));

        let waiter = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.arrive())
        };
        let releaser = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.release_after(|| panic!("must not run")))
        };

        // Only one of two workers ever arrives, so both sides block until closed.
        thread::sleep(std::time::Duration::from_millis(20));
        barrier.close();

        assert!(!waiter.join().unwrap());
        assert!(!releaser.join().unwrap());
        assert!(!barrier.arrive());
        assert!(barrier.is_closed());
    }
}
