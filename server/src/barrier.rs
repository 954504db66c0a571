//! Tick barrier gating the concurrent update phase
//!
//! One barrier is created per tick. Every expected arrival must be reported
//! before the driver may hand the tick's deltas to the reactor; a worker that
//! fails still reports arrival for its assigned work, so an isolated failure
//! cannot stall the tick.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

struct BarrierState {
    expected: usize,
    arrived: usize,
}

pub struct TickBarrier {
    state: Mutex<BarrierState>,
    condvar: Condvar,
}

impl TickBarrier {
    pub fn new(expected: usize) -> Self {
        Self {
            state: Mutex::new(BarrierState {
                expected,
                arrived: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Records one arrival, waking waiters once all expected arrivals are in
    pub fn arrive(&self) {
        let mut state = self.state.lock().unwrap();
        state.arrived += 1;
        if state.arrived >= state.expected {
            self.condvar.notify_all();
        }
    }

    /// Blocks until `arrived == expected`. There is no cancellation: a tick
    /// always completes once started.
    pub fn wait(&self) {
        let mut state = self.state.lock().unwrap();
        while state.arrived < state.expected {
            state = self.condvar.wait(state).unwrap();
        }
    }

    /// Like `wait` but gives up after the timeout; used only by tests
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        let (state, result) = self
            .condvar
            .wait_timeout_while(state, timeout, |s| s.arrived < s.expected)
            .unwrap();
        drop(state);
        !result.timed_out()
    }

    pub fn arrived(&self) -> usize {
        self.state.lock().unwrap().arrived
    }

    pub fn expected(&self) -> usize {
        self.state.lock().unwrap().expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_barrier_counts() {
        let barrier = TickBarrier::new(3);
        assert_eq!(barrier.expected(), 3);
        assert_eq!(barrier.arrived(), 0);

        barrier.arrive();
        barrier.arrive();
        assert_eq!(barrier.arrived(), 2);
        assert!(!barrier.wait_timeout(Duration::from_millis(10)));

        barrier.arrive();
        assert!(barrier.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_releases_only_when_all_arrive() {
        let barrier = Arc::new(TickBarrier::new(4));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                barrier.arrive();
            }));
        }

        barrier.wait();
        assert_eq!(barrier.arrived(), 4);

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_zero_expected_never_blocks() {
        let barrier = TickBarrier::new(0);
        barrier.wait();
    }

    #[test]
    fn test_failed_worker_still_arrives() {
        // Simulates the pipeline contract: a worker whose computation fails
        // must still report arrival for each assigned unit.
        let barrier = Arc::new(TickBarrier::new(2));

        let worker = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                for unit in 0..2 {
                    let result: Result<(), &str> = if unit == 0 {
                        Err("computation failed")
                    } else {
                        Ok(())
                    };
                    // Failure is logged and dropped, never skips the arrival
                    drop(result);
                    barrier.arrive();
                }
            })
        };

        barrier.wait();
        assert_eq!(barrier.arrived(), 2);
        worker.join().unwrap();
    }
}
