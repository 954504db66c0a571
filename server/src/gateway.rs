//! Host gateway: admission control for new connections
//!
//! Consulted by the reactor once per accepted socket, before any protocol
//! state exists for the connection. The decision is a pure function of the
//! remote address against three pieces of state: an explicit ban list, the
//! number of live connections per address, and a sliding-window rate limit
//! on connection attempts. A denied socket is closed immediately.

use log::info;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Banned,
    Throttled,
}

pub struct HostGateway {
    banned: HashSet<IpAddr>,
    live: HashMap<IpAddr, usize>,
    attempts: HashMap<IpAddr, VecDeque<Instant>>,
    max_live_per_addr: usize,
    max_attempts_per_window: usize,
    window: Duration,
}

impl Default for HostGateway {
    fn default() -> Self {
        Self::new(5, 10, Duration::from_secs(10))
    }
}

impl HostGateway {
    pub fn new(
        max_live_per_addr: usize,
        max_attempts_per_window: usize,
        window: Duration,
    ) -> Self {
        Self {
            banned: HashSet::new(),
            live: HashMap::new(),
            attempts: HashMap::new(),
            max_live_per_addr,
            max_attempts_per_window,
            window,
        }
    }

    /// Decides admission for one accepted socket and records the attempt.
    /// An `Allowed` verdict counts against the address until [`release`] is
    /// called for it.
    ///
    /// [`release`]: HostGateway::release
    pub fn check(&mut self, addr: IpAddr) -> Verdict {
        if self.banned.contains(&addr) {
            return Verdict::Banned;
        }

        let now = Instant::now();
        let attempts = self.attempts.entry(addr).or_default();
        while let Some(&front) = attempts.front() {
            if now.duration_since(front) > self.window {
                attempts.pop_front();
            } else {
                break;
            }
        }
        attempts.push_back(now);

        if attempts.len() > self.max_attempts_per_window {
            return Verdict::Throttled;
        }

        let live = self.live.entry(addr).or_insert(0);
        if *live >= self.max_live_per_addr {
            return Verdict::Throttled;
        }

        *live += 1;
        Verdict::Allowed
    }

    /// Drops attempt windows that have fully expired. Called periodically by
    /// the reactor sweep so addresses that connect once and never return do
    /// not stay tracked forever.
    pub fn prune(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.attempts.retain(|_, attempts| {
            while let Some(&front) = attempts.front() {
                if now.duration_since(front) > window {
                    attempts.pop_front();
                } else {
                    break;
                }
            }
            !attempts.is_empty()
        });
    }

    /// Number of addresses with a live attempt window
    pub fn tracked_attempts(&self) -> usize {
        self.attempts.len()
    }

    /// Releases one live-connection slot for the address; called on session
    /// teardown for every connection that was admitted.
    pub fn release(&mut self, addr: IpAddr) {
        if let Some(live) = self.live.get_mut(&addr) {
            *live = live.saturating_sub(1);
            if *live == 0 {
                self.live.remove(&addr);
            }
        }
    }

    pub fn ban(&mut self, addr: IpAddr) {
        info!("banned address {}", addr);
        self.banned.insert(addr);
    }

    pub fn unban(&mut self, addr: IpAddr) -> bool {
        self.banned.remove(&addr)
    }

    pub fn live_connections(&self, addr: IpAddr) -> usize {
        self.live.get(&addr).copied().unwrap_or(0)
    }
}
