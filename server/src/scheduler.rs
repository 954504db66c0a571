//! Cooperative tick-quantized task scheduler
//!
//! All delayed or repeating game logic funnels through this scheduler; it is
//! driven once per world tick by the driver, between frame application and
//! the update pipeline. Tasks live in two queues: `pending` holds tasks
//! submitted since the last pass, `active` holds tasks counting down.
//!
//! A task fires when its counter reaches zero. One-shot tasks (`period` of
//! zero) are swept after firing; repeating tasks reset their counter to
//! `period`. Cancellation is idempotent and may happen at any point before a
//! fire, either through the task's handle or in bulk by bind key (used to
//! tie a group of tasks to one entity's lifetime). A payload that fails is
//! logged and isolated; it never aborts the scheduler pass.

use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Opaque grouping token for bulk cancellation
pub type BindKey = u64;

/// Failure reported by one task payload; isolated per task
#[derive(Debug, Error)]
#[error("task failed: {0}")]
pub struct TaskFailure(pub String);

type Payload<C> = Box<dyn FnMut(&mut C) -> Result<(), TaskFailure> + Send>;
type Condition<C> = Box<dyn FnMut(&mut C) -> bool + Send>;

/// What a due task does when its counter hits zero.
///
/// The three variants differ only in their pre/post-fire condition checks;
/// everything else about task lifecycle is shared.
pub enum FirePolicy<C> {
    /// Fire unconditionally
    Always,
    /// Event listener: poll the condition each time the task comes due and
    /// run the payload only once it holds
    When(Condition<C>),
    /// Run the payload every time the task comes due until the condition
    /// holds, then self-cancel
    Until(Condition<C>),
}

/// Everything needed to submit one task
pub struct TaskSpec<C> {
    pub delay: u32,
    /// 0 = one-shot
    pub period: u32,
    pub fire_immediately: bool,
    pub bind_key: Option<BindKey>,
    /// For `When` listeners: cancel after the payload has run once
    pub once: bool,
    pub policy: FirePolicy<C>,
    pub payload: Payload<C>,
}

impl<C> TaskSpec<C> {
    pub fn one_shot(
        delay: u32,
        payload: impl FnMut(&mut C) -> Result<(), TaskFailure> + Send + 'static,
    ) -> Self {
        Self {
            delay,
            period: 0,
            fire_immediately: false,
            bind_key: None,
            once: false,
            policy: FirePolicy::Always,
            payload: Box::new(payload),
        }
    }

    pub fn repeating(
        delay: u32,
        period: u32,
        payload: impl FnMut(&mut C) -> Result<(), TaskFailure> + Send + 'static,
    ) -> Self {
        Self {
            delay,
            period,
            fire_immediately: false,
            bind_key: None,
            once: false,
            policy: FirePolicy::Always,
            payload: Box::new(payload),
        }
    }

    /// Polls `condition` every tick; runs `payload` once it holds, then
    /// self-cancels.
    pub fn event_listener(
        condition: impl FnMut(&mut C) -> bool + Send + 'static,
        payload: impl FnMut(&mut C) -> Result<(), TaskFailure> + Send + 'static,
    ) -> Self {
        Self {
            delay: 1,
            period: 1,
            fire_immediately: false,
            bind_key: None,
            once: true,
            policy: FirePolicy::When(Box::new(condition)),
            payload: Box::new(payload),
        }
    }

    /// Runs `payload` every tick until `condition` holds, then self-cancels
    pub fn until(
        condition: impl FnMut(&mut C) -> bool + Send + 'static,
        payload: impl FnMut(&mut C) -> Result<(), TaskFailure> + Send + 'static,
    ) -> Self {
        Self {
            delay: 1,
            period: 1,
            fire_immediately: false,
            bind_key: None,
            once: false,
            policy: FirePolicy::Until(Box::new(condition)),
            payload: Box::new(payload),
        }
    }

    pub fn bound_to(mut self, key: BindKey) -> Self {
        self.bind_key = Some(key);
        self
    }

    pub fn immediate(mut self) -> Self {
        self.fire_immediately = true;
        self
    }
}

/// Cancellation handle shared with the scheduled task
#[derive(Clone)]
pub struct TaskHandle {
    running: Arc<AtomicBool>,
}

impl TaskHandle {
    /// Idempotent: cancelling twice is a no-op
    pub fn cancel(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

struct Task<C> {
    remaining: u32,
    period: u32,
    running: Arc<AtomicBool>,
    bind_key: Option<BindKey>,
    once: bool,
    policy: FirePolicy<C>,
    payload: Payload<C>,
}

impl<C> Task<C> {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

pub struct TaskScheduler<C> {
    pending: Vec<Task<C>>,
    active: Vec<Task<C>>,
}

impl<C> Default for TaskScheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> TaskScheduler<C> {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            active: Vec::new(),
        }
    }

    /// Submits a task; it becomes eligible on the next tick boundary. When
    /// `fire_immediately` is set the payload additionally runs once right
    /// now, before scheduling.
    pub fn submit(&mut self, ctx: &mut C, mut spec: TaskSpec<C>) -> TaskHandle {
        if spec.fire_immediately {
            if let Err(e) = (spec.payload)(ctx) {
                warn!("immediate fire failed: {}", e);
            }
        }

        let running = Arc::new(AtomicBool::new(true));
        self.pending.push(Task {
            remaining: spec.delay,
            period: spec.period,
            running: Arc::clone(&running),
            bind_key: spec.bind_key,
            once: spec.once,
            policy: spec.policy,
            payload: spec.payload,
        });
        TaskHandle { running }
    }

    /// Cancels every task carrying the key, in both queues. Returns how many
    /// tasks were newly cancelled.
    pub fn cancel_by_key(&mut self, key: BindKey) -> usize {
        let mut cancelled = 0;
        for task in self.pending.iter().chain(self.active.iter()) {
            if task.bind_key == Some(key) && task.running.swap(false, Ordering::Relaxed) {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!("cancelled {} tasks bound to key {}", cancelled, key);
        }
        cancelled
    }

    /// Number of tasks not yet swept
    pub fn len(&self) -> usize {
        self.pending.len() + self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One scheduler pass: promote pending tasks, count down, fire the due
    /// ones. Called exactly once per world tick.
    pub fn tick(&mut self, ctx: &mut C) {
        // 1. Drain pending into active, dropping anything cancelled before
        //    its first pass.
        for task in self.pending.drain(..) {
            if task.is_running() {
                self.active.push(task);
            }
        }

        // 2. Count down and fire. swap_remove keeps the sweep O(1) per task;
        //    relative firing order within a tick is unspecified.
        let mut i = 0;
        while i < self.active.len() {
            if !self.active[i].is_running() {
                self.active.swap_remove(i);
                continue;
            }

            let task = &mut self.active[i];
            if task.remaining > 0 {
                task.remaining -= 1;
            }
            if task.remaining == 0 {
                Self::fire(task, ctx);
            }

            if task.is_running() {
                i += 1;
            } else {
                self.active.swap_remove(i);
            }
        }
    }

    fn fire(task: &mut Task<C>, ctx: &mut C) {
        match &mut task.policy {
            FirePolicy::Always => {
                Self::run_payload(&mut task.payload, ctx);
                if task.period == 0 {
                    task.stop();
                } else {
                    task.remaining = task.period;
                }
            }
            FirePolicy::When(condition) => {
                if condition(ctx) {
                    Self::run_payload(&mut task.payload, ctx);
                    if task.once {
                        task.stop();
                        return;
                    }
                }
                task.remaining = task.period.max(1);
            }
            FirePolicy::Until(condition) => {
                if condition(ctx) {
                    task.stop();
                } else {
                    Self::run_payload(&mut task.payload, ctx);
                    task.remaining = task.period.max(1);
                }
            }
        }
    }

    fn run_payload(payload: &mut Payload<C>, ctx: &mut C) {
        if let Err(e) = payload(ctx) {
            warn!("{}", e);
        }
    }
}
