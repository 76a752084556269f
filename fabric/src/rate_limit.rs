//! Rate limiting: a shared cost budget across a group of channels.
//!
//! A [`RateLimitedScheduler`] releases queued tasks at a configured
//! throughput in cost units per second, cycling round-robin over the
//! groups that have work so concurrent groups split the budget evenly. A
//! [`RateLimitedChannelGroup`] wraps channels so that every write and every
//! receipt passes through the shared scheduler, charged by the group's two
//! cost functions.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::channel::{Channel, Disconnected, OnDisconnected, OnMessage};
use crate::scheduler::CallbackScheduler;

/// Credit an idle scheduler may accumulate, as a fraction of a second of
/// throughput. Keeps a quiet period from turning into a burst.
const BURST_WINDOW: f64 = 0.1;

/// Charges a message in cost units; both directions have one.
pub type CostFn<T> = Arc<dyn Fn(&T) -> f64 + Send + Sync>;

type Task = Box<dyn FnOnce() + Send>;

struct LimiterState {
    groups: HashMap<u64, VecDeque<(f64, Task)>>,
    rotation: VecDeque<u64>,
    available: f64,
    refilled: Instant,
    shutdown: bool,
}

struct LimiterCore {
    scheduler: Arc<CallbackScheduler>,
    throughput: f64,
    state: Mutex<LimiterState>,
    wakeup: Condvar,
}

/// Releases tasks at a fixed throughput, fairly across group ids.
pub struct RateLimitedScheduler {
    core: Arc<LimiterCore>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimitedScheduler {
    /// A limiter releasing `throughput` cost units per second, executing
    /// released tasks on `scheduler`.
    pub fn new(scheduler: Arc<CallbackScheduler>, throughput: f64) -> Arc<RateLimitedScheduler> {
        assert!(throughput > 0.0);
        let core = Arc::new(LimiterCore {
            scheduler,
            throughput,
            state: Mutex::new(LimiterState {
                groups: HashMap::new(),
                rotation: VecDeque::new(),
                available: 0.0,
                refilled: Instant::now(),
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });

        let pump_core = core.clone();
        let pump = thread::Builder::new()
            .name("rate limiter".to_owned())
            .spawn(move || pump_loop(pump_core))
            .expect("failed to spawn rate limiter thread");

        Arc::new(RateLimitedScheduler { core, pump: Mutex::new(Some(pump)) })
    }

    /// Queues `task` under `group`, to run once `cost` units of budget are
    /// released to that group.
    pub fn schedule(&self, cost: f64, group: u64, task: impl FnOnce() + Send + 'static) {
        let mut state = self.core.state.lock().expect("rate limiter poisoned");
        if state.shutdown {
            return;
        }
        let queue = state.groups.entry(group).or_default();
        let was_empty = queue.is_empty();
        queue.push_back((cost.max(0.0), Box::new(task)));
        if was_empty {
            state.rotation.push_back(group);
        }
        self.core.wakeup.notify_one();
    }

    /// Discards everything queued under `group`.
    pub fn drop_group(&self, group: u64) {
        let mut state = self.core.state.lock().expect("rate limiter poisoned");
        state.groups.remove(&group);
        state.rotation.retain(|candidate| *candidate != group);
    }

    /// The callback scheduler released tasks execute on.
    pub fn scheduler(&self) -> Arc<CallbackScheduler> {
        self.core.scheduler.clone()
    }
}

impl Drop for RateLimitedScheduler {
    fn drop(&mut self) {
        {
            let mut state = self.core.state.lock().expect("rate limiter poisoned");
            state.shutdown = true;
            self.core.wakeup.notify_one();
        }
        if let Some(pump) = self.pump.lock().ok().and_then(|mut slot| slot.take()) {
            let _ = pump.join();
        }
    }
}

fn pump_loop(core: Arc<LimiterCore>) {
    let mut state = core.state.lock().expect("rate limiter poisoned");
    loop {
        if state.shutdown {
            return;
        }

        // Refill the bucket. Idle credit is capped, but a single task
        // costing more than the cap must still eventually run.
        let head_cost = state
            .rotation
            .front()
            .and_then(|group| state.groups.get(group))
            .and_then(|queue| queue.front())
            .map(|(cost, _)| *cost);
        let now = Instant::now();
        let elapsed = now.duration_since(state.refilled).as_secs_f64();
        state.refilled = now;
        let cap = (core.throughput * BURST_WINDOW).max(head_cost.unwrap_or(0.0));
        state.available = (state.available + elapsed * core.throughput).min(cap);

        match head_cost {
            None => {
                state = core.wakeup.wait(state).expect("rate limiter poisoned");
            }
            Some(cost) if cost <= state.available => {
                state.available -= cost;
                let group = state.rotation.pop_front().expect("rotation matches head");
                let queue = state.groups.get_mut(&group).expect("rotation matches groups");
                let (_, task) = queue.pop_front().expect("rotation implies work");
                if queue.is_empty() {
                    state.groups.remove(&group);
                } else {
                    state.rotation.push_back(group);
                }
                drop(state);
                core.scheduler
                    .schedule_immediately(task, "RateLimitedScheduler::release");
                state = core.state.lock().expect("rate limiter poisoned");
            }
            Some(cost) => {
                let needed = (cost - state.available) / core.throughput;
                let (reacquired, _) = core
                    .wakeup
                    .wait_timeout(state, Duration::from_secs_f64(needed))
                    .expect("rate limiter poisoned");
                state = reacquired;
            }
        }
    }
}

struct WrappedState {
    disconnected: bool,
}

struct WrappedCore<TOut, TIn> {
    inner: Arc<dyn Channel<TOut, TIn>>,
    limiter: Arc<RateLimitedScheduler>,
    cost_out: CostFn<TOut>,
    cost_in: CostFn<TIn>,
    id: u64,
    state: Mutex<WrappedState>,
}

impl<TOut, TIn> WrappedCore<TOut, TIn> {
    /// The inner channel failed or vanished underneath the wrapper.
    fn interior_disconnected(&self) {
        let mut state = self.state.lock().expect("rate limited channel poisoned");
        if state.disconnected {
            return;
        }
        state.disconnected = true;
        drop(state);
        self.limiter.drop_group(self.id);
    }
}

/// A channel whose traffic is charged against a group's shared budget.
pub struct RateLimitedChannel<TOut, TIn> {
    core: Arc<WrappedCore<TOut, TIn>>,
}

impl<TOut, TIn> Channel<TOut, TIn> for RateLimitedChannel<TOut, TIn>
where
    TOut: Send + 'static,
    TIn: Send + 'static,
{
    fn write(&self, message: TOut) -> Result<(), Disconnected> {
        {
            let state = self.core.state.lock().expect("rate limited channel poisoned");
            if state.disconnected {
                return Err(Disconnected);
            }
        }
        let cost = (self.core.cost_out)(&message);
        let core = self.core.clone();
        self.core.limiter.schedule(cost, self.core.id, move || {
            if core.inner.write(message).is_err() {
                core.interior_disconnected();
            }
        });
        Ok(())
    }

    fn disconnect(&self) {
        {
            let mut state = self.core.state.lock().expect("rate limited channel poisoned");
            if state.disconnected {
                return;
            }
            state.disconnected = true;
        }
        self.core.limiter.drop_group(self.core.id);
        self.core.inner.disconnect();
    }

    fn set_handlers(&self, on_message: OnMessage<TIn>, on_disconnected: OnDisconnected) {
        let handler = Arc::new(Mutex::new(on_message));
        let core = self.core.clone();
        let disconnect_core = self.core.clone();
        self.core.inner.set_handlers(
            Box::new(move |message| {
                let cost = (core.cost_in)(&message);
                let handler = handler.clone();
                core.limiter.schedule(cost, core.id, move || {
                    (handler.lock().expect("message handler poisoned"))(message)
                });
            }),
            Box::new(move || {
                disconnect_core.interior_disconnected();
                on_disconnected();
            }),
        );
    }

    fn scheduler(&self) -> Arc<CallbackScheduler> {
        self.core.limiter.scheduler()
    }

    fn channel_type(&self) -> String {
        format!("RateLimitedChannel<{}>", self.core.inner.channel_type())
    }
}

/// Hands out throttled views of channels sharing one budget.
pub struct RateLimitedChannelGroup<TOut, TIn> {
    limiter: Arc<RateLimitedScheduler>,
    cost_out: CostFn<TOut>,
    cost_in: CostFn<TIn>,
    next_id: Mutex<u64>,
}

impl<TOut, TIn> RateLimitedChannelGroup<TOut, TIn>
where
    TOut: Send + 'static,
    TIn: Send + 'static,
{
    /// A group releasing `throughput` cost units per second, charging
    /// writes by `cost_out` and receipts by `cost_in`.
    pub fn new(
        scheduler: Arc<CallbackScheduler>,
        cost_out: CostFn<TOut>,
        cost_in: CostFn<TIn>,
        throughput: f64,
    ) -> RateLimitedChannelGroup<TOut, TIn> {
        RateLimitedChannelGroup {
            limiter: RateLimitedScheduler::new(scheduler, throughput),
            cost_out,
            cost_in,
            next_id: Mutex::new(0),
        }
    }

    /// Returns a throttled channel drawing on this group's budget.
    pub fn wrap(&self, inner: Arc<dyn Channel<TOut, TIn>>) -> Arc<RateLimitedChannel<TOut, TIn>> {
        let id = {
            let mut next_id = self.next_id.lock().expect("channel group poisoned");
            *next_id += 1;
            *next_id
        };
        Arc::new(RateLimitedChannel {
            core: Arc::new(WrappedCore {
                inner,
                limiter: self.limiter.clone(),
                cost_out: self.cost_out.clone(),
                cost_in: self.cost_in.clone(),
                id,
                state: Mutex::new(WrappedState { disconnected: false }),
            }),
        })
    }
}
