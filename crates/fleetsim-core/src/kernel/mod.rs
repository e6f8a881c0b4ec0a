//! Discrete-event execution kernel.
//!
//! The [`Kernel`] owns the event queue, the virtual clock, every logical
//! process and every channel. It also owns a caller-supplied *world* value
//! `W` (the simulated datacenter, a test recorder, ...) which behaviors reach
//! through their [`Context`]. Nothing else mutates kernel state: the run loop
//! is strictly sequential and time-ordered.
//!
//! # Failures
//!
//! An error returned by a behavior fails only that process: it is logged,
//! its name is released and its supervisor (if any) gets a [`ProcessExit`].
//! Errors that [`SimError::is_kernel_fatal`] classifies as fatal stop the run
//! instead and mark the kernel terminated.

mod channel;
mod event;
mod process;

pub use channel::{Channel, ChannelId, Message, ReceivePort, ReceiveRef, SendPort, SendRef};
pub use event::Action;
pub use process::{
    from_fn, Behavior, Context, ExitOutcome, FnBehavior, ProcessExit, ProcessId, ProcessRef,
    ProcessState, Step, TimeoutHandle, Wakeup,
};

use crate::clock::SimClock;
use crate::error::SimError;
use channel::ChannelSlot;
use event::{Continuation, Event, EventQueue};
use process::ProcessSlot;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

static NEXT_KERNEL: AtomicU64 = AtomicU64::new(1);

/// Counters describing one kernel's run so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelStats {
    pub events_processed: u64,
    pub timeouts_cancelled: u64,
    pub processes_spawned: u64,
    pub processes_failed: u64,
    pub messages_sent: u64,
    pub messages_delivered: u64,
    /// Values overwritten in a slot before anyone took them.
    pub messages_conflated: u64,
}

/// The simulation kernel.
pub struct Kernel<W> {
    instance: u64,
    clock: SimClock,
    queue: EventQueue<W>,
    processes: Vec<ProcessSlot<W>>,
    names: HashMap<String, ProcessId>,
    channels: Vec<ChannelSlot>,
    terminated: bool,
    world: W,
    stats: KernelStats,
}

impl<W: 'static> Kernel<W> {
    pub fn new(world: W) -> Self {
        Self {
            instance: NEXT_KERNEL.fetch_add(1, Ordering::Relaxed),
            clock: SimClock::new(),
            queue: EventQueue::new(),
            processes: Vec::new(),
            names: HashMap::new(),
            channels: Vec::new(),
            terminated: false,
            world,
            stats: KernelStats::default(),
        }
    }

    /// Current virtual time in milliseconds.
    pub fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    pub fn world(&self) -> &W {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut W {
        &mut self.world
    }

    pub fn into_world(self) -> W {
        self.world
    }

    pub fn stats(&self) -> &KernelStats {
        &self.stats
    }

    /// Events still queued, cancelled timeouts included.
    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Look up a live process by name.
    pub fn lookup(&self, name: &str) -> Option<ProcessId> {
        self.names.get(name).copied()
    }

    pub fn process_state(&self, pid: ProcessId) -> Option<ProcessState> {
        self.processes.get(pid.0).map(|p| p.state)
    }

    // ---- processes ----

    /// Create a process and schedule its first resumption at the current
    /// time. Fails if a live process already holds `name`.
    pub fn spawn<B>(&mut self, behavior: B, name: &str) -> Result<ProcessRef, SimError>
    where
        B: Behavior<W> + 'static,
    {
        self.spawn_inner(Box::new(behavior), name, None)
    }

    /// [`spawn`](Self::spawn) for closures, with the context type inferred
    /// from this kernel.
    pub fn spawn_fn<F>(&mut self, name: &str, f: F) -> Result<ProcessRef, SimError>
    where
        F: FnMut(&mut Context<'_, W>, Wakeup) -> Result<Step, SimError> + 'static,
    {
        self.spawn_inner(Box::new(from_fn(f)), name, None)
    }

    /// Spawn a process whose exit is reported on `supervisor`.
    pub fn spawn_supervised<B>(
        &mut self,
        behavior: B,
        name: &str,
        supervisor: SendRef<ProcessExit>,
    ) -> Result<ProcessRef, SimError>
    where
        B: Behavior<W> + 'static,
    {
        self.check_ref(supervisor.id)?;
        self.spawn_inner(Box::new(behavior), name, Some(supervisor.id))
    }

    fn spawn_inner(
        &mut self,
        behavior: Box<dyn Behavior<W>>,
        name: &str,
        supervisor: Option<ChannelId>,
    ) -> Result<ProcessRef, SimError> {
        if self.names.contains_key(name) {
            return Err(SimError::DuplicateName(name.to_string()));
        }
        let pid = ProcessId(self.processes.len());
        self.processes.push(ProcessSlot {
            name: name.to_string(),
            state: ProcessState::Ready,
            behavior: Some(behavior),
            waiting_on: None,
            supervisor,
        });
        self.names.insert(name.to_string(), pid);
        self.stats.processes_spawned += 1;
        self.queue.push(
            self.clock.now_ms(),
            Event::Resume {
                pid,
                continuation: Continuation::Start,
            },
        );
        debug!(process = name, pid = pid.0, t = self.now(), "spawned");
        Ok(ProcessRef {
            id: pid,
            name: name.to_string(),
        })
    }

    // ---- channels ----

    /// Register a new channel.
    pub fn open<T: 'static>(&mut self) -> Channel<T> {
        let id = ChannelId {
            kernel: self.instance,
            index: self.channels.len(),
        };
        self.channels.push(ChannelSlot::default());
        Channel {
            send: SendRef::new(id),
            receive: ReceiveRef::new(id),
        }
    }

    /// Mint a send port not bound to any process, for driver code.
    pub fn connect<T: 'static>(&mut self, send: SendRef<T>) -> Result<SendPort<T>, SimError> {
        self.check_ref(send.id)?;
        Ok(SendPort::new(send.id, None))
    }

    /// Mint a receive port not bound to any process. Values can be taken
    /// from it with [`Kernel::try_receive`].
    pub fn listen<T: 'static>(
        &mut self,
        receive: ReceiveRef<T>,
    ) -> Result<ReceivePort<T>, SimError> {
        self.check_ref(receive.id)?;
        Ok(ReceivePort::new(receive.id, None))
    }

    /// Enqueue a `Send` event at the current time. Never blocks.
    pub fn send<T: 'static>(&mut self, port: &SendPort<T>, value: T) -> Result<(), SimError> {
        if port.is_closed() {
            return Err(SimError::PortClosed);
        }
        self.check_ref(port.channel())?;
        self.stats.messages_sent += 1;
        self.queue.push(
            self.clock.now_ms(),
            Event::Send {
                channel: port.channel(),
                payload: Box::new(value),
            },
        );
        Ok(())
    }

    /// Take the slot's value without suspending.
    pub fn try_receive<T: 'static>(&mut self, port: &ReceivePort<T>) -> Result<Option<T>, SimError> {
        if port.is_closed() {
            return Err(SimError::PortClosed);
        }
        let Some(payload) = self.channel_mut(port.channel())?.pending.take() else {
            return Ok(None);
        };
        self.stats.messages_delivered += 1;
        payload
            .downcast::<T>()
            .map(|value| Some(*value))
            .map_err(|_| SimError::MessageMismatch)
    }

    fn check_ref(&self, id: ChannelId) -> Result<(), SimError> {
        if id.kernel != self.instance || id.index >= self.channels.len() {
            return Err(SimError::InvalidReference);
        }
        Ok(())
    }

    fn channel_mut(&mut self, id: ChannelId) -> Result<&mut ChannelSlot, SimError> {
        if id.kernel != self.instance {
            return Err(SimError::InvalidReference);
        }
        self.channels
            .get_mut(id.index)
            .ok_or(SimError::InvalidReference)
    }

    // ---- scheduling ----

    /// Run `action` after `delay_ms`.
    pub fn schedule<F>(&mut self, delay_ms: u64, action: F)
    where
        F: FnOnce(&mut Kernel<W>) -> Result<(), SimError> + 'static,
    {
        let at = self.clock.after(delay_ms);
        self.queue.push(at, Event::Dispatch(Box::new(action)));
    }

    /// Run `action` at absolute time `time_ms`, which must not be in the past.
    pub fn schedule_at<F>(&mut self, time_ms: u64, action: F) -> Result<(), SimError>
    where
        F: FnOnce(&mut Kernel<W>) -> Result<(), SimError> + 'static,
    {
        let now = self.clock.now_ms();
        if time_ms < now {
            return Err(SimError::NonCausal {
                requested_ms: time_ms,
                now_ms: now,
            });
        }
        self.queue.push(time_ms, Event::Dispatch(Box::new(action)));
        Ok(())
    }

    // ---- run loop ----

    /// Process events until the queue is empty or the kernel is terminated.
    pub fn run(&mut self) -> Result<(), SimError> {
        if self.terminated {
            return Err(SimError::Terminated);
        }
        while !self.terminated && self.step()? {}
        Ok(())
    }

    /// Process every event with time `<= deadline_ms`, then move the clock
    /// to the deadline.
    pub fn run_until(&mut self, deadline_ms: u64) -> Result<(), SimError> {
        if self.terminated {
            return Err(SimError::Terminated);
        }
        while !self.terminated {
            match self.queue.peek_time() {
                Some(t) if t <= deadline_ms => {
                    self.step()?;
                }
                _ => break,
            }
        }
        if !self.terminated && deadline_ms > self.clock.now_ms() {
            self.clock.advance_to_ms(deadline_ms);
        }
        Ok(())
    }

    /// Process a single event. Returns `false` when the queue is empty.
    pub fn step(&mut self) -> Result<bool, SimError> {
        if self.terminated {
            return Err(SimError::Terminated);
        }
        let Some((time_ms, event)) = self.queue.pop() else {
            return Ok(false);
        };
        let now = self.clock.now_ms();
        if time_ms < now {
            self.terminated = true;
            return Err(SimError::ClockRegression {
                event_ms: time_ms,
                now_ms: now,
            });
        }
        self.clock.advance_to_ms(time_ms);
        self.stats.events_processed += 1;
        if let Err(err) = self.execute(event) {
            if err.is_kernel_fatal() {
                self.terminated = true;
            }
            return Err(err);
        }
        Ok(true)
    }

    /// Mark the kernel terminated. A second call is an error.
    pub fn terminate(&mut self) -> Result<(), SimError> {
        if self.terminated {
            return Err(SimError::AlreadyTerminated);
        }
        self.terminated = true;
        Ok(())
    }

    fn execute(&mut self, event: Event<W>) -> Result<(), SimError> {
        match event {
            Event::Dispatch(action) => match action(self) {
                Ok(()) => Ok(()),
                Err(err) if err.is_kernel_fatal() => Err(err),
                Err(err) => {
                    warn!(t = self.now(), error = %err, "scheduled action failed");
                    Ok(())
                }
            },
            Event::Resume { pid, continuation } => match continuation {
                Continuation::Start => self.resume(pid, Wakeup::Start),
                Continuation::Delay => self.resume(pid, Wakeup::Delay),
                Continuation::Ready(channel) => self.deliver(pid, channel),
            },
            Event::Timeout {
                pid,
                tag,
                cancelled,
            } => {
                if cancelled.get() {
                    self.stats.timeouts_cancelled += 1;
                    trace!(pid = pid.0, tag, "discarding cancelled timeout");
                    return Ok(());
                }
                self.resume(pid, Wakeup::Timeout(tag))
            }
            Event::Send { channel, payload } => {
                let slot = self
                    .channels
                    .get_mut(channel.index)
                    .ok_or_else(|| SimError::Internal(format!("send to unknown channel {}", channel)))?;
                if slot.pending.replace(payload).is_some() {
                    self.stats.messages_conflated += 1;
                }
                if let Some(pid) = slot.waiter.take() {
                    let now = self.clock.now_ms();
                    self.queue.push(
                        now,
                        Event::Resume {
                            pid,
                            continuation: Continuation::Ready(channel),
                        },
                    );
                }
                Ok(())
            }
        }
    }

    /// Hand the slot's current value to a process still waiting on it.
    fn deliver(&mut self, pid: ProcessId, channel: ChannelId) -> Result<(), SimError> {
        let waiting = self
            .processes
            .get(pid.0)
            .map(|p| p.state == ProcessState::Suspended && p.waiting_on == Some(channel))
            .unwrap_or(false);
        if !waiting {
            // Woken by something else in the meantime; the value stays put.
            return Ok(());
        }
        let slot = self
            .channels
            .get_mut(channel.index)
            .ok_or_else(|| SimError::Internal(format!("deliver on unknown channel {}", channel)))?;
        match slot.pending.take() {
            Some(payload) => {
                self.stats.messages_delivered += 1;
                self.resume(pid, Wakeup::Message(Message { channel, payload }))
            }
            None => {
                slot.waiter = Some(pid);
                Ok(())
            }
        }
    }

    fn resume(&mut self, pid: ProcessId, wakeup: Wakeup) -> Result<(), SimError> {
        let slot = self
            .processes
            .get_mut(pid.0)
            .ok_or(SimError::UnknownProcess(pid.0))?;
        if !slot.state.is_alive() {
            trace!(pid = pid.0, "wakeup for finished process ignored");
            return Ok(());
        }
        if let Some(channel) = slot.waiting_on.take() {
            if let Some(ch) = self.channels.get_mut(channel.index) {
                if ch.waiter == Some(pid) {
                    ch.waiter = None;
                }
            }
        }
        let mut behavior = slot
            .behavior
            .take()
            .ok_or_else(|| SimError::Internal(format!("process {} resumed while running", pid)))?;
        slot.state = ProcessState::Running;

        let result = {
            let mut ctx = Context { kernel: self, pid };
            behavior.resume(&mut ctx, wakeup)
        };

        match result {
            Ok(Step::Suspend) => {
                if let Some(slot) = self.processes.get_mut(pid.0) {
                    slot.behavior = Some(behavior);
                    slot.state = ProcessState::Suspended;
                }
                Ok(())
            }
            Ok(Step::Exit) => {
                self.finish(pid, ExitOutcome::Completed);
                Ok(())
            }
            Err(err) if err.is_kernel_fatal() => Err(err),
            Err(err) => {
                let name = self.processes.get(pid.0).map(|p| p.name.clone());
                warn!(
                    process = name.as_deref().unwrap_or("?"),
                    t = self.now(),
                    error = %err,
                    "logical process failed"
                );
                self.stats.processes_failed += 1;
                self.finish(pid, ExitOutcome::Failed(err.to_string()));
                Ok(())
            }
        }
    }

    fn finish(&mut self, pid: ProcessId, outcome: ExitOutcome) {
        let Some(slot) = self.processes.get_mut(pid.0) else {
            return;
        };
        slot.state = match outcome {
            ExitOutcome::Completed => ProcessState::Exited,
            ExitOutcome::Failed(_) => ProcessState::Failed,
        };
        slot.behavior = None;
        if let Some(channel) = slot.waiting_on.take() {
            if let Some(ch) = self.channels.get_mut(channel.index) {
                ch.waiter = None;
            }
        }
        let name = slot.name.clone();
        let supervisor = slot.supervisor;
        if self.names.get(&name) == Some(&pid) {
            self.names.remove(&name);
        }
        if let Some(channel) = supervisor {
            let exit = ProcessExit {
                process: ProcessRef { id: pid, name },
                outcome,
            };
            self.stats.messages_sent += 1;
            self.queue.push(
                self.clock.now_ms(),
                Event::Send {
                    channel,
                    payload: Box::new(exit),
                },
            );
        }
    }
}
