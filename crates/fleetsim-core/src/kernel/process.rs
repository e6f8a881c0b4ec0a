//! Logical processes.
//!
//! A process is an explicit state machine: the kernel calls
//! [`Behavior::resume`] with the reason it woke up, the behavior does its
//! work through the [`Context`] and answers with a [`Step`]. Suspending is
//! just returning `Step::Suspend` after arranging a wakeup (a delay, a
//! timeout, or a `receive` that found the slot empty).

use super::channel::{Channel, ChannelId, Message, ReceivePort, ReceiveRef, SendPort, SendRef};
use super::event::{Continuation, Event};
use super::Kernel;
use crate::error::SimError;
use serde::Serialize;
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

/// Kernel-local process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProcessId(pub(crate) usize);

impl ProcessId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Returned by `spawn`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRef {
    pub id: ProcessId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessState {
    /// Spawned, first resume not yet delivered.
    Ready,
    Running,
    Suspended,
    Exited,
    Failed,
}

impl ProcessState {
    pub fn is_alive(&self) -> bool {
        matches!(
            self,
            ProcessState::Ready | ProcessState::Running | ProcessState::Suspended
        )
    }
}

/// What a behavior wants after one resumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Suspend,
    Exit,
}

/// Why a process was resumed.
#[derive(Debug)]
pub enum Wakeup {
    Start,
    Delay,
    Timeout(u64),
    Message(Message),
}

/// Simulated behavior of a logical process.
pub trait Behavior<W> {
    fn resume(&mut self, ctx: &mut Context<'_, W>, wakeup: Wakeup) -> Result<Step, SimError>;
}

/// Behavior backed by a closure. See [`from_fn`].
pub struct FnBehavior<F>(F);

/// Wrap a closure as a [`Behavior`].
pub fn from_fn<W, F>(f: F) -> FnBehavior<F>
where
    F: FnMut(&mut Context<'_, W>, Wakeup) -> Result<Step, SimError>,
{
    FnBehavior(f)
}

impl<W, F> Behavior<W> for FnBehavior<F>
where
    F: FnMut(&mut Context<'_, W>, Wakeup) -> Result<Step, SimError>,
{
    fn resume(&mut self, ctx: &mut Context<'_, W>, wakeup: Wakeup) -> Result<Step, SimError> {
        (self.0)(ctx, wakeup)
    }
}

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Completed,
    Failed(String),
}

/// Sent to a supervisor when a supervised process ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub process: ProcessRef,
    pub outcome: ExitOutcome,
}

/// Cancels a pending timeout. Cancellation only flags the event; the dead
/// entry stays in the queue and is discarded when popped.
#[derive(Debug, Clone)]
pub struct TimeoutHandle {
    cancelled: Rc<Cell<bool>>,
}

impl TimeoutHandle {
    /// Returns `true` if this call did the cancelling.
    pub fn cancel(&self) -> bool {
        !self.cancelled.replace(true)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

pub(crate) struct ProcessSlot<W> {
    pub(crate) name: String,
    pub(crate) state: ProcessState,
    /// Taken out while the behavior runs.
    pub(crate) behavior: Option<Box<dyn Behavior<W>>>,
    pub(crate) waiting_on: Option<ChannelId>,
    pub(crate) supervisor: Option<ChannelId>,
}

/// Handle a behavior uses to act on the simulation while it runs.
pub struct Context<'a, W> {
    pub(crate) kernel: &'a mut Kernel<W>,
    pub(crate) pid: ProcessId,
}

impl<'a, W: 'static> Context<'a, W> {
    pub fn now(&self) -> u64 {
        self.kernel.now()
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn name(&self) -> &str {
        self.kernel
            .processes
            .get(self.pid.0)
            .map(|p| p.name.as_str())
            .unwrap_or_default()
    }

    pub fn world(&self) -> &W {
        &self.kernel.world
    }

    pub fn world_mut(&mut self) -> &mut W {
        &mut self.kernel.world
    }

    /// Direct access to the kernel, e.g. for flow or host calls that need
    /// both the clock and the world.
    pub fn kernel(&mut self) -> &mut Kernel<W> {
        &mut *self.kernel
    }

    /// Resume this process with [`Wakeup::Delay`] after `delay_ms`.
    pub fn delay(&mut self, delay_ms: u64) {
        let at = self.kernel.clock.after(delay_ms);
        self.kernel.queue.push(
            at,
            Event::Resume {
                pid: self.pid,
                continuation: Continuation::Delay,
            },
        );
    }

    /// Resume this process with [`Wakeup::Timeout`]`(tag)` after `delay_ms`
    /// unless the returned handle is cancelled first.
    pub fn timeout(&mut self, delay_ms: u64, tag: u64) -> TimeoutHandle {
        let cancelled = Rc::new(Cell::new(false));
        let at = self.kernel.clock.after(delay_ms);
        self.kernel.queue.push(
            at,
            Event::Timeout {
                pid: self.pid,
                tag,
                cancelled: Rc::clone(&cancelled),
            },
        );
        TimeoutHandle { cancelled }
    }

    pub fn open<T: 'static>(&mut self) -> Channel<T> {
        self.kernel.open()
    }

    pub fn connect<T: 'static>(&mut self, send: SendRef<T>) -> Result<SendPort<T>, SimError> {
        self.kernel.check_ref(send.id)?;
        Ok(SendPort::new(send.id, Some(self.pid)))
    }

    pub fn listen<T: 'static>(
        &mut self,
        receive: ReceiveRef<T>,
    ) -> Result<ReceivePort<T>, SimError> {
        self.kernel.check_ref(receive.id)?;
        Ok(ReceivePort::new(receive.id, Some(self.pid)))
    }

    /// Enqueue `value` on the port's channel at the current time.
    pub fn send<T: 'static>(&mut self, port: &SendPort<T>, value: T) -> Result<(), SimError> {
        self.kernel.send(port, value)
    }

    /// Take the pending value, or register as the channel's waiter and
    /// return `None`. In the latter case the behavior should suspend; it is
    /// resumed with [`Wakeup::Message`] once a value arrives.
    pub fn receive<T: 'static>(&mut self, port: &ReceivePort<T>) -> Result<Option<T>, SimError> {
        if port.is_closed() {
            return Err(SimError::PortClosed);
        }
        let id = port.channel();
        let pending = self.kernel.channel_mut(id)?.pending.take();
        match pending {
            Some(payload) => {
                self.kernel.stats.messages_delivered += 1;
                payload
                    .downcast::<T>()
                    .map(|value| Some(*value))
                    .map_err(|_| SimError::MessageMismatch)
            }
            None => {
                self.kernel.channel_mut(id)?.waiter = Some(self.pid);
                if let Some(slot) = self.kernel.processes.get_mut(self.pid.0) {
                    slot.waiting_on = Some(id);
                }
                Ok(None)
            }
        }
    }

    pub fn spawn<B>(&mut self, behavior: B, name: &str) -> Result<ProcessRef, SimError>
    where
        B: Behavior<W> + 'static,
    {
        self.kernel.spawn(behavior, name)
    }

    /// Run `action` against the kernel after `delay_ms`.
    pub fn schedule<F>(&mut self, delay_ms: u64, action: F)
    where
        F: FnOnce(&mut Kernel<W>) -> Result<(), SimError> + 'static,
    {
        let at = self.kernel.clock.after(delay_ms);
        self.kernel.queue.push(at, Event::Dispatch(Box::new(action)));
    }

    /// Stop the run once the current event completes.
    pub fn terminate_kernel(&mut self) {
        self.kernel.terminated = true;
    }
}
