//! Conflated channels and their ports.
//!
//! A channel is a single slot. A send lands in the slot when the kernel
//! processes the `Send` event, overwriting any value nobody has taken yet.
//! References ([`SendRef`], [`ReceiveRef`]) are plain copyable handles that
//! can be passed around freely; ports are minted from them through the
//! kernel, which checks that the reference belongs to it.

use super::process::ProcessId;
use crate::error::SimError;
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;

/// Identity of a channel: the kernel instance that owns it and its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId {
    pub(crate) kernel: u64,
    pub(crate) index: usize,
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k{}/ch{}", self.kernel, self.index)
    }
}

/// Kernel-side state of one channel.
#[derive(Default)]
pub(crate) struct ChannelSlot {
    /// The undelivered value, if any.
    pub(crate) pending: Option<Box<dyn Any>>,
    /// Process suspended in `receive` on this channel.
    pub(crate) waiter: Option<ProcessId>,
}

macro_rules! typed_ref {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        pub struct $name<T> {
            pub(crate) id: ChannelId,
            _marker: PhantomData<fn(T) -> T>,
        }

        impl<T> $name<T> {
            pub(crate) fn new(id: ChannelId) -> Self {
                Self {
                    id,
                    _marker: PhantomData,
                }
            }

            pub fn channel(&self) -> ChannelId {
                self.id
            }
        }

        impl<T> Clone for $name<T> {
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<T> Copy for $name<T> {}

        impl<T> fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.id)
            }
        }
    };
}

typed_ref!(SendRef, "Handle from which send ports are minted.");
typed_ref!(ReceiveRef, "Handle from which receive ports are minted.");

/// A freshly opened channel: both of its references.
#[derive(Debug)]
pub struct Channel<T> {
    pub send: SendRef<T>,
    pub receive: ReceiveRef<T>,
}

/// Sending end bound to a process (or to the driver, outside any process).
#[derive(Debug)]
pub struct SendPort<T> {
    id: ChannelId,
    owner: Option<ProcessId>,
    closed: bool,
    _marker: PhantomData<fn(T)>,
}

/// Receiving end bound to a process.
#[derive(Debug)]
pub struct ReceivePort<T> {
    id: ChannelId,
    owner: Option<ProcessId>,
    closed: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SendPort<T> {
    pub(crate) fn new(id: ChannelId, owner: Option<ProcessId>) -> Self {
        Self {
            id,
            owner,
            closed: false,
            _marker: PhantomData,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.id
    }

    pub fn owner(&self) -> Option<ProcessId> {
        self.owner
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the port. Returns `true` only for the call that closed it.
    pub fn close(&mut self) -> bool {
        !std::mem::replace(&mut self.closed, true)
    }
}

impl<T: 'static> ReceivePort<T> {
    pub(crate) fn new(id: ChannelId, owner: Option<ProcessId>) -> Self {
        Self {
            id,
            owner,
            closed: false,
            _marker: PhantomData,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.id
    }

    pub fn owner(&self) -> Option<ProcessId> {
        self.owner
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the port. Returns `true` only for the call that closed it.
    pub fn close(&mut self) -> bool {
        !std::mem::replace(&mut self.closed, true)
    }

    /// Whether `message` arrived on this port's channel.
    pub fn owns(&self, message: &Message) -> bool {
        message.channel == self.id
    }

    /// Unwrap a message delivered to this port.
    pub fn accept(&self, message: Message) -> Result<T, SimError> {
        if message.channel != self.id {
            return Err(SimError::MessageMismatch);
        }
        message
            .payload
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|_| SimError::MessageMismatch)
    }
}

/// A value handed to a process that was suspended in `receive`.
pub struct Message {
    pub(crate) channel: ChannelId,
    pub(crate) payload: Box<dyn Any>,
}

impl Message {
    pub fn channel(&self) -> ChannelId {
        self.channel
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}
