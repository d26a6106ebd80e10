//! The planix executive core.
//!
//! A plan is a tree of nodes, each a small state machine whose
//! transitions are gated by boolean expressions. Conditions,
//! variables and lookups form a demand driven notification graph;
//! external state flows in through a cache keyed by (name, params)
//! pairs; the executive runs every external event to quiescence.
//!
//! The core is synchronous and single threaded. The only structure
//! intended to be touched from other threads is [`EventQueue`], which
//! adapters use to post [`ExternalEvent`] records. See `planix-rt`
//! for a tokio runtime that drives an executive from such a queue.
#[macro_use]
extern crate serde_derive;

pub mod cache;
pub mod exec;
pub mod expr;
pub mod node;
pub mod plan;
#[cfg(test)]
mod test;
pub mod value;

use arcstr::ArcStr;
use parking_lot::{Condvar, Mutex};
use std::{collections::VecDeque, fmt, time::Duration};
use triomphe::Arc;

pub use cache::{State, StateCache};
pub use exec::{Exec, Transition};
pub use expr::ExprId;
pub use node::NodeId;
pub use value::{CommandHandle, Value, ValueType};

macro_rules! slot_id {
    ($name:ident, $tag:literal) => {
        /// An index into the owning arena. Ids are never reused
        /// within one executive; they are meaningless across
        /// executives.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub fn inner(&self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "{}"), self.0)
            }
        }
    };
}

pub(crate) use slot_id;

/// Identifies one issued command instance. Allocated by the
/// executive when the command is enqueued; every ack, return value,
/// and abort ack for the command carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd{}", self.0)
    }
}

/// A command handed to the outside world. The interface is expected
/// to eventually post a [`ExternalEvent::CommandAck`] for the handle,
/// and may post a [`ExternalEvent::CommandReturn`] before the
/// terminal ack.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub handle: CommandId,
    pub name: ArcStr,
    pub args: Vec<Value>,
    /// Variable that will receive the return value, if the plan
    /// declared one.
    pub return_var: Option<ExprId>,
    /// Variable that mirrors the command handle acks.
    pub ack_var: ExprId,
}

/// An update handed to the outside world, acknowledged by node id.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub node: ArcStr,
    pub pairs: Vec<(ArcStr, Value)>,
}

/// What the executive consumes from the outside world.
///
/// This is the seam between the core and everything else: adapters,
/// transports and simulators implement it; the state cache and the
/// step loop call it. All methods are synchronous; anything that
/// takes real time must be started here and completed later by
/// posting an [`ExternalEvent`].
pub trait Dispatcher: fmt::Debug + 'static {
    /// Return the current value of the state, or Unknown.
    fn lookup_now(&mut self, state: &State) -> Value;

    /// The executive is now interested in changes to this state.
    /// Until `unsubscribe`, new values should be posted as
    /// [`ExternalEvent::StateUpdate`] records.
    fn subscribe(&mut self, state: &State);

    /// Interest in the state has ended and related resources can be
    /// released.
    fn unsubscribe(&mut self, state: &State);

    /// Advise the interface that only reports outside [low, high]
    /// are of interest. Purely an optimization hint; the cache
    /// filters regardless of whether the interface honors it.
    fn set_thresholds(&mut self, state: &State, high: &Value, low: &Value);

    /// Begin executing a command.
    fn enqueue_command(&mut self, cmd: CommandRequest);

    /// Request that a previously enqueued command be aborted. The
    /// interface shall post a [`ExternalEvent::CommandAbortAck`]
    /// when the abort has taken effect.
    fn abort_command(&mut self, handle: CommandId);

    /// Report planner state to the outside world. The interface
    /// shall post an [`ExternalEvent::UpdateAck`] for the node.
    fn enqueue_update(&mut self, upd: UpdateRequest);

    /// Monotonic wall clock in seconds.
    fn current_time(&mut self) -> f64;
}

/// Inbound records posted by the outside world. Everything that
/// happened since the last step is drained from the [`EventQueue`]
/// and applied before the next quiescence cycle begins.
#[derive(Debug, Clone)]
pub enum ExternalEvent {
    StateUpdate(State, Value),
    CommandReturn(CommandId, Value),
    CommandAck(CommandId, CommandHandle),
    CommandAbortAck(CommandId, bool),
    UpdateAck(ArcStr, bool),
}

#[derive(Debug, Default)]
struct QueueInner {
    events: Mutex<VecDeque<ExternalEvent>>,
    ready: Condvar,
}

/// The thread safe inbound queue between adapters and the exec
/// thread. Publishing threads block at most briefly on the mutex;
/// the exec thread blocks on [`EventQueue::wait`] between steps.
#[derive(Debug, Clone, Default)]
pub struct EventQueue(Arc<QueueInner>);

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, ev: ExternalEvent) {
        let mut q = self.0.events.lock();
        q.push_back(ev);
        self.0.ready.notify_one();
    }

    pub fn push_many(&self, evs: impl IntoIterator<Item = ExternalEvent>) {
        let mut q = self.0.events.lock();
        q.extend(evs);
        self.0.ready.notify_one();
    }

    /// Move every queued record into `into`, preserving delivery
    /// order. Returns the number of records drained.
    pub fn drain_into(&self, into: &mut Vec<ExternalEvent>) -> usize {
        let mut q = self.0.events.lock();
        let n = q.len();
        into.extend(q.drain(..));
        n
    }

    pub fn is_empty(&self) -> bool {
        self.0.events.lock().is_empty()
    }

    /// Block until a record arrives or the timeout elapses. Returns
    /// true if the queue is non empty on return.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut q = self.0.events.lock();
        if q.is_empty() {
            self.0.ready.wait_for(&mut q, timeout);
        }
        !q.is_empty()
    }
}

#[cfg(test)]
mod queue_test {
    use super::*;
    use crate::cache::State;

    #[test]
    fn queue_preserves_order() {
        let q = EventQueue::new();
        q.push(ExternalEvent::StateUpdate(State::simple("a"), Value::Int(1)));
        q.push(ExternalEvent::StateUpdate(State::simple("b"), Value::Int(2)));
        let mut out = Vec::new();
        assert_eq!(q.drain_into(&mut out), 2);
        match (&out[0], &out[1]) {
            (
                ExternalEvent::StateUpdate(a, _),
                ExternalEvent::StateUpdate(b, _),
            ) => {
                assert_eq!(&*a.name, "a");
                assert_eq!(&*b.name, "b");
            }
            _ => panic!("wrong records"),
        }
        assert!(q.is_empty());
    }

    #[test]
    fn wait_times_out_empty() {
        let q = EventQueue::new();
        assert!(!q.wait(Duration::from_millis(5)));
        q.push(ExternalEvent::UpdateAck("n".into(), true));
        assert!(q.wait(Duration::from_millis(5)));
    }
}
