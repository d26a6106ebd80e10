//! A general purpose planix runtime.
//!
//! This crate drives a `planix-exec` executive from a tokio task.
//! The executive itself stays synchronous; the runtime blocks on the
//! world adapter between steps, snapshots whatever arrived, steps the
//! executive to quiescence, and fans committed transitions out to
//! subscriber channels. Interact with the running executive through
//! the [`RtHandle`] returned by [`RtConfig::start`].
use anyhow::{anyhow, Result};
use arcstr::ArcStr;
use derive_builder::Builder;
use log::error;
use planix_exec::{
    exec::Transition,
    node::{FailureType, NodeOutcome, NodeState},
    plan::PlanNode,
    Dispatcher, ExternalEvent,
};
use std::time::Duration;
use tokio::{
    sync::{mpsc as tmpsc, oneshot},
    task,
};

mod rt;
mod sim;
#[cfg(test)]
mod test;

pub use sim::{SimHandle, SimWorld};

/// The asynchronous half of the outside world.
///
/// A `World` is a [`Dispatcher`] (the synchronous contract the
/// executive core calls during a step) plus a polling method the
/// runtime awaits between steps.
pub trait World: Dispatcher + Send + 'static {
    /// Wait for inbound events. The runtime may cancel and re-issue
    /// this call at any time, so implementations MUST be cancel
    /// safe.
    fn poll(&mut self) -> impl Future<Output = Vec<ExternalEvent>> + Send;
}

/// A point in time snapshot of one node, for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub ident: ArcStr,
    pub state: NodeState,
    pub outcome: NodeOutcome,
    pub failure: FailureType,
}

/// What the runtime publishes to subscribers after each step batch.
#[derive(Debug, Clone)]
pub enum RtEvent {
    Transition(Transition),
    /// A root node reached Finished.
    PlanFinished(ArcStr),
}

pub(crate) enum ToRt {
    AddPlan {
        plan: Box<PlanNode>,
        res: oneshot::Sender<Result<ArcStr>>,
    },
    Inject {
        events: Vec<ExternalEvent>,
    },
    Snapshot {
        ident: ArcStr,
        res: oneshot::Sender<Option<NodeSnapshot>>,
    },
}

/// A handle to a running executive.
///
/// Drop the handle to shut the runtime task down.
pub struct RtHandle(tmpsc::UnboundedSender<ToRt>);

impl Clone for RtHandle {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl RtHandle {
    async fn call<R, F: FnOnce(oneshot::Sender<R>) -> ToRt>(&self, f: F) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.0.send(f(tx)).map_err(|_| anyhow!("runtime is dead"))?;
        rx.await.map_err(|_| anyhow!("runtime did not respond"))
    }

    /// Validate and load a plan; it starts running on the next step.
    pub async fn add_plan(&self, plan: PlanNode) -> Result<ArcStr> {
        self.call(|res| ToRt::AddPlan { plan: Box::new(plan), res }).await?
    }

    /// Post inbound events as if the world had delivered them.
    pub fn inject(&self, events: Vec<ExternalEvent>) -> Result<()> {
        self.0
            .send(ToRt::Inject { events })
            .map_err(|_| anyhow!("runtime is dead"))
    }

    /// Current state of the named node, if it exists.
    pub async fn snapshot(&self, ident: impl Into<ArcStr>) -> Result<Option<NodeSnapshot>> {
        let ident = ident.into();
        self.call(|res| ToRt::Snapshot { ident, res }).await
    }
}

#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct RtConfig<W: World> {
    /// The world adapter the executive talks to.
    world: W,
    /// Wake the executive at this period even when the world is
    /// quiet, so time driven conditions fire. Default none.
    #[builder(setter(strip_option), default)]
    tick: Option<Duration>,
    /// The channel that receives step event batches.
    sub: tmpsc::Sender<Vec<RtEvent>>,
}

impl<W: World> RtConfig<W> {
    /// Create a new config.
    pub fn builder(world: W, sub: tmpsc::Sender<Vec<RtEvent>>) -> RtConfigBuilder<W> {
        RtConfigBuilder::default().world(world).sub(sub)
    }

    /// Start the runtime, returning a handle capable of interacting
    /// with it.
    pub fn start(self) -> RtHandle {
        let (tx, rx) = tmpsc::unbounded_channel();
        task::spawn(async move {
            if let Err(e) = rt::Rt::new(self).run(rx).await {
                error!("runtime loop exited with error {e:?}")
            }
        });
        RtHandle(tx)
    }
}
