//! A scripted world for tests and bench setups.
//!
//! `SimWorld` answers lookups from a value table, acknowledges
//! commands and updates according to a small per-command script, and
//! lets a test inject state updates through a [`SimHandle`] from
//! outside the runtime, the way a real adapter thread would.
use crate::World;
use arcstr::ArcStr;
use fxhash::{FxHashMap, FxHashSet};
use log::debug;
use planix_exec::{
    cache::State, value::CommandHandle, CommandId, CommandRequest, Dispatcher,
    ExternalEvent, UpdateRequest, Value,
};
use std::time::Instant;
use tokio::sync::mpsc as tmpsc;

#[derive(Debug)]
pub struct SimWorld {
    values: FxHashMap<State, Value>,
    acks: FxHashMap<ArcStr, CommandHandle>,
    returns: FxHashMap<ArcStr, Value>,
    silent: FxHashSet<ArcStr>,
    tx: tmpsc::UnboundedSender<ExternalEvent>,
    rx: tmpsc::UnboundedReceiver<ExternalEvent>,
    epoch: Instant,
}

/// Posts events into the runtime from outside, like an adapter
/// thread reporting fresh sensor data.
#[derive(Debug, Clone)]
pub struct SimHandle(tmpsc::UnboundedSender<ExternalEvent>);

impl SimHandle {
    pub fn update(&self, state: State, value: Value) {
        let _ = self.0.send(ExternalEvent::StateUpdate(state, value));
    }

    pub fn event(&self, ev: ExternalEvent) {
        let _ = self.0.send(ev);
    }
}

impl SimWorld {
    pub fn new() -> Self {
        let (tx, rx) = tmpsc::unbounded_channel();
        Self {
            values: FxHashMap::default(),
            acks: FxHashMap::default(),
            returns: FxHashMap::default(),
            silent: FxHashSet::default(),
            tx,
            rx,
            epoch: Instant::now(),
        }
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle(self.tx.clone())
    }

    /// Seed the value a lookup of `state` returns.
    pub fn set(&mut self, state: State, value: Value) {
        self.values.insert(state, value);
    }

    /// Acknowledge the named command with this handle value instead
    /// of the default `COMMAND_SUCCESS`.
    pub fn ack_with(&mut self, name: impl Into<ArcStr>, ack: CommandHandle) {
        self.acks.insert(name.into(), ack);
    }

    /// Post a return value for the named command before its ack.
    pub fn return_with(&mut self, name: impl Into<ArcStr>, v: Value) {
        self.returns.insert(name.into(), v);
    }

    /// Never acknowledge the named command; its node will park until
    /// aborted or interrupted.
    pub fn never_ack(&mut self, name: impl Into<ArcStr>) {
        self.silent.insert(name.into());
    }
}

impl Default for SimWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher for SimWorld {
    fn lookup_now(&mut self, state: &State) -> Value {
        if *state == State::time() {
            return Value::Real(self.epoch.elapsed().as_secs_f64());
        }
        self.values.get(state).cloned().unwrap_or(Value::Unknown)
    }

    fn subscribe(&mut self, state: &State) {
        debug!("sim: subscribe {state}")
    }

    fn unsubscribe(&mut self, state: &State) {
        debug!("sim: unsubscribe {state}")
    }

    fn set_thresholds(&mut self, state: &State, high: &Value, low: &Value) {
        debug!("sim: thresholds {state} in [{low}, {high}]")
    }

    fn enqueue_command(&mut self, cmd: CommandRequest) {
        debug!("sim: command {} {:?} as {}", cmd.name, cmd.args, cmd.handle);
        if self.silent.contains(&cmd.name) {
            return;
        }
        if let Some(v) = self.returns.get(&cmd.name) {
            let _ = self.tx.send(ExternalEvent::CommandReturn(cmd.handle, v.clone()));
        }
        let ack = self.acks.get(&cmd.name).copied().unwrap_or(CommandHandle::Success);
        let _ = self.tx.send(ExternalEvent::CommandAck(cmd.handle, ack));
    }

    fn abort_command(&mut self, handle: CommandId) {
        debug!("sim: abort {handle}");
        let _ = self.tx.send(ExternalEvent::CommandAbortAck(handle, true));
    }

    fn enqueue_update(&mut self, upd: UpdateRequest) {
        debug!("sim: update {} {:?}", upd.node, upd.pairs);
        let _ = self.tx.send(ExternalEvent::UpdateAck(upd.node, true));
    }

    fn current_time(&mut self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

impl World for SimWorld {
    async fn poll(&mut self) -> Vec<ExternalEvent> {
        let mut batch = Vec::new();
        self.rx.recv_many(&mut batch, 1000).await;
        batch
    }
}
