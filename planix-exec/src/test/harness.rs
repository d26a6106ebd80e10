//! Test support: a recording dispatcher and plan builders.
use crate::{
    cache::State,
    exec::Exec,
    plan::{Conditions, PlanBody, PlanNode},
    value::Value,
    CommandId, CommandRequest, Dispatcher, UpdateRequest,
};
use fxhash::FxHashMap;

/// A dispatcher backed by a plain value map that records every call
/// the executive makes.
#[derive(Debug, Default)]
pub(crate) struct NullWorld {
    pub(crate) values: FxHashMap<State, Value>,
    pub(crate) subscribed: Vec<State>,
    pub(crate) unsubscribed: Vec<State>,
    pub(crate) thresholds: Vec<(State, Value, Value)>,
    pub(crate) commands: Vec<CommandRequest>,
    pub(crate) aborts: Vec<CommandId>,
    pub(crate) updates: Vec<UpdateRequest>,
    pub(crate) lookups: usize,
    pub(crate) time: f64,
}

impl Dispatcher for NullWorld {
    fn lookup_now(&mut self, state: &State) -> Value {
        self.lookups += 1;
        if *state == State::time() {
            return Value::Real(self.time);
        }
        self.values.get(state).cloned().unwrap_or(Value::Unknown)
    }

    fn subscribe(&mut self, state: &State) {
        self.subscribed.push(state.clone());
    }

    fn unsubscribe(&mut self, state: &State) {
        self.unsubscribed.push(state.clone());
    }

    fn set_thresholds(&mut self, state: &State, high: &Value, low: &Value) {
        self.thresholds.push((state.clone(), high.clone(), low.clone()));
    }

    fn enqueue_command(&mut self, cmd: CommandRequest) {
        self.commands.push(cmd);
    }

    fn abort_command(&mut self, handle: CommandId) {
        self.aborts.push(handle);
    }

    fn enqueue_update(&mut self, upd: UpdateRequest) {
        self.updates.push(upd);
    }

    fn current_time(&mut self) -> f64 {
        self.time
    }
}

pub(crate) fn init() -> Exec<NullWorld> {
    let _ = env_logger::try_init();
    Exec::new(NullWorld::default())
}

pub(crate) fn node(id: &str, body: PlanBody) -> PlanNode {
    PlanNode {
        id: id.into(),
        priority: 0,
        variables: vec![],
        interface: vec![],
        conditions: Conditions::default(),
        body,
    }
}
