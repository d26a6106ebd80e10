//! The cache for state in the external world.
//!
//! Every lookup expression reads through here. The cache memoizes
//! pull lookups per quiescence cycle, filters push updates against
//! per subscriber tolerances, and advises the outside interface of
//! the envelope outside which reports are interesting.
use crate::{value::Value, Dispatcher, ExprId};
use arcstr::{literal, ArcStr};
use fxhash::{FxBuildHasher, FxHashMap};
use indexmap::IndexMap;
use log::{debug, warn};
use std::{
    fmt,
    hash::{Hash, Hasher},
};
use triomphe::Arc;

/// Names one external world quantity: a state name plus an ordered
/// parameter list. Two states are the same quantity iff both match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    pub name: ArcStr,
    pub params: Arc<[Value]>,
}

impl State {
    pub fn new(name: ArcStr, params: impl IntoIterator<Item = Value>) -> Self {
        Self { name, params: Arc::from_iter(params) }
    }

    pub fn simple(name: impl Into<ArcStr>) -> Self {
        Self { name: name.into(), params: Arc::from_iter([]) }
    }

    /// The distinguished state denoting the executive's clock.
    pub fn time() -> Self {
        Self::simple(literal!("time"))
    }
}

impl Hash for State {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        for p in self.params.iter() {
            p.hash(state)
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?
            }
            write!(f, "{p}")?
        }
        write!(f, ")")
    }
}

/// How a lookup reads its state: pull once per quiescence, or push
/// on every tolerance crossing change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupKind {
    Now,
    OnChange,
}

#[derive(Debug)]
struct Sub {
    expr: ExprId,
    kind: LookupKind,
    tolerance: Value,
    /// Last value delivered to this subscriber; the tolerance is
    /// measured against it, not against the cache's own last value.
    last: Value,
}

#[derive(Debug)]
struct CacheEntry {
    value: Value,
    /// Quiescence count at which `value` was stored; None if never.
    stamp: Option<usize>,
    subs: Vec<Sub>,
}

impl CacheEntry {
    fn new() -> Self {
        Self { value: Value::Unknown, stamp: None, subs: Vec::new() }
    }
}

/// Did the change from `old` to `new` cross `tolerance`? Unknown
/// tolerance means zero: every update is delivered. For non numeric
/// values any inequality crosses any tolerance.
fn crosses(tolerance: &Value, old: &Value, new: &Value) -> bool {
    match (old, new) {
        (Value::Unknown, Value::Unknown) => false,
        (Value::Unknown, _) | (_, Value::Unknown) => true,
        (old, new) => match (old.as_real(), new.as_real(), tolerance.as_real()) {
            (Some(o), Some(n), Some(t)) => (n - o).abs() >= t,
            (Some(_), Some(_), None) => true,
            (_, _, _) => old != new,
        },
    }
}

/// State to value map with pull and push lookups, quiescence aware
/// freshness, and subscriber threshold advice.
#[derive(Debug)]
pub struct StateCache {
    entries: IndexMap<State, CacheEntry, FxBuildHasher>,
    by_expr: FxHashMap<ExprId, State>,
    time_state: State,
    quiescence: usize,
    in_quiescence: bool,
}

impl StateCache {
    pub fn new() -> Self {
        let mut entries = IndexMap::default();
        let time_state = State::time();
        entries.insert(time_state.clone(), CacheEntry::new());
        Self {
            entries,
            by_expr: FxHashMap::default(),
            time_state,
            quiescence: 0,
            in_quiescence: false,
        }
    }

    /// Number of completed quiescence cycles.
    pub fn quiescence_count(&self) -> usize {
        self.quiescence
    }

    pub fn in_quiescence(&self) -> bool {
        self.in_quiescence
    }

    pub fn time_state(&self) -> &State {
        &self.time_state
    }

    fn entry_mut(&mut self, state: &State) -> &mut CacheEntry {
        self.entries.entry(state.clone()).or_insert_with(CacheEntry::new)
    }

    /// Store `value` for `state` and compute the deliveries it owes
    /// subscribers, pushing (expr, value) pairs into `deliveries`.
    fn store(
        state: &State,
        entry: &mut CacheEntry,
        value: Value,
        stamp: usize,
        deliveries: &mut Vec<(ExprId, Value)>,
    ) {
        entry.stamp = Some(stamp);
        if entry.value.same(&value) {
            return;
        }
        debug!("cache: {state} <- {value}");
        entry.value = value;
        for sub in entry.subs.iter_mut() {
            if crosses(&sub.tolerance, &sub.last, &entry.value) {
                sub.last = entry.value.clone();
                deliveries.push((sub.expr, entry.value.clone()));
            }
        }
    }

    /// Representative tolerance for the entry: the minimum over
    /// subscribers, zero if any subscriber is a pull lookup.
    fn representative_tolerance(entry: &CacheEntry) -> f64 {
        let mut tol = f64::INFINITY;
        for sub in &entry.subs {
            let t = match sub.kind {
                LookupKind::Now => 0.0,
                LookupKind::OnChange => sub.tolerance.as_real().unwrap_or(0.0),
            };
            if t < tol {
                tol = t
            }
        }
        if tol.is_finite() { tol } else { 0.0 }
    }

    fn advise<D: Dispatcher>(state: &State, entry: &CacheEntry, world: &mut D) {
        if entry.subs.is_empty() {
            return;
        }
        if let Some(v) = entry.value.as_real() {
            let tol = Self::representative_tolerance(entry);
            world.set_thresholds(
                state,
                &Value::Real(v + tol),
                &Value::Real(v - tol),
            );
        }
    }

    /// Look up the current value of `state`, consulting the outside
    /// interface at most once per quiescence cycle. Any change the
    /// fetch reveals is delivered to subscribers like a push update.
    pub fn lookup_now<D: Dispatcher>(
        &mut self,
        world: &mut D,
        state: &State,
        deliveries: &mut Vec<(ExprId, Value)>,
    ) -> Value {
        let stamp = self.quiescence;
        let entry = self.entry_mut(state);
        if entry.stamp != Some(stamp) {
            let v = world.lookup_now(state);
            Self::store(state, entry, v, stamp, deliveries);
            Self::advise(state, entry, world);
        }
        entry.value.clone()
    }

    /// Subscribe a lookup expression to `state`. Fetches the state
    /// if it has not been read this quiescence, delivers the current
    /// value to the new subscriber via the returned value, and
    /// advises the interface of the new threshold envelope.
    pub fn register<D: Dispatcher>(
        &mut self,
        world: &mut D,
        state: &State,
        expr: ExprId,
        kind: LookupKind,
        tolerance: Value,
        deliveries: &mut Vec<(ExprId, Value)>,
    ) -> Value {
        let stamp = self.quiescence;
        if let Some(prev) = self.by_expr.insert(expr, state.clone()) {
            assert!(
                prev == *state,
                "lookup {expr} registered for {state} while still registered for {prev}"
            );
        }
        let entry = self.entry_mut(state);
        // re-registration replaces the previous subscription
        entry.subs.retain(|s| s.expr != expr);
        let first = entry.subs.is_empty();
        if entry.stamp != Some(stamp) {
            let v = world.lookup_now(state);
            Self::store(state, entry, v, stamp, deliveries);
        }
        let value = entry.value.clone();
        entry.subs.push(Sub { expr, kind, tolerance, last: value.clone() });
        if first {
            world.subscribe(state);
        }
        Self::advise(state, entry, world);
        value
    }

    /// Remove a lookup's subscription. When the state's last
    /// subscriber leaves, the interface is told to drop it.
    pub fn unregister<D: Dispatcher>(&mut self, world: &mut D, expr: ExprId) {
        let Some(state) = self.by_expr.remove(&expr) else { return };
        let Some(entry) = self.entries.get_mut(&state) else { return };
        entry.subs.retain(|s| s.expr != expr);
        if entry.subs.is_empty() {
            world.unsubscribe(&state);
        } else {
            Self::advise(&state, entry, world);
        }
    }

    /// Replace the tolerance of an existing subscription, e.g. when
    /// a tolerance expression changed without moving the state.
    pub fn set_tolerance<D: Dispatcher>(
        &mut self,
        world: &mut D,
        expr: ExprId,
        tolerance: Value,
    ) {
        let Some(state) = self.by_expr.get(&expr).cloned() else { return };
        let Some(entry) = self.entries.get_mut(&state) else { return };
        if let Some(sub) = entry.subs.iter_mut().find(|s| s.expr == expr) {
            sub.tolerance = tolerance;
        }
        Self::advise(&state, entry, world);
    }

    /// Record a value reported by the outside world. Legal only
    /// outside quiescence; the executive snapshots the world at the
    /// start of each step.
    pub fn update_state<D: Dispatcher>(
        &mut self,
        world: &mut D,
        state: &State,
        value: Value,
        deliveries: &mut Vec<(ExprId, Value)>,
    ) {
        assert!(
            !self.in_quiescence,
            "update_state({state}) during quiescence cycle {}",
            self.quiescence
        );
        let stamp = self.quiescence;
        let before = deliveries.len();
        let entry = self.entry_mut(state);
        Self::store(state, entry, value, stamp, deliveries);
        if deliveries.len() > before {
            Self::advise(state, entry, world);
        }
    }

    /// Begin a quiescence cycle: fix `time()` at `now` for the
    /// duration of the step and refresh every pull subscribed state
    /// so repeated reads in this cycle are stable.
    pub fn begin_quiescence<D: Dispatcher>(
        &mut self,
        world: &mut D,
        now: f64,
        deliveries: &mut Vec<(ExprId, Value)>,
    ) {
        assert!(!self.in_quiescence, "begin_quiescence while already in quiescence");
        self.in_quiescence = true;
        let stamp = self.quiescence;
        let time_state = self.time_state.clone();
        let entry = self.entry_mut(&time_state);
        Self::store(&time_state, entry, Value::Real(now), stamp, deliveries);
        Self::advise(&time_state, entry, world);
        // refresh states with pull subscribers that have not yet
        // been read this cycle
        for (state, entry) in self.entries.iter_mut() {
            if entry.stamp == Some(stamp) || *state == time_state {
                continue;
            }
            if entry.subs.iter().any(|s| s.kind == LookupKind::Now) {
                let v = world.lookup_now(state);
                Self::store(state, entry, v, stamp, deliveries);
                Self::advise(state, entry, world);
            }
        }
    }

    /// End the quiescence cycle and advance the counter.
    pub fn end_quiescence(&mut self) {
        assert!(self.in_quiescence, "end_quiescence while not in quiescence");
        self.in_quiescence = false;
        self.quiescence += 1;
    }

    /// The cache's current notion of the time. Reads through to the
    /// interface at most once per quiescence.
    pub fn current_time<D: Dispatcher>(
        &mut self,
        world: &mut D,
        deliveries: &mut Vec<(ExprId, Value)>,
    ) -> f64 {
        let time_state = self.time_state.clone();
        match self.lookup_now(world, &time_state, deliveries) {
            Value::Real(t) => t,
            Value::Int(t) => t as f64,
            v => {
                warn!("time() is not a Real: {v}");
                0.0
            }
        }
    }

    /// Last stored value without consulting the interface.
    pub fn last_value(&self, state: &State) -> Value {
        self.entries.get(state).map(|e| e.value.clone()).unwrap_or(Value::Unknown)
    }
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new()
    }
}
