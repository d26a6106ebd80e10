//! Lookup expressions: reads of the external world through the
//! state cache.
//!
//! A lookup computes the [`State`] it watches from its operand
//! expressions. While active it is registered with the cache under
//! that state and mirrors the cache entry's value; when an operand
//! moves the state it re-registers, and on deactivation it
//! unregisters. The cache pushes values back in through
//! [`deliver`], never the other way around.
use super::{ExprGraph, ExprId, ExprKind, Wakes};
use crate::{
    cache::{LookupKind, State, StateCache},
    value::{Value, ValueType},
    Dispatcher,
};
use log::warn;

#[derive(Debug)]
pub struct LookupState {
    pub kind: LookupKind,
    pub name: ExprId,
    pub params: Box<[ExprId]>,
    pub tolerance: Option<ExprId>,
    pub declared: ValueType,
    /// The state currently registered with the cache, if any.
    pub current: Option<State>,
}

fn lk(g: &ExprGraph, id: ExprId) -> &LookupState {
    match &g.slot(id).kind {
        ExprKind::Lookup(lk) => lk,
        k => panic!("{id} is not a lookup: {k:?}"),
    }
}

fn lk_mut(g: &mut ExprGraph, id: ExprId) -> &mut LookupState {
    match &mut g.slot_mut(id).kind {
        ExprKind::Lookup(lk) => lk,
        k => panic!("{id} is not a lookup: {k:?}"),
    }
}

/// The watched state, computed from the operands' current values.
/// None until the name expression is a known string.
fn compute_state(g: &ExprGraph, id: ExprId) -> Option<State> {
    let l = lk(g, id);
    let name = match g.value_of(l.name) {
        Value::Str(s) => s,
        Value::Unknown => return None,
        v => {
            warn!("lookup {id}: state name is not a String: {v}");
            return None;
        }
    };
    let params: Vec<Value> = l.params.iter().map(|p| g.value_of(*p)).collect();
    Some(State::new(name, params))
}

fn tolerance_value(g: &ExprGraph, id: ExprId) -> Value {
    let l = lk(g, id);
    match l.kind {
        LookupKind::Now => Value::Real(0.0),
        LookupKind::OnChange => match l.tolerance {
            None => Value::Real(0.0),
            Some(t) => g.value_of(t),
        },
    }
}

/// Apply a batch of cache deliveries to their lookup expressions,
/// propagating each through the graph.
pub(crate) fn apply_deliveries<D: Dispatcher>(
    g: &mut ExprGraph,
    deliveries: &mut Vec<(ExprId, Value)>,
    cache: &mut StateCache,
    world: &mut D,
    wakes: &mut Wakes,
) {
    while let Some((id, v)) = deliveries.pop() {
        deliver(g, id, v, cache, world, wakes)
    }
}

/// A value arriving from the cache for this lookup. Values of the
/// wrong type are coerced to Unknown with a warning.
pub(crate) fn deliver<D: Dispatcher>(
    g: &mut ExprGraph,
    id: ExprId,
    v: Value,
    cache: &mut StateCache,
    world: &mut D,
    wakes: &mut Wakes,
) {
    let declared = lk(g, id).declared;
    let v = if declared.accepts(v.value_type()) {
        v
    } else {
        warn!("lookup {id}: {} delivered for a {declared} state", v.value_type());
        Value::Unknown
    };
    g.set_value(id, v, cache, world, wakes)
}

/// Active edge 0 to 1: register with the cache and mirror the
/// entry's value.
pub(crate) fn activated<D: Dispatcher>(
    g: &mut ExprGraph,
    id: ExprId,
    cache: &mut StateCache,
    world: &mut D,
    wakes: &mut Wakes,
) {
    let state = compute_state(g, id);
    let kind = lk(g, id).kind;
    let value = match &state {
        None => Value::Unknown,
        Some(s) => {
            let tol = tolerance_value(g, id);
            let mut dv = Vec::new();
            let v = cache.register(world, s, id, kind, tol, &mut dv);
            apply_deliveries(g, &mut dv, cache, world, wakes);
            v
        }
    };
    lk_mut(g, id).current = state;
    let declared = lk(g, id).declared;
    let value = if declared.accepts(value.value_type()) {
        value
    } else {
        warn!("lookup {id}: {} delivered for a {declared} state", value.value_type());
        Value::Unknown
    };
    g.write(id, value);
}

/// Active edge 1 to 0: unregister and forget the mirrored value.
pub(crate) fn deactivated<D: Dispatcher>(
    g: &mut ExprGraph,
    id: ExprId,
    cache: &mut StateCache,
    world: &mut D,
) {
    cache.unregister(world, id);
    lk_mut(g, id).current = None;
    g.slot_mut(id).value = Value::Unknown;
}

/// An operand (state name, parameter, or tolerance) changed while
/// the lookup is active. Returns true if the lookup's own value
/// changed.
pub(crate) fn operand_changed<D: Dispatcher>(
    g: &mut ExprGraph,
    id: ExprId,
    cache: &mut StateCache,
    world: &mut D,
    wakes: &mut Wakes,
) -> bool {
    let new_state = compute_state(g, id);
    let tol = tolerance_value(g, id);
    if new_state == lk(g, id).current {
        // same state; at most the tolerance moved
        cache.set_tolerance(world, id, tol);
        return false;
    }
    let kind = lk(g, id).kind;
    cache.unregister(world, id);
    let value = match &new_state {
        None => Value::Unknown,
        Some(s) => {
            let mut dv = Vec::new();
            let v = cache.register(world, s, id, kind, tol, &mut dv);
            apply_deliveries(g, &mut dv, cache, world, wakes);
            v
        }
    };
    lk_mut(g, id).current = new_state;
    let declared = lk(g, id).declared;
    let value = if declared.accepts(value.value_type()) {
        value
    } else {
        warn!("lookup {id}: {} delivered for a {declared} state", value.value_type());
        Value::Unknown
    };
    g.write(id, value)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{expr::VarState, test::harness::NullWorld};

    struct Rig {
        g: ExprGraph,
        cache: StateCache,
        world: NullWorld,
        wakes: Wakes,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                g: ExprGraph::new(),
                cache: StateCache::new(),
                world: NullWorld::default(),
                wakes: Wakes::default(),
            }
        }

        fn add_lookup(
            &mut self,
            kind: LookupKind,
            name: &str,
            declared: ValueType,
        ) -> ExprId {
            let name = self.g.add_const(Value::from(name));
            self.g.add(ExprKind::Lookup(Box::new(LookupState {
                kind,
                name,
                params: Box::new([]),
                tolerance: None,
                declared,
                current: None,
            })))
        }
    }

    #[test]
    fn registers_on_activation() {
        let mut r = Rig::new();
        let s = State::simple("temp");
        r.world.values.insert(s.clone(), Value::Real(20.0));
        let lk = r.add_lookup(LookupKind::OnChange, "temp", ValueType::Real);
        let Rig { g, cache, world, wakes } = &mut r;
        g.activate(lk, cache, world, wakes);
        assert_eq!(g.value_of(lk), Value::Real(20.0));
        assert_eq!(world.subscribed, vec![s.clone()]);
        g.deactivate(lk, cache, world);
        assert_eq!(world.unsubscribed, vec![s]);
        assert_eq!(g.value_of(lk), Value::Unknown);
    }

    #[test]
    fn reregisters_when_parameter_moves() {
        let mut r = Rig::new();
        let which = r.g.add_var(VarState::new(
            ValueType::Str,
            Value::from("alpha"),
            false,
        ));
        let lk_id = {
            let g = &mut r.g;
            g.add(ExprKind::Lookup(Box::new(LookupState {
                kind: LookupKind::OnChange,
                name: which,
                params: Box::new([]),
                tolerance: None,
                declared: ValueType::Int,
                current: None,
            })))
        };
        r.world.values.insert(State::simple("alpha"), Value::Int(1));
        r.world.values.insert(State::simple("beta"), Value::Int(2));
        {
            let Rig { g, cache, world, wakes } = &mut r;
            g.activate(lk_id, cache, world, wakes);
        }
        assert_eq!(r.g.value_of(lk_id), Value::Int(1));
        {
            let Rig { g, cache, world, wakes } = &mut r;
            g.set_value(which, Value::from("beta"), cache, world, wakes);
        }
        assert_eq!(r.g.value_of(lk_id), Value::Int(2));
        assert_eq!(
            r.world.unsubscribed,
            vec![State::simple("alpha")],
            "old state dropped"
        );
    }

    #[test]
    fn wrong_type_coerces_to_unknown() {
        let mut r = Rig::new();
        let s = State::simple("flag");
        r.world.values.insert(s.clone(), Value::Real(3.5));
        let lk = r.add_lookup(LookupKind::Now, "flag", ValueType::Bool);
        let Rig { g, cache, world, wakes } = &mut r;
        g.activate(lk, cache, world, wakes);
        assert_eq!(g.value_of(lk), Value::Unknown);
    }
}
