//! The expression/notification graph.
//!
//! Expressions live in an arena and reference each other by
//! [`ExprId`]; listener edges are stored as index lists, so there is
//! no aliased ownership and removal is cheap. Change propagation
//! walks an explicit worklist seeded by the initial change rather
//! than recursing through listeners.
//!
//! Activation is a reference count. An expression with active count
//! zero is observationally Unknown and notifies nobody; compound
//! expressions cascade activation to their operands before
//! recomputing, so an active expression's operands are always
//! active. Constants are pinned: once activated their count never
//! drops below one.
use crate::{
    cache::{LookupKind, StateCache},
    node::{NodeId, NodeState},
    slot_id,
    value::{Value, ValueType},
    Dispatcher,
};
use log::error;
use smallvec::SmallVec;
use std::fmt;

pub mod lookup;
pub mod op;
pub mod var;

pub use lookup::LookupState;
pub use op::{ArithOp, CmpOp};
pub use var::VarState;

slot_id!(ExprId, "e");

/// An outgoing notification edge. Either another expression that
/// must recompute, or a node whose conditions must be rechecked by
/// the executive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listener {
    Expr(ExprId),
    Node(NodeId),
}

/// Nodes woken by a round of propagation, to be enqueued as
/// transition candidates by the executive.
#[derive(Debug, Default)]
pub struct Wakes {
    nodes: SmallVec<[NodeId; 8]>,
}

impl Wakes {
    pub fn push(&mut self, n: NodeId) {
        if !self.nodes.contains(&n) {
            self.nodes.push(n)
        }
    }

    pub fn drain(&mut self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.drain(..)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Debug)]
pub(crate) enum ExprKind {
    Const,
    Var(VarState),
    Not(ExprId),
    And(Box<[ExprId]>),
    Or(Box<[ExprId]>),
    Xor(Box<[ExprId]>),
    Cmp(CmpOp, ExprId, ExprId),
    Arith(ArithOp, Box<[ExprId]>),
    Concat(Box<[ExprId]>),
    Index(ExprId, ExprId),
    IsKnown(ExprId),
    Lookup(Box<LookupState>),
    /// True when every listed node state variable is Finished.
    AllChildrenFinished(Box<[ExprId]>),
    /// True when every listed node state variable is Waiting or
    /// Finished.
    AllChildrenWaitingOrFinished(Box<[ExprId]>),
}

#[derive(Debug)]
struct LockGuard {
    saved: Value,
    dirty: bool,
}

#[derive(Debug)]
struct Slot {
    kind: ExprKind,
    value: Value,
    typ: ValueType,
    active: u32,
    pinned: bool,
    listeners: SmallVec<[Listener; 2]>,
    lock: Option<LockGuard>,
}

/// The arena of expressions for one executive.
#[derive(Debug)]
pub struct ExprGraph {
    slots: Vec<Slot>,
    true_: ExprId,
    false_: ExprId,
    unknown: ExprId,
}

impl ExprGraph {
    pub fn new() -> Self {
        let mut t = Self {
            slots: Vec::new(),
            true_: ExprId(0),
            false_: ExprId(0),
            unknown: ExprId(0),
        };
        t.true_ = t.add_const(Value::Bool(true));
        t.false_ = t.add_const(Value::Bool(false));
        t.unknown = t.add_const(Value::Unknown);
        t
    }

    /// The shared constant True.
    pub fn konst_true(&self) -> ExprId {
        self.true_
    }

    /// The shared constant False.
    pub fn konst_false(&self) -> ExprId {
        self.false_
    }

    /// The shared constant Unknown.
    pub fn konst_unknown(&self) -> ExprId {
        self.unknown
    }

    fn slot(&self, id: ExprId) -> &Slot {
        &self.slots[id.0 as usize]
    }

    fn slot_mut(&mut self, id: ExprId) -> &mut Slot {
        &mut self.slots[id.0 as usize]
    }

    fn push(&mut self, kind: ExprKind, value: Value, typ: ValueType, pinned: bool) -> ExprId {
        let id = ExprId(self.slots.len() as u32);
        self.slots.push(Slot {
            kind,
            value,
            typ,
            active: if pinned { 1 } else { 0 },
            pinned,
            listeners: SmallVec::new(),
            lock: None,
        });
        id
    }

    /// Intern a constant. The shared booleans and Unknown are
    /// reused; anything else gets a fresh pinned slot.
    pub fn add_const(&mut self, v: Value) -> ExprId {
        if !self.slots.is_empty() {
            match &v {
                Value::Bool(true) => return self.true_,
                Value::Bool(false) => return self.false_,
                Value::Unknown => return self.unknown,
                _ => (),
            }
        }
        let typ = v.value_type();
        self.push(ExprKind::Const, v, typ, true)
    }

    pub fn add_var(&mut self, var: VarState) -> ExprId {
        let typ = var.typ;
        let value = var.initial.clone();
        self.push(ExprKind::Var(var), value, typ, false)
    }

    /// Add a derived expression. Operands must already exist, which
    /// makes the static graph a DAG by construction. Listener edges
    /// mirroring the operand edges are installed here.
    pub(crate) fn add(&mut self, kind: ExprKind) -> ExprId {
        let typ = self.infer_type(&kind);
        let id = self.push(kind, Value::Unknown, typ, false);
        for o in self.operands(id) {
            self.add_listener(o, Listener::Expr(id));
        }
        id
    }

    pub fn typ(&self, id: ExprId) -> ValueType {
        self.slot(id).typ
    }

    pub fn is_active(&self, id: ExprId) -> bool {
        self.slot(id).active > 0
    }

    pub(crate) fn active_count(&self, id: ExprId) -> u32 {
        self.slot(id).active
    }

    /// The observational value: Unknown while inactive.
    pub fn value_of(&self, id: ExprId) -> Value {
        let s = self.slot(id);
        if s.active > 0 { s.value.clone() } else { Value::Unknown }
    }

    pub fn is_true(&self, id: ExprId) -> bool {
        let s = self.slot(id);
        s.active > 0 && s.value.is_true()
    }

    pub fn is_false(&self, id: ExprId) -> bool {
        let s = self.slot(id);
        s.active > 0 && s.value.is_false()
    }

    /// Adding a listener already present is a no-op.
    pub fn add_listener(&mut self, id: ExprId, l: Listener) {
        let s = self.slot_mut(id);
        if !s.listeners.contains(&l) {
            s.listeners.push(l)
        }
    }

    pub fn remove_listener(&mut self, id: ExprId, l: Listener) {
        self.slot_mut(id).listeners.retain(|x| *x != l)
    }

    fn operands(&self, id: ExprId) -> SmallVec<[ExprId; 4]> {
        let mut out = SmallVec::new();
        match &self.slot(id).kind {
            ExprKind::Const | ExprKind::Var(_) => (),
            ExprKind::Not(a) | ExprKind::IsKnown(a) => out.push(*a),
            ExprKind::And(xs)
            | ExprKind::Or(xs)
            | ExprKind::Xor(xs)
            | ExprKind::Arith(_, xs)
            | ExprKind::Concat(xs)
            | ExprKind::AllChildrenFinished(xs)
            | ExprKind::AllChildrenWaitingOrFinished(xs) => out.extend(xs.iter().copied()),
            ExprKind::Cmp(_, a, b) | ExprKind::Index(a, b) => {
                out.push(*a);
                out.push(*b)
            }
            ExprKind::Lookup(lk) => {
                out.push(lk.name);
                out.extend(lk.params.iter().copied());
                out.extend(lk.tolerance)
            }
        }
        out
    }

    fn infer_type(&self, kind: &ExprKind) -> ValueType {
        match kind {
            ExprKind::Const => ValueType::Unknown,
            ExprKind::Var(v) => v.typ,
            ExprKind::Not(_)
            | ExprKind::And(_)
            | ExprKind::Or(_)
            | ExprKind::Xor(_)
            | ExprKind::Cmp(..)
            | ExprKind::IsKnown(_)
            | ExprKind::AllChildrenFinished(_)
            | ExprKind::AllChildrenWaitingOrFinished(_) => ValueType::Bool,
            ExprKind::Concat(_) => ValueType::Str,
            ExprKind::Arith(op, xs) => {
                let all_int = xs
                    .iter()
                    .all(|x| self.slot(*x).typ == ValueType::Int);
                op.result_type(all_int)
            }
            ExprKind::Index(a, _) => match self.slot(*a).typ {
                ValueType::Array(e) => e.into(),
                _ => ValueType::Unknown,
            },
            ExprKind::Lookup(lk) => lk.declared,
        }
    }

    /// Evaluate a derived expression from its operands' current
    /// observational values. Variables, constants and lookups are
    /// never evaluated here; their values are written directly.
    fn eval(&self, id: ExprId) -> Value {
        let res = match &self.slot(id).kind {
            ExprKind::Const | ExprKind::Var(_) | ExprKind::Lookup(_) => {
                return self.slot(id).value.clone()
            }
            ExprKind::Not(a) => Ok(op::eval_not(&self.value_of(*a))),
            ExprKind::And(xs) => {
                Ok(op::eval_and(xs.iter().map(|x| self.value_of(*x))))
            }
            ExprKind::Or(xs) => Ok(op::eval_or(xs.iter().map(|x| self.value_of(*x)))),
            ExprKind::Xor(xs) => {
                Ok(op::eval_xor(xs.iter().map(|x| self.value_of(*x))))
            }
            ExprKind::Cmp(cmp, a, b) => {
                Ok(op::eval_cmp(*cmp, &self.value_of(*a), &self.value_of(*b)))
            }
            ExprKind::Arith(ar, xs) => {
                let args: SmallVec<[Value; 4]> =
                    xs.iter().map(|x| self.value_of(*x)).collect();
                op::eval_arith(*ar, &args)
            }
            ExprKind::Concat(xs) => {
                Ok(op::eval_concat(xs.iter().map(|x| self.value_of(*x))))
            }
            ExprKind::Index(a, i) => {
                op::eval_index(&self.value_of(*a), &self.value_of(*i))
            }
            ExprKind::IsKnown(a) => Ok(Value::Bool(self.value_of(*a).is_known())),
            ExprKind::AllChildrenFinished(xs) => Ok(op::eval_all_in_states(
                xs.iter().map(|x| self.value_of(*x)),
                &[NodeState::Finished],
            )),
            ExprKind::AllChildrenWaitingOrFinished(xs) => Ok(op::eval_all_in_states(
                xs.iter().map(|x| self.value_of(*x)),
                &[NodeState::Waiting, NodeState::Finished],
            )),
        };
        match res {
            Ok(v) => v,
            Err(e) => {
                // a failed evaluation blocks every guarded
                // transition; the node simply does not move
                error!("evaluating {id}: {e:?}");
                Value::Unknown
            }
        }
    }

    /// Write a value into a slot, honoring the lock buffer. Returns
    /// true if the stored value changed and listeners should hear
    /// about it.
    fn write(&mut self, id: ExprId, v: Value) -> bool {
        let s = self.slot_mut(id);
        match &mut s.lock {
            Some(g) => {
                g.saved = v;
                g.dirty = true;
                false
            }
            None => {
                if s.value.same(&v) {
                    false
                } else {
                    s.value = v;
                    true
                }
            }
        }
    }

    fn fan_out(&self, id: ExprId, stack: &mut Vec<ExprId>, wakes: &mut Wakes) {
        for l in self.slot(id).listeners.iter() {
            match l {
                Listener::Node(n) => wakes.push(*n),
                Listener::Expr(e) => {
                    if self.is_active(*e) {
                        stack.push(*e)
                    }
                }
            }
        }
    }

    /// Propagate a change at `seed` through the graph depth first.
    /// Cycle freedom is by construction: listener edges mirror
    /// operand edges, and operands always precede their consumers in
    /// the arena.
    pub(crate) fn propagate<D: Dispatcher>(
        &mut self,
        seed: ExprId,
        cache: &mut StateCache,
        world: &mut D,
        wakes: &mut Wakes,
    ) {
        if !self.is_active(seed) {
            return;
        }
        let mut stack = Vec::new();
        self.fan_out(seed, &mut stack, wakes);
        while let Some(id) = stack.pop() {
            if !self.is_active(id) {
                continue;
            }
            let changed = if matches!(self.slot(id).kind, ExprKind::Lookup(_)) {
                lookup::operand_changed(self, id, cache, world, wakes)
            } else {
                let v = self.eval(id);
                self.write(id, v)
            };
            if changed {
                self.fan_out(id, &mut stack, wakes);
            }
        }
    }

    /// Set a slot's value from outside the graph (an assignment, an
    /// ack, a cache delivery) and notify if it is active.
    pub(crate) fn set_value<D: Dispatcher>(
        &mut self,
        id: ExprId,
        v: Value,
        cache: &mut StateCache,
        world: &mut D,
        wakes: &mut Wakes,
    ) {
        if self.write(id, v) && self.is_active(id) {
            self.propagate(id, cache, world, wakes)
        }
    }

    /// Increment the active count, recomputing and registering on
    /// the 0 to 1 edge. Operands are activated before their
    /// consumer recomputes.
    pub fn activate<D: Dispatcher>(
        &mut self,
        id: ExprId,
        cache: &mut StateCache,
        world: &mut D,
        wakes: &mut Wakes,
    ) {
        let s = self.slot_mut(id);
        s.active += 1;
        if s.active > 1 {
            return;
        }
        for o in self.operands(id) {
            self.activate(o, cache, world, wakes)
        }
        let is_source = matches!(
            self.slot(id).kind,
            ExprKind::Const | ExprKind::Var(_)
        );
        let is_lookup = matches!(self.slot(id).kind, ExprKind::Lookup(_));
        if is_lookup {
            lookup::activated(self, id, cache, world, wakes)
        } else if !is_source {
            let v = self.eval(id);
            self.write(id, v);
        }
        // becoming active can itself be a visible change
        if self.slot(id).value.is_known() {
            self.propagate(id, cache, world, wakes)
        }
    }

    /// Decrement the active count. Underflow is an internal
    /// consistency failure. Constants never drop below one.
    pub fn deactivate<D: Dispatcher>(
        &mut self,
        id: ExprId,
        cache: &mut StateCache,
        world: &mut D,
    ) {
        let s = self.slot_mut(id);
        if s.pinned && s.active == 1 {
            return;
        }
        assert!(s.active > 0, "active count underflow on {id}");
        s.active -= 1;
        let zero = s.active == 0;
        let is_lookup = matches!(s.kind, ExprKind::Lookup(_));
        if zero {
            if is_lookup {
                lookup::deactivated(self, id, cache, world)
            }
            for o in self.operands(id) {
                self.deactivate(o, cache, world)
            }
        }
    }

    /// Capture the current value; until [`ExprGraph::unlock`],
    /// writes buffer into the saved copy. Locking twice is a fatal
    /// misuse.
    pub fn lock(&mut self, id: ExprId) {
        let s = self.slot_mut(id);
        assert!(s.lock.is_none(), "{id} is already locked");
        s.lock = Some(LockGuard { saved: s.value.clone(), dirty: false });
    }

    /// Release the lock, flushing the buffered value if any write
    /// happened while locked.
    pub fn unlock<D: Dispatcher>(
        &mut self,
        id: ExprId,
        cache: &mut StateCache,
        world: &mut D,
        wakes: &mut Wakes,
    ) {
        let notify = {
            let s = self.slot_mut(id);
            let g = s.lock.take().expect("unlock of an unlocked expression");
            if g.dirty && !s.value.same(&g.saved) {
                s.value = g.saved;
                s.active > 0
            } else {
                false
            }
        };
        if notify {
            self.propagate(id, cache, world, wakes)
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Default for ExprGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExprGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, s) in self.slots.iter().enumerate() {
            writeln!(
                f,
                "e{i}: {:?} = {} (active {}, {} listeners)",
                s.typ,
                s.value,
                s.active,
                s.listeners.len()
            )?
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::harness::NullWorld;

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

        fn activate(&mut self, id: ExprId) {
            self.g.activate(id, &mut self.cache, &mut self.world, &mut self.wakes)
        }

        fn deactivate(&mut self, id: ExprId) {
            self.g.deactivate(id, &mut self.cache, &mut self.world)
        }

        fn set(&mut self, id: ExprId, v: Value) {
            self.g.set_value(id, v, &mut self.cache, &mut self.world, &mut self.wakes)
        }
    }

    #[test]
    fn inactive_is_unknown() {
        let mut r = Rig::new();
        let v = r.g.add_var(VarState::new(ValueType::Int, Value::Int(3), false));
        assert_eq!(r.g.value_of(v), Value::Unknown);
        r.activate(v);
        assert_eq!(r.g.value_of(v), Value::Int(3));
        r.deactivate(v);
        assert_eq!(r.g.value_of(v), Value::Unknown);
    }

    #[test]
    fn propagation_reaches_compound() {
        let mut r = Rig::new();
        let x = r.g.add_var(VarState::new(ValueType::Int, Value::Int(1), false));
        let two = r.g.add_const(Value::Int(2));
        let sum = r.g.add(ExprKind::Arith(ArithOp::Add, Box::new([x, two])));
        let cmp = r.g.add(ExprKind::Cmp(CmpOp::Gt, sum, two));
        r.activate(cmp);
        assert_eq!(r.g.value_of(sum), Value::Int(3));
        assert!(r.g.is_true(cmp));
        r.set(x, Value::Int(-5));
        assert_eq!(r.g.value_of(sum), Value::Int(-3));
        assert!(r.g.is_false(cmp));
    }

    #[test]
    fn activation_cascades_and_balances() {
        let mut r = Rig::new();
        let x = r.g.add_var(VarState::new(ValueType::Bool, Value::Bool(true), false));
        let n = r.g.add(ExprKind::Not(x));
        r.activate(n);
        r.activate(n);
        assert_eq!(r.g.active_count(x), 2);
        r.deactivate(n);
        assert!(r.g.is_active(x));
        r.deactivate(n);
        assert!(!r.g.is_active(x));
    }

    #[test]
    fn constants_stay_active() {
        let mut r = Rig::new();
        let t = r.g.konst_true();
        r.activate(t);
        r.deactivate(t);
        r.deactivate(t);
        assert!(r.g.is_active(t));
        assert!(r.g.is_true(t));
    }

    #[test]
    fn listeners_are_a_set() {
        let mut r = Rig::new();
        let x = r.g.add_var(VarState::new(ValueType::Int, Value::Int(0), false));
        let n = r.g.add(ExprKind::IsKnown(x));
        r.g.add_listener(x, Listener::Expr(n));
        r.g.add_listener(x, Listener::Expr(n));
        assert_eq!(r.g.slot(x).listeners.len(), 1);
        r.g.remove_listener(x, Listener::Expr(n));
        assert!(r.g.slot(x).listeners.is_empty());
    }

    #[test]
    fn lock_buffers_writes() {
        let mut r = Rig::new();
        let x = r.g.add_var(VarState::new(ValueType::Int, Value::Int(1), false));
        let k = r.g.add(ExprKind::IsKnown(x));
        r.g.add_listener(x, Listener::Expr(k));
        r.activate(k);
        r.g.lock(x);
        r.set(x, Value::Int(2));
        assert_eq!(r.g.value_of(x), Value::Int(1));
        r.set(x, Value::Int(3));
        let Rig { g, cache, world, wakes } = &mut r;
        g.unlock(x, cache, world, wakes);
        assert_eq!(r.g.value_of(x), Value::Int(3));
    }

    #[test]
    fn unknown_propagates_through_arith() {
        let mut r = Rig::new();
        let x = r.g.add_var(VarState::new(ValueType::Real, Value::Unknown, false));
        let one = r.g.add_const(Value::Real(1.0));
        let sum = r.g.add(ExprKind::Arith(ArithOp::Add, Box::new([x, one])));
        r.activate(sum);
        assert_eq!(r.g.value_of(sum), Value::Unknown);
        r.set(x, Value::Real(2.0));
        assert_eq!(r.g.value_of(sum), Value::Real(3.0));
    }

    #[test]
    fn node_listeners_wake() {
        let mut r = Rig::new();
        let x = r.g.add_var(VarState::new(ValueType::Bool, Value::Bool(false), false));
        r.g.add_listener(x, Listener::Node(NodeId(4)));
        r.activate(x);
        r.set(x, Value::Bool(true));
        let woken: Vec<_> = r.wakes.drain().collect();
        assert_eq!(woken, vec![NodeId(4)]);
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn deactivate_underflow_asserts() {
        let mut r = Rig::new();
        let x = r.g.add_var(VarState::new(ValueType::Int, Value::Int(0), false));
        r.deactivate(x);
    }
}
