//! Mutable expressions.
//!
//! A variable keeps its declared type, its initial value for reset,
//! and a saved copy used to roll back a single failed assignment.
//! The save/restore pair is not a general undo log; it holds at most
//! one value and only the assignment machinery touches it.
use super::{ExprGraph, ExprId, ExprKind, Wakes};
use crate::{
    cache::StateCache,
    value::{Value, ValueType},
    Dispatcher,
};
use anyhow::{bail, Result};

#[derive(Debug, Clone)]
pub struct VarState {
    pub typ: ValueType,
    pub initial: Value,
    pub saved: Option<Value>,
    pub konst: bool,
}

impl VarState {
    pub fn new(typ: ValueType, initial: Value, konst: bool) -> Self {
        Self { typ, initial, saved: None, konst }
    }
}

impl ExprGraph {
    fn var(&self, id: ExprId) -> &VarState {
        match &self.slot(id).kind {
            ExprKind::Var(v) => v,
            k => panic!("{id} is not a variable: {k:?}"),
        }
    }

    fn var_mut(&mut self, id: ExprId) -> &mut VarState {
        match &mut self.slot_mut(id).kind {
            ExprKind::Var(v) => v,
            k => panic!("{id} is not a variable: {k:?}"),
        }
    }

    pub fn is_var(&self, id: ExprId) -> bool {
        matches!(self.slot(id).kind, ExprKind::Var(_))
    }

    pub fn var_is_const(&self, id: ExprId) -> bool {
        self.var(id).konst
    }

    /// Write a variable, checking the const flag and the declared
    /// type. The stored value updates even while the variable is
    /// inactive; listeners hear about it only when it is active.
    pub fn assign<D: Dispatcher>(
        &mut self,
        id: ExprId,
        v: Value,
        cache: &mut StateCache,
        world: &mut D,
        wakes: &mut Wakes,
    ) -> Result<()> {
        let var = self.var(id);
        if var.konst {
            bail!("assignment to constant variable {id}")
        }
        if !var.typ.accepts(v.value_type()) {
            bail!("cannot store a {} in {id}, declared {}", v.value_type(), var.typ)
        }
        self.set_value(id, v, cache, world, wakes);
        Ok(())
    }

    /// Write one element of an array variable. The backing store is
    /// copied on write, so the initial array (and any saved copy)
    /// is unaffected.
    pub fn assign_element<D: Dispatcher>(
        &mut self,
        id: ExprId,
        index: i64,
        v: Value,
        cache: &mut StateCache,
        world: &mut D,
        wakes: &mut Wakes,
    ) -> Result<()> {
        let var = self.var(id);
        if var.konst {
            bail!("assignment to constant variable {id}")
        }
        let elem: ValueType = match var.typ {
            ValueType::Array(e) => e.into(),
            t => bail!("{id} is not an array variable (declared {t})"),
        };
        if !elem.accepts(v.value_type()) {
            bail!("cannot store a {} element in {id}, declared {elem}", v.value_type())
        }
        let mut arr = match &self.slot(id).value {
            Value::Array(a) => a.clone(),
            Value::Unknown => bail!("element write to unknown array {id}"),
            v => panic!("array variable {id} holds non array value {v}"),
        };
        let i = match usize::try_from(index) {
            Ok(i) if i < arr.len() => i,
            _ => bail!("array index {index} out of range (length {})", arr.len()),
        };
        arr.set(i, v);
        self.set_value(id, Value::Array(arr), cache, world, wakes);
        Ok(())
    }

    /// Restore the initial value and drop any saved copy.
    pub fn reset_var<D: Dispatcher>(
        &mut self,
        id: ExprId,
        cache: &mut StateCache,
        world: &mut D,
        wakes: &mut Wakes,
    ) {
        let var = self.var_mut(id);
        var.saved = None;
        let initial = var.initial.clone();
        self.set_value(id, initial, cache, world, wakes);
    }

    /// Copy the current value aside for later [`ExprGraph::restore_var`].
    pub fn save_var(&mut self, id: ExprId) {
        let cur = self.slot(id).value.clone();
        self.var_mut(id).saved = Some(cur);
    }

    /// Copy the saved value back and notify. No-op if nothing was
    /// saved.
    pub fn restore_var<D: Dispatcher>(
        &mut self,
        id: ExprId,
        cache: &mut StateCache,
        world: &mut D,
        wakes: &mut Wakes,
    ) {
        if let Some(v) = self.var_mut(id).saved.take() {
            self.set_value(id, v, cache, world, wakes);
        }
    }

    pub fn saved_value(&self, id: ExprId) -> Option<&Value> {
        self.var(id).saved.as_ref()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        expr::Wakes,
        test::harness::NullWorld,
        value::{ArrayValue, ElemType},
    };

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
    }

    macro_rules! call {
        ($r:expr, $m:ident ( $($a:expr),* )) => {{
            let Rig { g, cache, world, wakes } = &mut $r;
            g.$m($($a,)* cache, world, wakes)
        }};
    }

    #[test]
    fn save_restore_round_trip() {
        let mut r = Rig::new();
        let x = r.g.add_var(VarState::new(ValueType::Int, Value::Int(1), false));
        call!(r, activate(x));
        r.g.save_var(x);
        call!(r, assign(x, Value::Int(9))).unwrap();
        assert_eq!(r.g.value_of(x), Value::Int(9));
        call!(r, restore_var(x));
        assert_eq!(r.g.value_of(x), Value::Int(1));
    }

    #[test]
    fn reset_restores_initial() {
        let mut r = Rig::new();
        let x = r.g.add_var(VarState::new(ValueType::Real, Value::Real(2.5), false));
        call!(r, activate(x));
        call!(r, assign(x, Value::Real(7.0))).unwrap();
        call!(r, reset_var(x));
        assert_eq!(r.g.value_of(x), Value::Real(2.5));
    }

    #[test]
    fn const_write_is_fatal() {
        let mut r = Rig::new();
        let x = r.g.add_var(VarState::new(ValueType::Int, Value::Int(1), true));
        call!(r, activate(x));
        assert!(call!(r, assign(x, Value::Int(2))).is_err());
        assert_eq!(r.g.value_of(x), Value::Int(1));
    }

    #[test]
    fn type_checked_writes() {
        let mut r = Rig::new();
        let x = r.g.add_var(VarState::new(ValueType::Real, Value::Real(0.0), false));
        call!(r, activate(x));
        // Int promotes into a Real slot, Str does not
        assert!(call!(r, assign(x, Value::Int(2))).is_ok());
        assert!(call!(r, assign(x, Value::from("no"))).is_err());
    }

    #[test]
    fn array_element_write_is_cow() {
        let mut r = Rig::new();
        let init = ArrayValue::new(
            ElemType::Int,
            3,
            vec![Value::Int(1), Value::Int(2), Value::Int(3)],
        )
        .unwrap();
        let x = r.g.add_var(VarState::new(
            ValueType::Array(ElemType::Int),
            Value::Array(init),
            false,
        ));
        call!(r, activate(x));
        call!(r, assign_element(x, 1, Value::Int(42))).unwrap();
        match r.g.value_of(x) {
            Value::Array(a) => assert_eq!(a.get(1), Some(&Value::Int(42))),
            v => panic!("not an array: {v}"),
        }
        // out of range and wrong element type are fatal
        assert!(call!(r, assign_element(x, 3, Value::Int(0))).is_err());
        assert!(call!(r, assign_element(x, 0, Value::from("s"))).is_err());
        // reset goes back to the untouched initial
        call!(r, reset_var(x));
        match r.g.value_of(x) {
            Value::Array(a) => assert_eq!(a.get(1), Some(&Value::Int(2))),
            v => panic!("not an array: {v}"),
        }
    }
}
