//! Property tests for the executive's core invariants.
use super::harness::{init, node, NullWorld};
use crate::{
    cache::{LookupKind, State, StateCache},
    expr::{ExprGraph, VarState, Wakes},
    node::NodeState,
    plan::{PlanBody, PlanExpr, VarDecl},
    value::{Value, ValueType},
    ExprId,
};
use proptest::prelude::*;

proptest! {
    /// A change lookup is notified iff the update
    /// moved at least the tolerance away from the last delivered
    /// value, and its reference point advances exactly when
    /// notified.
    #[test]
    fn tolerance_notified_iff_crossed(
        vals in prop::collection::vec(-100.0f64..100.0, 1..40),
        tol in 0.0f64..25.0,
    ) {
        let mut world = NullWorld::default();
        let mut cache = StateCache::new();
        let mut dv = Vec::new();
        let s = State::simple("s");
        world.values.insert(s.clone(), Value::Real(0.0));
        cache.register(
            &mut world,
            &s,
            ExprId(1),
            LookupKind::OnChange,
            Value::Real(tol),
            &mut dv,
        );
        dv.clear();
        let mut last = 0.0f64;
        for v in vals {
            cache.update_state(&mut world, &s, Value::Real(v), &mut dv);
            let expect = (v - last).abs() >= tol && v != last;
            if expect {
                prop_assert_eq!(dv.len(), 1);
                prop_assert_eq!(&dv[0], &(ExprId(1), Value::Real(v)));
                last = v;
            } else {
                prop_assert!(dv.is_empty(), "unexpected delivery for {}", v);
            }
            dv.clear();
        }
    }

    /// lookup_now twice in one quiescence returns the
    /// same value no matter what the interface does in between.
    #[test]
    fn lookup_now_stable_within_quiescence(
        first in any::<i32>(),
        second in any::<i32>(),
    ) {
        let mut world = NullWorld::default();
        let mut cache = StateCache::new();
        let mut dv = Vec::new();
        let s = State::simple("s");
        world.values.insert(s.clone(), Value::Int(first));
        cache.begin_quiescence(&mut world, 0.0, &mut dv);
        let a = cache.lookup_now(&mut world, &s, &mut dv);
        world.values.insert(s.clone(), Value::Int(second));
        let b = cache.lookup_now(&mut world, &s, &mut dv);
        cache.end_quiescence();
        prop_assert_eq!(a, b);
    }

    /// Save then restore always returns a variable to
    /// its pre-assignment value.
    #[test]
    fn save_restore_round_trip(before in any::<i32>(), after in any::<i32>()) {
        let mut g = ExprGraph::new();
        let mut cache = StateCache::new();
        let mut world = NullWorld::default();
        let mut wakes = Wakes::default();
        let x = g.add_var(VarState::new(ValueType::Int, Value::Int(before), false));
        g.activate(x, &mut cache, &mut world, &mut wakes);
        g.save_var(x);
        g.assign(x, Value::Int(after), &mut cache, &mut world, &mut wakes).unwrap();
        g.restore_var(x, &mut cache, &mut world, &mut wakes);
        prop_assert_eq!(g.value_of(x), Value::Int(before));
    }

    /// Of two assignment nodes fighting over one
    /// variable, the lower priority integer executes first; ties
    /// break on the node identifier.
    #[test]
    fn assignment_priority_winner(p1 in 0i32..6, p2 in 0i32..6) {
        let mut exec = init();
        let assign = |id: &str, v: i32, priority: i32| {
            let mut n = node(
                id,
                PlanBody::Assignment {
                    target: "x".into(),
                    index: None,
                    value: Box::new(PlanExpr::lit(v)),
                },
            );
            n.priority = priority;
            n
        };
        let mut plan = node(
            "root",
            PlanBody::List { children: vec![assign("a", 1, p1), assign("b", 2, p2)] },
        );
        plan.variables = vec![VarDecl {
            name: "x".into(),
            typ: ValueType::Int,
            konst: false,
            init: Some(PlanExpr::lit(0)),
            max_size: None,
        }];
        exec.add_plan(&plan).unwrap();
        exec.step(0.0);
        // "a" wins ties lexicographically
        let winner = if p1 <= p2 { "a" } else { "b" };
        let loser = if p1 <= p2 { "b" } else { "a" };
        let w = exec.node_by_ident(winner).unwrap();
        let l = exec.node_by_ident(loser).unwrap();
        prop_assert_eq!(exec.node(w).state, NodeState::Executing);
        prop_assert_eq!(exec.node(l).state, NodeState::Waiting);
    }
}

/// Local variables hold an activation while the node
/// is anywhere between Waiting and IterationEnded, and none in
/// Inactive or Finished.
#[test]
fn local_variable_activation_follows_node_life() {
    let mut exec = init();
    let mut plan = node("n", PlanBody::Empty);
    plan.variables = vec![VarDecl {
        name: "v".into(),
        typ: ValueType::Int,
        konst: false,
        init: Some(PlanExpr::lit(7)),
        max_size: None,
    }];
    plan.conditions.end = Some(PlanExpr::Lookup {
        kind: LookupKind::OnChange,
        name: Box::new(PlanExpr::lit("done")),
        params: vec![],
        tolerance: None,
        declared: ValueType::Bool,
    });
    let done = State::simple("done");
    exec.world.values.insert(done.clone(), Value::Bool(false));
    let root = exec.add_plan(&plan).unwrap();
    let var = exec.node(root).names.get("v").unwrap().expr;
    assert!(!exec.graph.is_active(var), "inactive before first step");
    exec.step(0.0);
    assert_eq!(exec.node(root).state, NodeState::Executing);
    assert!(exec.graph.is_active(var), "active while executing");
    assert_eq!(exec.var_value(root, "v"), Some(Value::Int(7)));
    exec.world.values.insert(done.clone(), Value::Bool(true));
    exec.process_events([crate::ExternalEvent::StateUpdate(done, Value::Bool(true))]);
    exec.run_to_quiescence(1.0);
    assert_eq!(exec.node(root).state, NodeState::Finished);
    assert!(!exec.graph.is_active(var), "inactive when finished");
}

/// If nothing reachable changed between steps, no
/// expression changes value and no node moves.
#[test]
fn steps_without_input_are_stable() {
    let mut exec = init();
    let mut plan = node("n", PlanBody::Empty);
    plan.conditions.end = Some(PlanExpr::Lookup {
        kind: LookupKind::OnChange,
        name: Box::new(PlanExpr::lit("go")),
        params: vec![],
        tolerance: None,
        declared: ValueType::Bool,
    });
    exec.world.values.insert(State::simple("go"), Value::Bool(false));
    let root = exec.add_plan(&plan).unwrap();
    exec.run_to_quiescence(0.0);
    assert_eq!(exec.node(root).state, NodeState::Executing);
    exec.drain_transitions();
    for i in 0..5 {
        exec.step(1.0 + i as f64);
        assert!(exec.drain_transitions().is_empty(), "noise on step {i}");
        assert_eq!(exec.node(root).state, NodeState::Executing);
    }
}
