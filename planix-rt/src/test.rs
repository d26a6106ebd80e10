use crate::{RtConfig, RtEvent, SimWorld};
use anyhow::{bail, Result};
use planix_exec::{
    cache::{LookupKind, State},
    expr::CmpOp,
    node::{FailureType, NodeOutcome, NodeState},
    plan::{Conditions, PlanBody, PlanExpr, PlanNode},
    value::{CommandHandle, Value, ValueType},
};
use tokio::sync::mpsc;

fn node(id: &str, body: PlanBody) -> PlanNode {
    PlanNode {
        id: id.into(),
        priority: 0,
        variables: vec![],
        interface: vec![],
        conditions: Conditions::default(),
        body,
    }
}

async fn wait_finished(
    rx: &mut mpsc::Receiver<Vec<RtEvent>>,
    ident: &str,
) -> Result<()> {
    loop {
        match rx.recv().await {
            None => bail!("runtime died"),
            Some(batch) => {
                for ev in batch {
                    if let RtEvent::PlanFinished(id) = ev {
                        if &*id == ident {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

#[tokio::test(flavor = "current_thread")]
async fn empty_plan_runs_to_success() -> Result<()> {
    let _ = env_logger::try_init();
    let (tx, mut rx) = mpsc::channel(100);
    let rt = RtConfig::builder(SimWorld::new(), tx).build()?.start();
    rt.add_plan(node("p", PlanBody::Empty)).await?;
    wait_finished(&mut rx, "p").await?;
    let snap = rt.snapshot("p").await?.expect("plan exists");
    assert_eq!(snap.state, NodeState::Finished);
    assert_eq!(snap.outcome, NodeOutcome::Success);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn command_plan_completes_on_ack() -> Result<()> {
    let _ = env_logger::try_init();
    let (tx, mut rx) = mpsc::channel(100);
    let mut world = SimWorld::new();
    world.return_with("measure", Value::Real(4.2));
    let rt = RtConfig::builder(world, tx).build()?.start();
    let plan = node(
        "m",
        PlanBody::Command {
            name: Box::new(PlanExpr::lit("measure")),
            args: vec![PlanExpr::lit(1)],
            returns: None,
        },
    );
    rt.add_plan(plan).await?;
    wait_finished(&mut rx, "m").await?;
    let snap = rt.snapshot("m").await?.unwrap();
    assert_eq!(snap.outcome, NodeOutcome::Success);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn denied_command_fails() -> Result<()> {
    let _ = env_logger::try_init();
    let (tx, mut rx) = mpsc::channel(100);
    let mut world = SimWorld::new();
    world.ack_with("launch", CommandHandle::Denied);
    let rt = RtConfig::builder(world, tx).build()?.start();
    let plan = node(
        "l",
        PlanBody::Command {
            name: Box::new(PlanExpr::lit("launch")),
            args: vec![],
            returns: None,
        },
    );
    rt.add_plan(plan).await?;
    wait_finished(&mut rx, "l").await?;
    let snap = rt.snapshot("l").await?.unwrap();
    assert_eq!(snap.outcome, NodeOutcome::Failure);
    assert_eq!(snap.failure, FailureType::PostConditionFailed);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn change_lookup_wakes_the_executive() -> Result<()> {
    let _ = env_logger::try_init();
    let (tx, mut rx) = mpsc::channel(100);
    let mut world = SimWorld::new();
    let temp = State::simple("temp");
    world.set(temp.clone(), Value::Real(20.0));
    world.never_ack("hold");
    let sim = world.handle();
    let rt = RtConfig::builder(world, tx).build()?.start();
    let mut plan = node(
        "watch",
        PlanBody::Command {
            name: Box::new(PlanExpr::lit("hold")),
            args: vec![],
            returns: None,
        },
    );
    plan.conditions.end = Some(PlanExpr::Cmp {
        op: CmpOp::Gt,
        lhs: Box::new(PlanExpr::Lookup {
            kind: LookupKind::OnChange,
            name: Box::new(PlanExpr::lit("temp")),
            params: vec![],
            tolerance: Some(Box::new(PlanExpr::lit(0.5))),
            declared: ValueType::Real,
        }),
        rhs: Box::new(PlanExpr::lit(100.0)),
    });
    plan.conditions.post = Some(PlanExpr::lit(true));
    rt.add_plan(plan).await?;
    let snap = rt.snapshot("watch").await?.unwrap();
    assert_eq!(snap.state, NodeState::Executing);
    // below threshold: nothing moves
    sim.update(temp.clone(), Value::Real(99.0));
    // above: the node leaves Executing
    sim.update(temp.clone(), Value::Real(100.5));
    loop {
        match rx.recv().await {
            None => bail!("runtime died"),
            Some(batch) => {
                let done = batch.iter().any(|ev| {
                    matches!(ev, RtEvent::Transition(t)
                        if &*t.node == "watch" && t.to == NodeState::Finishing)
                });
                if done {
                    break;
                }
            }
        }
    }
    Ok(())
}
