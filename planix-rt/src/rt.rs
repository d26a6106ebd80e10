//! The runtime event loop.
use crate::{NodeSnapshot, RtConfig, RtEvent, ToRt, World};
use anyhow::Result;
use log::{debug, warn};
use planix_exec::{node::NodeState, Exec};
use std::time::Duration;
use tokio::{
    sync::mpsc::UnboundedReceiver,
    time::{self, Instant},
};

pub(crate) struct Rt<W: World> {
    exec: Exec<W>,
    sub: tokio::sync::mpsc::Sender<Vec<RtEvent>>,
    tick: Option<Duration>,
}

async fn maybe_tick(at: &mut Option<time::Interval>) -> Instant {
    match at {
        None => std::future::pending().await,
        Some(i) => i.tick().await,
    }
}

impl<W: World> Rt<W> {
    pub(crate) fn new(cfg: RtConfig<W>) -> Self {
        Self { exec: Exec::new(cfg.world), sub: cfg.sub, tick: cfg.tick }
    }

    /// Step to quiescence and publish whatever happened.
    async fn step_batch(&mut self) {
        let now = self.exec.world.current_time();
        let mut guard = 0usize;
        loop {
            self.exec.step(now);
            if !self.exec.needs_step() {
                break;
            }
            guard += 1;
            if guard > 1000 {
                warn!("executive did not settle at {now}, deferring to next wake");
                break;
            }
        }
        let batch: Vec<RtEvent> = self
            .exec
            .drain_transitions()
            .into_iter()
            .flat_map(|t| {
                let finished = t.to == NodeState::Finished
                    && self
                        .exec
                        .node_by_ident(&t.node)
                        .map(|n| self.exec.node(n).is_root())
                        .unwrap_or(false);
                let done = finished.then(|| RtEvent::PlanFinished(t.node.clone()));
                std::iter::once(RtEvent::Transition(t)).chain(done)
            })
            .collect();
        self.exec.delete_finished_plans();
        if !batch.is_empty() {
            if self.sub.send(batch).await.is_err() {
                debug!("no subscriber for step batch")
            }
        }
    }

    fn handle(&mut self, m: ToRt) {
        match m {
            ToRt::AddPlan { plan, res } => {
                let r = self.exec.add_plan(&plan).map(|id| self.exec.node(id).ident.clone());
                let _ = res.send(r);
            }
            ToRt::Inject { events } => self.exec.process_events(events),
            ToRt::Snapshot { ident, res } => {
                let snap = self.exec.node_by_ident(&ident).map(|id| {
                    let n = self.exec.node(id);
                    NodeSnapshot {
                        ident: n.ident.clone(),
                        state: n.state,
                        outcome: n.outcome,
                        failure: n.failure,
                    }
                });
                let _ = res.send(snap);
            }
        }
    }

    pub(crate) async fn run(mut self, mut to_rt: UnboundedReceiver<ToRt>) -> Result<()> {
        let mut ticker = self.tick.map(time::interval);
        let mut input: Vec<ToRt> = Vec::new();
        'main: loop {
            tokio::select! {
                n = to_rt.recv_many(&mut input, 1000) => {
                    if n == 0 {
                        break 'main Ok(());
                    }
                    for m in input.drain(..) {
                        self.handle(m);
                    }
                }
                evs = self.exec.world.poll() => {
                    self.exec.process_events(evs);
                }
                _ = maybe_tick(&mut ticker) => (),
            }
            // drain anything else that is already waiting so one
            // step sees the whole batch
            while let Ok(m) = to_rt.try_recv() {
                self.handle(m);
            }
            self.step_batch().await;
        }
    }
}
