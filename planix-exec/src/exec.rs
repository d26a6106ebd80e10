//! The executive: owns the arenas, runs the quiescence loop.
//!
//! Each step snapshots the outside world (events are applied between
//! steps), fixes `time()`, then repeatedly evaluates candidate
//! nodes, resolves assignment conflicts, and applies transitions
//! until nothing moves. Commands, aborts and updates collected by
//! entry actions are handed to the dispatcher after the loop;
//! assignments are performed by the executive itself at the end of
//! the step.
use crate::{
    cache::StateCache,
    expr::{lookup, ExprGraph, ExprId, Wakes},
    node::{
        transition::{self, active_conds},
        Body, Dest, FailureType, Node, NodeId, NodeOutcome, NodeState, QueueStatus,
    },
    plan::{self, PlanNode},
    value::{CommandHandle, Value},
    CommandId, CommandRequest, Dispatcher, ExternalEvent, UpdateRequest,
};
use anyhow::Result;
use arcstr::ArcStr;
use fxhash::FxHashMap;
use log::{debug, error, info, warn};
use smallvec::SmallVec;
use std::{collections::VecDeque, mem};

/// One committed node transition, reported in step order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub node: ArcStr,
    pub from: NodeState,
    pub to: NodeState,
    pub outcome: NodeOutcome,
    pub failure: FailureType,
}

#[derive(Debug)]
enum Outbound {
    Command(CommandRequest),
    Abort(CommandId),
    Update(UpdateRequest),
}

#[derive(Debug)]
pub struct Exec<D: Dispatcher> {
    pub(crate) graph: ExprGraph,
    pub(crate) cache: StateCache,
    pub world: D,
    pub(crate) nodes: Vec<Node>,
    roots: Vec<NodeId>,
    by_ident: FxHashMap<ArcStr, NodeId>,
    commands: FxHashMap<CommandId, NodeId>,
    next_command: u64,
    candidates: VecDeque<NodeId>,
    /// Assignment nodes parked on a busy variable, with the variable
    /// they wait for.
    pending: Vec<(NodeId, ExprId)>,
    /// Base variable to the Assignment node currently holding it.
    var_owners: FxHashMap<ExprId, NodeId>,
    /// Assignments to perform at the end of the current step.
    assignments: Vec<NodeId>,
    /// Nodes whose iteration ended this step; their repeat-or-finish
    /// decision belongs to the next macro step.
    deferred: Vec<NodeId>,
    outbox: Vec<Outbound>,
    finished_roots: Vec<NodeId>,
    transitions: Vec<Transition>,
    wakes: Wakes,
    deliveries: Vec<(ExprId, Value)>,
    ran_any: bool,
}

impl<D: Dispatcher> Exec<D> {
    pub fn new(world: D) -> Self {
        Self {
            graph: ExprGraph::new(),
            cache: StateCache::new(),
            world,
            nodes: Vec::new(),
            roots: Vec::new(),
            by_ident: FxHashMap::default(),
            commands: FxHashMap::default(),
            next_command: 0,
            candidates: VecDeque::new(),
            pending: Vec::new(),
            var_owners: FxHashMap::default(),
            assignments: Vec::new(),
            deferred: Vec::new(),
            outbox: Vec::new(),
            finished_roots: Vec::new(),
            transitions: Vec::new(),
            wakes: Wakes::default(),
            deliveries: Vec::new(),
            ran_any: false,
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn node_by_ident(&self, ident: &str) -> Option<NodeId> {
        self.by_ident.get(ident).copied()
    }

    /// Read a variable visible in a node's scope, by name.
    pub fn var_value(&self, node: NodeId, name: &str) -> Option<Value> {
        let mut at = Some(node);
        while let Some(id) = at {
            let n = self.node(id);
            if let Some(b) = n.names.get(name) {
                return Some(self.graph.value_of(b.expr));
            }
            at = n.parent;
        }
        None
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Validate and load a plan; the root starts Inactive and is a
    /// candidate for its first transition on the next step.
    pub fn add_plan(&mut self, plan: &PlanNode) -> Result<NodeId> {
        plan::validate(plan)?;
        let root = plan::compile(self, plan)?;
        self.roots.push(root);
        self.ran_any = true;
        self.enqueue_candidate(root);
        info!("loaded plan {}", self.node(root).ident);
        Ok(root)
    }

    pub(crate) fn register_ident(&mut self, ident: ArcStr, id: NodeId) -> Result<()> {
        if self.by_ident.insert(ident.clone(), id).is_some() {
            anyhow::bail!("node identifier {ident} is not plan unique")
        }
        Ok(())
    }

    /// True when at least one plan has run and none remain loaded.
    pub fn all_plans_finished(&self) -> bool {
        self.ran_any
            && self
                .roots
                .iter()
                .all(|r| self.node(*r).state == NodeState::Finished)
    }

    /// Anything left for the quiescence loop to look at?
    pub fn needs_step(&self) -> bool {
        !self.candidates.is_empty() || !self.deferred.is_empty()
    }

    pub fn drain_transitions(&mut self) -> Vec<Transition> {
        mem::take(&mut self.transitions)
    }

    fn enqueue_candidate(&mut self, n: NodeId) {
        let node = self.node_mut(n);
        if node.queue == QueueStatus::None {
            node.queue = QueueStatus::Candidate;
            self.candidates.push_back(n);
        }
    }

    fn flush_wakes(&mut self) {
        let woken: SmallVec<[NodeId; 8]> = self.wakes.drain().collect();
        for n in woken {
            self.enqueue_candidate(n)
        }
    }

    /// Activate an expression on behalf of the plan loader.
    pub(crate) fn activate_expr(&mut self, e: ExprId) {
        let Self { graph, cache, world, wakes, .. } = self;
        graph.activate(e, cache, world, wakes);
        self.flush_wakes();
    }

    fn apply_deliveries(&mut self) {
        let mut dv = mem::take(&mut self.deliveries);
        lookup::apply_deliveries(
            &mut self.graph,
            &mut dv,
            &mut self.cache,
            &mut self.world,
            &mut self.wakes,
        );
        self.deliveries = dv;
        self.flush_wakes();
    }

    fn post_var(&mut self, id: ExprId, v: Value) {
        let Self { graph, cache, world, wakes, .. } = self;
        graph.set_value(id, v, cache, world, wakes);
        self.flush_wakes();
    }

    /// Apply a batch of inbound records, in delivery order, firing
    /// listeners after each. Must be called between steps.
    pub fn process_events(&mut self, events: impl IntoIterator<Item = ExternalEvent>) {
        for ev in events {
            debug!("external event {ev:?}");
            match ev {
                ExternalEvent::StateUpdate(state, v) => {
                    let Self { cache, world, deliveries, .. } = self;
                    cache.update_state(world, &state, v, deliveries);
                    self.apply_deliveries();
                }
                ExternalEvent::CommandAck(id, h) => match self.commands.get(&id) {
                    None => warn!("ack for unknown command {id}"),
                    Some(n) => match &self.node(*n).body {
                        Body::Command(c) => {
                            let var = c.ack_var;
                            self.post_var(var, Value::Handle(h))
                        }
                        b => panic!("command {id} maps to a non command node {b:?}"),
                    },
                },
                ExternalEvent::CommandReturn(id, v) => match self.commands.get(&id) {
                    None => warn!("return value for unknown command {id}"),
                    Some(n) => match &self.node(*n).body {
                        Body::Command(c) => match c.return_var {
                            None => warn!("command {id} has no return variable"),
                            Some(var) => {
                                let Self { graph, cache, world, wakes, .. } = self;
                                if let Err(e) =
                                    graph.assign(var, v, cache, world, wakes)
                                {
                                    error!("storing return value of {id}: {e:?}")
                                }
                                self.flush_wakes()
                            }
                        },
                        b => panic!("command {id} maps to a non command node {b:?}"),
                    },
                },
                ExternalEvent::CommandAbortAck(id, ok) => {
                    if !ok {
                        warn!("abort of command {id} reported failure")
                    }
                    match self.commands.get(&id) {
                        None => warn!("abort ack for unknown command {id}"),
                        Some(n) => match &self.node(*n).body {
                            Body::Command(c) => {
                                let var = c.abort_ack;
                                self.post_var(var, Value::Bool(true))
                            }
                            b => panic!("command {id} maps to a non command node {b:?}"),
                        },
                    }
                }
                ExternalEvent::UpdateAck(ident, ok) => {
                    if !ok {
                        warn!("update for node {ident} reported failure")
                    }
                    match self.by_ident.get(&ident).copied() {
                        None => warn!("update ack for unknown node {ident}"),
                        Some(n) => match &self.node(n).body {
                            Body::Update(u) => {
                                let var = u.ack_var;
                                self.post_var(var, Value::Bool(true))
                            }
                            b => {
                                warn!("update ack for non update node {ident} ({b:?})")
                            }
                        },
                    }
                }
            }
        }
    }

    /// Run one macro step: the full quiescence cycle at `now`.
    pub fn step(&mut self, now: f64) {
        debug!("step at {now}, {} candidates", self.candidates.len());
        {
            let Self { cache, world, deliveries, .. } = self;
            cache.begin_quiescence(world, now, deliveries);
        }
        self.apply_deliveries();
        // ended iterations decide repeat-or-finish now
        for n in mem::take(&mut self.deferred) {
            self.enqueue_candidate(n);
        }
        // parked assignments get another look every step
        let parked: Vec<(NodeId, ExprId)> = self.pending.drain(..).collect();
        for (n, _) in parked {
            self.node_mut(n).queue = QueueStatus::None;
            self.enqueue_candidate(n);
        }
        let mut trans: Vec<(NodeId, Dest)> = Vec::new();
        loop {
            while let Some(n) = self.candidates.pop_front() {
                if self.node(n).queue != QueueStatus::Candidate {
                    continue;
                }
                self.node_mut(n).queue = QueueStatus::None;
                let parent_state = match self.node(n).parent {
                    None => NodeState::Executing,
                    Some(p) => self.node(p).state,
                };
                let node = self.node(n);
                match transition::destination(node, parent_state, &self.graph) {
                    Some(d) if d.to != node.state => {
                        self.node_mut(n).queue = QueueStatus::Transition;
                        trans.push((n, d));
                    }
                    _ => (),
                }
            }
            if trans.is_empty() {
                break;
            }
            self.resolve_conflicts(&mut trans);
            if trans.is_empty() {
                continue;
            }
            // parents enter before children except on the way to
            // Finished, where children lead
            trans.sort_by_key(|(n, d)| {
                let depth = self.node(*n).depth;
                match d.to {
                    NodeState::Finished => (1u8, u32::MAX - depth),
                    _ => (0, depth),
                }
            });
            for (n, d) in mem::take(&mut trans) {
                self.apply_transition(n, d);
            }
            self.flush_wakes();
        }
        self.cache.end_quiescence();
        for o in mem::take(&mut self.outbox) {
            match o {
                Outbound::Command(c) => self.world.enqueue_command(c),
                Outbound::Abort(h) => self.world.abort_command(h),
                Outbound::Update(u) => self.world.enqueue_update(u),
            }
        }
        for n in mem::take(&mut self.assignments) {
            self.perform_assignment(n);
        }
        self.flush_wakes();
        self.note_finished_roots();
    }

    /// Step until the executive settles. Bounded: a diverging plan
    /// is an internal error.
    pub fn run_to_quiescence(&mut self, now: f64) {
        let mut guard = 0usize;
        loop {
            self.step(now);
            if !self.needs_step() {
                break;
            }
            guard += 1;
            assert!(guard < 1000, "quiescence loop did not settle");
        }
    }

    /// Among Assignment nodes headed for Executing, at most one per
    /// base variable proceeds: lowest priority integer wins, ties
    /// break on the node identifier. Losers park in the pending
    /// queue until the variable frees up.
    fn resolve_conflicts(&mut self, trans: &mut Vec<(NodeId, Dest)>) {
        let mut winners: FxHashMap<ExprId, NodeId> = FxHashMap::default();
        let mut losers: Vec<(NodeId, ExprId)> = Vec::new();
        for (n, d) in trans.iter() {
            if d.to != NodeState::Executing {
                continue;
            }
            let node = self.node(*n);
            let var = match &node.body {
                Body::Assignment(a) => a.target,
                _ => continue,
            };
            if self.var_owners.contains_key(&var) {
                losers.push((*n, var));
                continue;
            }
            match winners.get(&var).copied() {
                None => {
                    winners.insert(var, *n);
                }
                Some(w) => {
                    let wn = self.node(w);
                    let better = (node.priority, &node.ident) < (wn.priority, &wn.ident);
                    if better {
                        losers.push((w, var));
                        winners.insert(var, *n);
                    } else {
                        losers.push((*n, var));
                    }
                }
            }
        }
        for (n, var) in losers {
            debug!("{}: lost assignment conflict on {var}", self.node(n).ident);
            trans.retain(|(t, _)| *t != n);
            let node = self.node_mut(n);
            node.queue = QueueStatus::Pending;
            self.pending.push((n, var));
        }
    }

    /// Release an assignment variable and wake anything parked on it.
    fn release_var(&mut self, var: ExprId, owner: NodeId) {
        if self.var_owners.get(&var) == Some(&owner) {
            self.var_owners.remove(&var);
            let mut parked = mem::take(&mut self.pending);
            parked.retain(|(n, v)| {
                if *v == var {
                    self.node_mut(*n).queue = QueueStatus::None;
                    self.enqueue_candidate(*n);
                    false
                } else {
                    true
                }
            });
            self.pending = parked;
        }
    }

    fn body_exprs(&self, n: NodeId) -> SmallVec<[ExprId; 4]> {
        let mut out = SmallVec::new();
        match &self.node(n).body {
            Body::Empty | Body::List => (),
            Body::Command(c) => {
                out.push(c.name);
                out.extend(c.args.iter().copied());
            }
            Body::Assignment(a) => {
                out.push(a.rhs);
                out.extend(a.index);
            }
            Body::Update(u) => out.extend(u.pairs.iter().map(|(_, e)| *e)),
        }
        out
    }

    fn activate_body(&mut self, n: NodeId) {
        if !self.node(n).body_active {
            self.node_mut(n).body_active = true;
            for e in self.body_exprs(n) {
                let Self { graph, cache, world, wakes, .. } = self;
                graph.activate(e, cache, world, wakes);
            }
            self.flush_wakes();
        }
    }

    fn deactivate_body(&mut self, n: NodeId) {
        if self.node(n).body_active {
            self.node_mut(n).body_active = false;
            for e in self.body_exprs(n) {
                let Self { graph, cache, world, .. } = self;
                graph.deactivate(e, cache, world);
            }
        }
    }

    fn activate_locals(&mut self, n: NodeId) {
        if !self.node(n).vars_active {
            self.node_mut(n).vars_active = true;
            let locals: SmallVec<[ExprId; 4]> =
                self.node(n).locals.iter().copied().collect();
            for v in locals {
                let Self { graph, cache, world, wakes, .. } = self;
                graph.activate(v, cache, world, wakes);
            }
            self.flush_wakes();
        }
    }

    fn deactivate_locals(&mut self, n: NodeId) {
        if self.node(n).vars_active {
            self.node_mut(n).vars_active = false;
            let locals: SmallVec<[ExprId; 4]> =
                self.node(n).locals.iter().copied().collect();
            for v in locals {
                let Self { graph, cache, world, .. } = self;
                graph.deactivate(v, cache, world);
            }
        }
    }

    fn reset_locals(&mut self, n: NodeId) {
        let locals: SmallVec<[ExprId; 4]> =
            self.node(n).locals.iter().copied().collect();
        for v in locals {
            let Self { graph, cache, world, wakes, .. } = self;
            graph.reset_var(v, cache, world, wakes);
        }
        self.flush_wakes();
    }

    /// Tear down whatever an action left behind when the iteration
    /// is over: body expressions, the assignment reservation, the
    /// command handle mapping.
    fn finish_action(&mut self, n: NodeId) {
        self.deactivate_body(n);
        let mut release = None;
        let mut done_cmd = None;
        match &mut self.node_mut(n).body {
            Body::Assignment(a) => release = Some(a.target),
            Body::Command(c) => done_cmd = c.handle.take(),
            _ => (),
        }
        if let Some(var) = release {
            self.release_var(var, n);
        }
        if let Some(h) = done_cmd {
            self.commands.remove(&h);
        }
    }

    fn switch_conds(&mut self, n: NodeId, from: NodeState, to: NodeState) {
        let kind = self.node(n).kind;
        let old = active_conds(kind, from);
        let new = active_conds(kind, to);
        // conditions active in both states keep their activation, so
        // a lookup watched across the transition is not re-registered
        for c in (old & !new).iter() {
            let e = self.node(n).cond(c);
            let Self { graph, cache, world, .. } = self;
            graph.deactivate(e, cache, world);
        }
        for c in (new & !old).iter() {
            let e = self.node(n).cond(c);
            let Self { graph, cache, world, wakes, .. } = self;
            graph.activate(e, cache, world, wakes);
        }
        self.flush_wakes();
    }

    fn apply_transition(&mut self, n: NodeId, d: Dest) {
        let from = self.node(n).state;
        assert!(
            self.node(n).queue == QueueStatus::Transition,
            "{} transitioned while not in the transition queue",
            self.node(n).ident
        );
        self.node_mut(n).queue = QueueStatus::None;
        self.switch_conds(n, from, d.to);
        match d.to {
            NodeState::Waiting => {
                if from == NodeState::Inactive {
                    self.activate_locals(n);
                } else {
                    // repeating: fresh variables, fresh outcome
                    self.reset_locals(n);
                    let node = self.node_mut(n);
                    node.outcome = NodeOutcome::None;
                    node.failure = FailureType::None;
                }
            }
            NodeState::Executing => {
                self.activate_body(n);
                self.enter_executing(n);
            }
            NodeState::Finishing => (),
            NodeState::Failing => self.enter_failing(n),
            NodeState::IterationEnded => self.finish_action(n),
            NodeState::Finished => {
                self.finish_action(n);
                self.deactivate_locals(n);
                if self.node(n).is_root() {
                    self.finished_roots.push(n);
                }
            }
            NodeState::Inactive => {
                // full reset so the next parent iteration starts clean
                self.finish_action(n);
                self.deactivate_locals(n);
                self.reset_locals(n);
                let node = self.node_mut(n);
                node.outcome = NodeOutcome::None;
                node.failure = FailureType::None;
            }
        }
        if let Some((o, f)) = d.outcome {
            let node = self.node_mut(n);
            node.outcome = o;
            node.failure = f;
        }
        self.node_mut(n).state = d.to;
        let (ident, state_var, outcome, failure) = {
            let node = self.node(n);
            (node.ident.clone(), node.state_var, node.outcome, node.failure)
        };
        debug!("{ident}: {from} -> {} ({outcome})", d.to);
        self.transitions.push(Transition { node: ident, from, to: d.to, outcome, failure });
        self.post_var(state_var, d.to.as_value());
        if d.to == NodeState::IterationEnded {
            // the iteration boundary is also a macro step boundary;
            // deferring the repeat-or-finish decision is what bounds
            // the quiescence loop for repeating nodes
            self.deferred.push(n);
        } else {
            // other chained transitions happen within the same step
            self.enqueue_candidate(n);
        }
    }

    /// Entry actions specific to Executing: fix the assignment
    /// save, issue the command or update.
    fn enter_executing(&mut self, n: NodeId) {
        match &self.node(n).body {
            Body::Empty | Body::List => (),
            Body::Assignment(a) => {
                let (target, done) = (a.target, a.done);
                self.graph.save_var(target);
                self.post_var(done, Value::Bool(false));
                self.var_owners.insert(target, n);
                self.assignments.push(n);
            }
            Body::Command(c) => {
                let (name_e, ack, abort_ack, ret) =
                    (c.name, c.ack_var, c.abort_ack, c.return_var);
                let args: Vec<Value> =
                    c.args.iter().map(|a| self.graph.value_of(*a)).collect();
                self.post_var(ack, Value::Unknown);
                self.post_var(abort_ack, Value::Bool(false));
                let name = match self.graph.value_of(name_e) {
                    Value::Str(s) => s,
                    v => {
                        error!(
                            "{}: command name is not a String: {v}",
                            self.node(n).ident
                        );
                        // deny the command locally; the default post
                        // condition turns this into a failure
                        self.post_var(ack, Value::Handle(CommandHandle::Denied));
                        return;
                    }
                };
                self.next_command += 1;
                let handle = CommandId(self.next_command);
                match &mut self.node_mut(n).body {
                    Body::Command(c) => c.handle = Some(handle),
                    _ => unreachable!(),
                }
                self.commands.insert(handle, n);
                debug!("{}: command {name} issued as {handle}", self.node(n).ident);
                self.outbox.push(Outbound::Command(CommandRequest {
                    handle,
                    name,
                    args,
                    return_var: ret,
                    ack_var: ack,
                }));
            }
            Body::Update(u) => {
                let ack = u.ack_var;
                let pairs: Vec<(ArcStr, Value)> = u
                    .pairs
                    .iter()
                    .map(|(k, e)| (k.clone(), self.graph.value_of(*e)))
                    .collect();
                let ident = self.node(n).ident.clone();
                self.post_var(ack, Value::Bool(false));
                self.outbox.push(Outbound::Update(UpdateRequest { node: ident, pairs }));
            }
        }
    }

    /// Entry actions specific to Failing: abort the command if it is
    /// still outstanding, roll back the assignment.
    fn enter_failing(&mut self, n: NodeId) {
        match &self.node(n).body {
            Body::Empty | Body::List => (),
            Body::Update(_) => (),
            Body::Assignment(a) => {
                let target = a.target;
                let Self { graph, cache, world, wakes, .. } = self;
                graph.restore_var(target, cache, world, wakes);
                self.flush_wakes();
            }
            Body::Command(c) => {
                let (ack, abort_ack, handle) = (c.ack_var, c.abort_ack, c.handle);
                let acked = match self.graph.value_of(ack) {
                    Value::Handle(h) => h.is_terminal(),
                    _ => false,
                };
                match handle {
                    Some(h) if !acked => {
                        debug!("{}: aborting {h}", self.node(n).ident);
                        self.outbox.push(Outbound::Abort(h));
                    }
                    _ => {
                        // nothing left to abort
                        self.post_var(abort_ack, Value::Bool(true));
                    }
                }
            }
        }
    }

    /// Perform one scheduled assignment. Failures here are runtime
    /// expression errors: the node is failed in place and the target
    /// keeps its saved value.
    fn perform_assignment(&mut self, n: NodeId) {
        if self.node(n).state != NodeState::Executing {
            // aborted before the write happened
            return;
        }
        let (target, index, rhs, done) = match &self.node(n).body {
            Body::Assignment(a) => (a.target, a.index, a.rhs, a.done),
            b => panic!("scheduled assignment on non assignment node {b:?}"),
        };
        let v = self.graph.value_of(rhs);
        let res = match index {
            None => {
                let Self { graph, cache, world, wakes, .. } = self;
                graph.assign(target, v, cache, world, wakes)
            }
            Some(ix) => match self.graph.value_of(ix) {
                Value::Int(i) => {
                    let Self { graph, cache, world, wakes, .. } = self;
                    graph.assign_element(target, i as i64, v, cache, world, wakes)
                }
                ix => Err(anyhow::anyhow!("array index is not an Integer: {ix}")),
            },
        };
        self.flush_wakes();
        match res {
            Ok(()) => self.post_var(done, Value::Bool(true)),
            Err(e) => {
                error!("{}: assignment failed: {e:?}", self.node(n).ident);
                self.force_finish(n, FailureType::PostConditionFailed);
            }
        }
    }

    /// Fail a node in place after a fatal action error, without
    /// unwinding anything else.
    fn force_finish(&mut self, n: NodeId, failure: FailureType) {
        let from = self.node(n).state;
        let kind = self.node(n).kind;
        for c in active_conds(kind, from).iter() {
            let e = self.node(n).cond(c);
            let Self { graph, cache, world, .. } = self;
            graph.deactivate(e, cache, world);
        }
        self.finish_action(n);
        self.deactivate_locals(n);
        {
            let node = self.node_mut(n);
            node.state = NodeState::Finished;
            node.outcome = NodeOutcome::Failure;
            node.failure = failure;
            node.queue = QueueStatus::None;
        }
        let (ident, state_var) = {
            let node = self.node(n);
            (node.ident.clone(), node.state_var)
        };
        warn!("{ident}: failed in place ({failure})");
        self.transitions.push(Transition {
            node: ident,
            from,
            to: NodeState::Finished,
            outcome: NodeOutcome::Failure,
            failure,
        });
        self.post_var(state_var, NodeState::Finished.as_value());
        if self.node(n).is_root() {
            self.finished_roots.push(n);
        }
    }

    fn note_finished_roots(&mut self) {
        for n in mem::take(&mut self.finished_roots) {
            self.node_mut(n).queue = QueueStatus::FinishedRoot;
            info!("plan {} finished: {}", self.node(n).ident, self.node(n).outcome);
        }
    }

    /// Drop root nodes that reached Finished from the executive's
    /// root table. Their arena records stay behind, inert, with
    /// every condition and variable deactivated. The application
    /// decides when; typically after each step batch.
    pub fn delete_finished_plans(&mut self) {
        let nodes = &self.nodes;
        self.roots.retain(|r| nodes[r.0 as usize].state != NodeState::Finished);
    }
}
