//! Plan input: the resolved records a parser hands the core.
//!
//! The records are plain serde data so front ends can produce them
//! in any format. [`validate`] surfaces every plan error before the
//! first step; [`compile`] then builds the node tree and its
//! expressions bottom up, which keeps the dependency graph a DAG by
//! construction. Compilation happens in two passes: a skeleton pass
//! creating nodes, scopes and variables top down, and a wiring pass
//! compiling conditions and bodies once every name and node-state
//! variable exists.
use crate::{
    cache::LookupKind,
    exec::Exec,
    expr::{ArithOp, CmpOp, ExprId, ExprKind, Listener, LookupState, VarState},
    node::{
        Binding, Body, AssignBody, CommandBody, Cond, Node, NodeId, NodeKind,
        NodeOutcome, NodeState, FailureType, QueueStatus, UpdateBody, NCONDS,
    },
    value::{ArrayValue, Value, ValueType},
    Dispatcher,
};
use anyhow::{anyhow, bail, Context, Result};
use arcstr::ArcStr;
use fxhash::{FxHashMap, FxHashSet};

/// An expression tree in a plan. Variable references are by name,
/// resolved lexically through the node's scope at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PlanExpr {
    Lit(Value),
    Ref(ArcStr),
    Not(Box<PlanExpr>),
    And(Vec<PlanExpr>),
    Or(Vec<PlanExpr>),
    Xor(Vec<PlanExpr>),
    Cmp { op: CmpOp, lhs: Box<PlanExpr>, rhs: Box<PlanExpr> },
    Arith { op: ArithOp, args: Vec<PlanExpr> },
    Concat(Vec<PlanExpr>),
    Index { array: Box<PlanExpr>, index: Box<PlanExpr> },
    IsKnown(Box<PlanExpr>),
    Lookup {
        kind: LookupKind,
        name: Box<PlanExpr>,
        #[serde(default)]
        params: Vec<PlanExpr>,
        #[serde(default)]
        tolerance: Option<Box<PlanExpr>>,
        declared: ValueType,
    },
}

impl PlanExpr {
    pub fn lit(v: impl Into<Value>) -> Self {
        PlanExpr::Lit(v.into())
    }

    pub fn var(name: impl Into<ArcStr>) -> Self {
        PlanExpr::Ref(name.into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarDecl {
    pub name: ArcStr,
    pub typ: ValueType,
    #[serde(default)]
    pub konst: bool,
    #[serde(default)]
    pub init: Option<PlanExpr>,
    /// Arrays only: the fixed maximum length.
    #[serde(default)]
    pub max_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterfaceMode {
    In,
    InOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceDecl {
    pub name: ArcStr,
    pub mode: InterfaceMode,
}

/// The eight user suppliable conditions. Missing entries get the
/// standard defaults at load time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conditions {
    #[serde(default)]
    pub skip: Option<PlanExpr>,
    #[serde(default)]
    pub start: Option<PlanExpr>,
    #[serde(default)]
    pub pre: Option<PlanExpr>,
    #[serde(default)]
    pub end: Option<PlanExpr>,
    #[serde(default)]
    pub post: Option<PlanExpr>,
    #[serde(default)]
    pub invariant: Option<PlanExpr>,
    #[serde(default)]
    pub exit: Option<PlanExpr>,
    #[serde(default)]
    pub repeat: Option<PlanExpr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PlanBody {
    Empty,
    List {
        children: Vec<PlanNode>,
    },
    LibraryCall {
        node: Box<PlanNode>,
    },
    Command {
        name: Box<PlanExpr>,
        #[serde(default)]
        args: Vec<PlanExpr>,
        /// Name of an in scope variable receiving the return value.
        #[serde(default)]
        returns: Option<ArcStr>,
    },
    Assignment {
        target: ArcStr,
        #[serde(default)]
        index: Option<Box<PlanExpr>>,
        value: Box<PlanExpr>,
    },
    Update {
        pairs: Vec<(ArcStr, PlanExpr)>,
    },
}

impl PlanBody {
    pub fn kind(&self) -> NodeKind {
        match self {
            PlanBody::Empty => NodeKind::Empty,
            PlanBody::List { .. } => NodeKind::List,
            PlanBody::LibraryCall { .. } => NodeKind::LibraryCall,
            PlanBody::Command { .. } => NodeKind::Command,
            PlanBody::Assignment { .. } => NodeKind::Assignment,
            PlanBody::Update { .. } => NodeKind::Update,
        }
    }

    fn children(&self) -> &[PlanNode] {
        match self {
            PlanBody::List { children } => children,
            PlanBody::LibraryCall { node } => std::slice::from_ref(node),
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: ArcStr,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub variables: Vec<VarDecl>,
    #[serde(default)]
    pub interface: Vec<InterfaceDecl>,
    #[serde(default)]
    pub conditions: Conditions,
    pub body: PlanBody,
}

//
// validation
//

struct Scope<'a> {
    names: FxHashMap<ArcStr, (ValueType, bool)>,
    parent: Option<&'a Scope<'a>>,
}

impl<'a> Scope<'a> {
    fn find(&self, name: &str) -> Option<(ValueType, bool)> {
        match self.names.get(name) {
            Some(b) => Some(*b),
            None => self.parent.and_then(|p| p.find(name)),
        }
    }
}

fn bool_typed(t: ValueType) -> bool {
    matches!(t, ValueType::Bool | ValueType::Unknown)
}

/// Evaluate an initial-value expression at load time. Only literal
/// leaves are allowed; anything that needs the running graph is a
/// plan error.
fn const_eval(e: &PlanExpr) -> Result<Value> {
    use crate::expr::op;
    match e {
        PlanExpr::Lit(v) => Ok(v.clone()),
        PlanExpr::Not(a) => Ok(op::eval_not(&const_eval(a)?)),
        PlanExpr::And(xs) => {
            let vs = xs.iter().map(const_eval).collect::<Result<Vec<_>>>()?;
            Ok(op::eval_and(vs.into_iter()))
        }
        PlanExpr::Or(xs) => {
            let vs = xs.iter().map(const_eval).collect::<Result<Vec<_>>>()?;
            Ok(op::eval_or(vs.into_iter()))
        }
        PlanExpr::Cmp { op: o, lhs, rhs } => {
            Ok(op::eval_cmp(*o, &const_eval(lhs)?, &const_eval(rhs)?))
        }
        PlanExpr::Arith { op: o, args } => {
            let vs = args.iter().map(const_eval).collect::<Result<Vec<_>>>()?;
            op::eval_arith(*o, &vs)
        }
        PlanExpr::Concat(xs) => {
            let vs = xs.iter().map(const_eval).collect::<Result<Vec<_>>>()?;
            Ok(op::eval_concat(vs.into_iter()))
        }
        e => bail!("initial value must be constant, found {e:?}"),
    }
}

fn expr_type(e: &PlanExpr, scope: &Scope) -> Result<ValueType> {
    match e {
        PlanExpr::Lit(v) => Ok(v.value_type()),
        PlanExpr::Ref(name) => match scope.find(name) {
            Some((t, _)) => Ok(t),
            None => bail!("unresolved variable reference {name}"),
        },
        PlanExpr::Not(a) => {
            let t = expr_type(a, scope)?;
            if !bool_typed(t) {
                bail!("NOT over a non Boolean ({t})")
            }
            Ok(ValueType::Bool)
        }
        PlanExpr::And(xs) | PlanExpr::Or(xs) | PlanExpr::Xor(xs) => {
            if xs.is_empty() {
                bail!("logical operator with no operands")
            }
            for x in xs {
                let t = expr_type(x, scope)?;
                if !bool_typed(t) {
                    bail!("logical operator over a non Boolean ({t})")
                }
            }
            Ok(ValueType::Bool)
        }
        PlanExpr::Cmp { op, lhs, rhs } => {
            let lt = expr_type(lhs, scope)?;
            let rt = expr_type(rhs, scope)?;
            match op {
                CmpOp::Eq | CmpOp::Ne => (),
                _ => {
                    let numeric = |t: ValueType| t.is_numeric() || t == ValueType::Unknown;
                    if !numeric(lt) || !numeric(rt) {
                        bail!("ordering comparison over non numeric types {lt}, {rt}")
                    }
                }
            }
            Ok(ValueType::Bool)
        }
        PlanExpr::Arith { op, args } => {
            if let Some(n) = op.arity() {
                if args.len() != n {
                    bail!("{op:?} takes {n} operands, got {}", args.len())
                }
            } else if args.is_empty() {
                bail!("{op:?} takes at least one operand")
            }
            let mut all_int = true;
            for a in args {
                let t = expr_type(a, scope)?;
                match t {
                    ValueType::Int => (),
                    ValueType::Real | ValueType::Unknown => all_int = false,
                    t => bail!("arithmetic over a non numeric type ({t})"),
                }
            }
            Ok(op.result_type(all_int))
        }
        PlanExpr::Concat(xs) => {
            for x in xs {
                expr_type(x, scope)?;
            }
            Ok(ValueType::Str)
        }
        PlanExpr::Index { array, index } => {
            let at = expr_type(array, scope)?;
            let it = expr_type(index, scope)?;
            if !matches!(it, ValueType::Int | ValueType::Unknown) {
                bail!("array subscript must be an Integer, found {it}")
            }
            match at {
                ValueType::Array(e) => Ok(e.into()),
                t => bail!("subscript of a non array type ({t})"),
            }
        }
        PlanExpr::IsKnown(a) => {
            expr_type(a, scope)?;
            Ok(ValueType::Bool)
        }
        PlanExpr::Lookup { name, params, tolerance, declared, .. } => {
            let nt = expr_type(name, scope)?;
            if !matches!(nt, ValueType::Str | ValueType::Unknown) {
                bail!("lookup state name must be a String, found {nt}")
            }
            for p in params {
                expr_type(p, scope)?;
            }
            if let Some(t) = tolerance {
                let tt = expr_type(t, scope)?;
                if !matches!(tt, ValueType::Int | ValueType::Real | ValueType::Unknown) {
                    bail!("lookup tolerance must be numeric, found {tt}")
                }
            }
            Ok(*declared)
        }
    }
}

fn initial_value(d: &VarDecl) -> Result<Value> {
    let v = match &d.init {
        None => match d.typ {
            ValueType::Array(elem) => {
                let max = d
                    .max_size
                    .ok_or_else(|| anyhow!("array variable {} has no max size", d.name))?;
                Value::Array(ArrayValue::unknown(elem, max))
            }
            _ => Value::Unknown,
        },
        Some(e) => {
            let v = const_eval(e)
                .with_context(|| format!("initial value of {}", d.name))?;
            match (&v, d.typ) {
                (Value::Array(a), ValueType::Array(elem)) => {
                    if a.elem != elem {
                        bail!("array variable {} initialized with {} elements",
                            d.name, ValueType::from(a.elem))
                    }
                    let max = d.max_size.unwrap_or(a.max);
                    if a.len() > max {
                        bail!(
                            "array literal of {} elements exceeds {}'s max {max}",
                            a.len(),
                            d.name
                        )
                    }
                    // pad to the declared size; unset elements are Unknown
                    let mut elems = a.elems().to_vec();
                    elems.resize(max, Value::Unknown);
                    Value::Array(ArrayValue::new(elem, max, elems)?)
                }
                (v, t) => {
                    if !t.accepts(v.value_type()) {
                        bail!(
                            "variable {} declared {t} initialized with a {}",
                            d.name,
                            v.value_type()
                        )
                    }
                    v.clone()
                }
            }
        }
    };
    Ok(v)
}

fn validate_node(
    plan: &PlanNode,
    idents: &mut FxHashSet<ArcStr>,
    parent: Option<&Scope>,
) -> Result<()> {
    if !idents.insert(plan.id.clone()) {
        bail!("node identifier {} is not plan unique", plan.id)
    }
    let mut names: FxHashMap<ArcStr, (ValueType, bool)> = FxHashMap::default();
    for d in &plan.variables {
        if names.contains_key(&d.name) {
            bail!("variable {} declared twice in node {}", d.name, plan.id)
        }
        initial_value(d).with_context(|| format!("in node {}", plan.id))?;
        names.insert(d.name.clone(), (d.typ, !d.konst));
    }
    for i in &plan.interface {
        let Some(p) = parent else {
            bail!("interface variable {} in root node {}", i.name, plan.id)
        };
        let Some((t, writable)) = p.find(&i.name) else {
            bail!("interface variable {} of node {} is unresolved", i.name, plan.id)
        };
        let writable = writable && i.mode == InterfaceMode::InOut;
        names.insert(i.name.clone(), (t, writable));
    }
    let scope = Scope { names, parent };
    let conds = [
        ("SkipCondition", &plan.conditions.skip),
        ("StartCondition", &plan.conditions.start),
        ("PreCondition", &plan.conditions.pre),
        ("EndCondition", &plan.conditions.end),
        ("PostCondition", &plan.conditions.post),
        ("InvariantCondition", &plan.conditions.invariant),
        ("ExitCondition", &plan.conditions.exit),
        ("RepeatCondition", &plan.conditions.repeat),
    ];
    for (what, c) in conds {
        if let Some(e) = c {
            let t = expr_type(e, &scope)
                .with_context(|| format!("{what} of node {}", plan.id))?;
            if !bool_typed(t) {
                bail!("{what} of node {} is {t}, not Boolean", plan.id)
            }
        }
    }
    match &plan.body {
        PlanBody::Empty | PlanBody::List { .. } | PlanBody::LibraryCall { .. } => (),
        PlanBody::Command { name, args, returns } => {
            let nt = expr_type(name, &scope)
                .with_context(|| format!("command name of node {}", plan.id))?;
            if !matches!(nt, ValueType::Str | ValueType::Unknown) {
                bail!("command name of node {} is {nt}, not a String", plan.id)
            }
            for a in args {
                expr_type(a, &scope)
                    .with_context(|| format!("command argument of node {}", plan.id))?;
            }
            if let Some(r) = returns {
                let Some((_, writable)) = scope.find(r) else {
                    bail!("return variable {r} of node {} is unresolved", plan.id)
                };
                if !writable {
                    bail!("return variable {r} of node {} is not assignable", plan.id)
                }
            }
        }
        PlanBody::Assignment { target, index, value } => {
            let Some((tt, writable)) = scope.find(target) else {
                bail!("assignment target {target} of node {} is unresolved", plan.id)
            };
            if !writable {
                bail!("assignment to read only variable {target} in node {}", plan.id)
            }
            let vt = expr_type(value, &scope)
                .with_context(|| format!("assignment value of node {}", plan.id))?;
            match index {
                None => {
                    if !tt.accepts(vt) {
                        bail!(
                            "cannot assign a {vt} to {target} ({tt}) in node {}",
                            plan.id
                        )
                    }
                }
                Some(ix) => {
                    let ValueType::Array(elem) = tt else {
                        bail!("element assignment to non array {target} in node {}",
                            plan.id)
                    };
                    let it = expr_type(ix, &scope)?;
                    if !matches!(it, ValueType::Int | ValueType::Unknown) {
                        bail!("array index of node {} is {it}, not Integer", plan.id)
                    }
                    if !ValueType::from(elem).accepts(vt) {
                        bail!(
                            "cannot assign a {vt} element to {target} in node {}",
                            plan.id
                        )
                    }
                }
            }
        }
        PlanBody::Update { pairs } => {
            for (k, e) in pairs {
                expr_type(e, &scope)
                    .with_context(|| format!("update pair {k} of node {}", plan.id))?;
            }
        }
    }
    for c in plan.body.children() {
        validate_node(c, idents, Some(&scope))?;
    }
    Ok(())
}

/// Check a plan without touching the executive. Every error a plan
/// can carry statically surfaces here, before the first step.
pub fn validate(plan: &PlanNode) -> Result<()> {
    let mut idents = FxHashSet::default();
    validate_node(plan, &mut idents, None)
}

//
// compilation
//

fn resolve<D: Dispatcher>(
    exec: &Exec<D>,
    mut at: Option<NodeId>,
    name: &str,
) -> Option<Binding> {
    while let Some(id) = at {
        let n = exec.node(id);
        if let Some(b) = n.names.get(name) {
            return Some(*b);
        }
        at = n.parent;
    }
    None
}

/// Skeleton pass: create the node record, its scope, its variables
/// and its node-state variable, then recurse into children.
fn skeleton<D: Dispatcher>(
    exec: &mut Exec<D>,
    plan: &PlanNode,
    parent: Option<NodeId>,
    depth: u32,
) -> Result<NodeId> {
    let id = NodeId(exec.nodes.len() as u32);
    exec.register_ident(plan.id.clone(), id)?;
    let state_var = exec.graph.add_var(VarState::new(
        ValueType::Int,
        NodeState::Inactive.as_value(),
        false,
    ));
    // node-state variables are live for the life of the plan
    exec.activate_expr(state_var);
    let mut names: FxHashMap<ArcStr, Binding> = FxHashMap::default();
    let mut locals = Vec::new();
    for d in &plan.variables {
        let init = initial_value(d)?;
        let var = exec.graph.add_var(VarState::new(d.typ, init, d.konst));
        names.insert(d.name.clone(), Binding { expr: var, writable: !d.konst });
        locals.push(var);
    }
    for i in &plan.interface {
        let b = resolve(exec, parent, &i.name)
            .ok_or_else(|| anyhow!("interface variable {} is unresolved", i.name))?;
        names.insert(
            i.name.clone(),
            Binding { expr: b.expr, writable: b.writable && i.mode == InterfaceMode::InOut },
        );
    }
    // internal variables the action machinery needs; they live with
    // the locals so their activation follows the node's life cycle
    let unknown = exec.graph.konst_unknown();
    let body = match &plan.body {
        PlanBody::Empty => Body::Empty,
        PlanBody::List { .. } | PlanBody::LibraryCall { .. } => Body::List,
        PlanBody::Command { .. } => {
            let ack_var = exec
                .graph
                .add_var(VarState::new(ValueType::Handle, Value::Unknown, false));
            let abort_ack = exec
                .graph
                .add_var(VarState::new(ValueType::Bool, Value::Bool(false), false));
            locals.push(ack_var);
            locals.push(abort_ack);
            Body::Command(CommandBody {
                name: unknown,
                args: Vec::new(),
                ack_var,
                abort_ack,
                return_var: None,
                handle: None,
            })
        }
        PlanBody::Assignment { .. } => {
            let done = exec
                .graph
                .add_var(VarState::new(ValueType::Bool, Value::Bool(false), false));
            locals.push(done);
            Body::Assignment(AssignBody { target: unknown, index: None, rhs: unknown, done })
        }
        PlanBody::Update { .. } => {
            let ack_var = exec
                .graph
                .add_var(VarState::new(ValueType::Bool, Value::Bool(false), false));
            locals.push(ack_var);
            Body::Update(UpdateBody { pairs: Vec::new(), ack_var })
        }
    };
    exec.nodes.push(Node {
        ident: plan.id.clone(),
        kind: plan.body.kind(),
        state: NodeState::Inactive,
        outcome: NodeOutcome::None,
        failure: FailureType::None,
        parent,
        depth,
        children: Vec::new(),
        conds: [unknown; NCONDS],
        state_var,
        locals,
        names,
        body,
        priority: plan.priority,
        queue: QueueStatus::None,
        vars_active: false,
        body_active: false,
    });
    let mut children = Vec::new();
    for c in plan.body.children() {
        let cid = skeleton(exec, c, Some(id), depth + 1)?;
        children.push(cid);
    }
    // children watch the parent's state for their own transitions
    for c in &children {
        exec.graph.add_listener(state_var, Listener::Node(*c));
    }
    exec.node_mut(id).children = children;
    Ok(id)
}

fn compile_expr<D: Dispatcher>(
    exec: &mut Exec<D>,
    at: NodeId,
    e: &PlanExpr,
) -> Result<ExprId> {
    let id = match e {
        PlanExpr::Lit(v) => exec.graph.add_const(v.clone()),
        PlanExpr::Ref(name) => {
            resolve(exec, Some(at), name)
                .ok_or_else(|| anyhow!("unresolved variable reference {name}"))?
                .expr
        }
        PlanExpr::Not(a) => {
            let a = compile_expr(exec, at, a)?;
            exec.graph.add(ExprKind::Not(a))
        }
        PlanExpr::And(xs) => {
            let xs = compile_all(exec, at, xs)?;
            exec.graph.add(ExprKind::And(xs))
        }
        PlanExpr::Or(xs) => {
            let xs = compile_all(exec, at, xs)?;
            exec.graph.add(ExprKind::Or(xs))
        }
        PlanExpr::Xor(xs) => {
            let xs = compile_all(exec, at, xs)?;
            exec.graph.add(ExprKind::Xor(xs))
        }
        PlanExpr::Cmp { op, lhs, rhs } => {
            let lhs = compile_expr(exec, at, lhs)?;
            let rhs = compile_expr(exec, at, rhs)?;
            exec.graph.add(ExprKind::Cmp(*op, lhs, rhs))
        }
        PlanExpr::Arith { op, args } => {
            let args = compile_all(exec, at, args)?;
            exec.graph.add(ExprKind::Arith(*op, args))
        }
        PlanExpr::Concat(xs) => {
            let xs = compile_all(exec, at, xs)?;
            exec.graph.add(ExprKind::Concat(xs))
        }
        PlanExpr::Index { array, index } => {
            let array = compile_expr(exec, at, array)?;
            let index = compile_expr(exec, at, index)?;
            exec.graph.add(ExprKind::Index(array, index))
        }
        PlanExpr::IsKnown(a) => {
            let a = compile_expr(exec, at, a)?;
            exec.graph.add(ExprKind::IsKnown(a))
        }
        PlanExpr::Lookup { kind, name, params, tolerance, declared } => {
            let name = compile_expr(exec, at, name)?;
            let params = compile_all(exec, at, params)?;
            let tolerance = match tolerance {
                None => None,
                Some(t) => Some(compile_expr(exec, at, t)?),
            };
            exec.graph.add(ExprKind::Lookup(Box::new(LookupState {
                kind: *kind,
                name,
                params,
                tolerance,
                declared: *declared,
                current: None,
            })))
        }
    };
    Ok(id)
}

fn compile_all<D: Dispatcher>(
    exec: &mut Exec<D>,
    at: NodeId,
    es: &[PlanExpr],
) -> Result<Box<[ExprId]>> {
    es.iter().map(|e| compile_expr(exec, at, e)).collect()
}

/// Wiring pass: conditions (with defaults), ancestor conjunctions,
/// and body expressions. Parents are wired before children so a
/// child's ancestor conditions can reference the parent's.
fn wire<D: Dispatcher>(exec: &mut Exec<D>, id: NodeId, plan: &PlanNode) -> Result<()> {
    let kind = exec.node(id).kind;
    let parent = exec.node(id).parent;
    let t = exec.graph.konst_true();
    let f = exec.graph.konst_false();
    let set = |exec: &mut Exec<D>, c: Cond, e: ExprId| {
        exec.node_mut(id).conds[c.index()] = e;
    };
    let user = |exec: &mut Exec<D>, e: &Option<PlanExpr>, dflt: ExprId| match e {
        None => Ok(dflt),
        Some(e) => compile_expr(exec, id, e),
    };
    let skip = user(exec, &plan.conditions.skip, f)?;
    let start = user(exec, &plan.conditions.start, t)?;
    let pre = user(exec, &plan.conditions.pre, t)?;
    let invariant = user(exec, &plan.conditions.invariant, t)?;
    let exit = user(exec, &plan.conditions.exit, f)?;
    let repeat = user(exec, &plan.conditions.repeat, f)?;
    let child_states: Box<[ExprId]> = exec
        .node(id)
        .children
        .iter()
        .map(|c| exec.node(*c).state_var)
        .collect();
    let end = match &plan.conditions.end {
        Some(e) => compile_expr(exec, id, e)?,
        None if kind.is_list_like() => {
            exec.graph.add(ExprKind::AllChildrenFinished(child_states.clone()))
        }
        None => t,
    };
    let post = match &plan.conditions.post {
        Some(e) => compile_expr(exec, id, e)?,
        None => match &exec.node(id).body {
            // a denied command is a failure unless the plan says
            // otherwise
            Body::Command(c) => {
                let ack = c.ack_var;
                let denied = exec
                    .graph
                    .add_const(Value::Handle(crate::value::CommandHandle::Denied));
                let is_denied = exec.graph.add(ExprKind::Cmp(CmpOp::Eq, ack, denied));
                exec.graph.add(ExprKind::Not(is_denied))
            }
            _ => t,
        },
    };
    let (action_complete, abort_complete) = match &exec.node(id).body {
        Body::Empty => (t, t),
        Body::List => {
            let wf = exec
                .graph
                .add(ExprKind::AllChildrenWaitingOrFinished(child_states.clone()));
            (wf, wf)
        }
        Body::Command(c) => {
            let (ack, abort) = (c.ack_var, c.abort_ack);
            let done = exec.graph.add(ExprKind::IsKnown(ack));
            (done, abort)
        }
        Body::Assignment(a) => (a.done, t),
        Body::Update(u) => (u.ack_var, u.ack_var),
    };
    let (anc_end, anc_exit, anc_inv) = match parent {
        None => (f, f, t),
        Some(p) => {
            let pn = exec.node(p);
            let (pae, pax, pai) = (
                pn.cond(Cond::AncEnd),
                pn.cond(Cond::AncExit),
                pn.cond(Cond::AncInvariant),
            );
            let (pe, px, pi) =
                (pn.cond(Cond::End), pn.cond(Cond::Exit), pn.cond(Cond::Invariant));
            let anc_end = exec.graph.add(ExprKind::Or(Box::new([pae, pe])));
            let anc_exit = exec.graph.add(ExprKind::Or(Box::new([pax, px])));
            let anc_inv = exec.graph.add(ExprKind::And(Box::new([pai, pi])));
            (anc_end, anc_exit, anc_inv)
        }
    };
    set(exec, Cond::Skip, skip);
    set(exec, Cond::Start, start);
    set(exec, Cond::Pre, pre);
    set(exec, Cond::End, end);
    set(exec, Cond::Post, post);
    set(exec, Cond::Invariant, invariant);
    set(exec, Cond::Exit, exit);
    set(exec, Cond::Repeat, repeat);
    set(exec, Cond::ActionComplete, action_complete);
    set(exec, Cond::AbortComplete, abort_complete);
    set(exec, Cond::AncEnd, anc_end);
    set(exec, Cond::AncExit, anc_exit);
    set(exec, Cond::AncInvariant, anc_inv);
    for c in Cond::ALL {
        let e = exec.node(id).cond(c);
        exec.graph.add_listener(e, Listener::Node(id));
    }
    // body expressions
    match &plan.body {
        PlanBody::Empty | PlanBody::List { .. } | PlanBody::LibraryCall { .. } => (),
        PlanBody::Command { name, args, returns } => {
            let name = compile_expr(exec, id, name)?;
            let args = args
                .iter()
                .map(|a| compile_expr(exec, id, a))
                .collect::<Result<Vec<_>>>()?;
            let return_var = match returns {
                None => None,
                Some(r) => Some(
                    resolve(exec, Some(id), r)
                        .ok_or_else(|| anyhow!("unresolved return variable {r}"))?
                        .expr,
                ),
            };
            match &mut exec.node_mut(id).body {
                Body::Command(c) => {
                    c.name = name;
                    c.args = args;
                    c.return_var = return_var;
                }
                _ => unreachable!(),
            }
        }
        PlanBody::Assignment { target, index, value } => {
            let target = resolve(exec, Some(id), target)
                .ok_or_else(|| anyhow!("unresolved assignment target {target}"))?
                .expr;
            let index = match index {
                None => None,
                Some(ix) => Some(compile_expr(exec, id, ix)?),
            };
            let rhs = compile_expr(exec, id, value)?;
            match &mut exec.node_mut(id).body {
                Body::Assignment(a) => {
                    a.target = target;
                    a.index = index;
                    a.rhs = rhs;
                }
                _ => unreachable!(),
            }
        }
        PlanBody::Update { pairs } => {
            let pairs = pairs
                .iter()
                .map(|(k, e)| Ok((k.clone(), compile_expr(exec, id, e)?)))
                .collect::<Result<Vec<_>>>()?;
            match &mut exec.node_mut(id).body {
                Body::Update(u) => u.pairs = pairs,
                _ => unreachable!(),
            }
        }
    }
    let children: Vec<NodeId> = exec.node(id).children.clone();
    for (c, cp) in children.into_iter().zip(plan.body.children()) {
        wire(exec, c, cp)?;
    }
    Ok(())
}

/// Compile a validated plan into the executive's arenas. Call
/// [`validate`] first; compilation assumes a well formed plan.
pub(crate) fn compile<D: Dispatcher>(
    exec: &mut Exec<D>,
    plan: &PlanNode,
) -> Result<NodeId> {
    let root = skeleton(exec, plan, None, 0)?;
    wire(exec, root, plan)?;
    Ok(root)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::value::ElemType;

    fn empty(id: &str) -> PlanNode {
        PlanNode {
            id: id.into(),
            priority: 0,
            variables: vec![],
            interface: vec![],
            conditions: Conditions::default(),
            body: PlanBody::Empty,
        }
    }

    #[test]
    fn duplicate_idents_rejected() {
        let plan = PlanNode {
            body: PlanBody::List { children: vec![empty("a"), empty("a")] },
            ..empty("root")
        };
        assert!(validate(&plan).is_err());
    }

    #[test]
    fn unresolved_reference_rejected() {
        let mut plan = empty("root");
        plan.conditions.start = Some(PlanExpr::var("nope"));
        assert!(validate(&plan).is_err());
    }

    #[test]
    fn non_boolean_condition_rejected() {
        let mut plan = empty("root");
        plan.conditions.start = Some(PlanExpr::lit(3));
        let e = validate(&plan).unwrap_err();
        assert!(format!("{e}").contains("not Boolean"), "{e}");
    }

    #[test]
    fn const_assignment_rejected() {
        let plan = PlanNode {
            variables: vec![VarDecl {
                name: "k".into(),
                typ: ValueType::Int,
                konst: true,
                init: Some(PlanExpr::lit(1)),
                max_size: None,
            }],
            body: PlanBody::List {
                children: vec![PlanNode {
                    body: PlanBody::Assignment {
                        target: "k".into(),
                        index: None,
                        value: Box::new(PlanExpr::lit(2)),
                    },
                    ..empty("child")
                }],
            },
            ..empty("root")
        };
        assert!(validate(&plan).is_err());
    }

    #[test]
    fn in_alias_is_read_only() {
        let plan = PlanNode {
            variables: vec![VarDecl {
                name: "x".into(),
                typ: ValueType::Int,
                konst: false,
                init: Some(PlanExpr::lit(0)),
                max_size: None,
            }],
            body: PlanBody::List {
                children: vec![PlanNode {
                    interface: vec![InterfaceDecl {
                        name: "x".into(),
                        mode: InterfaceMode::In,
                    }],
                    body: PlanBody::Assignment {
                        target: "x".into(),
                        index: None,
                        value: Box::new(PlanExpr::lit(2)),
                    },
                    ..empty("child")
                }],
            },
            ..empty("root")
        };
        let e = validate(&plan).unwrap_err();
        assert!(format!("{e}").contains("read only"), "{e}");
    }

    #[test]
    fn array_literal_out_of_range_rejected() {
        let arr = ArrayValue::new(
            ElemType::Int,
            2,
            vec![Value::Int(1), Value::Int(2)],
        )
        .unwrap();
        let plan = PlanNode {
            variables: vec![VarDecl {
                name: "a".into(),
                typ: ValueType::Array(ElemType::Int),
                konst: false,
                init: Some(PlanExpr::Lit(Value::Array(arr))),
                max_size: Some(1),
            }],
            ..empty("root")
        };
        assert!(validate(&plan).is_err());
    }

    #[test]
    fn plans_round_trip_through_serde() {
        let mut plan = empty("root");
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
        let s = serde_json::to_string(&plan).unwrap();
        let back: PlanNode = serde_json::from_str(&s).unwrap();
        assert!(validate(&back).is_ok());
        assert_eq!(format!("{:?}", plan.conditions.end), format!("{:?}", back.conditions.end));
    }
}
