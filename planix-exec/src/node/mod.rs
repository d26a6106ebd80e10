//! The node model: the tree of little state machines that is a plan.
//!
//! Nodes live in an arena owned by the executive and reference each
//! other, their conditions, and their variables by id. Each node
//! also owns a node-state variable in the expression graph, an
//! Integer mirror of its state; ancestor conditions and the
//! children-finished aggregates listen to those instead of holding
//! back pointers into the node tree.
use crate::{
    expr::ExprId,
    slot_id,
    value::Value,
    CommandId,
};
use anyhow::{bail, Result};
use arcstr::ArcStr;
use enumflags2::bitflags;
use fxhash::FxHashMap;
use std::{fmt, str::FromStr};

pub mod transition;

pub use transition::Dest;

slot_id!(NodeId, "n");

macro_rules! named_enum {
    ($name:ident, $($variant:ident => $s:literal),+ $(,)?) => {
        impl $name {
            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $s),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.name())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($s => Ok($name::$variant),)+
                    s => bail!(concat!("not a ", stringify!($name), ": {}"), s),
                }
            }
        }
    };
}

/// Node state. The Integer coding is what node-state variables hold
/// in the expression graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum NodeState {
    Inactive = 0,
    Waiting,
    Executing,
    IterationEnded,
    Finished,
    Failing,
    Finishing,
}

named_enum!(NodeState,
    Inactive => "INACTIVE",
    Waiting => "WAITING",
    Executing => "EXECUTING",
    IterationEnded => "ITERATION_ENDED",
    Finished => "FINISHED",
    Failing => "FAILING",
    Finishing => "FINISHING",
);

impl NodeState {
    pub fn as_value(&self) -> Value {
        Value::Int(*self as i32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeOutcome {
    None,
    Success,
    Failure,
    Skipped,
    Interrupted,
}

named_enum!(NodeOutcome,
    None => "NO_OUTCOME",
    Success => "SUCCESS",
    Failure => "FAILURE",
    Skipped => "SKIPPED",
    Interrupted => "INTERRUPTED",
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureType {
    None,
    PreConditionFailed,
    PostConditionFailed,
    InvariantConditionFailed,
    ParentFailed,
    Exited,
    ParentExited,
}

named_enum!(FailureType,
    None => "NO_FAILURE",
    PreConditionFailed => "PRE_CONDITION_FAILED",
    PostConditionFailed => "POST_CONDITION_FAILED",
    InvariantConditionFailed => "INVARIANT_CONDITION_FAILED",
    ParentFailed => "PARENT_FAILED",
    Exited => "EXITED",
    ParentExited => "PARENT_EXITED",
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Empty,
    List,
    Command,
    Assignment,
    Update,
    LibraryCall,
}

named_enum!(NodeKind,
    Empty => "Empty",
    List => "NodeList",
    Command => "Command",
    Assignment => "Assignment",
    Update => "Update",
    LibraryCall => "LibraryNodeCall",
);

impl NodeKind {
    /// List semantics: owns children and aggregates their states.
    pub fn is_list_like(&self) -> bool {
        matches!(self, NodeKind::List | NodeKind::LibraryCall)
    }
}

/// The condition slots every node carries. The bit positions are
/// used for the per state activation sets in [`transition`].
#[bitflags]
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Skip,
    Start,
    Pre,
    End,
    Post,
    Invariant,
    Exit,
    Repeat,
    ActionComplete,
    AbortComplete,
    AncEnd,
    AncExit,
    AncInvariant,
}

pub const NCONDS: usize = 13;

impl Cond {
    pub fn index(self) -> usize {
        (self as u16).trailing_zeros() as usize
    }

    pub const ALL: [Cond; NCONDS] = [
        Cond::Skip,
        Cond::Start,
        Cond::Pre,
        Cond::End,
        Cond::Post,
        Cond::Invariant,
        Cond::Exit,
        Cond::Repeat,
        Cond::ActionComplete,
        Cond::AbortComplete,
        Cond::AncEnd,
        Cond::AncExit,
        Cond::AncInvariant,
    ];
}

/// Which queue, if any, a node currently sits in. A node is in at
/// most one queue at a time; the executive asserts on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    None,
    Candidate,
    Pending,
    Transition,
    FinishedRoot,
}

/// A variable visible in a node's scope, with the plan-load decision
/// of whether assignments through this name are legal (In interface
/// aliases and const variables are read only).
#[derive(Debug, Clone, Copy)]
pub struct Binding {
    pub expr: ExprId,
    pub writable: bool,
}

#[derive(Debug)]
pub struct CommandBody {
    pub name: ExprId,
    pub args: Vec<ExprId>,
    /// CommandHandle variable mirroring acks.
    pub ack_var: ExprId,
    /// Boolean variable set by the abort ack.
    pub abort_ack: ExprId,
    pub return_var: Option<ExprId>,
    /// The in-flight command instance, if any.
    pub handle: Option<CommandId>,
}

#[derive(Debug)]
pub struct AssignBody {
    /// The base variable being written.
    pub target: ExprId,
    /// Element index for array element assignment.
    pub index: Option<ExprId>,
    pub rhs: ExprId,
    /// Boolean variable the executive sets once the write happened.
    pub done: ExprId,
}

#[derive(Debug)]
pub struct UpdateBody {
    pub pairs: Vec<(ArcStr, ExprId)>,
    /// Boolean variable set by the update ack.
    pub ack_var: ExprId,
}

#[derive(Debug)]
pub enum Body {
    Empty,
    List,
    Command(CommandBody),
    Assignment(AssignBody),
    Update(UpdateBody),
}

#[derive(Debug)]
pub struct Node {
    pub ident: ArcStr,
    pub kind: NodeKind,
    pub state: NodeState,
    pub outcome: NodeOutcome,
    pub failure: FailureType,
    pub parent: Option<NodeId>,
    pub depth: u32,
    pub children: Vec<NodeId>,
    pub conds: [ExprId; NCONDS],
    /// Integer mirror of `state` in the expression graph.
    pub state_var: ExprId,
    /// Variables declared in this node, activated on first entry to
    /// Waiting and deactivated on entry to Finished.
    pub locals: Vec<ExprId>,
    /// Name resolution for this node's scope (locals plus interface
    /// aliases). Kept after load for introspection.
    pub names: FxHashMap<ArcStr, Binding>,
    pub body: Body,
    /// Assignment only; lower wins conflicts.
    pub priority: i32,
    pub queue: QueueStatus,
    /// Whether the locals are currently activated.
    pub vars_active: bool,
    /// Whether the body expressions (command name and arguments,
    /// assignment right hand side, update pair values) are
    /// currently activated.
    pub body_active: bool,
}

impl Node {
    pub fn cond(&self, c: Cond) -> ExprId {
        self.conds[c.index()]
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{} {} {}]",
            self.kind, self.ident, self.state, self.outcome, self.failure
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn state_names_round_trip() {
        for s in [
            NodeState::Inactive,
            NodeState::Waiting,
            NodeState::Executing,
            NodeState::IterationEnded,
            NodeState::Finished,
            NodeState::Failing,
            NodeState::Finishing,
        ] {
            assert_eq!(s.name().parse::<NodeState>().unwrap(), s);
        }
        assert!("BOGUS".parse::<NodeState>().is_err());
    }

    #[test]
    fn cond_indices_are_dense() {
        for (i, c) in Cond::ALL.iter().enumerate() {
            assert_eq!(c.index(), i);
        }
    }

    #[test]
    fn state_coding_matches_value() {
        assert_eq!(NodeState::Inactive.as_value(), Value::Int(0));
        assert_eq!(NodeState::Finishing.as_value(), Value::Int(6));
    }
}
