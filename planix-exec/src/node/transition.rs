//! Destination state computation and the per state condition sets.
//!
//! Guards are evaluated in a fixed priority order (ancestor exit
//! first, start last) and the first match wins. Every guard tests
//! `is_true` or `is_false`, never their negations: an Unknown
//! condition matches neither polarity and leaves the node where it
//! is, which is how expression errors are contained.
use super::{Cond, FailureType, Node, NodeKind, NodeOutcome, NodeState};
use crate::expr::ExprGraph;
use enumflags2::BitFlags;

/// Where a node would go if it transitioned right now, plus the
/// outcome/failure pair the transition records. `outcome: None`
/// keeps whatever the node already has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dest {
    pub to: NodeState,
    pub outcome: Option<(NodeOutcome, FailureType)>,
}

impl Dest {
    fn keep(to: NodeState) -> Self {
        Self { to, outcome: None }
    }

    fn with(to: NodeState, o: NodeOutcome, f: FailureType) -> Self {
        Self { to, outcome: Some((o, f)) }
    }
}

/// The conditions a node of `kind` holds active while in `state`.
/// Activation reference counts make sharing across nodes safe: a
/// child's ancestor condition keeps its parent's exit/invariant
/// expressions alive even after the parent stops watching them.
pub(crate) fn active_conds(kind: NodeKind, state: NodeState) -> BitFlags<Cond> {
    match state {
        NodeState::Inactive | NodeState::Finished => BitFlags::empty(),
        NodeState::Waiting => {
            Cond::AncExit
                | Cond::AncInvariant
                | Cond::AncEnd
                | Cond::Exit
                | Cond::Skip
                | Cond::Start
                | Cond::Pre
        }
        NodeState::Executing => {
            let base = Cond::AncExit
                | Cond::Exit
                | Cond::AncInvariant
                | Cond::Invariant
                | Cond::End
                | Cond::Post;
            match kind {
                NodeKind::Empty => base,
                _ => base | Cond::ActionComplete,
            }
        }
        NodeState::Finishing => {
            Cond::AncExit
                | Cond::Exit
                | Cond::AncInvariant
                | Cond::Invariant
                | Cond::ActionComplete
                | Cond::Post
        }
        NodeState::Failing => Cond::AbortComplete.into(),
        NodeState::IterationEnded => {
            Cond::AncExit | Cond::AncInvariant | Cond::AncEnd | Cond::Repeat
        }
    }
}

/// Success if the post condition holds, post condition failure
/// otherwise.
fn post_outcome(n: &Node, g: &ExprGraph) -> Option<(NodeOutcome, FailureType)> {
    if g.is_true(n.cond(Cond::Post)) {
        Some((NodeOutcome::Success, FailureType::None))
    } else {
        Some((NodeOutcome::Failure, FailureType::PostConditionFailed))
    }
}

/// Compute the destination for one node. `parent_state` is the
/// parent's current state; the executive passes Executing for root
/// nodes. Returns None when no guard matches.
pub(crate) fn destination(
    n: &Node,
    parent_state: NodeState,
    g: &ExprGraph,
) -> Option<Dest> {
    let t = |c: Cond| g.is_true(n.cond(c));
    let f = |c: Cond| g.is_false(n.cond(c));
    match n.state {
        NodeState::Inactive => match parent_state {
            NodeState::Finished => Some(Dest::with(
                NodeState::Finished,
                NodeOutcome::Skipped,
                FailureType::None,
            )),
            NodeState::Executing => {
                if t(Cond::AncExit) || f(Cond::AncInvariant) || t(Cond::AncEnd) {
                    Some(Dest::with(
                        NodeState::Finished,
                        NodeOutcome::Skipped,
                        FailureType::None,
                    ))
                } else {
                    Some(Dest::keep(NodeState::Waiting))
                }
            }
            _ => None,
        },
        NodeState::Waiting => {
            if t(Cond::AncExit)
                || t(Cond::Exit)
                || f(Cond::AncInvariant)
                || t(Cond::AncEnd)
                || t(Cond::Skip)
            {
                Some(Dest::with(
                    NodeState::Finished,
                    NodeOutcome::Skipped,
                    FailureType::None,
                ))
            } else if t(Cond::Start) {
                if t(Cond::Pre) {
                    Some(Dest::keep(NodeState::Executing))
                } else if f(Cond::Pre) {
                    Some(Dest::with(
                        NodeState::IterationEnded,
                        NodeOutcome::Failure,
                        FailureType::PreConditionFailed,
                    ))
                } else {
                    None
                }
            } else {
                None
            }
        }
        NodeState::Executing => match n.kind {
            NodeKind::Empty => {
                if t(Cond::AncExit) {
                    Some(Dest::with(
                        NodeState::Finished,
                        NodeOutcome::Interrupted,
                        FailureType::ParentExited,
                    ))
                } else if t(Cond::Exit) {
                    Some(Dest::with(
                        NodeState::IterationEnded,
                        NodeOutcome::Interrupted,
                        FailureType::Exited,
                    ))
                } else if f(Cond::AncInvariant) {
                    Some(Dest::with(
                        NodeState::Finished,
                        NodeOutcome::Failure,
                        FailureType::ParentFailed,
                    ))
                } else if f(Cond::Invariant) {
                    Some(Dest::with(
                        NodeState::IterationEnded,
                        NodeOutcome::Failure,
                        FailureType::InvariantConditionFailed,
                    ))
                } else if t(Cond::End) {
                    Some(Dest { to: NodeState::IterationEnded, outcome: post_outcome(n, g) })
                } else {
                    None
                }
            }
            _ => {
                if t(Cond::AncExit) {
                    Some(Dest::with(
                        NodeState::Failing,
                        NodeOutcome::Interrupted,
                        FailureType::ParentExited,
                    ))
                } else if t(Cond::Exit) {
                    Some(Dest::with(
                        NodeState::Failing,
                        NodeOutcome::Interrupted,
                        FailureType::Exited,
                    ))
                } else if f(Cond::AncInvariant) {
                    Some(Dest::with(
                        NodeState::Failing,
                        NodeOutcome::Failure,
                        FailureType::ParentFailed,
                    ))
                } else if f(Cond::Invariant) {
                    Some(Dest::with(
                        NodeState::Failing,
                        NodeOutcome::Failure,
                        FailureType::InvariantConditionFailed,
                    ))
                } else {
                    match n.kind {
                        NodeKind::Command | NodeKind::List | NodeKind::LibraryCall => {
                            if t(Cond::End) {
                                Some(Dest::keep(NodeState::Finishing))
                            } else {
                                None
                            }
                        }
                        NodeKind::Assignment | NodeKind::Update => {
                            if t(Cond::ActionComplete) {
                                Some(Dest {
                                    to: NodeState::IterationEnded,
                                    outcome: post_outcome(n, g),
                                })
                            } else {
                                None
                            }
                        }
                        NodeKind::Empty => unreachable!(),
                    }
                }
            }
        },
        NodeState::Finishing => {
            if t(Cond::AncExit) {
                Some(Dest::with(
                    NodeState::Failing,
                    NodeOutcome::Interrupted,
                    FailureType::ParentExited,
                ))
            } else if t(Cond::Exit) {
                Some(Dest::with(
                    NodeState::Failing,
                    NodeOutcome::Interrupted,
                    FailureType::Exited,
                ))
            } else if f(Cond::AncInvariant) {
                Some(Dest::with(
                    NodeState::Failing,
                    NodeOutcome::Failure,
                    FailureType::ParentFailed,
                ))
            } else if f(Cond::Invariant) {
                Some(Dest::with(
                    NodeState::Failing,
                    NodeOutcome::Failure,
                    FailureType::InvariantConditionFailed,
                ))
            } else if t(Cond::ActionComplete) {
                Some(Dest { to: NodeState::IterationEnded, outcome: post_outcome(n, g) })
            } else {
                None
            }
        }
        NodeState::Failing => {
            if t(Cond::AbortComplete) {
                match n.failure {
                    FailureType::ParentFailed | FailureType::ParentExited => {
                        Some(Dest::keep(NodeState::Finished))
                    }
                    _ => Some(Dest::keep(NodeState::IterationEnded)),
                }
            } else {
                None
            }
        }
        NodeState::IterationEnded => {
            if t(Cond::AncExit)
                || f(Cond::AncInvariant)
                || t(Cond::AncEnd)
                || f(Cond::Repeat)
            {
                Some(Dest::keep(NodeState::Finished))
            } else if t(Cond::Repeat) {
                Some(Dest::keep(NodeState::Waiting))
            } else {
                None
            }
        }
        NodeState::Finished => {
            if parent_state == NodeState::Waiting {
                Some(Dest::keep(NodeState::Inactive))
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn condition_sets_per_state() {
        let w = active_conds(NodeKind::Empty, NodeState::Waiting);
        assert!(w.contains(Cond::Start) && w.contains(Cond::Pre));
        assert!(!w.contains(Cond::End));
        let e = active_conds(NodeKind::Empty, NodeState::Executing);
        assert!(e.contains(Cond::End) && !e.contains(Cond::ActionComplete));
        let c = active_conds(NodeKind::Command, NodeState::Executing);
        assert!(c.contains(Cond::ActionComplete));
        assert_eq!(
            active_conds(NodeKind::List, NodeState::Finished),
            BitFlags::empty()
        );
        assert_eq!(
            active_conds(NodeKind::Command, NodeState::Failing),
            BitFlags::from(Cond::AbortComplete)
        );
    }
}
