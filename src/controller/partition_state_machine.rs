//! State machine for network partition recovery.
//!
//! Recovery walks the partitioned nodes through drain, eviction and restart:
//!
//! ```text
//! Observed -> Drain -> Evict  -> Restart -> Done
//!               |                  ^   |
//!               +----> Forced -----+   +-> Failed -> Restart (retry)
//! ```
//!
//! The table here only decides which transitions are legal and which event
//! applies; the partition reconciler performs the side effects.

use std::fmt;

use crate::crd::PartitionState;

// ============================================================================
// Partition Events
// ============================================================================

/// Events that move a partition recovery between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionEvent {
    /// The partition CR was picked up.
    Started,

    /// Every partitioned node reports no messages in its queues.
    QueuesDrained,

    /// The drain window elapsed with messages still queued.
    DrainTimedOut,

    /// Replicas were reduced and the partitioned pods deleted.
    NodesEvicted,

    /// Replicas were restored and every node is Ready again.
    NodesRejoined,

    /// Nodes did not come back within the restart window.
    RestartTimedOut,

    /// A failed recovery is attempted again.
    RetryRequested,
}

impl fmt::Display for PartitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionEvent::Started => write!(f, "Started"),
            PartitionEvent::QueuesDrained => write!(f, "QueuesDrained"),
            PartitionEvent::DrainTimedOut => write!(f, "DrainTimedOut"),
            PartitionEvent::NodesEvicted => write!(f, "NodesEvicted"),
            PartitionEvent::NodesRejoined => write!(f, "NodesRejoined"),
            PartitionEvent::RestartTimedOut => write!(f, "RestartTimedOut"),
            PartitionEvent::RetryRequested => write!(f, "RetryRequested"),
        }
    }
}

// ============================================================================
// Transition Context
// ============================================================================

/// Observations used to pick an event and evaluate guards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionTransitionContext {
    pub queues_drained: bool,
    pub drain_timed_out: bool,
    pub nodes_evicted: bool,
    pub nodes_rejoined: bool,
    pub restart_timed_out: bool,
}

// ============================================================================
// Partition Transition
// ============================================================================

/// A single legal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionTransition {
    pub from: PartitionState,
    pub to: PartitionState,
    pub event: PartitionEvent,
    pub description: &'static str,
}

impl PartitionTransition {
    const fn new(
        from: PartitionState,
        to: PartitionState,
        event: PartitionEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

const TRANSITIONS: [PartitionTransition; 8] = [
    PartitionTransition::new(
        PartitionState::Observed,
        PartitionState::Drain,
        PartitionEvent::Started,
        "Start draining queues on the partitioned nodes",
    ),
    PartitionTransition::new(
        PartitionState::Drain,
        PartitionState::Evict,
        PartitionEvent::QueuesDrained,
        "Queues drained, evict the partitioned nodes",
    ),
    PartitionTransition::new(
        PartitionState::Drain,
        PartitionState::Forced,
        PartitionEvent::DrainTimedOut,
        "Drain timed out, evict with possible message loss",
    ),
    PartitionTransition::new(
        PartitionState::Evict,
        PartitionState::Restart,
        PartitionEvent::NodesEvicted,
        "Nodes evicted, restore replicas",
    ),
    PartitionTransition::new(
        PartitionState::Forced,
        PartitionState::Restart,
        PartitionEvent::NodesEvicted,
        "Nodes force-evicted, restore replicas",
    ),
    PartitionTransition::new(
        PartitionState::Restart,
        PartitionState::Done,
        PartitionEvent::NodesRejoined,
        "All nodes rejoined the cluster",
    ),
    PartitionTransition::new(
        PartitionState::Restart,
        PartitionState::Failed,
        PartitionEvent::RestartTimedOut,
        "Nodes did not rejoin in time",
    ),
    PartitionTransition::new(
        PartitionState::Failed,
        PartitionState::Restart,
        PartitionEvent::RetryRequested,
        "Retry restoring the evicted nodes",
    ),
];

// ============================================================================
// Partition State Machine
// ============================================================================

/// Validates partition state transitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartitionStateMachine;

impl PartitionStateMachine {
    pub fn new() -> Self {
        Self
    }

    /// The transition `event` causes from `from`, if it is legal and its guard holds.
    pub fn transition(
        &self,
        from: PartitionState,
        event: PartitionEvent,
        ctx: &PartitionTransitionContext,
    ) -> Option<PartitionTransition> {
        let transition = TRANSITIONS
            .iter()
            .find(|t| t.from == from && t.event == event)?;

        if !evaluate_guard(transition, ctx) {
            return None;
        }
        Some(*transition)
    }

    /// Check if a state transition is valid (without guards).
    pub fn can_transition(&self, from: PartitionState, to: PartitionState) -> bool {
        from == to || TRANSITIONS.iter().any(|t| t.from == from && t.to == to)
    }

    pub fn valid_transitions(&self, from: PartitionState) -> Vec<PartitionState> {
        TRANSITIONS
            .iter()
            .filter(|t| t.from == from)
            .map(|t| t.to)
            .collect()
    }

    pub fn transitions_from(&self, state: PartitionState) -> Vec<&'static PartitionTransition> {
        TRANSITIONS.iter().filter(|t| t.from == state).collect()
    }
}

fn evaluate_guard(transition: &PartitionTransition, ctx: &PartitionTransitionContext) -> bool {
    match transition.event {
        PartitionEvent::QueuesDrained => ctx.queues_drained,
        PartitionEvent::DrainTimedOut => ctx.drain_timed_out,
        PartitionEvent::NodesEvicted => ctx.nodes_evicted,
        PartitionEvent::NodesRejoined => ctx.nodes_rejoined,
        PartitionEvent::RestartTimedOut => ctx.restart_timed_out,
        PartitionEvent::Started | PartitionEvent::RetryRequested => true,
    }
}

/// Pick the event that applies in `state`, or `None` to keep waiting.
///
/// Progress wins over a timeout observed in the same poll.
pub fn determine_partition_event(
    state: PartitionState,
    ctx: &PartitionTransitionContext,
) -> Option<PartitionEvent> {
    match state {
        PartitionState::Observed => Some(PartitionEvent::Started),
        PartitionState::Drain => {
            if ctx.queues_drained {
                Some(PartitionEvent::QueuesDrained)
            } else if ctx.drain_timed_out {
                Some(PartitionEvent::DrainTimedOut)
            } else {
                None
            }
        }
        PartitionState::Evict | PartitionState::Forced => {
            ctx.nodes_evicted.then_some(PartitionEvent::NodesEvicted)
        }
        PartitionState::Restart => {
            if ctx.nodes_rejoined {
                Some(PartitionEvent::NodesRejoined)
            } else if ctx.restart_timed_out {
                Some(PartitionEvent::RestartTimedOut)
            } else {
                None
            }
        }
        PartitionState::Failed => Some(PartitionEvent::RetryRequested),
        PartitionState::Done => None,
    }
}
