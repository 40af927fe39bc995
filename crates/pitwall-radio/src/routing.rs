//! Role-based routing decisions.
//!
//! One [`RoutingPolicy`] is picked from the local role when the engine starts
//! and is never swapped afterwards. Both methods are pure.

use pitwall_common::Role;

use crate::context::SessionContext;

/// Outcome of evaluating a newly arrived remote stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundDecision {
    Accept { presentation_key: String },
    Ignore,
}

pub trait RoutingPolicy: Send + Sync {
    /// Decide whether a stream from `remote_id` is rendered.
    ///
    /// `remote_name` is the speaker name already resolved by the caller
    /// (display name, or the team address when none was sent).
    fn inbound(&self, ctx: &SessionContext, remote_id: &str, remote_name: &str)
        -> InboundDecision;

    /// Decide whether the local track goes to the entry for `remote_id`.
    fn outbound(&self, ctx: &SessionContext, remote_id: &str) -> bool;
}

/// Race control: selection driven.
#[derive(Debug, Default)]
pub struct DirectorRouting;

impl RoutingPolicy for DirectorRouting {
    fn inbound(
        &self,
        ctx: &SessionContext,
        remote_id: &str,
        _remote_name: &str,
    ) -> InboundDecision {
        if ctx.selection().listen.includes(remote_id) {
            InboundDecision::Accept {
                presentation_key: remote_id.to_string(),
            }
        } else {
            InboundDecision::Ignore
        }
    }

    fn outbound(&self, ctx: &SessionContext, remote_id: &str) -> bool {
        ctx.selection().speak.includes(remote_id)
    }
}

/// Team radio: own team address only, both ways.
#[derive(Debug, Default)]
pub struct DriverRouting;

impl RoutingPolicy for DriverRouting {
    fn inbound(
        &self,
        ctx: &SessionContext,
        remote_id: &str,
        remote_name: &str,
    ) -> InboundDecision {
        if remote_id != ctx.identity().team_id() {
            return InboundDecision::Ignore;
        }
        // Director and teammates all arrive under the team address.
        InboundDecision::Accept {
            presentation_key: format!("{remote_id}_{remote_name}"),
        }
    }

    fn outbound(&self, ctx: &SessionContext, remote_id: &str) -> bool {
        remote_id == ctx.identity().team_id()
    }
}

pub fn policy_for(role: Role) -> Box<dyn RoutingPolicy> {
    match role {
        Role::Director => Box::new(DirectorRouting),
        Role::Driver => Box::new(DriverRouting),
    }
}
