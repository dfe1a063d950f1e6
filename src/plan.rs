//! Redirection planning: which target backs each of the child's streams.

use std::fmt;
use std::os::fd::{OwnedFd, RawFd};

/// One of the child's standard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Input,
    Output,
    Error,
}

impl Role {
    /// All roles in their canonical order.
    pub const ALL: [Role; 3] = [Role::Input, Role::Output, Role::Error];

    /// The well-known descriptor for this stream.
    pub fn fd(self) -> RawFd {
        match self {
            Role::Input => 0,
            Role::Output => 1,
            Role::Error => 2,
        }
    }

    /// Whether the child reads from this stream rather than writing to it.
    /// This picks the child end of a fresh channel.
    pub(crate) fn child_reads(self) -> bool {
        matches!(self, Role::Input)
    }

    pub(crate) fn index(self) -> usize {
        self.fd() as usize
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Input => "stdin",
            Role::Output => "stdout",
            Role::Error => "stderr",
        })
    }
}

/// Where a stream ends up in the child.
#[derive(Debug, Default)]
pub enum Target {
    /// Keep the parent's descriptor unchanged.
    #[default]
    Inherit,
    /// Redirect to the null device.
    Null,
    /// Redirect to a descriptor supplied by the caller, such as another
    /// invocation's channel end. Ownership transfers to the invocation;
    /// the parent's copy is closed once the child holds its own.
    Explicit(OwnedFd),
    /// Allocate a fresh channel. The parent end becomes available on the
    /// resulting `RunStatus`.
    NewChannel,
}

/// Resolved mapping from each role to its target.
///
/// Built once per invocation and consumed by the launcher. The internal
/// control channel is not representable here; it belongs to the launcher
/// alone and never reaches a caller.
#[derive(Debug)]
pub struct RedirectionPlan {
    targets: [Target; 3],
}

impl Default for RedirectionPlan {
    fn default() -> Self {
        Self {
            targets: [Target::Inherit, Target::Inherit, Target::Inherit],
        }
    }
}

impl RedirectionPlan {
    pub fn builder() -> PlanBuilder {
        PlanBuilder::default()
    }

    pub fn target(&self, role: Role) -> &Target {
        &self.targets[role.index()]
    }

    /// Whether any role resolved to a fresh channel.
    pub fn wants_channels(&self) -> bool {
        self.targets
            .iter()
            .any(|t| matches!(t, Target::NewChannel))
    }

    pub(crate) fn into_targets(self) -> [Target; 3] {
        self.targets
    }
}

/// Collects directives in declaration order; when a role is named more than
/// once, the last directive wins. Roles never named default to `Inherit`.
#[derive(Debug, Default)]
pub struct PlanBuilder {
    directives: Vec<(Role, Target)>,
}

impl PlanBuilder {
    pub fn redirect(mut self, role: Role, target: Target) -> Self {
        self.directives.push((role, target));
        self
    }

    /// Shorthand for `redirect(role, Target::NewChannel)`.
    pub fn channel(self, role: Role) -> Self {
        self.redirect(role, Target::NewChannel)
    }

    pub fn build(self) -> RedirectionPlan {
        let mut plan = RedirectionPlan::default();
        for (role, target) in self.directives {
            plan.targets[role.index()] = target;
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_roles_inherit() {
        let plan = RedirectionPlan::builder().build();
        for role in Role::ALL {
            assert!(matches!(plan.target(role), Target::Inherit));
        }
        assert!(!plan.wants_channels());
    }

    #[test]
    fn last_directive_wins() {
        let plan = RedirectionPlan::builder()
            .redirect(Role::Output, Target::Null)
            .channel(Role::Output)
            .build();
        assert!(matches!(plan.target(Role::Output), Target::NewChannel));
        assert!(plan.wants_channels());
    }

    #[test]
    fn roles_resolve_independently() {
        let plan = RedirectionPlan::builder()
            .channel(Role::Input)
            .redirect(Role::Error, Target::Null)
            .build();
        assert!(matches!(plan.target(Role::Input), Target::NewChannel));
        assert!(matches!(plan.target(Role::Output), Target::Inherit));
        assert!(matches!(plan.target(Role::Error), Target::Null));
    }

    #[test]
    fn role_descriptors() {
        assert_eq!(Role::Input.fd(), 0);
        assert_eq!(Role::Output.fd(), 1);
        assert_eq!(Role::Error.fd(), 2);
        assert!(Role::Input.child_reads());
        assert!(!Role::Output.child_reads());
    }
}
