//! Guild role reconciliation for the entitlement pair and the
//! registered marker.
//!
//! Every mutation re-checks the hierarchy precondition first: the
//! service account's top role must sit strictly above the target role,
//! otherwise the directory rejects the call. Mutations are individually
//! fault tolerant; one skipped or failed role never aborts the rest of
//! a sync.

use std::sync::Arc;

use tracing::warn;

use portaria_shared::{MemberId, RoleConfig, RoleId};

use crate::directory::{top_role_position, Directory, Member, Role};
use crate::error::MembershipResult;

/// What happened to a single role mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Applied,
    /// Hierarchy precondition failed, or the configured role no longer
    /// exists in the guild. The mutation was never attempted.
    SkippedHierarchy,
    Failed(String),
}

impl MutationOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, MutationOutcome::Applied)
    }
}

/// Result of one entitlement sync: the role that was granted and the
/// role that was revoked, with their individual outcomes.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub granted: (RoleId, MutationOutcome),
    pub revoked: (RoleId, MutationOutcome),
}

impl SyncReport {
    pub fn fully_applied(&self) -> bool {
        self.granted.1.applied() && self.revoked.1.applied()
    }
}

struct Hierarchy {
    own_top: i64,
    roles: Vec<Role>,
}

impl Hierarchy {
    /// `None` when the configured role is gone from the guild.
    fn manageable(&self, role: RoleId) -> Option<bool> {
        self.roles
            .iter()
            .find(|r| r.id == role)
            .map(|r| r.position < self.own_top)
    }
}

pub struct RoleSynchronizer {
    directory: Arc<dyn Directory>,
    roles: RoleConfig,
}

impl RoleSynchronizer {
    pub fn new(directory: Arc<dyn Directory>, roles: RoleConfig) -> Self {
        Self { directory, roles }
    }

    /// Fetched once per sync so a batch of mutations sees one
    /// consistent view of the guild.
    async fn hierarchy(&self) -> MembershipResult<Hierarchy> {
        let own = self.directory.own_member().await?;
        let roles = self.directory.guild_roles().await?;
        let own_top = top_role_position(&own, &roles);
        Ok(Hierarchy { own_top, roles })
    }

    async fn grant(&self, hierarchy: &Hierarchy, member: &MemberId, role: RoleId) -> MutationOutcome {
        match hierarchy.manageable(role) {
            Some(true) => {}
            Some(false) => {
                warn!(member = member.as_str(), role = role.0, "Skipping grant, role sits above the service account");
                return MutationOutcome::SkippedHierarchy;
            }
            None => {
                warn!(member = member.as_str(), role = role.0, "Skipping grant, configured role is missing from the guild");
                return MutationOutcome::SkippedHierarchy;
            }
        }
        match self.directory.add_role(member, role).await {
            Ok(()) => MutationOutcome::Applied,
            Err(e) => {
                warn!(member = member.as_str(), role = role.0, error = %e, "Role grant failed");
                MutationOutcome::Failed(e.to_string())
            }
        }
    }

    async fn revoke(&self, hierarchy: &Hierarchy, member: &MemberId, role: RoleId) -> MutationOutcome {
        match hierarchy.manageable(role) {
            Some(true) => {}
            Some(false) => {
                warn!(member = member.as_str(), role = role.0, "Skipping revoke, role sits above the service account");
                return MutationOutcome::SkippedHierarchy;
            }
            None => {
                warn!(member = member.as_str(), role = role.0, "Skipping revoke, configured role is missing from the guild");
                return MutationOutcome::SkippedHierarchy;
            }
        }
        match self.directory.remove_role(member, role).await {
            Ok(()) => MutationOutcome::Applied,
            Err(e) => {
                warn!(member = member.as_str(), role = role.0, error = %e, "Role revoke failed");
                MutationOutcome::Failed(e.to_string())
            }
        }
    }

    /// Reconciles the VIP/awaiting pair against the member's current
    /// entitlement. Active members hold VIP and lose awaiting; lapsed
    /// members get the reverse.
    pub async fn sync_entitlement(&self, member: &MemberId, active: bool) -> MembershipResult<SyncReport> {
        let hierarchy = self.hierarchy().await?;
        let (to_grant, to_revoke) = if active {
            (self.roles.vip, self.roles.awaiting)
        } else {
            (self.roles.awaiting, self.roles.vip)
        };
        let granted = self.grant(&hierarchy, member, to_grant).await;
        let revoked = self.revoke(&hierarchy, member, to_revoke).await;
        Ok(SyncReport {
            granted: (to_grant, granted),
            revoked: (to_revoke, revoked),
        })
    }

    /// Grants the registered marker. Takes the fetched member because
    /// the precondition also covers the member's own top role: the
    /// service account must out-rank both the role and the member.
    pub async fn assign_registered(&self, member: &Member) -> MembershipResult<MutationOutcome> {
        let hierarchy = self.hierarchy().await?;
        let member_top = top_role_position(member, &hierarchy.roles);
        if member_top >= hierarchy.own_top {
            warn!(member = member.id.as_str(), "Skipping registered grant, member out-ranks the service account");
            return Ok(MutationOutcome::SkippedHierarchy);
        }
        Ok(self.grant(&hierarchy, &member.id, self.roles.registered).await)
    }

    /// Strips every managed role the member still holds. Roles the
    /// member does not carry are not attempted and do not appear in
    /// the report.
    pub async fn remove_all(&self, member: &Member) -> MembershipResult<Vec<(RoleId, MutationOutcome)>> {
        let hierarchy = self.hierarchy().await?;
        let mut report = Vec::new();
        for role in [self.roles.vip, self.roles.awaiting, self.roles.registered] {
            if !member.has_role(role) {
                continue;
            }
            let outcome = self.revoke(&hierarchy, &member.id, role).await;
            report.push((role, outcome));
        }
        Ok(report)
    }
}
