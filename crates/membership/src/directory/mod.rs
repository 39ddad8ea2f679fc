//! Community directory port: the capability set the engine needs from the
//! guild (member lookup, role mutation, channels, messaging).
//!
//! Implementations: [`rest::RestDirectory`] over the directory's HTTP API
//! and [`memory::InMemoryDirectory`] for tests.

pub mod memory;
pub mod rest;

use async_trait::async_trait;

use crate::error::MembershipResult;
use portaria_shared::{ChannelId, MemberId, RoleId};

/// A guild member as the engine sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: MemberId,
    pub username: String,
    pub role_ids: Vec<RoleId>,
}

impl Member {
    pub fn has_role(&self, role: RoleId) -> bool {
        self.role_ids.contains(&role)
    }
}

/// A guild role with its hierarchy position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub position: i64,
}

/// Request to create a private text channel visible to one member and the
/// service account only.
#[derive(Debug, Clone)]
pub struct NewChannel {
    pub name: String,
    pub category: ChannelId,
    pub member: MemberId,
}

#[async_trait]
pub trait Directory: Send + Sync {
    /// Fetch a member by id.
    ///
    /// Returns `MemberNotFound` when the member left the guild and
    /// `DirectoryUnavailable` on transport faults; callers treat the two
    /// very differently.
    async fn fetch_member(&self, member: &MemberId) -> MembershipResult<Member>;

    /// The service account's own guild membership.
    async fn own_member(&self) -> MembershipResult<Member>;

    /// All guild roles with their positions.
    async fn guild_roles(&self) -> MembershipResult<Vec<Role>>;

    async fn add_role(&self, member: &MemberId, role: RoleId) -> MembershipResult<()>;

    async fn remove_role(&self, member: &MemberId, role: RoleId) -> MembershipResult<()>;

    /// Create a private channel; the adapter installs the overwrites
    /// (hide from everyone, show to the member and the service account).
    async fn create_private_channel(&self, req: &NewChannel) -> MembershipResult<ChannelId>;

    /// Find an existing text channel by exact name, for reusing notice
    /// channels instead of stacking duplicates.
    async fn find_text_channel(&self, name: &str) -> MembershipResult<Option<ChannelId>>;

    async fn delete_channel(&self, channel: ChannelId) -> MembershipResult<()>;

    async fn send_channel_message(
        &self,
        channel: ChannelId,
        content: &str,
    ) -> MembershipResult<()>;

    /// Direct-message a member, opening the DM channel if needed.
    async fn send_dm(&self, member: &MemberId, content: &str) -> MembershipResult<()>;
}

/// Highest role position a member holds; 0 when they hold none (the
/// implicit everyone role sits at the bottom).
pub fn top_role_position(member: &Member, roles: &[Role]) -> i64 {
    member
        .role_ids
        .iter()
        .filter_map(|id| roles.iter().find(|r| r.id == *id))
        .map(|r| r.position)
        .max()
        .unwrap_or(0)
}

/// Normalize a display name into a channel slug: lowercase, ascii
/// alphanumerics and dashes only, at most 20 characters.
pub fn channel_slug(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .take(20)
        .collect()
}
