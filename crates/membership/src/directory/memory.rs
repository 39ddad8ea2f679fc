//! In-memory directory used by the engine tests. Records every mutation
//! and supports targeted fault injection (outage, departed members,
//! channel failures).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Directory, Member, NewChannel, Role};
use crate::error::{MembershipError, MembershipResult};
use portaria_shared::{ChannelId, MemberId, RoleId};

/// A channel created through the adapter, kept for assertions even after
/// deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
    pub id: ChannelId,
    pub name: String,
    pub category: ChannelId,
    pub member: MemberId,
}

#[derive(Default)]
struct State {
    own: Option<Member>,
    roles: Vec<Role>,
    members: HashMap<String, Member>,
    unavailable: bool,
    channel_create_fails: bool,
    failing_channels: HashSet<u64>,
    failing_dms: HashSet<String>,
    channels: Vec<ChannelRecord>,
    deleted_channels: Vec<ChannelId>,
    messages: HashMap<u64, Vec<String>>,
    dms: HashMap<String, Vec<String>>,
    next_channel: u64,
}

#[derive(Default)]
pub struct InMemoryDirectory {
    state: Mutex<State>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_channel: 9_000,
                ..State::default()
            }),
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Role ids are unique; re-inserting an id replaces the role, so a
    /// test can move one in the hierarchy.
    pub fn insert_role(&self, role: Role) {
        let mut state = self.locked();
        state.roles.retain(|r| r.id != role.id);
        state.roles.push(role);
    }

    pub fn insert_member(&self, member: Member) {
        let mut state = self.locked();
        state.members.insert(member.id.to_string(), member);
    }

    /// Install the service account's own membership.
    pub fn set_own(&self, member: Member) {
        self.locked().own = Some(member);
    }

    /// Remove a member so subsequent fetches report them gone.
    pub fn remove_member(&self, member: &MemberId) {
        self.locked().members.remove(member.as_str());
    }

    /// Simulate a directory-wide outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.locked().unavailable = unavailable;
    }

    pub fn set_channel_create_fails(&self, fails: bool) {
        self.locked().channel_create_fails = fails;
    }

    pub fn fail_sends_to(&self, channel: ChannelId) {
        self.locked().failing_channels.insert(channel.0);
    }

    pub fn fail_dms_to(&self, member: &MemberId) {
        self.locked().failing_dms.insert(member.to_string());
    }

    pub fn member(&self, member: &MemberId) -> Option<Member> {
        self.locked().members.get(member.as_str()).cloned()
    }

    pub fn created_channels(&self) -> Vec<ChannelRecord> {
        self.locked().channels.clone()
    }

    pub fn deleted_channels(&self) -> Vec<ChannelId> {
        self.locked().deleted_channels.clone()
    }

    pub fn channel_messages(&self, channel: ChannelId) -> Vec<String> {
        self.locked().messages.get(&channel.0).cloned().unwrap_or_default()
    }

    pub fn dms_to(&self, member: &MemberId) -> Vec<String> {
        self.locked().dms.get(member.as_str()).cloned().unwrap_or_default()
    }

    fn check_available(state: &State) -> MembershipResult<()> {
        if state.unavailable {
            return Err(MembershipError::DirectoryUnavailable(
                "injected outage".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn fetch_member(&self, member: &MemberId) -> MembershipResult<Member> {
        let state = self.locked();
        Self::check_available(&state)?;
        state
            .members
            .get(member.as_str())
            .cloned()
            .ok_or_else(|| MembershipError::MemberNotFound(member.to_string()))
    }

    async fn own_member(&self) -> MembershipResult<Member> {
        let state = self.locked();
        Self::check_available(&state)?;
        state.own.clone().ok_or_else(|| {
            MembershipError::DirectoryUnavailable("own member not seeded".to_string())
        })
    }

    async fn guild_roles(&self) -> MembershipResult<Vec<Role>> {
        let state = self.locked();
        Self::check_available(&state)?;
        Ok(state.roles.clone())
    }

    async fn add_role(&self, member: &MemberId, role: RoleId) -> MembershipResult<()> {
        let mut state = self.locked();
        Self::check_available(&state)?;
        let entry = state
            .members
            .get_mut(member.as_str())
            .ok_or_else(|| MembershipError::MemberNotFound(member.to_string()))?;
        if !entry.role_ids.contains(&role) {
            entry.role_ids.push(role);
        }
        Ok(())
    }

    async fn remove_role(&self, member: &MemberId, role: RoleId) -> MembershipResult<()> {
        let mut state = self.locked();
        Self::check_available(&state)?;
        let entry = state
            .members
            .get_mut(member.as_str())
            .ok_or_else(|| MembershipError::MemberNotFound(member.to_string()))?;
        entry.role_ids.retain(|r| *r != role);
        Ok(())
    }

    async fn create_private_channel(&self, req: &NewChannel) -> MembershipResult<ChannelId> {
        let mut state = self.locked();
        Self::check_available(&state)?;
        if state.channel_create_fails {
            return Err(MembershipError::DirectoryUnavailable(
                "injected channel create failure".to_string(),
            ));
        }
        state.next_channel += 1;
        let id = ChannelId(state.next_channel);
        state.channels.push(ChannelRecord {
            id,
            name: req.name.clone(),
            category: req.category,
            member: req.member.clone(),
        });
        Ok(id)
    }

    async fn find_text_channel(&self, name: &str) -> MembershipResult<Option<ChannelId>> {
        let state = self.locked();
        Self::check_available(&state)?;
        Ok(state
            .channels
            .iter()
            .filter(|c| !state.deleted_channels.contains(&c.id))
            .find(|c| c.name == name)
            .map(|c| c.id))
    }

    async fn delete_channel(&self, channel: ChannelId) -> MembershipResult<()> {
        let mut state = self.locked();
        Self::check_available(&state)?;
        state.deleted_channels.push(channel);
        Ok(())
    }

    async fn send_channel_message(
        &self,
        channel: ChannelId,
        content: &str,
    ) -> MembershipResult<()> {
        let mut state = self.locked();
        Self::check_available(&state)?;
        if state.failing_channels.contains(&channel.0) {
            return Err(MembershipError::DirectoryUnavailable(
                "injected send failure".to_string(),
            ));
        }
        if state.deleted_channels.contains(&channel) {
            return Err(MembershipError::DirectoryUnavailable(
                "channel deleted".to_string(),
            ));
        }
        state
            .messages
            .entry(channel.0)
            .or_default()
            .push(content.to_string());
        Ok(())
    }

    async fn send_dm(&self, member: &MemberId, content: &str) -> MembershipResult<()> {
        let mut state = self.locked();
        Self::check_available(&state)?;
        if state.failing_dms.contains(member.as_str()) {
            return Err(MembershipError::DirectoryUnavailable(
                "injected dm failure".to_string(),
            ));
        }
        state
            .dms
            .entry(member.to_string())
            .or_default()
            .push(content.to_string());
        Ok(())
    }
}
