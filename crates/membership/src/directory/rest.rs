//! Directory adapter over the community platform's REST API (v10).
//!
//! One `reqwest::Client` is built at construction and cloned internally.
//! The service account's user id is fetched once and cached; it is needed
//! for the private-channel permission overwrites.

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OnceCell;

use super::{Directory, Member, NewChannel, Role};
use crate::error::{MembershipError, MembershipResult};
use portaria_shared::{ChannelId, MemberId, RoleId};

const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

// Permission bits: view = 1 << 10, send = 1 << 11, history = 1 << 16.
const DENY_EVERYONE: u64 = 1 << 10;
const ALLOW_MEMBER: u64 = (1 << 10) | (1 << 11) | (1 << 16);
const ALLOW_SERVICE: u64 = (1 << 10) | (1 << 11);

pub struct RestDirectory {
    client: Client,
    base: String,
    token: String,
    guild_id: u64,
    own_user_id: OnceCell<String>,
}

#[derive(Debug, Deserialize)]
struct UserBody {
    id: String,
    username: String,
}

#[derive(Debug, Deserialize)]
struct MemberBody {
    user: UserBody,
    roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RoleBody {
    id: String,
    name: String,
    position: i64,
}

#[derive(Debug, Deserialize)]
struct ChannelBody {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GuildChannelBody {
    id: String,
    name: String,
    #[serde(rename = "type")]
    kind: u8,
}

impl RestDirectory {
    pub fn new(token: &str, guild_id: u64) -> Self {
        Self::with_base(token, guild_id, DEFAULT_API_BASE)
    }

    /// Construct against a non-default API base (test servers).
    pub fn with_base(token: &str, guild_id: u64, base: &str) -> Self {
        Self {
            client: Client::new(),
            base: base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            guild_id,
            own_user_id: OnceCell::new(),
        }
    }

    fn auth(&self) -> String {
        format!("Bot {}", self.token)
    }

    async fn own_user_id(&self) -> MembershipResult<&str> {
        self.own_user_id
            .get_or_try_init(|| async {
                let url = format!("{}/users/@me", self.base);
                let response = self
                    .client
                    .get(&url)
                    .header("Authorization", self.auth())
                    .send()
                    .await
                    .map_err(|e| {
                        MembershipError::DirectoryUnavailable(format!(
                            "own-user fetch failed: {e}"
                        ))
                    })?;
                if !response.status().is_success() {
                    return Err(MembershipError::DirectoryUnavailable(format!(
                        "own-user fetch returned {}",
                        response.status()
                    )));
                }
                let user: UserBody = response.json().await.map_err(|e| {
                    MembershipError::DirectoryUnavailable(format!("own-user body: {e}"))
                })?;
                Ok(user.id)
            })
            .await
            .map(String::as_str)
    }

    /// Role mutation PUT/DELETE share everything but the verb.
    async fn mutate_role(
        &self,
        method: reqwest::Method,
        member: &MemberId,
        role: RoleId,
    ) -> MembershipResult<()> {
        let url = format!(
            "{}/guilds/{}/members/{}/roles/{}",
            self.base, self.guild_id, member, role
        );
        let response = self
            .client
            .request(method, &url)
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(|e| {
                MembershipError::DirectoryUnavailable(format!("role mutation failed: {e}"))
            })?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(MembershipError::MemberNotFound(member.to_string())),
            s => Err(MembershipError::DirectoryUnavailable(format!(
                "role mutation returned {s}"
            ))),
        }
    }

    async fn post_message(&self, channel: u64, content: &str) -> MembershipResult<()> {
        let url = format!("{}/channels/{}/messages", self.base, channel);
        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth())
            .json(&json!({ "content": content }))
            .send()
            .await
            .map_err(|e| {
                MembershipError::DirectoryUnavailable(format!("message send failed: {e}"))
            })?;
        if !response.status().is_success() {
            return Err(MembershipError::DirectoryUnavailable(format!(
                "message send returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

fn parse_snowflake(raw: &str) -> MembershipResult<u64> {
    raw.parse().map_err(|_| {
        MembershipError::DirectoryUnavailable(format!("unparseable snowflake: {raw}"))
    })
}

#[async_trait::async_trait]
impl Directory for RestDirectory {
    async fn fetch_member(&self, member: &MemberId) -> MembershipResult<Member> {
        let url = format!("{}/guilds/{}/members/{}", self.base, self.guild_id, member);
        let response = self
            .client
            .get(&url)
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(|e| {
                tracing::error!(user_id = %member, "Member fetch transport failure: {}", e);
                MembershipError::DirectoryUnavailable(format!("member fetch failed: {e}"))
            })?;
        match response.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(MembershipError::MemberNotFound(member.to_string()))
            }
            s => {
                return Err(MembershipError::DirectoryUnavailable(format!(
                    "member fetch returned {s}"
                )))
            }
        }
        let body: MemberBody = response.json().await.map_err(|e| {
            MembershipError::DirectoryUnavailable(format!("member body: {e}"))
        })?;
        let role_ids = body
            .roles
            .iter()
            .map(|raw| parse_snowflake(raw).map(RoleId))
            .collect::<MembershipResult<Vec<_>>>()?;
        Ok(Member {
            id: MemberId::new(&body.user.id),
            username: body.user.username,
            role_ids,
        })
    }

    async fn own_member(&self) -> MembershipResult<Member> {
        let own_id = self.own_user_id().await?.to_string();
        self.fetch_member(&MemberId(own_id)).await
    }

    async fn guild_roles(&self) -> MembershipResult<Vec<Role>> {
        let url = format!("{}/guilds/{}/roles", self.base, self.guild_id);
        let response = self
            .client
            .get(&url)
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(|e| {
                MembershipError::DirectoryUnavailable(format!("role list failed: {e}"))
            })?;
        if !response.status().is_success() {
            return Err(MembershipError::DirectoryUnavailable(format!(
                "role list returned {}",
                response.status()
            )));
        }
        let bodies: Vec<RoleBody> = response.json().await.map_err(|e| {
            MembershipError::DirectoryUnavailable(format!("role list body: {e}"))
        })?;
        bodies
            .into_iter()
            .map(|r| {
                Ok(Role {
                    id: RoleId(parse_snowflake(&r.id)?),
                    name: r.name,
                    position: r.position,
                })
            })
            .collect()
    }

    async fn add_role(&self, member: &MemberId, role: RoleId) -> MembershipResult<()> {
        self.mutate_role(reqwest::Method::PUT, member, role).await
    }

    async fn remove_role(&self, member: &MemberId, role: RoleId) -> MembershipResult<()> {
        self.mutate_role(reqwest::Method::DELETE, member, role).await
    }

    async fn create_private_channel(&self, req: &NewChannel) -> MembershipResult<ChannelId> {
        let own_id = self.own_user_id().await?;
        let url = format!("{}/guilds/{}/channels", self.base, self.guild_id);
        // The everyone role id equals the guild id.
        let body = json!({
            "name": req.name,
            "type": 0,
            "parent_id": req.category.to_string(),
            "permission_overwrites": [
                { "id": self.guild_id.to_string(), "type": 0, "deny": DENY_EVERYONE.to_string() },
                { "id": req.member.to_string(), "type": 1, "allow": ALLOW_MEMBER.to_string() },
                { "id": own_id, "type": 1, "allow": ALLOW_SERVICE.to_string() },
            ],
        });
        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                MembershipError::DirectoryUnavailable(format!("channel create failed: {e}"))
            })?;
        if !response.status().is_success() {
            return Err(MembershipError::DirectoryUnavailable(format!(
                "channel create returned {}",
                response.status()
            )));
        }
        let channel: ChannelBody = response.json().await.map_err(|e| {
            MembershipError::DirectoryUnavailable(format!("channel body: {e}"))
        })?;
        Ok(ChannelId(parse_snowflake(&channel.id)?))
    }

    async fn find_text_channel(&self, name: &str) -> MembershipResult<Option<ChannelId>> {
        let url = format!("{}/guilds/{}/channels", self.base, self.guild_id);
        let response = self
            .client
            .get(&url)
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(|e| {
                MembershipError::DirectoryUnavailable(format!("channel list failed: {e}"))
            })?;
        if !response.status().is_success() {
            return Err(MembershipError::DirectoryUnavailable(format!(
                "channel list returned {}",
                response.status()
            )));
        }
        let bodies: Vec<GuildChannelBody> = response.json().await.map_err(|e| {
            MembershipError::DirectoryUnavailable(format!("channel list body: {e}"))
        })?;
        let found = bodies.iter().find(|c| c.kind == 0 && c.name == name);
        match found {
            Some(c) => Ok(Some(ChannelId(parse_snowflake(&c.id)?))),
            None => Ok(None),
        }
    }

    async fn delete_channel(&self, channel: ChannelId) -> MembershipResult<()> {
        let url = format!("{}/channels/{}", self.base, channel);
        let response = self
            .client
            .delete(&url)
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(|e| {
                MembershipError::DirectoryUnavailable(format!("channel delete failed: {e}"))
            })?;
        // Deleting an already-deleted channel is a no-op.
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(MembershipError::DirectoryUnavailable(format!(
                "channel delete returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn send_channel_message(
        &self,
        channel: ChannelId,
        content: &str,
    ) -> MembershipResult<()> {
        self.post_message(channel.0, content).await
    }

    async fn send_dm(&self, member: &MemberId, content: &str) -> MembershipResult<()> {
        let url = format!("{}/users/@me/channels", self.base);
        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth())
            .json(&json!({ "recipient_id": member.to_string() }))
            .send()
            .await
            .map_err(|e| {
                MembershipError::DirectoryUnavailable(format!("dm open failed: {e}"))
            })?;
        if !response.status().is_success() {
            return Err(MembershipError::DirectoryUnavailable(format!(
                "dm open returned {}",
                response.status()
            )));
        }
        let channel: ChannelBody = response.json().await.map_err(|e| {
            MembershipError::DirectoryUnavailable(format!("dm channel body: {e}"))
        })?;
        self.post_message(parse_snowflake(&channel.id)?, content).await
    }
}
