use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    ChannelId, GroupId, GuildId, Member, MembershipPlatform, PlatformError, Report,
    ReportPublisher, UserId,
};

const MEMBER_PAGE_SIZE: usize = 1000;

/// REST adapter for a single Discord guild.
#[derive(Clone)]
pub struct DiscordPlatform {
    client: Client,
    api_base: String,
    token: String,
    guild: GuildId,
}

impl std::fmt::Debug for DiscordPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordPlatform")
            .field("api_base", &self.api_base)
            .field("guild", &self.guild)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct GuildMemberPayload {
    user: UserPayload,
    #[serde(default)]
    nick: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    id: String,
    username: String,
    #[serde(default)]
    global_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RolePayload {
    id: String,
    #[serde(default)]
    managed: bool,
}

#[derive(Debug, Serialize)]
struct EmbedPayload<'a> {
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    color: u32,
    fields: Vec<EmbedFieldPayload<'a>>,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct EmbedFieldPayload<'a> {
    name: &'a str,
    value: &'a str,
    inline: bool,
}

impl DiscordPlatform {
    pub fn new(
        api_base: impl Into<String>,
        token: impl Into<String>,
        guild: GuildId,
        timeout: Duration,
    ) -> Result<Self, PlatformError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| PlatformError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            guild,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_base, path))
            .header("Authorization", format!("Bot {}", self.token))
    }

    fn member_path(&self, id: UserId) -> String {
        format!("/guilds/{}/members/{}", self.guild.0, id.0)
    }

    async fn send(&self, builder: RequestBuilder, subject: &str) -> Result<Response, PlatformError> {
        let response = builder
            .send()
            .await
            .map_err(|err| PlatformError::Transport(err.to_string()))?;
        check_status(response, subject).await
    }
}

async fn check_status(response: Response, subject: &str) -> Result<Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::FORBIDDEN => Err(PlatformError::Forbidden(subject.to_string())),
        StatusCode::NOT_FOUND => Err(PlatformError::NotFound(subject.to_string())),
        _ => {
            let message = response.text().await.unwrap_or_default();
            Err(PlatformError::Api {
                status: status.as_u16(),
                message: message.chars().take(200).collect(),
            })
        }
    }
}

fn parse_snowflake(raw: &str) -> Result<u64, PlatformError> {
    raw.parse::<u64>().map_err(|_| PlatformError::Api {
        status: 200,
        message: format!("invalid snowflake '{raw}'"),
    })
}

impl GuildMemberPayload {
    fn into_member(self) -> Result<Member, PlatformError> {
        let groups = self
            .roles
            .iter()
            .map(|role| parse_snowflake(role).map(GroupId))
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(Member {
            id: UserId(parse_snowflake(&self.user.id)?),
            username: self.user.global_name.unwrap_or(self.user.username),
            nickname: self.nick,
            groups,
        })
    }
}

#[async_trait]
impl MembershipPlatform for DiscordPlatform {
    async fn member(&self, id: UserId) -> Result<Option<Member>, PlatformError> {
        let builder = self.request(Method::GET, &self.member_path(id));
        let response = match self.send(builder, &format!("member {id}")).await {
            Ok(response) => response,
            Err(PlatformError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let payload: GuildMemberPayload = response
            .json()
            .await
            .map_err(|err| PlatformError::Transport(err.to_string()))?;
        payload.into_member().map(Some)
    }

    async fn set_display_name(&self, id: UserId, name: Option<&str>) -> Result<(), PlatformError> {
        let builder = self
            .request(Method::PATCH, &self.member_path(id))
            .json(&json!({ "nick": name }));
        self.send(builder, &format!("nickname of {id}")).await?;
        Ok(())
    }

    async fn add_group(&self, id: UserId, group: GroupId) -> Result<(), PlatformError> {
        let path = format!("{}/roles/{}", self.member_path(id), group.0);
        self.send(self.request(Method::PUT, &path), &format!("role {group}"))
            .await?;
        Ok(())
    }

    async fn remove_group(&self, id: UserId, group: GroupId) -> Result<(), PlatformError> {
        let path = format!("{}/roles/{}", self.member_path(id), group.0);
        self.send(self.request(Method::DELETE, &path), &format!("role {group}"))
            .await?;
        Ok(())
    }

    async fn group_members(&self, group: GroupId) -> Result<Vec<UserId>, PlatformError> {
        let mut holders = Vec::new();
        let mut after = 0_u64;
        loop {
            let path = format!(
                "/guilds/{}/members?limit={}&after={}",
                self.guild.0, MEMBER_PAGE_SIZE, after
            );
            let response = self
                .send(self.request(Method::GET, &path), "guild members")
                .await?;
            let page: Vec<GuildMemberPayload> = response
                .json()
                .await
                .map_err(|err| PlatformError::Transport(err.to_string()))?;
            let page_len = page.len();

            for payload in page {
                let member = payload.into_member()?;
                after = after.max(member.id.0);
                if member.has_group(group) {
                    holders.push(member.id);
                }
            }

            if page_len < MEMBER_PAGE_SIZE {
                break;
            }
        }
        Ok(holders)
    }

    async fn managed_groups(&self) -> Result<BTreeSet<GroupId>, PlatformError> {
        let path = format!("/guilds/{}/roles", self.guild.0);
        let response = self.send(self.request(Method::GET, &path), "guild roles").await?;
        let roles: Vec<RolePayload> = response
            .json()
            .await
            .map_err(|err| PlatformError::Transport(err.to_string()))?;

        let mut managed = BTreeSet::from([GroupId(self.guild.0)]);
        for role in roles.into_iter().filter(|role| role.managed) {
            managed.insert(GroupId(parse_snowflake(&role.id)?));
        }
        Ok(managed)
    }
}

#[async_trait]
impl ReportPublisher for DiscordPlatform {
    async fn publish(&self, channel: ChannelId, report: Report) -> Result<(), PlatformError> {
        let embed = EmbedPayload {
            title: &report.title,
            description: report.description.as_deref(),
            color: report.tone.color(),
            fields: report
                .fields
                .iter()
                .map(|field| EmbedFieldPayload {
                    name: &field.name,
                    value: &field.value,
                    inline: false,
                })
                .collect(),
            timestamp: report.timestamp.to_rfc3339(),
        };
        let path = format!("/channels/{}/messages", channel.0);
        let builder = self
            .request(Method::POST, &path)
            .json(&json!({ "embeds": [embed] }));
        self.send(builder, "report channel").await?;
        Ok(())
    }

    async fn send_text(&self, channel: ChannelId, text: &str) -> Result<(), PlatformError> {
        let path = format!("/channels/{}/messages", channel.0);
        let builder = self
            .request(Method::POST, &path)
            .json(&json!({ "content": text }));
        self.send(builder, "message channel").await?;
        Ok(())
    }
}
