//! Discord REST (v10) adapter for [`Messenger`].
//!
//! Every user is addressed through the bot's DM channel with them.  Only
//! messages authored by the bot are reported back.

use std::{collections::HashMap, sync::Mutex, time::Duration};

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use grade_monitor::{report::GradeReport, session::Selection, store::UserId};
use log::{trace, warn};
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION},
    RequestBuilder, Response, StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use tokio::sync::OnceCell;
use url::Url;

use crate::messenger::{
    ChannelMessage, Controls, MessageId, Messenger, OutgoingMessage, SelectOption, Selector,
    FINAL_GRADES_MODE, REFETCH_COURSES, REFRESH_GRADES, SELECT_MODE, SELECT_SEMESTER,
};

const ACTION_ROW: u8 = 1;
const BUTTON: u8 = 2;
const STRING_SELECT: u8 = 3;
const SECONDARY: u8 = 2;
const RATE_LIMIT_RETRIES: usize = 5;

#[derive(Deserialize)]
struct Snowflake {
    id: String,
}

#[derive(Deserialize)]
struct RateLimited {
    retry_after: f64,
}

#[derive(Deserialize)]
struct WireMessage {
    id: String,
    author: Snowflake,
    #[serde(default)]
    embeds: Vec<WireEmbed>,
    #[serde(default)]
    components: Vec<WireComponent>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Default, PartialEq, Debug)]
struct WireEmbed {
    title: Option<String>,
    description: Option<String>,
    timestamp: Option<String>,
    #[serde(default)]
    fields: Vec<WireField>,
}

#[derive(Serialize, Deserialize, PartialEq, Debug)]
struct WireField {
    name: String,
    value: String,
    #[serde(default)]
    inline: bool,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Default, PartialEq, Debug)]
struct WireComponent {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    components: Vec<WireComponent>,
    custom_id: Option<String>,
    label: Option<String>,
    style: Option<u8>,
    emoji: Option<WireEmoji>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    options: Vec<WireOption>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, PartialEq, Debug)]
struct WireOption {
    label: String,
    value: String,
    description: Option<String>,
    emoji: Option<WireEmoji>,
    #[serde(default)]
    default: bool,
}

#[derive(Serialize, Deserialize, PartialEq, Debug)]
struct WireEmoji {
    name: String,
}

#[derive(Serialize, PartialEq, Debug)]
struct WireOutgoing<'a> {
    content: &'a str,
    embeds: Vec<WireEmbed>,
    components: Vec<WireComponent>,
}

fn row(components: Vec<WireComponent>) -> WireComponent {
    WireComponent {
        kind: ACTION_ROW,
        components,
        ..Default::default()
    }
}

fn select(custom_id: &str, options: Vec<SelectOption>) -> WireComponent {
    WireComponent {
        kind: STRING_SELECT,
        custom_id: Some(custom_id.into()),
        options: options
            .into_iter()
            .map(|option| WireOption {
                value: option.label.clone(),
                label: option.label,
                description: option.description.map(Into::into),
                emoji: Some(WireEmoji {
                    name: option.emoji.into(),
                }),
                default: option.default,
            })
            .collect(),
        ..Default::default()
    }
}

fn button(custom_id: &str, label: &str) -> WireComponent {
    WireComponent {
        kind: BUTTON,
        custom_id: Some(custom_id.into()),
        label: Some(label.into()),
        style: Some(SECONDARY),
        emoji: Some(WireEmoji { name: "🔄".into() }),
        ..Default::default()
    }
}

fn encode(message: &OutgoingMessage) -> WireOutgoing<'_> {
    let embeds = message
        .card
        .iter()
        .map(|card| WireEmbed {
            title: Some(card.title.clone()),
            description: Some(card.description.clone()),
            timestamp: Some(card.timestamp.to_rfc3339()),
            fields: card
                .report
                .iter()
                .map(|(course, details)| WireField {
                    name: course.into(),
                    value: details.into(),
                    inline: false,
                })
                .collect(),
        })
        .collect();
    let components = match &message.controls {
        Controls::None => vec![],
        Controls::Refresh => vec![row(vec![button(REFRESH_GRADES, "Refresh")])],
        Controls::Full(selector) => encode_selector(selector),
    };
    WireOutgoing {
        content: &message.content,
        embeds,
        components,
    }
}

fn encode_selector(selector: &Selector) -> Vec<WireComponent> {
    vec![
        row(vec![select(SELECT_SEMESTER, selector.semester_options())]),
        row(vec![select(SELECT_MODE, selector.mode_options())]),
        row(vec![
            button(REFRESH_GRADES, "Refresh Grades"),
            button(REFETCH_COURSES, "Refetch Courses"),
        ]),
    ]
}

fn decode(message: WireMessage) -> anyhow::Result<ChannelMessage> {
    let id = message
        .id
        .parse()
        .with_context(|| format!("Bad message id: {:?}", message.id))?;
    let report = message.embeds.into_iter().next().map(|embed| {
        embed
            .fields
            .into_iter()
            .map(|field| (field.name, field.value))
            .collect::<GradeReport>()
    });
    let selects = message
        .components
        .iter()
        .flat_map(|row| &row.components)
        .filter(|component| component.kind == STRING_SELECT)
        .collect::<Vec<_>>();
    let chosen = |custom_id: &str| {
        selects
            .iter()
            .copied()
            .filter(|select| select.custom_id.as_deref() == Some(custom_id))
            .flat_map(|select| &select.options)
            .find(|option| option.default)
            .map(|option| option.value.clone())
    };
    let selection = Selection {
        semester: chosen(SELECT_SEMESTER),
        final_grades_only: chosen(SELECT_MODE).map(|mode| mode == FINAL_GRADES_MODE),
    };
    Ok(ChannelMessage {
        id: MessageId(id),
        report,
        selection,
    })
}

pub struct Discord {
    client: reqwest::Client,
    api: Url,
    bot_user: OnceCell<String>,
    channels: Mutex<HashMap<UserId, String>>,
}

impl Discord {
    pub fn new(bot_token: &str, api: Url) -> anyhow::Result<Self> {
        let mut authorization = HeaderValue::from_str(&format!("Bot {bot_token}"))?;
        authorization.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, authorization);
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(concat!("DiscordBot (grade-watcher, ", env!("CARGO_PKG_VERSION"), ")"))
            .build()?;
        Ok(Self {
            client,
            api,
            bot_user: OnceCell::new(),
            channels: Mutex::new(HashMap::new()),
        })
    }

    fn endpoint(&self, path: &str) -> anyhow::Result<Url> {
        Ok(self.api.join(path)?)
    }

    async fn call(&self, request: RequestBuilder) -> anyhow::Result<Response> {
        for _ in 0..RATE_LIMIT_RETRIES {
            let response = request
                .try_clone()
                .ok_or_else(|| anyhow!("Request cannot be retried"))?
                .send()
                .await?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response.error_for_status()?);
            }
            let limit = response.json::<RateLimited>().await?;
            warn!("Rate limited.  Retrying after {}s", limit.retry_after);
            tokio::time::sleep(Duration::from_secs_f64(limit.retry_after)).await;
        }
        bail!("Still rate limited after {RATE_LIMIT_RETRIES} attempts")
    }

    async fn bot_user_id(&self) -> anyhow::Result<&str> {
        let id = self
            .bot_user
            .get_or_try_init(|| async {
                let url = self.endpoint("users/@me")?;
                let me = self.call(self.client.get(url)).await?;
                anyhow::Ok(me.json::<Snowflake>().await?.id)
            })
            .await?;
        Ok(id.as_str())
    }

    async fn channel(&self, user_id: UserId) -> anyhow::Result<String> {
        if let Some(channel) = self.channels.lock().unwrap_or_else(|e| e.into_inner()).get(&user_id) {
            return Ok(channel.clone());
        }
        let url = self.endpoint("users/@me/channels")?;
        let body = serde_json::json!({ "recipient_id": user_id.to_string() });
        let channel = self
            .call(self.client.post(url).json(&body))
            .await
            .with_context(|| format!("Opening a DM channel with {user_id}"))?
            .json::<Snowflake>()
            .await?
            .id;
        trace!("{user_id}: DM channel {channel}");
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_id, channel.clone());
        Ok(channel)
    }

    async fn message_url(&self, user_id: UserId, id: Option<MessageId>) -> anyhow::Result<Url> {
        let channel = self.channel(user_id).await?;
        match id {
            Some(id) => self.endpoint(&format!("channels/{channel}/messages/{id}")),
            None => self.endpoint(&format!("channels/{channel}/messages")),
        }
    }
}

#[async_trait]
impl Messenger for Discord {
    async fn channel_messages(&self, user_id: UserId) -> anyhow::Result<Vec<ChannelMessage>> {
        let bot = self.bot_user_id().await?.to_owned();
        let mut url = self.message_url(user_id, None).await?;
        url.query_pairs_mut().append_pair("limit", "50");
        let messages = self
            .call(self.client.get(url))
            .await?
            .json::<Vec<WireMessage>>()
            .await?;
        messages
            .into_iter()
            .filter(|message| message.author.id == bot)
            .map(decode)
            .collect()
    }

    async fn send(&self, user_id: UserId, message: &OutgoingMessage) -> anyhow::Result<MessageId> {
        let url = self.message_url(user_id, None).await?;
        let sent = self
            .call(self.client.post(url).json(&encode(message)))
            .await?
            .json::<Snowflake>()
            .await?;
        Ok(MessageId(sent.id.parse()?))
    }

    async fn edit(
        &self,
        user_id: UserId,
        id: MessageId,
        message: &OutgoingMessage,
    ) -> anyhow::Result<()> {
        let url = self.message_url(user_id, Some(id)).await?;
        self.call(self.client.patch(url).json(&encode(message)))
            .await?;
        Ok(())
    }

    async fn edit_content(&self, user_id: UserId, id: MessageId, content: &str) -> anyhow::Result<()> {
        let url = self.message_url(user_id, Some(id)).await?;
        let body = serde_json::json!({ "content": content });
        self.call(self.client.patch(url).json(&body)).await?;
        Ok(())
    }

    async fn delete(&self, user_id: UserId, id: MessageId) -> anyhow::Result<()> {
        let url = self.message_url(user_id, Some(id)).await?;
        self.call(self.client.delete(url)).await?;
        Ok(())
    }
}
