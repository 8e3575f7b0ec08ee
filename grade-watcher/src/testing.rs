use std::{collections::HashMap, sync::Mutex};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use grade_monitor::store::UserId;

use crate::messenger::{ChannelMessage, MessageId, Messenger, OutgoingMessage};

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Event {
    Sent(UserId, MessageId),
    Edited(UserId, MessageId),
    EditedContent(UserId, MessageId, String),
    Deleted(UserId, MessageId),
}

#[derive(Default)]
struct MessengerState {
    last_id: u64,
    channels: HashMap<UserId, Vec<(MessageId, OutgoingMessage)>>,
    events: Vec<Event>,
    down: bool,
}

/// Keeps every channel in memory and records what was done to it.
#[derive(Default)]
pub struct FakeMessenger {
    state: Mutex<MessengerState>,
}

impl FakeMessenger {
    /// Puts a message in the channel without recording an event.
    pub fn seed(&self, user_id: UserId, message: OutgoingMessage) -> MessageId {
        let mut state = self.state.lock().unwrap();
        state.last_id += 1;
        let id = MessageId(state.last_id);
        state.channels.entry(user_id).or_default().push((id, message));
        id
    }

    pub fn messages(&self, user_id: UserId) -> Vec<OutgoingMessage> {
        let state = self.state.lock().unwrap();
        state
            .channels
            .get(&user_id)
            .map(|messages| messages.iter().map(|(_, m)| m.clone()).collect())
            .unwrap_or_default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut self.state.lock().unwrap().events)
    }

    /// Makes every call fail.
    pub fn set_down(&self, down: bool) {
        self.state.lock().unwrap().down = down;
    }

    fn with<R>(
        &self,
        f: impl FnOnce(&mut MessengerState) -> anyhow::Result<R>,
    ) -> anyhow::Result<R> {
        let mut state = self.state.lock().unwrap();
        if state.down {
            bail!("Messenger is down");
        }
        f(&mut state)
    }
}

fn find(
    state: &mut MessengerState,
    user_id: UserId,
    id: MessageId,
) -> anyhow::Result<&mut OutgoingMessage> {
    state
        .channels
        .get_mut(&user_id)
        .and_then(|messages| messages.iter_mut().find(|(i, _)| *i == id))
        .map(|(_, message)| message)
        .ok_or_else(|| anyhow!("Unknown message {id}"))
}

#[async_trait]
impl Messenger for FakeMessenger {
    async fn channel_messages(&self, user_id: UserId) -> anyhow::Result<Vec<ChannelMessage>> {
        self.with(|state| {
            Ok(state
                .channels
                .get(&user_id)
                .map(|messages| {
                    messages
                        .iter()
                        .rev()
                        .map(|(id, message)| message.read_back(*id))
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    async fn send(&self, user_id: UserId, message: &OutgoingMessage) -> anyhow::Result<MessageId> {
        self.with(|state| {
            state.last_id += 1;
            let id = MessageId(state.last_id);
            state
                .channels
                .entry(user_id)
                .or_default()
                .push((id, message.clone()));
            state.events.push(Event::Sent(user_id, id));
            Ok(id)
        })
    }

    async fn edit(
        &self,
        user_id: UserId,
        id: MessageId,
        message: &OutgoingMessage,
    ) -> anyhow::Result<()> {
        self.with(|state| {
            *find(state, user_id, id)? = message.clone();
            state.events.push(Event::Edited(user_id, id));
            Ok(())
        })
    }

    async fn edit_content(&self, user_id: UserId, id: MessageId, content: &str) -> anyhow::Result<()> {
        self.with(|state| {
            find(state, user_id, id)?.content = content.to_owned();
            state
                .events
                .push(Event::EditedContent(user_id, id, content.to_owned()));
            Ok(())
        })
    }

    async fn delete(&self, user_id: UserId, id: MessageId) -> anyhow::Result<()> {
        self.with(|state| {
            find(state, user_id, id)?;
            if let Some(messages) = state.channels.get_mut(&user_id) {
                messages.retain(|(i, _)| *i != id);
            }
            state.events.push(Event::Deleted(user_id, id));
            Ok(())
        })
    }
}
