use grade_monitor::{report::GradeReport, session::Selection, store::UserId};
use log::debug;

use crate::messenger::{ChannelMessage, MessageId, Messenger, OutgoingMessage};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Trigger {
    Scheduled,
    SelectionChanged,
    ManualRefresh,
    Registration,
}

impl Trigger {
    /// Interactive triggers wait for a running cycle instead of being dropped.
    pub fn is_interactive(self) -> bool {
        !matches!(self, Self::Scheduled)
    }
}

/// What a user's channel holds before a cycle delivers.
#[derive(Clone, PartialEq, Debug)]
pub enum Standing {
    Empty,
    /// Exactly one message, carrying a report.
    Report {
        id: MessageId,
        report: GradeReport,
        selection: Selection,
    },
    /// Anything else: none of these is trusted.
    Strays(Vec<MessageId>),
}

impl Standing {
    pub fn detect(mut messages: Vec<ChannelMessage>) -> Self {
        match messages.len() {
            0 => Self::Empty,
            1 if messages[0].report.is_some() => {
                let message = messages.remove(0);
                Self::Report {
                    id: message.id,
                    report: message.report.unwrap_or_default(),
                    selection: message.selection,
                }
            }
            _ => Self::Strays(messages.into_iter().map(|m| m.id).collect()),
        }
    }

    pub fn selection(&self) -> Selection {
        match self {
            Self::Report { selection, .. } => selection.clone(),
            _ => Selection::default(),
        }
    }

    pub fn report_id(&self) -> Option<MessageId> {
        match self {
            Self::Report { id, .. } => Some(*id),
            _ => None,
        }
    }

    pub fn message_ids(&self) -> Vec<MessageId> {
        match self {
            Self::Empty => vec![],
            Self::Report { id, .. } => vec![*id],
            Self::Strays(ids) => ids.clone(),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Delivery {
    /// Update the standing message without notifying the user.
    EditInPlace(MessageId),
    /// Delete these and post a fresh message.
    Replace(Vec<MessageId>),
}

pub fn decide(trigger: Trigger, standing: &Standing, report: &GradeReport) -> Delivery {
    match (standing, trigger) {
        (Standing::Report { id, report: old, .. }, Trigger::Scheduled) if old.identical(report) => {
            Delivery::EditInPlace(*id)
        }
        (Standing::Report { id, .. }, Trigger::SelectionChanged) => Delivery::EditInPlace(*id),
        _ => Delivery::Replace(standing.message_ids()),
    }
}

/// Leaves `message` as the only message in the channel.
pub async fn deliver(
    messenger: &dyn Messenger,
    user_id: UserId,
    delivery: Delivery,
    message: &OutgoingMessage,
) -> anyhow::Result<MessageId> {
    match delivery {
        Delivery::EditInPlace(id) => {
            debug!("{user_id}: Updating message {id} in place");
            messenger.edit(user_id, id, message).await?;
            Ok(id)
        }
        Delivery::Replace(ids) => {
            purge(messenger, user_id, &ids).await?;
            messenger.send(user_id, message).await
        }
    }
}

pub async fn purge(messenger: &dyn Messenger, user_id: UserId, ids: &[MessageId]) -> anyhow::Result<()> {
    for &id in ids {
        debug!("{user_id}: Deleting message {id}");
        messenger.delete(user_id, id).await?;
    }
    Ok(())
}
