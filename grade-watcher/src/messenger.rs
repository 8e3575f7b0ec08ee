use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::{Display, From, FromStr};
use grade_monitor::{report::GradeReport, semester, session::Selection, store::UserId};
use grade_monitor_utils::credentials::StudentId;

pub const SELECT_SEMESTER: &str = "select-semester";
pub const SELECT_MODE: &str = "select-mode";
pub const REFRESH_GRADES: &str = "refresh-grades";
pub const REFETCH_COURSES: &str = "refetch-courses";

pub const FINAL_GRADES_MODE: &str = "Mode 1: Final Grades";
pub const ALL_GRADES_MODE: &str = "Mode 2: All Grades";

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, From, FromStr)]
pub struct MessageId(pub u64);

/// `Next refresh <t:UNIX:R> 🕒`, rendered by the client as a relative time.
pub fn next_refresh_line(at: DateTime<Utc>) -> String {
    format!("Next refresh <t:{}:R> 🕒", at.timestamp())
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReportCard {
    pub title: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub report: GradeReport,
}

impl ReportCard {
    pub fn new(
        student_id: &StudentId,
        cgpa: Option<&str>,
        report: GradeReport,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            title: format!("Grades Report For {student_id}"),
            description: format!("**||__Cumulative GPA: {}__||**", cgpa.unwrap_or("N/A")),
            timestamp,
            report,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectOption {
    pub label: String,
    pub description: Option<&'static str>,
    pub emoji: &'static str,
    pub default: bool,
}

/// Semester and mode selectors of a report, plus its buttons.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selector {
    semesters: Vec<String>,
    selected: String,
    final_grades_only: bool,
}

impl Selector {
    pub fn new(
        semesters: impl IntoIterator<Item = String>,
        selected: String,
        final_grades_only: bool,
    ) -> Self {
        let mut semesters = semesters.into_iter().collect::<Vec<_>>();
        if !semesters.contains(&selected) {
            semesters.push(selected.clone());
        }
        semester::sort_chronologically(&mut semesters);
        Self {
            semesters,
            selected,
            final_grades_only,
        }
    }

    pub fn selection(&self) -> Selection {
        Selection {
            semester: Some(self.selected.clone()),
            final_grades_only: Some(self.final_grades_only),
        }
    }

    pub fn semester_options(&self) -> Vec<SelectOption> {
        self.semesters
            .iter()
            .map(|label| SelectOption {
                label: label.clone(),
                description: None,
                emoji: semester::parse(label).map_or("📅", |(season, _)| season.emoji()),
                default: *label == self.selected,
            })
            .collect()
    }

    pub fn mode_options(&self) -> Vec<SelectOption> {
        vec![
            SelectOption {
                label: FINAL_GRADES_MODE.into(),
                description: Some(
                    "Fetches only final course grade. This can be faster as it visits fewer pages.",
                ),
                emoji: "🔴",
                default: self.final_grades_only,
            },
            SelectOption {
                label: ALL_GRADES_MODE.into(),
                description: Some(
                    "Fetches all course grades such as final, midterm, activities, etc.",
                ),
                emoji: "🟢",
                default: !self.final_grades_only,
            },
        ]
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Controls {
    None,
    /// A lone refresh button, attached to notices.
    Refresh,
    Full(Selector),
}

#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingMessage {
    pub content: String,
    pub card: Option<ReportCard>,
    pub controls: Controls,
}

impl OutgoingMessage {
    pub fn notice(content: String) -> Self {
        Self {
            content,
            card: None,
            controls: Controls::Refresh,
        }
    }

    /// What [`Messenger::channel_messages`] recovers from this message once
    /// it is delivered.
    pub fn read_back(&self, id: MessageId) -> ChannelMessage {
        ChannelMessage {
            id,
            report: self.card.as_ref().map(|card| card.report.clone()),
            selection: match &self.controls {
                Controls::Full(selector) => selector.selection(),
                _ => Selection::default(),
            },
        }
    }
}

/// A message found in a user's channel.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelMessage {
    pub id: MessageId,
    pub report: Option<GradeReport>,
    pub selection: Selection,
}

/// The chat platform, addressed per user through their private channel.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Messages the bot has posted in the user's channel, newest first.
    async fn channel_messages(&self, user_id: UserId) -> anyhow::Result<Vec<ChannelMessage>>;
    async fn send(&self, user_id: UserId, message: &OutgoingMessage) -> anyhow::Result<MessageId>;
    async fn edit(
        &self,
        user_id: UserId,
        id: MessageId,
        message: &OutgoingMessage,
    ) -> anyhow::Result<()>;
    async fn edit_content(&self, user_id: UserId, id: MessageId, content: &str) -> anyhow::Result<()>;
    async fn delete(&self, user_id: UserId, id: MessageId) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{next_refresh_line, ReportCard, Selector};

    #[test]
    fn semester_selector_is_chronological() {
        let selector = Selector::new(
            ["Fall 2024", "Spring 2024", "Summer 2024", "Fall 2023"].map(String::from),
            "Spring 2024".into(),
            false,
        );
        let options = selector.semester_options();
        assert_eq!(
            options.iter().map(|o| o.label.as_str()).collect::<Vec<_>>(),
            ["Fall 2023", "Spring 2024", "Summer 2024", "Fall 2024"]
        );
        assert_eq!(
            options.iter().map(|o| o.emoji).collect::<Vec<_>>(),
            ["🍂", "🌸", "☀️", "🍂"]
        );
        assert_eq!(
            options.iter().filter(|o| o.default).map(|o| o.label.as_str()).collect::<Vec<_>>(),
            ["Spring 2024"]
        );
    }

    #[test]
    fn mode_selector_marks_the_current_mode() {
        let selector = Selector::new(vec![], "Fall 2024".into(), true);
        let modes = selector.mode_options();
        assert!(modes[0].default && !modes[1].default);
        assert_eq!(selector.semester_options().len(), 1);
        assert_eq!(selector.selection().final_grades_only, Some(true));
    }

    #[test]
    fn card_and_footer() {
        let at = Utc.with_ymd_and_hms(2024, 10, 1, 12, 0, 0).unwrap();
        let card = ReportCard::new(&"2100123".to_owned().into(), Some("3.41"), Default::default(), at);
        assert_eq!(card.title, "Grades Report For 2100123");
        assert_eq!(card.description, "**||__Cumulative GPA: 3.41__||**");
        assert_eq!(next_refresh_line(at), "Next refresh <t:1727784000:R> 🕒");
    }
}
