use std::{sync::Arc, time::Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use grade_monitor::{
    error::PortalError,
    extractor::{load_student_data, GradeExtractor},
    portal::Services,
    session::{Selection, Session},
};
use log::{error, info, warn};
use tokio::sync::Mutex;

use crate::{
    messenger::{next_refresh_line, Controls, Messenger, OutgoingMessage, ReportCard, Selector},
    notification::{decide, deliver, purge, Standing, Trigger},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Outcome {
    Success,
    /// The user has to act; retrying sooner would not help.
    UserActionable,
    Failed,
}

/// When the next scheduled cycle runs, depending on how this one ends.
#[derive(Clone, Copy, Debug)]
pub struct NextRefresh {
    pub on_success: DateTime<Utc>,
    pub on_failure: DateTime<Utc>,
}

/// One fetch-and-notify pass for one user.
pub struct Cycle {
    pub services: Services,
    pub messenger: Arc<dyn Messenger>,
    pub session: Arc<Mutex<Session>>,
    pub trigger: Trigger,
    /// Selection changes requested since the last cycle.
    pub choice: Selection,
    pub next_refresh: NextRefresh,
}

impl Cycle {
    pub async fn run(self) -> Outcome {
        let session = Arc::clone(&self.session);
        let mut session = session.lock().await;
        let user_id = session.user_id();
        if let Some(semester) = self.choice.semester.clone() {
            session.select_semester(semester);
        }
        if let Some(final_grades_only) = self.choice.final_grades_only {
            session.select_final_grades_only(final_grades_only);
        }

        info!("{user_id}: Running a {:?} cycle", self.trigger);
        let started = Instant::now();
        let error = match self.attempt(&mut session).await {
            Ok(()) => {
                session.record_success();
                info!("{user_id}: Grades delivered in {:.1?}", started.elapsed());
                return Outcome::Success;
            }
            Err(e) => e,
        };

        let outcome = if let Some(actionable) = PortalError::user_actionable(&error) {
            warn!("{user_id}: {actionable}");
            Outcome::UserActionable
        } else {
            let failures = session.record_failure();
            error!("{user_id}: Cycle failed ({failures} in a row): {error:#}");
            Outcome::Failed
        };
        if let Err(e) = self.report_failure(&session, &error).await {
            error!("{user_id}: Could not report the failure: {e:#}");
        }
        outcome
    }

    async fn attempt(&self, session: &mut Session) -> anyhow::Result<()> {
        let user_id = session.user_id();
        let messages = self
            .messenger
            .channel_messages(user_id)
            .await
            .context("Reading the channel")?;
        let standing = Standing::detect(messages);

        session.login(&self.services).await?;
        let student = load_student_data(session, &self.services).await?;
        let (semester, final_grades_only) = session.resolve_selection(&student, &standing.selection());
        let report = GradeExtractor::new(session, &self.services, &student, &semester)
            .fetch_grades_report(final_grades_only)
            .await?;
        info!(
            "{user_id}: {} courses in {semester} (final grades only: {final_grades_only})",
            report.len()
        );

        let account = self
            .services
            .config
            .user(user_id)
            .with_context(|| format!("{user_id} is no longer registered"))?;
        let delivery = decide(self.trigger, &standing, &report);
        let message = OutgoingMessage {
            content: next_refresh_line(self.next_refresh.on_success),
            card: Some(ReportCard::new(
                &account.credentials.student_id,
                session.cgpa(),
                report,
                Utc::now(),
            )),
            controls: Controls::Full(Selector::new(
                student.semesters.iter().cloned(),
                semester,
                final_grades_only,
            )),
        };
        deliver(self.messenger.as_ref(), user_id, delivery, &message).await?;
        Ok(())
    }

    async fn report_failure(&self, session: &Session, error: &anyhow::Error) -> anyhow::Result<()> {
        let user_id = session.user_id();
        let messenger = self.messenger.as_ref();
        let standing = Standing::detect(messenger.channel_messages(user_id).await?);

        if let Some(actionable) = PortalError::user_actionable(error) {
            purge(messenger, user_id, &standing.message_ids()).await?;
            messenger
                .send(user_id, &OutgoingMessage::notice(format!("`{actionable}`")))
                .await?;
            return Ok(());
        }

        let text = format!(
            "{}🔂 ({})",
            next_refresh_line(self.next_refresh.on_failure),
            session.failures()
        );
        match standing.report_id() {
            Some(id) => messenger.edit_content(user_id, id, &text).await?,
            None => {
                purge(messenger, user_id, &standing.message_ids()).await?;
                let notice = format!("{text}\n\n`Faculty server is currently down.`");
                messenger
                    .send(user_id, &OutgoingMessage::notice(notice))
                    .await?;
            }
        }
        Ok(())
    }
}
