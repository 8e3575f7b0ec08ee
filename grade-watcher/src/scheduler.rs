use std::{collections::HashMap, mem, sync::Arc, time::Duration};

use anyhow::bail;
use chrono::{DateTime, Utc};
use grade_monitor::{
    portal::Services,
    session::{Selection, Session},
    store::{Intervals, UserId},
};
use itertools::Itertools;
use log::{debug, info, warn};
use tokio::{
    sync::{mpsc, Mutex},
    time::{interval, MissedTickBehavior},
};

use crate::{
    commands::{Command, Request},
    cycle::{Cycle, NextRefresh, Outcome},
    messenger::Messenger,
    notification::Trigger,
    timetable::Timetable,
};

struct Slot {
    session: Arc<Mutex<Session>>,
    running: bool,
    pending: Option<Trigger>,
    /// Selection changes not yet handed to a cycle.
    choice: Selection,
}

impl Slot {
    fn new(session: Session) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
            running: false,
            pending: None,
            choice: Selection::default(),
        }
    }
}

/// A deferred trigger that resends wins over a selection change.
fn merge(pending: Option<Trigger>, trigger: Trigger) -> Trigger {
    match (pending, trigger) {
        (Some(pending), Trigger::SelectionChanged) => pending,
        (_, trigger) => trigger,
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(now)
}

/// Owns every session and drives their cycles from one loop.
pub struct Scheduler {
    services: Services,
    messenger: Arc<dyn Messenger>,
    timetable: Timetable<UserId>,
    slots: HashMap<UserId, Slot>,
    finished_tx: mpsc::UnboundedSender<(UserId, Outcome)>,
    finished_rx: mpsc::UnboundedReceiver<(UserId, Outcome)>,
}

impl Scheduler {
    pub fn new(services: Services, messenger: Arc<dyn Messenger>) -> Self {
        let intervals = services.config.intervals();
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        Self {
            services,
            messenger,
            timetable: Timetable::new(intervals.normal(), intervals.after_failure()),
            slots: HashMap::new(),
            finished_tx,
            finished_rx,
        }
    }

    /// Creates a session for every registered user and staggers them.
    pub fn start(&mut self) -> anyhow::Result<()> {
        let users = self
            .services
            .config
            .read(|config| config.users.iter().map(|user| user.user_id).collect_vec());
        info!("Scheduling {} users", users.len());
        for &user_id in &users {
            let session = Session::new(user_id, &self.services)?;
            self.slots.insert(user_id, Slot::new(session));
        }
        for user_id in self.timetable.start(users) {
            self.trigger(user_id, Trigger::Scheduled);
        }
        Ok(())
    }

    pub async fn run(mut self, mut requests: mpsc::Receiver<Request>) -> anyhow::Result<()> {
        self.start()?;
        let mut tick = interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => self.tick(),
                Some((user_id, outcome)) = self.finished_rx.recv() => self.finish(user_id, outcome),
                request = requests.recv() => match request {
                    Some(request) => self.handle(request),
                    None => {
                        info!("Command queue closed.  Stopping the scheduler.");
                        return Ok(());
                    }
                },
            }
        }
    }

    fn tick(&mut self) {
        for user_id in self.timetable.tick() {
            self.trigger(user_id, Trigger::Scheduled);
        }
    }

    fn trigger(&mut self, user_id: UserId, trigger: Trigger) {
        let Some(slot) = self.slots.get_mut(&user_id) else {
            warn!("{user_id}: No session to trigger");
            return;
        };
        if slot.running {
            if trigger.is_interactive() {
                debug!("{user_id}: Deferring {trigger:?} until the running cycle ends");
                slot.pending = Some(merge(slot.pending, trigger));
            } else {
                debug!("{user_id}: Previous cycle still running.  Skipping this one.");
            }
            return;
        }

        slot.running = true;
        let now = Utc::now();
        let next_refresh = NextRefresh {
            on_success: after(
                now,
                self.timetable
                    .next_after_success(&user_id)
                    .unwrap_or_else(|| self.services.config.intervals().normal()),
            ),
            on_failure: after(now, self.timetable.after_failure()),
        };
        let cycle = Cycle {
            services: self.services.clone(),
            messenger: Arc::clone(&self.messenger),
            session: Arc::clone(&slot.session),
            trigger,
            choice: mem::take(&mut slot.choice),
            next_refresh,
        };
        let finished = self.finished_tx.clone();
        tokio::spawn(async move {
            let outcome = cycle.run().await;
            // Only fails when the scheduler is gone.
            let _ = finished.send((user_id, outcome));
        });
    }

    fn finish(&mut self, user_id: UserId, outcome: Outcome) {
        debug!("{user_id}: Cycle finished: {outcome:?}");
        match outcome {
            Outcome::Success => self.timetable.succeed(&user_id),
            Outcome::Failed => self.timetable.shorten(&user_id),
            Outcome::UserActionable => {}
        }
        let Some(slot) = self.slots.get_mut(&user_id) else {
            return;
        };
        slot.running = false;
        if let Some(trigger) = slot.pending.take() {
            self.trigger(user_id, trigger);
        }
    }

    fn handle(&mut self, request: Request) {
        let Request {
            user_id,
            command,
            reply,
        } = request;
        info!("{user_id}: {command:?}");
        let answer = self.apply(user_id, command).unwrap_or_else(|e| {
            warn!("{user_id}: {e:#}");
            e.to_string()
        });
        if reply.send(answer).is_err() {
            debug!("{user_id}: Nobody is waiting for the answer");
        }
    }

    fn apply(&mut self, user_id: UserId, command: Command) -> anyhow::Result<String> {
        if !matches!(command, Command::Register(_)) && !self.slots.contains_key(&user_id) {
            bail!("You are not registered yet.  Use `register <student-id> <password>` first.");
        }
        match command {
            Command::Register(credentials) => {
                self.services
                    .config
                    .update(|config| config.register(user_id, credentials))?;
                let session = Session::new(user_id, &self.services)?;
                match self.slots.get_mut(&user_id) {
                    Some(slot) => {
                        slot.session = Arc::new(Mutex::new(session));
                        slot.choice = Selection::default();
                    }
                    None => {
                        self.slots.insert(user_id, Slot::new(session));
                    }
                }
                self.timetable.join(user_id);
                self.trigger(user_id, Trigger::Registration);
                Ok("You will receive a private message with your grades within a few seconds.".into())
            }
            Command::SelectSemester(semester) => {
                let answer = format!("Switching to {semester}.");
                self.choose(user_id, |choice| choice.semester = Some(semester));
                Ok(answer)
            }
            Command::SelectMode { final_grades_only } => {
                self.choose(user_id, |choice| {
                    choice.final_grades_only = Some(final_grades_only)
                });
                Ok(if final_grades_only {
                    "Showing final grades only.".into()
                } else {
                    "Showing all grades.".into()
                })
            }
            Command::Refresh => {
                self.trigger(user_id, Trigger::ManualRefresh);
                Ok("Refreshing your grades.".into())
            }
            Command::Refetch => {
                self.services.config.update(|config| {
                    if let Some(account) = config.user_mut(user_id) {
                        account.semesters.values_mut().for_each(|courses| courses.clear());
                    }
                })?;
                self.trigger(user_id, Trigger::ManualRefresh);
                Ok("Looking for your courses again.".into())
            }
            Command::SetIntervals {
                normal_minutes,
                after_failure_minutes,
            } => {
                let intervals = Intervals::validated(normal_minutes, after_failure_minutes)?;
                self.services
                    .config
                    .update(|config| config.intervals = intervals)?;
                self.timetable
                    .set_intervals(intervals.normal(), intervals.after_failure());
                Ok(format!(
                    "Refreshing every {normal_minutes} minutes, or {after_failure_minutes} after an error."
                ))
            }
        }
    }

    fn choose(&mut self, user_id: UserId, f: impl FnOnce(&mut Selection)) {
        if let Some(slot) = self.slots.get_mut(&user_id) {
            f(&mut slot.choice);
        }
        self.trigger(user_id, Trigger::SelectionChanged);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use grade_monitor::{
        session::Selection,
        store::UserId,
        testing::{credentials, register, Fixture},
    };
    use tokio::sync::{mpsc, oneshot};

    use super::{merge, Scheduler};
    use crate::{
        commands::{Command, Request},
        cycle::Outcome,
        messenger::Controls,
        notification::Trigger,
        testing::{Event, FakeMessenger},
    };

    fn scheduler(fixture: &Fixture) -> (Scheduler, Arc<FakeMessenger>) {
        let messenger = Arc::new(FakeMessenger::default());
        let scheduler = Scheduler::new(fixture.services.clone(), messenger.clone());
        (scheduler, messenger)
    }

    fn ask(scheduler: &mut Scheduler, user_id: UserId, command: Command) -> String {
        let (reply, mut answer) = oneshot::channel();
        scheduler.handle(Request {
            user_id,
            command,
            reply,
        });
        answer.try_recv().unwrap()
    }

    async fn finish_next(scheduler: &mut Scheduler) -> (UserId, Outcome) {
        let (user_id, outcome) = scheduler.finished_rx.recv().await.unwrap();
        scheduler.finish(user_id, outcome);
        (user_id, outcome)
    }

    #[test]
    fn resending_triggers_win() {
        assert_eq!(merge(None, Trigger::SelectionChanged), Trigger::SelectionChanged);
        assert_eq!(
            merge(Some(Trigger::ManualRefresh), Trigger::SelectionChanged),
            Trigger::ManualRefresh
        );
        assert_eq!(
            merge(Some(Trigger::SelectionChanged), Trigger::Registration),
            Trigger::Registration
        );
    }

    #[tokio::test(start_paused = true)]
    async fn three_users_are_staggered() {
        let fixture = Fixture::new();
        register(&fixture.services.config, UserId(2));
        register(&fixture.services.config, UserId(3));
        fixture
            .services
            .config
            .update(|config| config.intervals.normal_minutes = 5)
            .unwrap();
        fixture.serve_portal();
        let (scheduler, messenger) = scheduler(&fixture);

        let (_requests, receiver) = mpsc::channel(8);
        let running = tokio::spawn(scheduler.run(receiver));
        tokio::time::sleep(Duration::from_millis(101_500)).await;
        running.abort();

        let sent_to = |user_id| {
            messenger
                .events()
                .iter()
                .filter(|event| matches!(event, Event::Sent(u, _) if *u == user_id))
                .count()
        };
        assert_eq!(sent_to(UserId(1)), 1);
        assert_eq!(sent_to(UserId(2)), 1);
        assert_eq!(sent_to(UserId(3)), 0);
    }

    #[tokio::test]
    async fn scheduled_triggers_are_skipped_and_interactive_ones_deferred() {
        let fixture = Fixture::new();
        fixture.serve_portal();
        let (mut scheduler, messenger) = scheduler(&fixture);
        scheduler.start().unwrap();

        let slot = &scheduler.slots[&UserId(1)];
        assert!(slot.running);
        let session = Arc::clone(&slot.session);
        let guard = session.lock().await;
        scheduler.trigger(UserId(1), Trigger::Scheduled);
        assert_eq!(scheduler.slots[&UserId(1)].pending, None);
        scheduler.trigger(UserId(1), Trigger::ManualRefresh);
        scheduler.trigger(UserId(1), Trigger::Scheduled);
        assert_eq!(
            scheduler.slots[&UserId(1)].pending,
            Some(Trigger::ManualRefresh)
        );
        drop(guard);

        assert_eq!(finish_next(&mut scheduler).await, (UserId(1), Outcome::Success));
        assert!(scheduler.slots[&UserId(1)].running);
        assert_eq!(finish_next(&mut scheduler).await, (UserId(1), Outcome::Success));
        assert!(!scheduler.slots[&UserId(1)].running);
        assert_eq!(
            messenger.events(),
            [
                Event::Sent(UserId(1), crate::messenger::MessageId(1)),
                Event::Deleted(UserId(1), crate::messenger::MessageId(1)),
                Event::Sent(UserId(1), crate::messenger::MessageId(2)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn only_plain_failures_shorten_the_countdown() {
        let fixture = Fixture::new();
        fixture.serve_portal();
        let home = fixture.home_url();
        fixture.transport.forget(&home);
        fixture
            .transport
            .respond(&home, "<h2>Course Evaluation Questionnaire</h2>");
        let (mut scheduler, messenger) = scheduler(&fixture);
        scheduler.start().unwrap();

        assert_eq!(
            finish_next(&mut scheduler).await,
            (UserId(1), Outcome::UserActionable)
        );
        assert_eq!(
            scheduler.timetable.remaining(&UserId(1)),
            Some(Duration::from_secs(60 * 60))
        );
        assert!(messenger.messages(UserId(1))[0].card.is_none());

        fixture.transport.forget(&home);
        fixture
            .transport
            .respond_status(&home, reqwest::StatusCode::SERVICE_UNAVAILABLE, "");
        scheduler.trigger(UserId(1), Trigger::ManualRefresh);
        assert_eq!(finish_next(&mut scheduler).await, (UserId(1), Outcome::Failed));
        assert_eq!(
            scheduler.timetable.remaining(&UserId(1)),
            Some(Duration::from_secs(60))
        );

        fixture.transport.forget(&home);
        fixture.serve_portal();
        scheduler.trigger(UserId(1), Trigger::ManualRefresh);
        assert_eq!(finish_next(&mut scheduler).await, (UserId(1), Outcome::Success));
        assert_eq!(
            scheduler.timetable.remaining(&UserId(1)),
            Some(Duration::from_secs(60 * 60))
        );
    }

    #[tokio::test]
    async fn registration_starts_watching() {
        let fixture = Fixture::new();
        fixture.serve_portal();
        let (mut scheduler, messenger) = scheduler(&fixture);
        scheduler.start().unwrap();
        finish_next(&mut scheduler).await;

        let answer = ask(&mut scheduler, UserId(2), Command::Register(credentials()));
        assert_eq!(
            answer,
            "You will receive a private message with your grades within a few seconds."
        );
        assert!(scheduler.timetable.contains(&UserId(2)));
        assert_eq!(finish_next(&mut scheduler).await, (UserId(2), Outcome::Success));
        assert_eq!(messenger.messages(UserId(2)).len(), 1);
        assert!(fixture.services.config.user(UserId(2)).is_some());
    }

    #[tokio::test]
    async fn selection_reaches_the_next_cycle() {
        let fixture = Fixture::new();
        fixture.serve_portal();
        let (mut scheduler, messenger) = scheduler(&fixture);
        scheduler.start().unwrap();
        finish_next(&mut scheduler).await;

        ask(
            &mut scheduler,
            UserId(1),
            Command::SelectMode {
                final_grades_only: true,
            },
        );
        ask(&mut scheduler, UserId(1), Command::SelectSemester("Spring 2024".into()));
        assert_eq!(finish_next(&mut scheduler).await, (UserId(1), Outcome::Success));
        if scheduler.slots[&UserId(1)].running {
            finish_next(&mut scheduler).await;
        }

        let messages = messenger.messages(UserId(1));
        assert_eq!(messages.len(), 1);
        let Controls::Full(selector) = &messages[0].controls else {
            panic!("report without controls");
        };
        assert_eq!(
            selector.selection(),
            Selection {
                semester: Some("Spring 2024".into()),
                final_grades_only: Some(true),
            }
        );
    }

    #[tokio::test]
    async fn commands_need_a_registration() {
        let fixture = Fixture::new();
        let (mut scheduler, _) = scheduler(&fixture);
        let answer = ask(&mut scheduler, UserId(9), Command::Refresh);
        assert!(answer.starts_with("You are not registered yet."));
        assert!(scheduler.slots.is_empty());
    }

    #[tokio::test]
    async fn intervals_are_validated_and_persisted() {
        let fixture = Fixture::new();
        let (mut scheduler, _) = scheduler(&fixture);
        scheduler.slots.insert(
            UserId(1),
            super::Slot::new(
                grade_monitor::session::Session::new(UserId(1), &fixture.services).unwrap(),
            ),
        );

        let answer = ask(
            &mut scheduler,
            UserId(1),
            Command::SetIntervals {
                normal_minutes: 4,
                after_failure_minutes: 1,
            },
        );
        assert_eq!(answer, "The refresh interval must be at least 5 minutes.");
        assert_eq!(fixture.services.config.intervals().normal_minutes, 60);

        ask(
            &mut scheduler,
            UserId(1),
            Command::SetIntervals {
                normal_minutes: 30,
                after_failure_minutes: 2,
            },
        );
        let intervals = fixture.services.config.intervals();
        assert_eq!((intervals.normal_minutes, intervals.after_failure_minutes), (30, 2));
        assert_eq!(scheduler.timetable.after_failure(), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn refetch_forgets_known_courses() {
        let fixture = Fixture::new();
        fixture.seed_course_urls(
            UserId(1),
            "Fall 2024",
            &[(
                "CSE 111: Data Structures",
                "https://eng.asu.edu.eg/dashboard/course/1001".parse().unwrap(),
            )],
        );
        fixture.serve_portal();
        let (mut scheduler, _) = scheduler(&fixture);
        scheduler.start().unwrap();
        finish_next(&mut scheduler).await;

        ask(&mut scheduler, UserId(1), Command::Refetch);
        let account = fixture.services.config.user(UserId(1)).unwrap();
        assert!(account.semesters.values().all(|courses| courses.is_empty()));
        assert!(account.semesters.contains_key("Fall 2024"));
    }
}
