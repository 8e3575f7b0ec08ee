use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Context};
use futures::future::try_join_all;
use log::{info, warn};
use tokio::sync::OnceCell;
use url::Url;

use crate::{
    error::PortalError,
    fetcher::Fetcher,
    markup,
    portal::Services,
    report::{self, GradeReport},
    session::Session,
    store::UserId,
};

/// The student courses page of this cycle and what it says about semesters.
#[derive(Clone, Debug)]
pub struct StudentData {
    pub student_courses: String,
    pub current_semester: String,
    /// Every semester the student is known to have, including the current one.
    pub semesters: BTreeSet<String>,
}

/// Fetches the student courses page and records newly seen semesters.
pub async fn load_student_data(session: &Session, services: &Services) -> anyhow::Result<StudentData> {
    let portal = &services.portal;
    let user_id = session.user_id();
    let page = session
        .fetcher()
        .fetch(&portal.url(&portal.student_courses_path)?)
        .await
        .context("Fetching the student courses")?;
    if portal.markup.questionnaire.matches(&page) {
        return Err(PortalError::QuestionnaireRequired.into());
    }
    let current_semester = portal
        .markup
        .current_semester(&page)
        .ok_or_else(|| anyhow!("The current semester was not found on the student courses page"))?
        .to_owned();

    let mut discovered = markup::semesters(&page);
    discovered.insert(current_semester.clone());
    let known = services
        .config
        .user(user_id)
        .map(|account| account.semesters.keys().cloned().collect::<BTreeSet<_>>())
        .unwrap_or_default();
    let new = discovered.difference(&known).cloned().collect::<Vec<_>>();
    if !new.is_empty() {
        info!("{user_id}: Found new semesters: {new:?}");
        services.config.update(|config| {
            if let Some(account) = config.user_mut(user_id) {
                for semester in &new {
                    account.semesters.entry(semester.clone()).or_default();
                }
            }
        })?;
    }

    Ok(StudentData {
        student_courses: page,
        current_semester,
        semesters: known.union(&discovered).cloned().collect(),
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    FinalGradesOnly,
    Detailed,
}

/// Whether this cycle may still switch to the other mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Fallback {
    Available,
    Spent,
}

/// Builds the grade report of one semester for one cycle.
pub struct GradeExtractor<'a> {
    user_id: UserId,
    fetcher: &'a Fetcher,
    services: &'a Services,
    student: &'a StudentData,
    semester: &'a str,
}

impl<'a> GradeExtractor<'a> {
    pub fn new(
        session: &'a Session,
        services: &'a Services,
        student: &'a StudentData,
        semester: &'a str,
    ) -> Self {
        Self {
            user_id: session.user_id(),
            fetcher: session.fetcher(),
            services,
            student,
            semester,
        }
    }

    /// Final grades only are cheap but may be unreleased; the detailed
    /// report needs one page per course. Each falls back to the other at most
    /// once per call.
    pub async fn fetch_grades_report(&self, final_grades_only: bool) -> anyhow::Result<GradeReport> {
        let mut mode = if final_grades_only {
            Mode::FinalGradesOnly
        } else {
            Mode::Detailed
        };
        let mut fallback = Fallback::Available;
        loop {
            match mode {
                Mode::FinalGradesOnly => {
                    let report = self.final_grades();
                    if !report.is_empty() || fallback == Fallback::Spent {
                        return Ok(report);
                    }
                    info!(
                        "{}: No final grades for {}.  Fetching detailed grades.",
                        self.user_id, self.semester
                    );
                    mode = Mode::Detailed;
                }
                Mode::Detailed => match self.detailed_grades().await {
                    Ok(report) => return Ok(report),
                    Err(e) if fallback == Fallback::Available => {
                        warn!(
                            "{}: Detailed grades failed: {e:#}.  Falling back to final grades.",
                            self.user_id
                        );
                        mode = Mode::FinalGradesOnly;
                    }
                    Err(e) => return Err(e),
                },
            }
            fallback = Fallback::Spent;
        }
    }

    pub fn final_grades(&self) -> GradeReport {
        self.services
            .portal
            .markup
            .final_grades(&self.student.student_courses, self.semester)
            .into_iter()
            .map(|record| (record.key(), report::final_grade_line(&record.grade)))
            .collect()
    }

    async fn detailed_grades(&self) -> anyhow::Result<GradeReport> {
        let urls = self
            .services
            .courses
            .resolve(
                self.user_id,
                self.semester,
                self.student,
                self.fetcher,
                &self.services.portal,
            )
            .await?;
        let refreshed = OnceCell::new();
        let details = try_join_all(
            urls.iter()
                .map(|(course, url)| self.course_details(course, url, &refreshed)),
        )
        .await?;
        Ok(urls.into_keys().zip(details).collect())
    }

    async fn course_details(
        &self,
        course: &str,
        url: &Url,
        refreshed: &OnceCell<BTreeMap<String, Url>>,
    ) -> anyhow::Result<String> {
        let markup = &self.services.portal.markup;
        let page = self.fetcher.fetch(url).await?;
        let lines = markup.grade_details(&page);
        if !lines.is_empty() {
            return Ok(lines.join("\n").trim().to_owned());
        }

        warn!(
            "{}: {course}: no grades found at {url}.  Refreshing course URLs.",
            self.user_id
        );
        let fresh = refreshed
            .get_or_try_init(|| {
                self.services.courses.refresh(
                    self.user_id,
                    self.semester,
                    self.student,
                    self.fetcher,
                    &self.services.portal,
                )
            })
            .await?;
        let mismatch = || PortalError::PortalMarkupMismatch {
            course: course.to_owned(),
            url: url.clone(),
        };
        let url = fresh.get(course).ok_or_else(mismatch)?;
        let page = self.fetcher.fetch(url).await?;
        let lines = markup.grade_details(&page);
        if lines.is_empty() {
            return Err(mismatch().into());
        }
        Ok(lines.join("\n").trim().to_owned())
    }
}
