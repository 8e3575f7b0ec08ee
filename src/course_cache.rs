use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::Context;
use itertools::Itertools;
use log::{info, warn};
use url::Url;

use crate::{
    extractor::StudentData,
    fetcher::Fetcher,
    markup,
    portal::PortalConfig,
    store::{SharedConfig, UserId},
};

/// Course page URLs per semester, shared by every user and persisted in the
/// config store.
pub struct CourseUrlCache {
    config: Arc<SharedConfig>,
    semester_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CourseUrlCache {
    pub fn new(config: Arc<SharedConfig>) -> Self {
        Self {
            config,
            semester_locks: Mutex::new(HashMap::new()),
        }
    }

    /// URLs of the user's courses in `semester`, if every one of them is known.
    pub fn cached(&self, user_id: UserId, semester: &str) -> Option<BTreeMap<String, Url>> {
        self.config.read(|config| {
            let courses = config.user(user_id)?.semesters.get(semester)?;
            if courses.is_empty() {
                return None;
            }
            let urls = config.courses.get(semester)?;
            courses
                .iter()
                .map(|course| Some((course.clone(), urls.get(course)?.clone())))
                .collect()
        })
    }

    pub async fn resolve(
        &self,
        user_id: UserId,
        semester: &str,
        student: &StudentData,
        fetcher: &Fetcher,
        portal: &PortalConfig,
    ) -> anyhow::Result<BTreeMap<String, Url>> {
        match self.cached(user_id, semester) {
            Some(urls) => Ok(urls),
            None => {
                info!("{user_id}: Course URLs of {semester} are not cached.  Fetching them.");
                self.refresh(user_id, semester, student, fetcher, portal)
                    .await
            }
        }
    }

    /// Harvests the URLs of the user's courses in `semester` again.
    pub async fn refresh(
        &self,
        user_id: UserId,
        semester: &str,
        student: &StudentData,
        fetcher: &Fetcher,
        portal: &PortalConfig,
    ) -> anyhow::Result<BTreeMap<String, Url>> {
        let lock = self.semester_lock(semester);
        let _guard = lock.lock().await;

        let harvested = if semester == student.current_semester {
            let page = fetcher
                .fetch(&portal.url(&portal.my_courses_path)?)
                .await
                .context("Fetching the current courses")?;
            markup::my_course_links(&page, semester)
                .into_iter()
                .map(|(course, href)| Ok((semester.to_owned(), course.to_owned(), portal.url(href)?)))
                .collect::<anyhow::Result<Vec<_>>>()?
        } else {
            portal
                .markup
                .course_links(&student.student_courses)
                .into_iter()
                .map(|link| Ok((link.semester, link.course, portal.url(&link.href)?)))
                .collect::<anyhow::Result<Vec<_>>>()?
        };
        if harvested.iter().all(|(s, _, _)| s != semester) {
            warn!("{user_id}: No course of {semester} was found");
        }

        let by_semester = harvested
            .into_iter()
            .into_group_map_by(|(s, _, _)| s.clone())
            .into_iter()
            .map(|(s, links)| {
                let urls = links
                    .into_iter()
                    .map(|(_, course, url)| (course, url))
                    .collect::<BTreeMap<_, _>>();
                (s, urls)
            })
            .collect::<BTreeMap<_, _>>();

        self.config.update(|config| {
            for (s, urls) in &by_semester {
                config
                    .courses
                    .entry(s.clone())
                    .or_default()
                    .extend(urls.iter().map(|(c, u)| (c.clone(), u.clone())));
            }
            if let Some(account) = config.user_mut(user_id) {
                for (s, urls) in &by_semester {
                    let known = account.semesters.entry(s.clone()).or_default();
                    if s == semester {
                        *known = urls.keys().cloned().collect::<BTreeSet<_>>();
                    } else {
                        known.extend(urls.keys().cloned());
                    }
                }
            }
        })?;

        Ok(by_semester.get(semester).cloned().unwrap_or_default())
    }

    fn semester_lock(&self, semester: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .semester_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(semester.to_owned()).or_default())
    }
}
