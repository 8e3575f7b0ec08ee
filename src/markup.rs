//! Positional decoding of the portal's HTML.
//!
//! The portal has no API and its markup is not well-formed enough to be worth
//! a DOM, so every value is recovered from fixed substrings and line offsets.
//! All of those live in [`MarkupConfig`] so that a markup change on the portal
//! is a settings change here.

use std::collections::BTreeSet;

use grade_monitor_utils::regex;
use serde::{Deserialize, Serialize};

use crate::report;

/// Substring test, optionally ignoring ASCII case.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Matcher {
    pub needle: String,
    #[serde(default)]
    pub ignore_case: bool,
}

impl Matcher {
    pub fn exact(needle: impl Into<String>) -> Self {
        Self {
            needle: needle.into(),
            ignore_case: false,
        }
    }

    pub fn ignoring_case(needle: impl Into<String>) -> Self {
        Self {
            needle: needle.into(),
            ignore_case: true,
        }
    }

    pub fn matches(&self, haystack: &str) -> bool {
        if self.ignore_case {
            haystack
                .to_ascii_lowercase()
                .contains(&self.needle.to_ascii_lowercase())
        } else {
            haystack.contains(&self.needle)
        }
    }
}

/// Which occurrence of the delimiters [`extract_between`] anchors on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Occurrence {
    /// `start` is the first occurrence, `end` the first one after it.
    First,
    /// `end` is the last occurrence, `start` the last one before it.
    /// Without any `start` before it, the text begins at the line start.
    Last,
}

/// Returns the text between `start` and `end`.
pub fn extract_between<'a>(
    source: &'a str,
    start: &str,
    end: &str,
    occurrence: Occurrence,
) -> Option<&'a str> {
    match occurrence {
        Occurrence::First => {
            let begin = source.find(start)? + start.len();
            let len = source[begin..].find(end)?;
            Some(&source[begin..begin + len])
        }
        Occurrence::Last => {
            let finish = source.rfind(end)?;
            let begin = source[..finish]
                .rfind(start)
                .map_or(0, |i| i + start.len());
            Some(&source[begin..finish])
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Delimiters {
    pub start: String,
    pub end: String,
}

impl Delimiters {
    fn new(start: &str, end: &str) -> Self {
        Self {
            start: start.to_owned(),
            end: end.to_owned(),
        }
    }

    fn first<'a>(&self, source: &'a str) -> Option<&'a str> {
        extract_between(source, &self.start, &self.end, Occurrence::First)
    }
}

/// Row layout of the final-grades table on the student courses page.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FinalTableLayout {
    pub row_marker: String,
    pub code_offset: usize,
    pub name_offset: usize,
    pub semester_offset: usize,
    pub grade_offset: usize,
    pub stride: usize,
}

impl Default for FinalTableLayout {
    fn default() -> Self {
        Self {
            row_marker: "<tr >".into(),
            code_offset: 1,
            name_offset: 2,
            semester_offset: 3,
            grade_offset: 4,
            stride: 40,
        }
    }
}

/// Layout of the course links on the student courses page.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkTableLayout {
    pub link_marker: String,
    pub code_lines_above: usize,
    pub semester_lines_below: usize,
    pub stride: usize,
}

impl Default for LinkTableLayout {
    fn default() -> Self {
        Self {
            link_marker: "\"https://eng.asu.edu.eg/dashboard/".into(),
            code_lines_above: 3,
            semester_lines_below: 6,
            stride: 40,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MarkupConfig {
    /// Navigation fragment only shown to a logged-in student.
    pub authenticated: Matcher,
    pub questionnaire: Matcher,
    pub captcha: Matcher,
    pub login_failed: Matcher,
    /// Present on the login page variant with suffixed field names.
    pub alternate_login: Matcher,
    pub csrf_token: Delimiters,
    pub cgpa: Delimiters,
    pub current_semester: Delimiters,
    /// A course page line is kept when it contains any of these.
    pub grade_markers: Vec<String>,
    pub total_discriminator: String,
    pub label_discriminator: String,
    pub final_table: FinalTableLayout,
    pub link_table: LinkTableLayout,
}

impl Default for MarkupConfig {
    fn default() -> Self {
        Self {
            authenticated: Matcher::exact("my_courses"),
            questionnaire: Matcher::ignoring_case("Questionnaire"),
            captcha: Matcher::exact("recaptcha"),
            login_failed: Matcher::exact("alert alert-danger"),
            alternate_login: Matcher::exact("email1"),
            csrf_token: Delimiters::new("token\" content=\"", "\""),
            cgpa: Delimiters::new("\"text-white\">", "<"),
            current_semester: Delimiters::new("<strong>Term</strong>: ", "<"),
            grade_markers: vec!["float-left".into(), "float-right".into()],
            total_discriminator: "right".into(),
            label_discriminator: "left".into(),
            final_table: FinalTableLayout::default(),
            link_table: LinkTableLayout::default(),
        }
    }
}

/// The two field naming schemes of the login form.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginVariant {
    Standard,
    Alternate,
}

impl LoginVariant {
    pub fn page(self) -> &'static str {
        match self {
            Self::Standard => "login",
            Self::Alternate => "log1n",
        }
    }

    pub fn email_field(self) -> &'static str {
        match self {
            Self::Standard => "email",
            Self::Alternate => "email1",
        }
    }

    pub fn password_field(self) -> &'static str {
        match self {
            Self::Standard => "password",
            Self::Alternate => "password1",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalGradeRecord {
    pub code: String,
    pub name: String,
    pub grade: String,
}

impl FinalGradeRecord {
    pub fn key(&self) -> String {
        report::course_key(&self.code, &self.name)
    }
}

/// A course link found on the student courses page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CourseLink {
    pub semester: String,
    /// `"{code}: {name}"`, the same key the final grades use.
    pub course: String,
    pub href: String,
}

impl MarkupConfig {
    pub fn is_authenticated(&self, page: &str) -> bool {
        self.authenticated.matches(page)
    }

    pub fn login_variant(&self, page: &str) -> LoginVariant {
        if self.alternate_login.matches(page) {
            LoginVariant::Alternate
        } else {
            LoginVariant::Standard
        }
    }

    pub fn csrf_token<'a>(&self, page: &'a str) -> Option<&'a str> {
        self.csrf_token.first(page)
    }

    pub fn cgpa<'a>(&self, page: &'a str) -> Option<&'a str> {
        self.cgpa.first(page).map(str::trim)
    }

    pub fn current_semester<'a>(&self, page: &'a str) -> Option<&'a str> {
        self.current_semester
            .first(page)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Rows of the final-grades table that belong to `semester`.
    pub fn final_grades(&self, page: &str, semester: &str) -> Vec<FinalGradeRecord> {
        let layout = &self.final_table;
        let lines = page.lines().collect::<Vec<_>>();
        let field = |i: usize, offset: usize, start: &str, end: &str| {
            lines
                .get(i + offset)
                .and_then(|line| extract_between(line, start, end, Occurrence::Last))
        };
        let mut records = vec![];
        let mut i = 0;
        while i < lines.len() {
            if !lines[i].contains(&layout.row_marker) {
                i += 1;
                continue;
            }
            let record = (|| {
                let row_semester = field(i, layout.semester_offset, ">", " <")?;
                (row_semester == semester).then_some(())?;
                Some(FinalGradeRecord {
                    code: field(i, layout.code_offset, ">", "<")?.to_owned(),
                    name: field(i, layout.name_offset, ">", "<")?.to_owned(),
                    grade: field(i, layout.grade_offset, ">", "<")?.to_owned(),
                })
            })();
            match record {
                Some(record) => {
                    records.push(record);
                    i += layout.stride.max(1);
                }
                None => i += 1,
            }
        }
        records
    }

    /// Every course link on the student courses page, of any semester.
    pub fn course_links(&self, page: &str) -> Vec<CourseLink> {
        let layout = &self.link_table;
        let lines = page.lines().collect::<Vec<_>>();
        let mut links = vec![];
        let mut i = 0;
        while i < lines.len() {
            let line = lines[i];
            if !line.contains(&layout.link_marker) {
                i += 1;
                continue;
            }
            let link = (|| {
                let code_line = lines.get(i.checked_sub(layout.code_lines_above)?)?;
                let code = extract_between(code_line, ">", "<", Occurrence::Last)?;
                let name = extract_between(line, ">", "<", Occurrence::Last)?;
                let semester_line = lines.get(i + layout.semester_lines_below)?;
                let semester = extract_between(semester_line, ">", "<", Occurrence::Last)?.trim();
                let href = extract_between(line, "\"", "\"", Occurrence::First)?;
                Some(CourseLink {
                    semester: semester.to_owned(),
                    course: report::course_key(code, name),
                    href: href.to_owned(),
                })
            })();
            match link {
                Some(link) => {
                    links.push(link);
                    i += layout.stride.max(1);
                }
                None => i += 1,
            }
        }
        links
    }

    /// Extracts the graded items of a course page.
    ///
    /// An empty result means the page carried none of the grade markers.
    pub fn grade_details(&self, page: &str) -> Vec<String> {
        let kept = page
            .lines()
            .filter(|line| self.grade_markers.iter().any(|m| line.contains(m.as_str())))
            .collect::<Vec<_>>();
        let mut details = vec![];
        let mut i = 0;
        while i < kept.len() {
            let line = kept[i];
            if line.contains(&self.total_discriminator) {
                if let Some(value) = extract_between(line, ">", "<", Occurrence::Last) {
                    details.push(report::final_grade_line(value.trim()));
                }
            } else if line.contains(&self.label_discriminator) {
                if let (Some(title), Some(next)) = (
                    extract_between(line, ">", "<", Occurrence::Last),
                    kept.get(i + 1),
                ) {
                    let value = extract_between(next, ">", "<", Occurrence::Last)
                        .unwrap_or_default()
                        .replace(' ', "");
                    details.push(format!("{}: {}", title.trim(), value));
                    i += 1;
                }
            }
            i += 1;
        }
        details
    }
}

/// Links of the current semester's courses on the "my courses" page,
/// as `(course name, href)`.
pub fn my_course_links<'a>(page: &'a str, semester: &str) -> Vec<(&'a str, &'a str)> {
    page.lines()
        .filter(|line| line.contains(semester))
        .filter_map(|line| {
            let name = extract_between(line, ">", " (", Occurrence::Last)?;
            let href = extract_between(line, "\"", "?", Occurrence::First)?;
            Some((name.trim(), href))
        })
        .collect()
}

/// Semester labels such as `Fall 2024` mentioned anywhere on the page.
pub fn semesters(page: &str) -> BTreeSet<String> {
    regex!(r"\b(Spring|Summer|Fall) \d{4}\b")
        .find_iter(page)
        .map(|m| m.as_str().to_owned())
        .collect()
}
