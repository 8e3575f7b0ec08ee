use std::collections::BTreeMap;

use derive_more::{From, IntoIterator};
use serde::{Deserialize, Serialize};

pub fn course_key(code: &str, name: &str) -> String {
    format!("{}: {}", code.trim(), name.trim())
}

pub fn final_grade_line(grade: &str) -> String {
    format!("||**__Course Grade: {grade}__**||")
}

/// Grades of one semester, keyed and ordered by course name.
///
/// The value is either a single final-grade line or several
/// `"title: value"` lines joined by newlines.
#[derive(Clone, Default, PartialEq, Eq, Debug, Serialize, Deserialize, From, IntoIterator)]
pub struct GradeReport(BTreeMap<String, String>);

impl GradeReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, course: String, details: String) {
        self.0.insert(course, details);
    }

    pub fn get(&self, course: &str) -> Option<&str> {
        self.0.get(course).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn courses(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Same courses with byte-identical details.
    pub fn identical(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(course, details)| other.get(course) == Some(details))
    }
}

impl FromIterator<(String, String)> for GradeReport {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::{course_key, final_grade_line, GradeReport};

    fn report(entries: &[(&str, &str)]) -> GradeReport {
        entries
            .iter()
            .map(|&(k, v)| (k.to_owned(), v.to_owned()))
            .collect()
    }

    #[test]
    fn identical_is_reflexive_and_symmetric() {
        let a = report(&[("CSE 111: DS", "Midterm: 18/20"), ("PHM 212: CA", "Quiz: 9/10")]);
        let b = report(&[("PHM 212: CA", "Quiz: 9/10"), ("CSE 111: DS", "Midterm: 18/20")]);
        let c = report(&[("CSE 111: DS", "Midterm: 18/20"), ("PHM 212: CA", "Quiz: 10/10")]);
        let d = report(&[("CSE 111: DS", "Midterm: 18/20")]);
        assert!(a.identical(&a));
        assert!(a.identical(&b) && b.identical(&a));
        assert!(!a.identical(&c) && !c.identical(&a));
        assert!(!a.identical(&d) && !d.identical(&a));
        assert!(GradeReport::new().identical(&GradeReport::new()));
    }

    #[test]
    fn ordered_by_course() {
        let r = report(&[("b", "2"), ("a", "1")]);
        assert_eq!(r.courses().collect::<Vec<_>>(), ["a", "b"]);
    }

    #[test]
    fn formatting() {
        assert_eq!(course_key(" CSE 111", "Data Structures "), "CSE 111: Data Structures");
        assert_eq!(final_grade_line("A-"), "||**__Course Grade: A-__**||");
    }
}
