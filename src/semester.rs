use std::str::FromStr;

use strum::{Display, EnumString};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Display, EnumString)]
pub enum Season {
    Spring,
    Summer,
    Fall,
}

impl Season {
    pub fn emoji(self) -> &'static str {
        match self {
            Self::Spring => "🌸",
            Self::Summer => "☀️",
            Self::Fall => "🍂",
        }
    }
}

/// Splits a label such as `Fall 2024`.
pub fn parse(label: &str) -> Option<(Season, u32)> {
    let (season, year) = label.trim().split_once(' ')?;
    Some((Season::from_str(season).ok()?, year.parse().ok()?))
}

/// Chronological key; labels that do not parse sort first.
pub fn sort_key(label: &str) -> u32 {
    parse(label).map_or(0, |(season, year)| year * 3 + season as u32)
}

pub fn sort_chronologically<S: AsRef<str>>(labels: &mut [S]) {
    labels.sort_by_key(|label| (sort_key(label.as_ref()), label.as_ref().to_owned()));
}
