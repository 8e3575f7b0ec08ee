use std::{hash::Hash, time::Duration};

use indexmap::IndexMap;

#[derive(Clone, Copy, Debug)]
struct Countdown {
    remaining: u64,
    shortened: bool,
}

/// Per-key countdowns driven by a shared one-second tick.
///
/// Keys keep their insertion order, which is also their index for staggering:
/// with `total` keys and an interval of `I` seconds, key `index` first fires
/// after `floor(I / total) * index` seconds.
#[derive(Debug)]
pub struct Timetable<K> {
    countdowns: IndexMap<K, Countdown>,
    interval: u64,
    after_failure: u64,
}

impl<K: Hash + Eq + Clone> Timetable<K> {
    pub fn new(interval: Duration, after_failure: Duration) -> Self {
        Self {
            countdowns: IndexMap::new(),
            interval: interval.as_secs().max(1),
            after_failure: after_failure.as_secs().max(1),
        }
    }

    /// Schedules every key at once and returns those firing right away.
    pub fn start(&mut self, keys: impl IntoIterator<Item = K>) -> Vec<K> {
        let keys = keys.into_iter().collect::<Vec<_>>();
        let step = self.interval / keys.len().max(1) as u64;
        let mut now = vec![];
        for (index, key) in keys.into_iter().enumerate() {
            if self.schedule(key.clone(), step * index as u64) {
                now.push(key);
            }
        }
        now
    }

    /// Schedules a key arriving mid-run at the end of the order.  Returns
    /// whether it fires right away.  An already scheduled key keeps its
    /// countdown.
    pub fn join(&mut self, key: K) -> bool {
        if self.countdowns.contains_key(&key) {
            return false;
        }
        let index = self.countdowns.len() as u64;
        let offset = self.interval / (index + 1) * index;
        self.schedule(key, offset)
    }

    fn schedule(&mut self, key: K, offset: u64) -> bool {
        let fires = offset == 0;
        let remaining = if fires { self.interval } else { offset };
        self.countdowns.insert(
            key,
            Countdown {
                remaining,
                shortened: false,
            },
        );
        fires
    }

    /// Advances every countdown by one second and returns the keys that fire.
    pub fn tick(&mut self) -> Vec<K> {
        let interval = self.interval;
        self.countdowns
            .iter_mut()
            .filter_map(|(key, countdown)| {
                countdown.remaining = countdown.remaining.saturating_sub(1);
                (countdown.remaining == 0).then(|| {
                    countdown.remaining = interval;
                    key.clone()
                })
            })
            .collect()
    }

    /// Retries a key sooner after a failed cycle.
    pub fn shorten(&mut self, key: &K) {
        if let Some(countdown) = self.countdowns.get_mut(key) {
            countdown.remaining = self.after_failure;
            countdown.shortened = true;
        }
    }

    /// Drops the override left by [`Self::shorten`], if any.
    pub fn succeed(&mut self, key: &K) {
        if let Some(countdown) = self.countdowns.get_mut(key) {
            if countdown.shortened {
                countdown.remaining = self.interval;
                countdown.shortened = false;
            }
        }
    }

    /// New intervals apply from the next reset of each countdown.
    pub fn set_intervals(&mut self, interval: Duration, after_failure: Duration) {
        self.interval = interval.as_secs().max(1);
        self.after_failure = after_failure.as_secs().max(1);
    }

    pub fn contains(&self, key: &K) -> bool {
        self.countdowns.contains_key(key)
    }

    pub fn remaining(&self, key: &K) -> Option<Duration> {
        self.countdowns
            .get(key)
            .map(|countdown| Duration::from_secs(countdown.remaining))
    }

    /// Time until the next scheduled cycle of `key` if the running one
    /// succeeds.
    pub fn next_after_success(&self, key: &K) -> Option<Duration> {
        self.countdowns.get(key).map(|countdown| {
            Duration::from_secs(if countdown.shortened {
                self.interval
            } else {
                countdown.remaining
            })
        })
    }

    pub fn after_failure(&self) -> Duration {
        Duration::from_secs(self.after_failure)
    }
}
