//! Decaying time-window event counter used for flood control.
//!
//! Each group keeps its event timestamps newest-first, so the oldest entry is
//! always at the back and expiry is a pop from the tail.

use crate::config::ConfigError;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Counts events per group over a sliding `life_span`.
#[derive(Debug, Clone)]
pub struct DecayingWindow {
    life_span: Duration,
    max_count: Option<usize>,
    groups: HashMap<String, VecDeque<Instant>>,
}

impl DecayingWindow {
    /// Creates a window without a cap; `increment_if_under_max` is unavailable.
    pub fn new(life_span: Duration) -> Self {
        Self {
            life_span,
            max_count: None,
            groups: HashMap::new(),
        }
    }

    /// Creates a window that admits at most `max_count` events per `life_span`.
    pub fn with_max(life_span: Duration, max_count: usize) -> Self {
        Self {
            life_span,
            max_count: Some(max_count),
            groups: HashMap::new(),
        }
    }

    pub fn life_span(&self) -> Duration {
        self.life_span
    }

    pub fn max_count(&self) -> Option<usize> {
        self.max_count
    }

    /// Records an event and returns the group's new size. Ignores `max_count`.
    pub fn increment(&mut self, group: &str) -> usize {
        self.increment_at(group, Instant::now())
    }

    /// Returns the number of live events in a group (0 if unknown).
    pub fn count(&mut self, group: &str) -> usize {
        self.count_at(group, Instant::now())
    }

    /// Records an event only while the group is under `max_count`.
    ///
    /// `Ok(true)` means the event was recorded and may be sent, `Ok(false)`
    /// means it must be dropped; nothing is recorded in that case.
    pub fn increment_if_under_max(&mut self, group: &str) -> Result<bool, ConfigError> {
        self.increment_if_under_max_at(group, Instant::now())
    }

    /// Records an event only while the group holds fewer than `max` events.
    pub fn increment_if_under(&mut self, group: &str, max: usize) -> bool {
        self.increment_if_under_at(group, max, Instant::now())
    }

    pub(crate) fn increment_at(&mut self, group: &str, now: Instant) -> usize {
        self.purge_expired(group, now);
        let events = self.groups.entry(group.to_string()).or_default();
        events.push_front(now);
        events.len()
    }

    pub(crate) fn count_at(&mut self, group: &str, now: Instant) -> usize {
        self.purge_expired(group, now);
        self.groups.get(group).map_or(0, VecDeque::len)
    }

    pub(crate) fn increment_if_under_max_at(
        &mut self,
        group: &str,
        now: Instant,
    ) -> Result<bool, ConfigError> {
        let max = self.max_count.ok_or(ConfigError::MaxCountNotConfigured)?;
        Ok(self.increment_if_under_at(group, max, now))
    }

    pub(crate) fn increment_if_under_at(&mut self, group: &str, max: usize, now: Instant) -> bool {
        if self.count_at(group, now) < max {
            self.increment_at(group, now);
            true
        } else {
            false
        }
    }

    fn purge_expired(&mut self, group: &str, now: Instant) {
        let Some(events) = self.groups.get_mut(group) else {
            return;
        };
        while let Some(&oldest) = events.back() {
            if now.saturating_duration_since(oldest) > self.life_span {
                events.pop_back();
            } else {
                break;
            }
        }
        if events.is_empty() {
            self.groups.remove(group);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_decay() {
        let mut window = DecayingWindow::new(Duration::from_secs(2));
        let start = Instant::now();
        while window.count_at("mock", start) < 100 {
            window.increment_at("mock", start);
        }
        assert_eq!(window.count_at("mock", start), 100);
        assert_eq!(window.count_at("mock", start + Duration::from_secs(2)), 100);
        assert_eq!(
            window.count_at("mock", start + Duration::from_millis(2001)),
            0
        );
    }

    #[test]
    fn test_decay_in_real_time() {
        let mut window = DecayingWindow::new(Duration::from_millis(200));
        for _ in 0..100 {
            window.increment("mock");
        }
        assert_eq!(window.count("mock"), 100);
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(window.count("mock"), 0);
    }

    #[test]
    fn test_only_expired_entries_are_purged() {
        let mut window = DecayingWindow::new(Duration::from_secs(10));
        let start = Instant::now();
        window.increment_at("g", start);
        window.increment_at("g", start + Duration::from_secs(5));
        assert_eq!(window.increment_at("g", start + Duration::from_secs(8)), 3);
        assert_eq!(window.count_at("g", start + Duration::from_secs(11)), 2);
        assert_eq!(window.count_at("g", start + Duration::from_secs(16)), 1);
        assert_eq!(window.count_at("g", start + Duration::from_secs(19)), 0);
    }

    #[test]
    fn test_max_count_caps_consecutive_increments() {
        let mut window = DecayingWindow::with_max(Duration::from_secs(30), 10);
        for _ in 0..10 {
            assert!(window.increment_if_under_max("mock").unwrap());
        }
        assert!(!window.increment_if_under_max("mock").unwrap());
        assert_eq!(window.count("mock"), 10);
    }

    #[test]
    fn test_rapid_calls_never_exceed_max() {
        let mut window = DecayingWindow::with_max(Duration::from_secs(30), 10);
        let accepted = (0..1000)
            .filter(|_| window.increment_if_under_max("mock").unwrap())
            .count();
        assert_eq!(accepted, 10);
        assert_eq!(window.count("mock"), 10);
    }

    #[test]
    fn test_capacity_returns_after_decay() {
        let mut window = DecayingWindow::with_max(Duration::from_secs(30), 2);
        let start = Instant::now();
        assert!(window.increment_if_under_max_at("c", start).unwrap());
        assert!(window.increment_if_under_max_at("c", start).unwrap());
        assert!(!window.increment_if_under_max_at("c", start).unwrap());

        let later = start + Duration::from_secs(31);
        assert!(window.increment_if_under_max_at("c", later).unwrap());
        assert_eq!(window.count_at("c", later), 1);
    }

    #[test]
    fn test_increment_ignores_max() {
        let mut window = DecayingWindow::with_max(Duration::from_secs(30), 1);
        assert_eq!(window.increment("g"), 1);
        assert_eq!(window.increment("g"), 2);
        assert!(!window.increment_if_under_max("g").unwrap());
    }

    #[test]
    fn test_max_requires_configuration() {
        let mut window = DecayingWindow::new(Duration::from_secs(1));
        assert!(matches!(
            window.increment_if_under_max("g"),
            Err(ConfigError::MaxCountNotConfigured)
        ));
        assert_eq!(window.count("g"), 0);
    }

    #[test]
    fn test_explicit_max_needs_no_configured_max() {
        let mut window = DecayingWindow::new(Duration::from_secs(30));
        let start = Instant::now();
        assert!(window.increment_if_under_at("g", 2, start));
        assert!(window.increment_if_under_at("g", 2, start));
        assert!(!window.increment_if_under_at("g", 2, start));
        assert!(window.increment_if_under_at("g", 2, start + Duration::from_secs(31)));
        assert!(!window.increment_if_under("other", 0));
    }

    #[test]
    fn test_groups_are_independent() {
        let mut window = DecayingWindow::with_max(Duration::from_secs(60), 1);
        assert!(window.increment_if_under_max("#a").unwrap());
        assert!(window.increment_if_under_max("#b").unwrap());
        assert!(!window.increment_if_under_max("#a").unwrap());
        assert_eq!(window.count("#unknown"), 0);
    }

    #[test]
    fn test_many_group_names() {
        let mut window = DecayingWindow::new(Duration::from_secs(60));
        for idx in 0..10_000 {
            let name = format!("group-{}", idx % 37);
            if idx % 2 == 1 {
                assert!(window.increment(&name) >= 1);
            } else {
                let _ = window.count(&name);
            }
        }
    }
}
