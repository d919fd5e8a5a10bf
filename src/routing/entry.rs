//! A single registered route: compiled pattern, step chain, shared data.

use std::any::Any;
use std::sync::Arc;

use regex::Regex;

use crate::chain::{self, ChainError, Step};
use crate::scope::RequestScope;

/// One route: a regex over request paths plus the chain run on a match.
///
/// Capture groups in the pattern become positional route parameters, in
/// left-to-right order. Entries are configured mutably, then frozen inside
/// the [`Registry`](crate::routing::Registry).
pub struct RouteEntry {
    pattern: String,
    regex: Regex,
    head: Option<Box<dyn Step>>,
    data: Vec<(String, Arc<dyn Any + Send + Sync>)>,
}

impl RouteEntry {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: pattern.to_string(),
            regex: Regex::new(pattern)?,
            head: None,
            data: Vec::new(),
        })
    }

    /// The pattern as registered; doubles as the entry's name in logs.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Append steps to the entry's chain, in order.
    pub fn use_steps(&mut self, steps: Vec<Box<dyn Step>>) -> Result<&mut Self, ChainError> {
        if let Some(chain_head) = chain::chain_steps(steps)? {
            match self.head.as_mut() {
                Some(head) => chain::link_tail(head.as_mut(), chain_head)?,
                None => self.head = Some(chain_head),
            }
        }
        Ok(self)
    }

    /// Share `value` with every request dispatched to this entry.
    pub fn put_data<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) -> &mut Self {
        self.put_shared(key, Arc::new(value))
    }

    pub fn put_shared(
        &mut self,
        key: impl Into<String>,
        value: Arc<dyn Any + Send + Sync>,
    ) -> &mut Self {
        let key = key.into();
        match self.data.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.data.push((key, value)),
        }
        self
    }

    pub fn data(&self) -> &[(String, Arc<dyn Any + Send + Sync>)] {
        &self.data
    }

    /// Set the timeout on every step of this entry's chain.
    pub fn set_timeout_ms(&mut self, ms: u64) -> &mut Self {
        if let Some(head) = self.head.as_mut() {
            chain::set_timeout_all(head.as_mut(), ms);
        }
        self
    }

    /// Match `path`, returning the captured parameters on success. A
    /// pattern without capture groups matches with an empty vector.
    pub fn matches(&self, path: &str) -> Option<Vec<String>> {
        let mut matched = false;
        let mut params = Vec::new();
        for captures in self.regex.captures_iter(path) {
            matched = true;
            for group in captures.iter().skip(1) {
                params.push(group.map(|m| m.as_str().to_string()).unwrap_or_default());
            }
        }
        matched.then_some(params)
    }

    /// Run this entry's chain against `scope`.
    pub async fn execute(&self, scope: &mut RequestScope) {
        if let Some(head) = self.head.as_deref() {
            chain::run(head, scope).await;
        }
    }
}

impl Drop for RouteEntry {
    fn drop(&mut self) {
        if let Some(head) = self.head.as_mut() {
            chain::close_all(head.as_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{FnStep, Flow};

    fn noop_step() -> Box<dyn Step> {
        Box::new(FnStep::new(|_| Box::pin(async { Flow::Continue })))
    }

    #[test]
    fn captures_preserve_order() {
        let entry = RouteEntry::new(r"^/report/(\d{4})/(\d{2})$").unwrap();
        assert_eq!(
            entry.matches("/report/2024/07"),
            Some(vec!["2024".into(), "07".into()])
        );
        assert_eq!(entry.matches("/report/x/y"), None);
    }

    #[test]
    fn pattern_without_groups_matches_with_empty_params() {
        let entry = RouteEntry::new(r"^/health$").unwrap();
        assert_eq!(entry.matches("/health"), Some(vec![]));
    }

    #[test]
    fn unmatched_optional_group_becomes_empty_param() {
        let entry = RouteEntry::new(r"^/files/(\w+)(?:\.(\w+))?$").unwrap();
        assert_eq!(
            entry.matches("/files/readme"),
            Some(vec!["readme".into(), "".into()])
        );
        assert_eq!(
            entry.matches("/files/readme.txt"),
            Some(vec!["readme".into(), "txt".into()])
        );
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(RouteEntry::new(r"([unclosed").is_err());
    }

    #[test]
    fn use_steps_appends_to_existing_chain() {
        let mut entry = RouteEntry::new("^/x$").unwrap();
        entry.use_steps(vec![noop_step()]).unwrap();
        entry.use_steps(vec![noop_step(), noop_step()]).unwrap();
        entry.set_timeout_ms(100);
        let mut count = 0;
        let mut node = entry.head.as_deref();
        while let Some(step) = node {
            assert_eq!(step.timeout_ms(), 100);
            count += 1;
            node = step.next();
        }
        assert_eq!(count, 3);
    }
}
