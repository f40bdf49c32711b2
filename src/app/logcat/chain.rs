use std::sync::Arc;

use regex::Regex;

use crate::app::error::AppError;
use crate::app::models::LogEvent;

pub trait LogHandler: Send + Sync {
    fn handle(&self, event: &LogEvent);
}

/// Registration metadata carried next to each handler.
#[derive(Debug, Clone)]
pub struct HandlerSpec {
    pub name: String,
    pub priority: i32,
    pub regex: Option<Regex>,
    pub tag: Option<String>,
    pub keywords: Vec<String>,
}

impl HandlerSpec {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
            regex: None,
            tag: None,
            keywords: Vec::new(),
        }
    }

    pub fn with_regex(mut self, pattern: &str) -> Result<Self, AppError> {
        let regex = Regex::new(pattern).map_err(|err| {
            AppError::validation(format!("Invalid regex for {}: {err}", self.name), "")
        })?;
        self.regex = Some(regex);
        Ok(self)
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    /// Regex on the raw line, then exact tag, then every keyword as a substring.
    pub fn matches(&self, event: &LogEvent) -> bool {
        if let Some(regex) = &self.regex {
            if !regex.is_match(&event.raw_line) {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if event.tag.as_deref() != Some(tag.as_str()) {
                return false;
            }
        }
        self.keywords
            .iter()
            .all(|keyword| event.raw_line.contains(keyword.as_str()))
    }
}

#[derive(Default)]
pub struct HandlerChainBuilder {
    entries: Vec<(HandlerSpec, Arc<dyn LogHandler>)>,
}

impl HandlerChainBuilder {
    pub fn register(mut self, spec: HandlerSpec, handler: Arc<dyn LogHandler>) -> Self {
        self.entries.push((spec, handler));
        self
    }

    /// Ascending `(priority, name)`, then reversed: the highest priority runs first.
    pub fn build(mut self) -> HandlerChain {
        self.entries.sort_by(|(left, _), (right, _)| {
            left.priority
                .cmp(&right.priority)
                .then_with(|| left.name.cmp(&right.name))
        });
        self.entries.reverse();
        HandlerChain {
            entries: self.entries,
        }
    }
}

pub struct HandlerChain {
    entries: Vec<(HandlerSpec, Arc<dyn LogHandler>)>,
}

impl HandlerChain {
    pub fn builder() -> HandlerChainBuilder {
        HandlerChainBuilder::default()
    }

    pub fn dispatch(&self, event: &LogEvent) -> usize {
        let mut invoked = 0;
        for (spec, handler) in &self.entries {
            if spec.matches(event) {
                handler.handle(event);
                invoked += 1;
            }
        }
        invoked
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(spec, _)| spec.name.as_str()).collect()
    }
}
