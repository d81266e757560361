//! Topic access control for publishing and subscribing.
//!
//! Every check here is a pure predicate over a [`ScopingRule`] and a topic
//! name: no I/O, no shared state, safe to call from any number of tasks.
//!
//! ## Policy
//!
//! - An empty list allows every topic.
//! - A non-empty list allows exactly the topics it contains. Matching is
//!   exact string membership; there are no wildcards and no prefixes.
//! - `allowed_topics` applies to every app using the component and is
//!   checked before the app's own publish/subscribe scopes.

use serde::{Deserialize, Serialize};

/// Declared topic scopes for one pub/sub component, as seen by this app.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopingRule {
    /// Topics any app may use on this component. Empty = unrestricted.
    #[serde(default)]
    pub allowed_topics: Vec<String>,
    /// Topics this app may publish to. Empty = unrestricted.
    #[serde(default)]
    pub scoped_publishings: Vec<String>,
    /// Topics this app may subscribe to. Empty = unrestricted.
    #[serde(default)]
    pub scoped_subscriptions: Vec<String>,
}

impl ScopingRule {
    /// A rule that allows everything.
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn with_allowed_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_publishings<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scoped_publishings = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_subscriptions<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scoped_subscriptions = topics.into_iter().map(Into::into).collect();
        self
    }

    /// May this app publish to `topic`?
    pub fn can_publish(&self, topic: &str) -> bool {
        is_operation_allowed(topic, &self.allowed_topics, &self.scoped_publishings)
    }

    /// May this app subscribe to `topic`?
    pub fn can_subscribe(&self, topic: &str) -> bool {
        is_operation_allowed(topic, &self.allowed_topics, &self.scoped_subscriptions)
    }
}

/// Exact-membership check against a single scope list.
pub fn is_allowed(topic: &str, scoped_topics: &[String]) -> bool {
    scoped_topics.is_empty() || scoped_topics.iter().any(|t| t == topic)
}

/// Component-wide allow-list first, then the operation's app scope.
pub fn is_operation_allowed(topic: &str, allowed_topics: &[String], scoped_topics: &[String]) -> bool {
    is_allowed(topic, allowed_topics) && is_allowed(topic, scoped_topics)
}

/// Qualify `topic` with the app's namespace when the component is namespace-scoped.
pub fn qualify_topic(namespace: &str, topic: &str, namespace_scoped: bool) -> String {
    if namespace_scoped {
        format!("{}{}", namespace, topic)
    } else {
        topic.to_string()
    }
}
