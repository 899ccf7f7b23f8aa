//! Queue bindings and topic routing.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An (exchange, queue, routing key) triple.
///
/// Exchanges are always durable topic exchanges and queues are always
/// durable, so a binding is fully described by its three names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueBinding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl QueueBinding {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Returns the name of the first empty component, if any.
    pub fn empty_component(&self) -> Option<&'static str> {
        if self.exchange.is_empty() {
            Some("exchange")
        } else if self.queue.is_empty() {
            Some("queue")
        } else if self.routing_key.is_empty() {
            Some("routing_key")
        } else {
            None
        }
    }
}

impl fmt::Display for QueueBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -[{}]-> {}", self.exchange, self.routing_key, self.queue)
    }
}

/// AMQP topic matching: words are separated by `.`, `*` matches exactly one
/// word and `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(topic_matches("route.request", "route.request"));
        assert!(!topic_matches("route.request", "route.result"));
        assert!(!topic_matches("route.request", "route.request.extra"));
    }

    #[test]
    fn test_star_matches_one_word() {
        assert!(topic_matches("route.*", "route.request"));
        assert!(!topic_matches("route.*", "route"));
        assert!(!topic_matches("route.*", "route.request.eu"));
        assert!(topic_matches("*.request", "route.request"));
    }

    #[test]
    fn test_hash_matches_any_number_of_words() {
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("route.#", "route"));
        assert!(topic_matches("route.#", "route.request.eu.west"));
        assert!(topic_matches("route.#.west", "route.request.eu.west"));
        assert!(!topic_matches("route.#.west", "route.request.eu.east"));
    }

    #[test]
    fn test_binding_empty_component() {
        let binding = QueueBinding::new("planning.inbound", "", "route.request");
        assert_eq!(binding.empty_component(), Some("queue"));

        let binding = QueueBinding::new("planning.inbound", "jobs", "route.request");
        assert_eq!(binding.empty_component(), None);
        assert_eq!(binding.to_string(), "planning.inbound -[route.request]-> jobs");
    }
}
