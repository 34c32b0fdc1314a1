//! Ordered, duplicate-free set of subscribed topics.

/// Topics in first-subscribed order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopicSet {
    topics: Vec<String>,
}

impl TopicSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `topic`. Returns `false` if it was already present.
    pub fn insert(&mut self, topic: &str) -> bool {
        if self.contains(topic) {
            return false;
        }
        self.topics.push(topic.to_string());
        true
    }

    /// Remove `topic`. Returns `false` if it was not present.
    pub fn remove(&mut self, topic: &str) -> bool {
        let before = self.topics.len();
        self.topics.retain(|t| t != topic);
        self.topics.len() < before
    }

    /// Whether `topic` is present.
    pub fn contains(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t == topic)
    }

    /// Number of topics.
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Copy of the topics in order.
    pub fn snapshot(&self) -> Vec<String> {
        self.topics.clone()
    }

    /// Split a copy of the topics into consecutive batches of at most
    /// `size` (a zero size is treated as one).
    pub fn batches(&self, size: usize) -> Vec<Vec<String>> {
        self.topics
            .chunks(size.max(1))
            .map(<[String]>::to_vec)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_idempotent() {
        let mut set = TopicSet::new();
        assert!(set.insert("x"));
        assert!(!set.insert("x"));
        assert_eq!(set.snapshot(), vec!["x"]);
    }

    #[test]
    fn remove_reports_presence() {
        let mut set = TopicSet::new();
        let _ = set.insert("a");
        assert!(!set.remove("b"));
        assert!(set.remove("a"));
        assert!(set.is_empty());
    }

    #[test]
    fn preserves_insertion_order() {
        let mut set = TopicSet::new();
        for t in ["c", "a", "b"] {
            let _ = set.insert(t);
        }
        assert_eq!(set.snapshot(), vec!["c", "a", "b"]);
    }

    #[test]
    fn batches_of_thirty() {
        let mut set = TopicSet::new();
        for i in 0..65 {
            let _ = set.insert(&format!("t{i}"));
        }
        let batches = set.batches(30);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 30);
        assert_eq!(batches[1].len(), 30);
        assert_eq!(batches[2].len(), 5);
        assert_eq!(batches[2][0], "t60");
    }

    #[test]
    fn empty_set_has_no_batches() {
        assert!(TopicSet::new().batches(30).is_empty());
    }
}
