//! Per-subscription duplicate suppression.

use std::collections::HashSet;

use serde_json::Value;

/// Identifiers already emitted in the current subscription.
#[derive(Debug, Default, Clone)]
pub struct EventDeduplicator {
    seen: HashSet<String>,
}

impl EventDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every identifier; called when a new subscription starts.
    pub fn reset(&mut self) {
        self.seen.clear();
    }

    /// Record `id`, returning `true` only the first time it is seen.
    pub fn add_and_check(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string());
        true
    }

    /// Keep the first occurrence of each identifier, preserving order.
    ///
    /// Entities without an identifier are always kept.
    pub fn filter_duplicates(&mut self, entities: Vec<Value>) -> Vec<Value> {
        entities
            .into_iter()
            .filter(|entity| match entity_id(entity) {
                Some(id) => self.add_and_check(&id),
                None => true,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Identifier of an entity: a non-empty string, or a number as decimal text.
pub fn entity_id(entity: &Value) -> Option<String> {
    match entity.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// True when `request` opens a new subscription (`["REQ", <sub>, ...]`).
pub fn is_subscription_start(request: &str) -> bool {
    match serde_json::from_str::<Value>(request) {
        Ok(Value::Array(items)) => items.len() >= 2 && items[0] == "REQ",
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch() -> Vec<Value> {
        vec![
            json!({"id": "a", "pubkey": "p", "kind": 1}),
            json!({"id": "b", "pubkey": "p", "kind": 1}),
            json!({"id": "a", "pubkey": "q", "kind": 7}),
        ]
    }

    #[test]
    fn test_add_and_check() {
        let mut dedup = EventDeduplicator::new();
        assert!(dedup.add_and_check("e1"));
        assert!(!dedup.add_and_check("e1"));
        assert!(dedup.add_and_check("e2"));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_filter_keeps_first_occurrence_in_order() {
        let mut dedup = EventDeduplicator::new();
        let kept = dedup.filter_duplicates(batch());
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0]["id"], "a");
        assert_eq!(kept[0]["pubkey"], "p");
        assert_eq!(kept[1]["id"], "b");
    }

    #[test]
    fn test_filter_twice_without_reset_is_empty() {
        let mut dedup = EventDeduplicator::new();
        assert_eq!(dedup.filter_duplicates(batch()).len(), 2);
        assert!(dedup.filter_duplicates(batch()).is_empty());
    }

    #[test]
    fn test_filter_twice_with_reset_is_full() {
        let mut dedup = EventDeduplicator::new();
        let first = dedup.filter_duplicates(batch());
        dedup.reset();
        assert!(dedup.is_empty());
        let second = dedup.filter_duplicates(batch());
        assert_eq!(first, second);
    }

    #[test]
    fn test_entities_without_id_are_kept() {
        let mut dedup = EventDeduplicator::new();
        let entities = vec![json!({"kind": 1}), json!({"kind": 1}), json!({"id": ""})];
        assert_eq!(dedup.filter_duplicates(entities).len(), 3);
        assert!(dedup.is_empty());
    }

    #[test]
    fn test_numeric_ids_compare_as_text() {
        let mut dedup = EventDeduplicator::new();
        assert_eq!(entity_id(&json!({"id": 42})), Some("42".to_string()));
        assert!(dedup.add_and_check("42"));
        let kept = dedup.filter_duplicates(vec![json!({"id": 42, "kind": 1})]);
        assert!(kept.is_empty());
    }

    #[test]
    fn test_subscription_start_detection() {
        assert!(is_subscription_start(r#"["REQ","sub1",{"kinds":[1]}]"#));
        assert!(is_subscription_start(r#"["REQ","sub1"]"#));
        assert!(!is_subscription_start(r#"["REQ"]"#));
        assert!(!is_subscription_start(r#"["CLOSE","sub1"]"#));
        assert!(!is_subscription_start(r#"{"REQ":"sub1"}"#));
        assert!(!is_subscription_start("not json"));
    }
}
