//! Answer sets and the raw, untrusted form input they are sanitized from.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Hard cap on distinct field ids accepted from one request.
pub const MAX_FORM_FIELDS: usize = 512;

/// Hard cap on repeated values accepted for one field id.
pub const MAX_VALUES_PER_FIELD: usize = 64;

/// A sanitized answer. The shape follows the question type: scalar text or
/// number, a list for checkbox groups, a sub-id map for multi-number groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Choices(Vec<String>),
    Group(BTreeMap<String, f64>),
}

impl AnswerValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_choices(&self) -> Option<&[String]> {
        match self {
            Self::Choices(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// `Null`, blank text, and empty selections count as "not answered".
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(s) => s.trim().is_empty(),
            Self::Choices(c) => c.is_empty(),
            Self::Group(g) => g.is_empty(),
            Self::Bool(_) | Self::Number(_) => false,
        }
    }

    /// Render back into raw form values (the inverse the sanitizer reads).
    /// Groups have no single-field rendering; see [`AnswerSet::to_form`].
    pub fn to_raw(&self) -> Vec<String> {
        match self {
            Self::Null | Self::Group(_) => Vec::new(),
            Self::Bool(b) => vec![b.to_string()],
            Self::Number(n) => vec![n.to_string()],
            Self::Text(s) => vec![s.clone()],
            Self::Choices(c) => c.clone(),
        }
    }
}

/// Mapping from question id to sanitized answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnswerSet(BTreeMap<String, AnswerValue>);

impl AnswerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&AnswerValue> {
        self.0.get(id)
    }

    pub fn insert(&mut self, id: impl Into<String>, value: AnswerValue) {
        self.0.insert(id.into(), value);
    }

    pub fn remove(&mut self, id: &str) -> Option<AnswerValue> {
        self.0.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    pub fn text(&self, id: &str) -> Option<&str> {
        self.get(id).and_then(AnswerValue::as_text)
    }

    /// Whether an answer exists and is non-empty.
    pub fn is_answered(&self, id: &str) -> bool {
        self.get(id).is_some_and(|v| !v.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AnswerValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keep only answers whose id passes the predicate.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.0.retain(|k, _| keep(k));
    }

    /// Render as raw form input. Group answers are flattened into their
    /// sub-field ids, which is how clients submit them.
    pub fn to_form(&self) -> RawForm {
        let mut form = RawForm::new();
        for (id, value) in &self.0 {
            match value {
                AnswerValue::Group(subs) => {
                    for (sub, n) in subs {
                        form.push(sub, n.to_string());
                    }
                }
                other => {
                    for raw in other.to_raw() {
                        form.push(id, raw);
                    }
                }
            }
        }
        form
    }
}

impl FromIterator<(String, AnswerValue)> for AnswerSet {
    fn from_iter<I: IntoIterator<Item = (String, AnswerValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Untrusted request input: every value submitted for each field id, in
/// arrival order. Repeated keys (checkbox groups) keep all their values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawForm {
    fields: BTreeMap<String, Vec<String>>,
}

impl RawForm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value. Values past the per-field cap, and new ids past the
    /// field cap, are dropped.
    pub fn push(&mut self, id: impl Into<String>, value: impl Into<String>) {
        let id = id.into();
        if !self.fields.contains_key(&id) && self.fields.len() >= MAX_FORM_FIELDS {
            return;
        }
        let values = self.fields.entry(id).or_default();
        if values.len() < MAX_VALUES_PER_FIELD {
            values.push(value.into());
        }
    }

    /// Build from decoded key/value pairs, e.g. a urlencoded body.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut form = Self::new();
        for (k, v) in pairs {
            form.push(k, v);
        }
        form
    }

    /// Build from a JSON object. Arrays contribute one value per scalar
    /// element; nested objects (multi-number groups) contribute their entries
    /// under the sub-field ids. Returns `None` if the body is not an object.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let object = value.as_object()?;
        let mut form = Self::new();
        for (key, value) in object {
            match value {
                serde_json::Value::Array(items) => {
                    for item in items {
                        if let Some(s) = json_scalar(item) {
                            form.push(key.as_str(), s);
                        }
                    }
                }
                serde_json::Value::Object(subs) => {
                    for (sub, item) in subs {
                        if let Some(s) = json_scalar(item) {
                            form.push(sub.as_str(), s);
                        }
                    }
                }
                other => {
                    if let Some(s) = json_scalar(other) {
                        form.push(key.as_str(), s);
                    }
                }
            }
        }
        Some(form)
    }

    /// All values submitted for an id (empty if absent).
    pub fn values(&self, id: &str) -> &[String] {
        self.fields.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn first(&self, id: &str) -> Option<&str> {
        self.values(id).first().map(String::as_str)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.fields.contains_key(id)
    }

    /// Remove an id and return its values.
    pub fn take(&mut self, id: &str) -> Vec<String> {
        self.fields.remove(id).unwrap_or_default()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

fn json_scalar(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_keeps_repeated_values() {
        let form = RawForm::from_pairs([("impacts", "health"), ("impacts", "housing"), ("x", "1")]);
        assert_eq!(form.values("impacts"), &["health", "housing"]);
        assert_eq!(form.first("x"), Some("1"));
        assert!(form.values("missing").is_empty());
    }

    #[test]
    fn form_caps_values_per_field() {
        let form = RawForm::from_pairs((0..100).map(|i| ("k", i.to_string())));
        assert_eq!(form.values("k").len(), MAX_VALUES_PER_FIELD);
    }

    #[test]
    fn form_caps_field_count() {
        let form = RawForm::from_pairs((0..600).map(|i| (format!("f{i}"), "v")));
        assert_eq!(form.len(), MAX_FORM_FIELDS);
    }

    #[test]
    fn json_body_flattens_arrays_and_groups() {
        let body = serde_json::json!({
            "parent_type": "paying",
            "impacts": ["health", "housing", {"nested": true}],
            "children": {"children_under_5": 2, "children_5_to_15": "1"},
            "consent_given": true,
            "ignored": null,
        });
        let form = RawForm::from_json(&body).unwrap();
        assert_eq!(form.first("parent_type"), Some("paying"));
        assert_eq!(form.values("impacts"), &["health", "housing"]);
        assert_eq!(form.first("children_under_5"), Some("2"));
        assert_eq!(form.first("children_5_to_15"), Some("1"));
        assert_eq!(form.first("consent_given"), Some("true"));
        assert!(!form.contains("ignored"));
        assert!(!form.contains("children"));
    }

    #[test]
    fn json_body_must_be_object() {
        assert!(RawForm::from_json(&serde_json::json!(["a"])).is_none());
    }

    #[test]
    fn empty_answers() {
        assert!(AnswerValue::Null.is_empty());
        assert!(AnswerValue::Text("  ".into()).is_empty());
        assert!(AnswerValue::Choices(vec![]).is_empty());
        assert!(!AnswerValue::Number(0.0).is_empty());
        assert!(!AnswerValue::Bool(false).is_empty());
    }

    #[test]
    fn answer_set_serializes_untagged() {
        let mut set = AnswerSet::new();
        set.insert("a", AnswerValue::Text("x".into()));
        set.insert("b", AnswerValue::Choices(vec!["y".into()]));
        set.insert("c", AnswerValue::Null);
        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json, serde_json::json!({"a": "x", "b": ["y"], "c": null}));
    }

    #[test]
    fn to_form_flattens_groups() {
        let mut set = AnswerSet::new();
        let mut group = BTreeMap::new();
        group.insert("kids".to_string(), 2.0);
        set.insert("children", AnswerValue::Group(group));
        set.insert("n", AnswerValue::Number(1.5));
        let form = set.to_form();
        assert_eq!(form.first("kids"), Some("2"));
        assert_eq!(form.first("n"), Some("1.5"));
        assert!(!form.contains("children"));
    }
}
