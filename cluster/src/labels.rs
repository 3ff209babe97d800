//! Equality-based label selectors.

use std::collections::BTreeMap;
use std::fmt;

/// A requirement on a single label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// The label must have the value.
    Eq(String),
    /// The label must not have the value.
    NotEq(String),
}

impl Requirement {
    /// Determines if a label value satisfies the requirement.
    ///
    /// A missing label never equals a value.
    fn matches(&self, value: Option<&str>) -> bool {
        match self {
            Self::Eq(expected) => value == Some(expected.as_str()),
            Self::NotEq(unexpected) => value != Some(unexpected.as_str()),
        }
    }
}

/// A label selector made of equality-based requirements.
///
/// Requirements are keyed by label; the selector renders them sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector(BTreeMap<String, Requirement>);

impl LabelSelector {
    /// Constructs an empty selector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires the label to have the value.
    pub fn eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), Requirement::Eq(value.into()));
        self
    }

    /// Requires the label to not have the value.
    pub fn not_eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), Requirement::NotEq(value.into()));
        self
    }

    /// Determines if the selector has no requirements.
    ///
    /// An empty selector selects everything.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Determines if a set of labels satisfies every requirement.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0
            .iter()
            .all(|(k, r)| r.matches(labels.get(k).map(String::as_str)))
    }

    /// Renders the selector in the query-string form the API server accepts.
    pub fn query_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, requirement)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }

            match requirement {
                Requirement::Eq(v) => write!(f, "{key}={v}")?,
                Requirement::NotEq(v) => write!(f, "{key}!={v}")?,
            }
        }

        Ok(())
    }
}

impl From<&BTreeMap<String, String>> for LabelSelector {
    fn from(labels: &BTreeMap<String, String>) -> Self {
        Self(
            labels
                .iter()
                .map(|(k, v)| (k.clone(), Requirement::Eq(v.clone())))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_renders_sorted_requirements() {
        let selector = LabelSelector::new()
            .not_eq("tier", "backend")
            .eq("app", "knitfab")
            .eq("component", "worker");

        assert_eq!(
            selector.query_string(),
            "app=knitfab,component=worker,tier!=backend"
        );
        assert_eq!(LabelSelector::new().query_string(), "");
    }

    #[test]
    fn later_requirements_replace_earlier_ones() {
        let selector = LabelSelector::new().eq("app", "a").not_eq("app", "b");
        assert_eq!(selector.query_string(), "app!=b");
    }

    #[test]
    fn it_matches_labels() {
        let labels = BTreeMap::from_iter([
            ("app".to_string(), "knitfab".to_string()),
            ("component".to_string(), "worker".to_string()),
        ]);

        assert!(LabelSelector::from(&labels).matches(&labels));
        assert!(LabelSelector::new().matches(&labels));
        assert!(LabelSelector::new().not_eq("tier", "backend").matches(&labels));
        assert!(!LabelSelector::new().eq("tier", "backend").matches(&labels));
        assert!(!LabelSelector::new().not_eq("app", "knitfab").matches(&labels));
    }
}
