//! Label selectors as carried by a deployment's `spec.selector`.
//!
//! The selector renders to the API server's string syntax for list calls and
//! can also evaluate itself locally (used by the in-memory cluster).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOp {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl SelectorOp {
    pub fn from_api(op: &str) -> Option<Self> {
        match op {
            "In" => Some(SelectorOp::In),
            "NotIn" => Some(SelectorOp::NotIn),
            "Exists" => Some(SelectorOp::Exists),
            "DoesNotExist" => Some(SelectorOp::DoesNotExist),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorRequirement {
    pub key: String,
    pub operator: SelectorOp,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<SelectorRequirement>,
}

impl LabelSelector {
    pub fn from_labels<I, K, V>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: labels.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            match_expressions: Vec::new(),
        }
    }

    /// An empty selector matches every pod in the namespace; callers treat it
    /// as "no selector" rather than "select all".
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    /// Render to `key=value,key in (a,b),!key` form.
    pub fn render(&self) -> String {
        let mut parts: Vec<String> = self.match_labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        for req in &self.match_expressions {
            let part = match req.operator {
                SelectorOp::In => format!("{} in ({})", req.key, req.values.join(",")),
                SelectorOp::NotIn => format!("{} notin ({})", req.key, req.values.join(",")),
                SelectorOp::Exists => req.key.clone(),
                SelectorOp::DoesNotExist => format!("!{}", req.key),
            };
            parts.push(part);
        }
        parts.join(",")
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let labels_ok = self.match_labels.iter().all(|(k, v)| labels.get(k) == Some(v));
        labels_ok
            && self.match_expressions.iter().all(|req| {
                let present = labels.get(&req.key);
                match req.operator {
                    SelectorOp::In => present.map(|v| req.values.contains(v)).unwrap_or(false),
                    SelectorOp::NotIn => present.map(|v| !req.values.contains(v)).unwrap_or(true),
                    SelectorOp::Exists => present.is_some(),
                    SelectorOp::DoesNotExist => present.is_none(),
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn sample() -> LabelSelector {
        let mut sel = LabelSelector::from_labels([("app", "checkout")]);
        sel.match_expressions.push(SelectorRequirement {
            key: "tier".into(),
            operator: SelectorOp::In,
            values: vec!["web".into(), "api".into()],
        });
        sel.match_expressions.push(SelectorRequirement { key: "canary".into(), operator: SelectorOp::DoesNotExist, values: vec![] });
        sel
    }

    #[test]
    fn renders_labels_then_expressions() {
        assert_eq!(sample().render(), "app=checkout,tier in (web,api),!canary");
        let sorted = LabelSelector::from_labels([("b", "2"), ("a", "1")]);
        assert_eq!(sorted.render(), "a=1,b=2");
    }

    #[test]
    fn matches_all_requirements() {
        let sel = sample();
        assert!(sel.matches(&labels(&[("app", "checkout"), ("tier", "web")])));
        assert!(!sel.matches(&labels(&[("app", "checkout"), ("tier", "db")])));
        assert!(!sel.matches(&labels(&[("app", "checkout"), ("tier", "web"), ("canary", "true")])));
        assert!(!sel.matches(&labels(&[("app", "cart"), ("tier", "web")])));
    }

    #[test]
    fn not_in_and_exists() {
        let sel = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![
                SelectorRequirement { key: "env".into(), operator: SelectorOp::NotIn, values: vec!["dev".into()] },
                SelectorRequirement { key: "team".into(), operator: SelectorOp::Exists, values: vec![] },
            ],
        };
        assert_eq!(sel.render(), "env notin (dev),team");
        assert!(sel.matches(&labels(&[("team", "payments")])));
        assert!(!sel.matches(&labels(&[("team", "payments"), ("env", "dev")])));
        assert!(!sel.matches(&labels(&[("env", "prod")])));
    }

    #[test]
    fn empty_selector_is_flagged() {
        assert!(LabelSelector::default().is_empty());
        assert!(!sample().is_empty());
    }
}
