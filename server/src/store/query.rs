//! Queries against the document store.
//!
//! Deliberately small: enough to express the demo publications.

use lagless_engine::{CollectionName, FieldName, Fields};
use serde::{Deserialize, Serialize};

/// Which documents of a collection match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Selector {
    /// Every document
    All,
    /// Documents with one of these ids
    Ids(Vec<String>),
    /// Documents whose field equals a value
    Eq(FieldName, serde_json::Value),
    /// Documents matching every selector
    And(Vec<Selector>),
}

impl Selector {
    /// Check a document against this selector.
    pub fn matches(&self, id: &str, fields: &Fields) -> bool {
        match self {
            Selector::All => true,
            Selector::Ids(ids) => ids.iter().any(|candidate| candidate == id),
            Selector::Eq(field, value) => fields.get(field) == Some(value),
            Selector::And(selectors) => selectors.iter().all(|s| s.matches(id, fields)),
        }
    }
}

/// A collection, a selector and an optional field projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub collection: CollectionName,
    pub selector: Selector,
    /// Fields to publish; `None` publishes all of them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<FieldName>>,
}

impl Query {
    /// Match every document of `collection`.
    pub fn new(collection: impl Into<CollectionName>) -> Self {
        Self {
            collection: collection.into(),
            selector: Selector::All,
            fields: None,
        }
    }

    /// Restrict to documents matching `selector`.
    pub fn filter(mut self, selector: Selector) -> Self {
        self.selector = match self.selector {
            Selector::All => selector,
            Selector::And(mut selectors) => {
                selectors.push(selector);
                Selector::And(selectors)
            }
            existing => Selector::And(vec![existing, selector]),
        };
        self
    }

    /// Only publish these fields.
    pub fn project<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<FieldName>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn matches(&self, id: &str, fields: &Fields) -> bool {
        self.selector.matches(id, fields)
    }

    /// Apply the projection.
    pub fn projected(&self, fields: &Fields) -> Fields {
        match &self.fields {
            Some(names) => fields
                .iter()
                .filter(|(name, _)| names.contains(name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            None => fields.clone(),
        }
    }
}
