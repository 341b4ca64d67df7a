//! Projection between tag dictionaries and flat model labels.
//!
//! A model consumes and produces single strings. A [`TagCodec`] turns a
//! part's [`Tags`] into that string ([`TagCodec::encode`]) and writes a label
//! back onto the configured keys ([`TagCodec::decode`], [`TagCodec::apply`]).
//!
//! For a list of keys, every configured key contributes one piece (an empty
//! piece when unset), so pieces keep their position and decoding a label
//! produced by `encode` recovers exactly the values that were set, provided
//! the join string is non-empty and does not occur inside the values.

mod label_map;

pub use label_map::LabelMap;

use serde::{Deserialize, Serialize};
use std::slice;

use crate::annotation::Tags;

/// Which tag keys make up a label.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TagSelector {
    /// Constant empty label (single-class detection).
    #[default]
    Empty,
    /// One tag key; the label is its value.
    Single(String),
    /// An ordered list of keys whose values are joined.
    List(Vec<String>),
}

impl TagSelector {
    /// The configured keys, in label order.
    pub fn keys(&self) -> &[String] {
        match self {
            TagSelector::Empty => &[],
            TagSelector::Single(key) => slice::from_ref(key),
            TagSelector::List(keys) => keys,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SelectorRepr {
    One(String),
    Many(Vec<String>),
}

impl Serialize for TagSelector {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TagSelector::Empty => serializer.serialize_none(),
            TagSelector::Single(key) => serializer.serialize_str(key),
            TagSelector::List(keys) => keys.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for TagSelector {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<SelectorRepr>::deserialize(deserializer)? {
            None => TagSelector::Empty,
            Some(SelectorRepr::One(key)) => TagSelector::Single(key),
            Some(SelectorRepr::Many(keys)) if keys.is_empty() => TagSelector::Empty,
            Some(SelectorRepr::Many(keys)) => TagSelector::List(keys),
        })
    }
}

/// A tag selector plus the string used to join list pieces.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagCodec {
    selector: TagSelector,
    join: String,
}

impl TagCodec {
    pub fn new(selector: TagSelector, join: impl Into<String>) -> Self {
        Self {
            selector,
            join: join.into(),
        }
    }

    /// Codec for a single tag key.
    pub fn single(key: impl Into<String>) -> Self {
        Self::new(TagSelector::Single(key.into()), "")
    }

    /// Codec joining several keys with `join`.
    pub fn list<I, S>(keys: I, join: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            TagSelector::List(keys.into_iter().map(Into::into).collect()),
            join,
        )
    }

    pub fn selector(&self) -> &TagSelector {
        &self.selector
    }

    pub fn join(&self) -> &str {
        &self.join
    }

    pub fn keys(&self) -> &[String] {
        self.selector.keys()
    }

    /// Label for a tag dictionary, or `None` when the relevant tags are unset.
    pub fn encode(&self, tags: &Tags) -> Option<String> {
        match &self.selector {
            TagSelector::Empty => Some(String::new()),
            TagSelector::Single(key) => tags.get(key).map(str::to_string),
            TagSelector::List(keys) => {
                if keys.iter().all(|key| !tags.contains_key(key)) {
                    return None;
                }
                let pieces: Vec<&str> = keys
                    .iter()
                    .map(|key| tags.get(key).unwrap_or_default())
                    .collect();
                Some(pieces.join(self.join.as_str()))
            }
        }
    }

    /// Tags described by a label, restricted to the configured keys.
    ///
    /// With an empty join string a multi-key label cannot be split, so it is
    /// assigned whole to the first key.
    pub fn decode(&self, label: &str) -> Tags {
        match &self.selector {
            TagSelector::Empty => Tags::new(),
            TagSelector::Single(key) => Tags::new().with(key.as_str(), label),
            TagSelector::List(keys) if self.join.is_empty() => keys
                .first()
                .map(|key| Tags::new().with(key.as_str(), label))
                .unwrap_or_default(),
            TagSelector::List(keys) => keys
                .iter()
                .map(String::as_str)
                .zip(label.split(self.join.as_str()))
                .collect(),
        }
    }

    /// Unsets every configured key.
    pub fn clear(&self, tags: &mut Tags) {
        for key in self.keys() {
            tags.remove(key);
        }
    }

    /// Overwrites the configured keys with the values a label describes.
    ///
    /// Keys outside the codec are left untouched.
    pub fn apply(&self, tags: &mut Tags, label: &str) {
        self.clear(tags);
        tags.update(&self.decode(label));
    }
}
