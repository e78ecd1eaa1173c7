//! Named numeric attributes with a base and a current value.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attribute(Arc<str>);

impl Attribute {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Attribute {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeValue {
    pub base: f64,
    pub current: f64,
}

impl AttributeValue {
    pub fn new(base: f64) -> Self {
        Self {
            base,
            current: base,
        }
    }
}

/// The attribute values one owner carries.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeSet {
    values: BTreeMap<Attribute, AttributeValue>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, attribute: impl Into<Attribute>, base: f64) -> Self {
        self.values.insert(attribute.into(), AttributeValue::new(base));
        self
    }

    pub fn get(&self, attribute: &Attribute) -> Option<AttributeValue> {
        self.values.get(attribute).copied()
    }

    pub fn current(&self, attribute: &Attribute) -> f64 {
        self.values.get(attribute).map_or(0.0, |v| v.current)
    }

    pub fn base(&self, attribute: &Attribute) -> f64 {
        self.values.get(attribute).map_or(0.0, |v| v.base)
    }

    pub fn set_base(&mut self, attribute: &Attribute, base: f64) {
        self.values.entry(attribute.clone()).or_default().base = base;
    }

    /// Returns the previous current value.
    pub fn set_current(&mut self, attribute: &Attribute, current: f64) -> f64 {
        let value = self.values.entry(attribute.clone()).or_default();
        std::mem::replace(&mut value.current, current)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Attribute, &AttributeValue)> {
        self.values.iter()
    }
}

impl FromIterator<(Attribute, f64)> for AttributeSet {
    fn from_iter<I: IntoIterator<Item = (Attribute, f64)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(a, base)| (a, AttributeValue::new(base)))
                .collect(),
        }
    }
}
