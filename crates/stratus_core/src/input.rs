//! Resource input records.
//!
//! An input record maps field names to [`Input`]s. An input is a literal JSON
//! value, a deferred value, or a list or object whose members may themselves
//! be deferred. Declaring a resource scans the record once for embedded
//! deferred values; their provenance becomes the resource's dependency edges.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use crate::deferred::Deferred;
use crate::error::CoreResult;
use crate::resource::ResourceId;

/// A single input field value.
#[derive(Debug, Clone)]
pub enum Input {
    Literal(Value),
    Deferred(Deferred<Value>),
    List(Vec<Input>),
    Object(BTreeMap<String, Input>),
}

impl Input {
    /// Build an object input from `(key, input)` pairs.
    pub fn object<K, I>(fields: impl IntoIterator<Item = (K, I)>) -> Self
    where
        K: Into<String>,
        I: Into<Input>,
    {
        Self::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Build a list input.
    pub fn list<I: Into<Input>>(items: impl IntoIterator<Item = I>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }

    fn collect_deferred(&self, found: &mut Vec<Deferred<Value>>) {
        match self {
            Self::Literal(_) => {}
            Self::Deferred(value) => found.push(value.clone()),
            Self::List(items) => items.iter().for_each(|i| i.collect_deferred(found)),
            Self::Object(fields) => fields.values().for_each(|i| i.collect_deferred(found)),
        }
    }

    /// Rebuild the concrete value, taking deferred values from `settled` in
    /// the same depth-first order `collect_deferred` produced them.
    fn fill(&self, settled: &mut impl Iterator<Item = Value>) -> Value {
        match self {
            Self::Literal(value) => value.clone(),
            Self::Deferred(_) => settled.next().unwrap_or(Value::Null),
            Self::List(items) => Value::Array(items.iter().map(|i| i.fill(settled)).collect()),
            Self::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, i)| (k.clone(), i.fill(settled)))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for Input {
    fn from(value: Value) -> Self {
        Self::Literal(value)
    }
}

impl From<&str> for Input {
    fn from(value: &str) -> Self {
        Self::Literal(Value::String(value.to_string()))
    }
}

impl From<String> for Input {
    fn from(value: String) -> Self {
        Self::Literal(Value::String(value))
    }
}

impl From<u32> for Input {
    fn from(value: u32) -> Self {
        Self::Literal(Value::from(value))
    }
}

impl From<bool> for Input {
    fn from(value: bool) -> Self {
        Self::Literal(Value::Bool(value))
    }
}

impl From<Deferred<Value>> for Input {
    fn from(value: Deferred<Value>) -> Self {
        Self::Deferred(value)
    }
}

impl From<&Deferred<Value>> for Input {
    fn from(value: &Deferred<Value>) -> Self {
        Self::Deferred(value.clone())
    }
}

impl From<Deferred<String>> for Input {
    fn from(value: Deferred<String>) -> Self {
        Self::Deferred(value.map(Value::String))
    }
}

/// The input record of a resource.
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    fields: BTreeMap<String, Input>,
}

impl Inputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field.
    pub fn field(mut self, name: impl Into<String>, input: impl Into<Input>) -> Self {
        self.insert(name, input);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, input: impl Into<Input>) {
        self.fields.insert(name.into(), input.into());
    }

    pub fn get(&self, name: &str) -> Option<&Input> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Field names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Every deferred value embedded in the record, depth first.
    pub fn deferreds(&self) -> Vec<Deferred<Value>> {
        let mut found = Vec::new();
        for input in self.fields.values() {
            input.collect_deferred(&mut found);
        }
        found
    }

    /// Resources whose outputs feed this record.
    pub fn provenance(&self) -> BTreeSet<ResourceId> {
        self.deferreds()
            .iter()
            .flat_map(|d| d.provenance().iter().copied())
            .collect()
    }

    /// The concrete record, once every embedded deferred value has resolved.
    pub fn resolve(&self) -> Deferred<Map<String, Value>> {
        let fields = self.fields.clone();
        Deferred::join_all(&self.deferreds()).map(move |values| {
            let mut settled = values.into_iter();
            fields
                .iter()
                .map(|(name, input)| (name.clone(), input.fill(&mut settled)))
                .collect()
        })
    }

    /// The concrete record if it can be built without waiting.
    pub fn resolve_now(&self) -> Option<CoreResult<Map<String, Value>>> {
        self.resolve().peek()
    }
}
