//! Directory entries as handed to callers.

use crate::ldap_protocol::{PartialAttribute, SearchResultEntry};
use std::collections::btree_map::{self, BTreeMap};
use std::collections::BTreeSet;

/// Named set of byte values. Value order is irrelevant and duplicates collapse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    name: String,
    values: BTreeSet<Vec<u8>>,
}

impl Attribute {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: BTreeSet::new(),
        }
    }

    pub fn with_values<I, V>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Vec<u8>>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Name as first seen (original case).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns false if the value was already present.
    pub fn insert(&mut self, value: impl Into<Vec<u8>>) -> bool {
        self.values.insert(value.into())
    }

    pub fn contains(&self, value: &[u8]) -> bool {
        self.values.contains(value)
    }

    pub fn values(&self) -> impl Iterator<Item = &[u8]> {
        self.values.iter().map(Vec::as_slice)
    }

    /// Values that are valid UTF-8.
    pub fn str_values(&self) -> impl Iterator<Item = &str> {
        self.values.iter().filter_map(|v| std::str::from_utf8(v).ok())
    }

    pub fn first_str(&self) -> Option<&str> {
        self.str_values().next()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn merge(&mut self, other: Attribute) {
        self.values.extend(other.values);
    }
}

impl From<PartialAttribute> for Attribute {
    fn from(attr: PartialAttribute) -> Self {
        Attribute::with_values(attr.attr_type, attr.attr_values)
    }
}

/// Attributes keyed case-insensitively by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeSet {
    attrs: BTreeMap<String, Attribute>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `attr`, merging its values into an existing attribute whose name differs only by case.
    pub fn insert(&mut self, attr: Attribute) {
        match self.attrs.entry(attr.name.to_ascii_lowercase()) {
            btree_map::Entry::Occupied(mut existing) => existing.get_mut().merge(attr),
            btree_map::Entry::Vacant(slot) => {
                slot.insert(attr);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attrs.get(&name.to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.attrs.contains_key(&name.to_ascii_lowercase())
    }

    pub fn remove(&mut self, name: &str) -> Option<Attribute> {
        self.attrs.remove(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Attributes ordered by lowercased name.
    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.attrs.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.attrs.values().map(Attribute::name)
    }
}

impl FromIterator<Attribute> for AttributeSet {
    fn from_iter<T: IntoIterator<Item = Attribute>>(iter: T) -> Self {
        let mut set = AttributeSet::new();
        for attr in iter {
            set.insert(attr);
        }
        set
    }
}

impl<'a> IntoIterator for &'a AttributeSet {
    type Item = &'a Attribute;
    type IntoIter = btree_map::Values<'a, String, Attribute>;

    fn into_iter(self) -> Self::IntoIter {
        self.attrs.values()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub dn: String,
    pub attributes: AttributeSet,
}

impl Entry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: AttributeSet::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    /// First UTF-8 value of `name`, if any.
    pub fn first_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Attribute::first_str)
    }
}

impl From<SearchResultEntry> for Entry {
    fn from(entry: SearchResultEntry) -> Self {
        Self {
            dn: entry.object_name,
            attributes: entry.attributes.into_iter().map(Attribute::from).collect(),
        }
    }
}
