//! Capability tokens gate which consumer receives which event.
//!
//! Every hook point declares, per event type, the set of capabilities a
//! consumer must hold to receive it. A consumer receives an event when the
//! required set is a subset of its own. The empty set is satisfied by anyone.

use std::{
    borrow::Cow,
    collections::BTreeSet,
    fmt,
};

use serde::Serialize;

/// An opaque token, declared in the [`CapabilityModel`] vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Capability(Cow<'static, str>);

impl Capability {
    pub const fn new(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Capability {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

impl From<&'static str> for Capability {
    fn from(name: &'static str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, capability: impl Into<Capability>) -> bool {
        self.0.insert(capability.into())
    }

    pub fn contains(&self, capability: &Capability) -> bool {
        self.0.contains(capability)
    }

    pub fn is_subset(&self, other: &CapabilitySet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn union(&self, other: &CapabilitySet) -> CapabilitySet {
        Self(self.0.union(&other.0).cloned().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<C: Into<Capability>> FromIterator<C> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = C>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("-");
        }
        let tokens: Vec<&str> = self.0.iter().map(Capability::as_str).collect();
        f.write_str(&tokens.join(","))
    }
}

/// Which event types a capability requirement applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EventTypeSelector {
    /// Every event type emitted by the hook point.
    Any,
    Named(Cow<'static, str>),
}

impl EventTypeSelector {
    pub const fn named(event_type: &'static str) -> Self {
        Self::Named(Cow::Borrowed(event_type))
    }

    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            EventTypeSelector::Any => true,
            EventTypeSelector::Named(name) => name == event_type,
        }
    }
}

impl fmt::Display for EventTypeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventTypeSelector::Any => f.write_str("*"),
            EventTypeSelector::Named(name) => f.write_str(name),
        }
    }
}

/// Capability requirements of the event types of one hook point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventCapabilities {
    entries: Vec<(EventTypeSelector, CapabilitySet)>,
}

impl EventCapabilities {
    pub fn insert(&mut self, selector: EventTypeSelector, capabilities: CapabilitySet) {
        self.entries.push((selector, capabilities));
    }

    /// Union of the wildcard entry and the entries naming `event_type`.
    /// `None` when the event type is not declared at all.
    pub fn required(&self, event_type: &str) -> Option<CapabilitySet> {
        self.entries
            .iter()
            .filter(|(selector, _)| selector.matches(event_type))
            .map(|(_, capabilities)| capabilities)
            .fold(None, |acc: Option<CapabilitySet>, capabilities| {
                Some(match acc {
                    Some(acc) => acc.union(capabilities),
                    None => capabilities.clone(),
                })
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &(EventTypeSelector, CapabilitySet)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The declared capability vocabulary.
#[derive(Debug, Clone, Default)]
pub struct CapabilityModel {
    vocabulary: BTreeSet<Capability>,
}

impl CapabilityModel {
    pub fn new<I, C>(vocabulary: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Capability>,
    {
        Self {
            vocabulary: vocabulary.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_declared(&self, capability: &Capability) -> bool {
        self.vocabulary.contains(capability)
    }

    /// First token of `capabilities` missing from the vocabulary.
    pub fn validate(&self, capabilities: &CapabilitySet) -> Result<(), Capability> {
        match capabilities.iter().find(|c| !self.is_declared(c)) {
            Some(unknown) => Err(unknown.clone()),
            None => Ok(()),
        }
    }

    pub fn required_capabilities(
        &self,
        event_capabilities: &EventCapabilities,
        event_type: &str,
    ) -> Option<CapabilitySet> {
        event_capabilities.required(event_type)
    }

    pub fn consumer_satisfies(consumer: &CapabilitySet, required: &CapabilitySet) -> bool {
        required.is_subset(consumer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(tokens: &[&'static str]) -> CapabilitySet {
        tokens.iter().copied().collect()
    }

    #[test]
    fn union_of_wildcard_and_named() {
        let mut caps = EventCapabilities::default();
        caps.insert(EventTypeSelector::Any, set(&["process"]));
        caps.insert(EventTypeSelector::named("exec"), set(&["exec-args"]));
        assert_eq!(caps.required("exec"), Some(set(&["process", "exec-args"])));
        assert_eq!(caps.required("fork"), Some(set(&["process"])));
    }

    #[test]
    fn undeclared_event_type() {
        let mut caps = EventCapabilities::default();
        caps.insert(EventTypeSelector::named("exec"), CapabilitySet::empty());
        assert_eq!(caps.required("exec"), Some(CapabilitySet::empty()));
        assert_eq!(caps.required("exit"), None);
    }

    #[test]
    fn subset_rule() {
        let required = set(&["process"]);
        assert!(CapabilityModel::consumer_satisfies(
            &set(&["process", "network"]),
            &required
        ));
        assert!(!CapabilityModel::consumer_satisfies(
            &set(&["network"]),
            &required
        ));
        // empty requirements are satisfied by everybody
        assert!(CapabilityModel::consumer_satisfies(
            &CapabilitySet::empty(),
            &CapabilitySet::empty()
        ));
    }

    #[test]
    fn vocabulary_validation() {
        let model = CapabilityModel::new(["process"]);
        assert!(model.validate(&set(&["process"])).is_ok());
        assert_eq!(
            model.validate(&set(&["process", "secrets"])),
            Err(Capability::new("secrets"))
        );
    }
}
