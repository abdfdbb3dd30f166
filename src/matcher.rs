use std::{collections::HashMap, sync::RwLock};

use crate::error::ServerError;

// A trie over dot-separated hostname labels, consumed right-to-left:
// "www.example.com" descends com -> example -> www. Wildcard labels are
// only meaningful at the deepest level of a stored pattern:
//
// - `*` matches exactly one label.
// - `**` matches one or more labels, greedily.
//
// Lookup precedence at each node is exact label, then `*`, then `**`.
struct Section<C> {
    sections: HashMap<String, Section<C>>,
    value: Option<C>,
}

impl<C> Default for Section<C> {
    fn default() -> Self {
        Section {
            sections: HashMap::new(),
            value: None,
        }
    }
}

impl<C> Section<C> {
    fn set(&mut self, parts: &[&str], value: C) -> Result<(), ServerError> {
        let Some((last, rest)) = parts.split_last() else {
            if self.value.is_some() {
                return Err(ServerError::PatternAlreadyExists);
            }
            self.value = Some(value);
            return Ok(());
        };
        self.sections.entry((*last).into()).or_default().set(rest, value)
    }

    fn find(&self, parts: &[&str]) -> Option<&Section<C>> {
        let Some((last, rest)) = parts.split_last() else {
            return Some(self);
        };
        self.sections.get(*last).and_then(|section| section.find(rest))
    }

    fn remove(&mut self, parts: &[&str]) -> bool {
        let Some((last, rest)) = parts.split_last() else {
            return self.value.take().is_some();
        };
        let Some(section) = self.sections.get_mut(*last) else {
            return false;
        };
        let removed = section.remove(rest);
        // Prune subtrees that no longer lead anywhere.
        if removed && section.sections.is_empty() && section.value.is_none() {
            self.sections.remove(*last);
        }
        removed
    }

    fn match_domain(&self, parts: &[&str]) -> Option<&C> {
        let Some((last, rest)) = parts.split_last() else {
            return self.value.as_ref();
        };
        if let Some(section) = self.sections.get(*last) {
            if let Some(value) = section.match_domain(rest) {
                return Some(value);
            }
        }
        if let Some(section) = self.sections.get("*") {
            if let Some(value) = section.match_domain(rest) {
                return Some(value);
            }
        }
        // `**` is terminal: it swallows whatever labels remain.
        self.sections
            .get("**")
            .and_then(|section| section.value.as_ref())
    }

    fn match_pattern(&self, parts: &[&str]) -> Option<&C> {
        let Some((last, rest)) = parts.split_last() else {
            return self.value.as_ref();
        };
        if let Some(section) = self.sections.get(*last) {
            if let Some(value) = section.match_domain(rest) {
                return Some(value);
            }
        }
        self.sections
            .get("**")
            .and_then(|section| section.value.as_ref())
    }
}

pub(crate) struct Matcher<C> {
    root: RwLock<Section<C>>,
}

impl<C> Matcher<C> {
    pub(crate) fn new() -> Self {
        Matcher {
            root: RwLock::new(Section::default()),
        }
    }

    fn labels(pattern: &str) -> Vec<&str> {
        pattern.split('.').collect()
    }

    // Stores a value under the exact pattern, failing if already present.
    pub(crate) fn insert(&self, pattern: &str, value: C) -> Result<(), ServerError> {
        self.root
            .write()
            .expect("not poisoned")
            .set(&Matcher::<C>::labels(pattern), value)
    }

    // Exact lookup, no wildcard expansion.
    pub(crate) fn get(&self, pattern: &str) -> Option<C>
    where
        C: Clone,
    {
        self.root
            .read()
            .expect("not poisoned")
            .find(&Matcher::<C>::labels(pattern))
            .and_then(|section| section.value.clone())
    }

    // Exact lookup, no wildcard expansion.
    pub(crate) fn contains(&self, pattern: &str) -> bool {
        self.root
            .read()
            .expect("not poisoned")
            .find(&Matcher::<C>::labels(pattern))
            .is_some_and(|section| section.value.is_some())
    }

    // Removes the exact pattern, reporting whether anything was removed.
    pub(crate) fn remove(&self, pattern: &str) -> bool {
        self.root
            .write()
            .expect("not poisoned")
            .remove(&Matcher::<C>::labels(pattern))
    }

    // Matches a concrete domain against the stored patterns, expanding
    // wildcards.
    pub(crate) fn match_domain(&self, domain: &str) -> Option<C>
    where
        C: Clone,
    {
        self.root
            .read()
            .expect("not poisoned")
            .match_domain(&Matcher::<C>::labels(domain))
            .cloned()
    }

    // Tests whether a requested pattern would be accepted by any stored
    // pattern. This is the allowance direction: the stored set acts as the
    // matcher and the request is the subject, so a stored `*.example.com`
    // accepts a request for `foo.example.com`.
    pub(crate) fn match_pattern(&self, pattern: &str) -> bool {
        self.root
            .read()
            .expect("not poisoned")
            .match_pattern(&Matcher::<C>::labels(pattern))
            .is_some()
    }
}
