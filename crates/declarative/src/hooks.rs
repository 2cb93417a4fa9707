//! Hook dispatch over an ordered set of plugins
//!
//! Plugins are kept in registration order, except those marked
//! [`HookOrder::TryLast`] which are moved after all others (keeping their
//! relative order). Results of a hook call are combined with one of the
//! aggregation disciplines below. An error returned by a plugin aborts the
//! dispatch and is propagated as is.

use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Position of a plugin in dispatch order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum HookOrder {
    /// Dispatched in registration order
    #[default]
    Normal,
    /// Dispatched after every `Normal` plugin
    TryLast,
}

/// An immutable, ordered set of plugins
pub struct HookSet<P: ?Sized> {
    plugins: Vec<Box<P>>,
}

impl<P: ?Sized> HookSet<P> {
    /// Build the set from plugins in registration order
    pub fn new(mut plugins: Vec<Box<P>>, order: impl Fn(&P) -> HookOrder) -> Self {
        // sort_by_key is stable: registration order is kept within a class
        plugins.sort_by_key(|p| order(p));
        Self { plugins }
    }

    /// Iterate plugins in dispatch order
    pub fn iter(&self) -> impl Iterator<Item = &P> {
        self.plugins.iter().map(|p| p.as_ref())
    }

    /// Number of registered plugins
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether no plugin is registered
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl<P: ?Sized> Default for HookSet<P> {
    fn default() -> Self {
        Self {
            plugins: Vec::new(),
        }
    }
}

/// Values that can be combined by [`merge_all`]
pub trait Merge {
    /// Fold `other` into `self`
    fn merge(&mut self, other: Self);
}

/// Maps merge key by key; on collision the later plugin wins.
impl<K: Ord, V> Merge for BTreeMap<K, V> {
    fn merge(&mut self, other: Self) {
        self.extend(other);
    }
}

impl<K: Hash + Eq, V> Merge for HashMap<K, V> {
    fn merge(&mut self, other: Self) {
        self.extend(other);
    }
}

/// Lists concatenate in dispatch order, skipping items already present.
impl<T: PartialEq> Merge for Vec<T> {
    fn merge(&mut self, other: Self) {
        for item in other {
            if !self.contains(&item) {
                self.push(item);
            }
        }
    }
}

/// Return the first non-`None` result
///
/// Later plugins are not called once a result is found.
pub fn first_non_null<'p, P, T>(
    plugins: impl IntoIterator<Item = &'p P>,
    mut call: impl FnMut(&'p P) -> Result<Option<T>>,
) -> Result<Option<T>>
where
    P: ?Sized + 'p,
{
    for plugin in plugins {
        if let Some(value) = call(plugin)? {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

/// Return `true` if some plugin returned `true`
///
/// Evaluation stops at the first `true`, so a specialized implementation
/// registered earlier supersedes generic ones registered after it.
pub fn any_true<'p, P>(
    plugins: impl IntoIterator<Item = &'p P>,
    mut call: impl FnMut(&'p P) -> Result<bool>,
) -> Result<bool>
where
    P: ?Sized + 'p,
{
    for plugin in plugins {
        if call(plugin)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Merge every non-`None` result, in dispatch order
pub fn merge_all<'p, P, T>(
    plugins: impl IntoIterator<Item = &'p P>,
    mut call: impl FnMut(&'p P) -> Result<Option<T>>,
) -> Result<T>
where
    P: ?Sized + 'p,
    T: Merge + Default,
{
    let mut merged = T::default();
    for plugin in plugins {
        if let Some(value) = call(plugin)? {
            merged.merge(value);
        }
    }
    Ok(merged)
}

/// Call every plugin for its side effects
pub fn call_all<'p, P>(
    plugins: impl IntoIterator<Item = &'p P>,
    mut call: impl FnMut(&'p P) -> Result<()>,
) -> Result<()>
where
    P: ?Sized + 'p,
{
    for plugin in plugins {
        call(plugin)?;
    }
    Ok(())
}
