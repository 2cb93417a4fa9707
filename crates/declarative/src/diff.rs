//! Diff computation

use std::collections::BTreeMap;

/// Changes between two keyed collections: `key -> (before, after)`
///
/// Only keys whose value differs (including appearing or disappearing) are
/// reported.
pub fn changes<V: PartialEq + Clone>(
    before: &BTreeMap<String, V>,
    after: &BTreeMap<String, V>,
) -> BTreeMap<String, (Option<V>, Option<V>)> {
    let mut out = BTreeMap::new();
    for (key, old) in before {
        match after.get(key) {
            Some(new) if new == old => {}
            new => {
                out.insert(key.clone(), (Some(old.clone()), new.cloned()));
            }
        }
    }
    for (key, new) in after {
        if !before.contains_key(key) {
            out.insert(key.clone(), (None, Some(new.clone())));
        }
    }
    out
}
