// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use rustc_hash::FxHashSet;
use std::sync::{Arc, Mutex};

/// Interns strings, handing out pointers that stay identical for equal
/// content for the flyweight's lifetime
///
/// Used to deduplicate table ids across accumulated update batches.
#[derive(Default)]
pub struct FlyweightString {
    strings: Mutex<FxHashSet<Arc<str>>>,
}

impl FlyweightString {
    /// Interns a string, returning the canonical instance.
    pub fn get(&self, s: &str) -> Arc<str> {
        #[allow(clippy::expect_used)]
        let mut strings = self.strings.lock().expect("lock is poisoned");

        if let Some(existing) = strings.get(s) {
            return existing.clone();
        }

        let interned: Arc<str> = s.into();
        strings.insert(interned.clone());
        interned
    }

    /// Number of distinct interned strings.
    #[must_use]
    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.strings.lock().expect("lock is poisoned").len()
    }

    /// Returns `true` if nothing has been interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn flyweight_identity() {
        let flyweight = FlyweightString::default();

        let a = flyweight.get("2/14");
        let b = flyweight.get("2/14");
        let c = flyweight.get("2/15");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(2, flyweight.len());
    }
}
