//! Control parameter collections.
//!
//! Controls are the per-frame tuning parameters an application attaches to a
//! capture request and an algorithm worker computes for the pipeline. This
//! module keeps them deliberately small: a numeric identifier mapped to a
//! typed value, with no registry of well-known identifiers. Identifier
//! allocation belongs to the pipeline and algorithm layers.

use std::collections::HashMap;

/// Numeric identifier of a control.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControlId(pub u32);

/// A typed control value.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlValue {
    /// Boolean control, typically an enable flag.
    Bool(bool),
    /// 32-bit integer control.
    Integer(i32),
    /// 64-bit integer control, used for timestamps and durations.
    Integer64(i64),
}

impl From<bool> for ControlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for ControlValue {
    fn from(v: i32) -> Self {
        Self::Integer(v)
    }
}

impl From<i64> for ControlValue {
    fn from(v: i64) -> Self {
        Self::Integer64(v)
    }
}

/// An unordered collection of controls, at most one value per identifier.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ControlList {
    controls: HashMap<ControlId, ControlValue>,
}

impl ControlList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `id` to `value`, replacing any previous value.
    pub fn set(&mut self, id: ControlId, value: impl Into<ControlValue>) {
        self.controls.insert(id, value.into());
    }

    /// Look up the value for `id`.
    pub fn get(&self, id: ControlId) -> Option<&ControlValue> {
        self.controls.get(&id)
    }

    /// Whether a value is set for `id`.
    pub fn contains(&self, id: ControlId) -> bool {
        self.controls.contains_key(&id)
    }

    /// Number of controls in the list.
    pub fn len(&self) -> usize {
        self.controls.len()
    }

    /// Whether the list holds no controls.
    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }

    /// Remove every control from the list.
    pub fn clear(&mut self) {
        self.controls.clear();
    }

    /// Merge `other` into this list, overwriting on identifier collision.
    pub fn merge(&mut self, other: &ControlList) {
        for (id, value) in &other.controls {
            self.controls.insert(*id, value.clone());
        }
    }

    /// Iterate over all identifier/value pairs, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&ControlId, &ControlValue)> {
        self.controls.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut list = ControlList::new();
        list.set(ControlId(1), true);
        list.set(ControlId(2), 1500i32);
        list.set(ControlId(3), 33_333_000i64);

        assert_eq!(list.get(ControlId(1)), Some(&ControlValue::Bool(true)));
        assert_eq!(list.get(ControlId(2)), Some(&ControlValue::Integer(1500)));
        assert_eq!(
            list.get(ControlId(3)),
            Some(&ControlValue::Integer64(33_333_000))
        );
        assert_eq!(list.get(ControlId(4)), None);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_set_replaces() {
        let mut list = ControlList::new();
        list.set(ControlId(7), 1i32);
        list.set(ControlId(7), 2i32);
        assert_eq!(list.get(ControlId(7)), Some(&ControlValue::Integer(2)));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_merge_overwrites_collisions() {
        let mut a = ControlList::new();
        a.set(ControlId(1), 1i32);
        a.set(ControlId(2), 2i32);

        let mut b = ControlList::new();
        b.set(ControlId(2), 20i32);
        b.set(ControlId(3), 30i32);

        a.merge(&b);
        assert_eq!(a.get(ControlId(1)), Some(&ControlValue::Integer(1)));
        assert_eq!(a.get(ControlId(2)), Some(&ControlValue::Integer(20)));
        assert_eq!(a.get(ControlId(3)), Some(&ControlValue::Integer(30)));
    }
}
