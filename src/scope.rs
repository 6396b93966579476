//! Scope sets for resolved permission values.
//!
//! A resolved value is not a plain boolean: an override may apply only to the
//! account it is set on (`self`), only below it (`descendants`), or both.
//! `[]` is disabled and `[self, descendants]` is the ordinary enabled value.

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AppliesTo {
    on_self: bool,
    on_descendants: bool,
}

impl AppliesTo {
    pub const NONE: AppliesTo = AppliesTo::from_flags(false, false);
    pub const SELF: AppliesTo = AppliesTo::from_flags(true, false);
    pub const DESCENDANTS: AppliesTo = AppliesTo::from_flags(false, true);
    pub const ALL: AppliesTo = AppliesTo::from_flags(true, true);

    pub const fn from_flags(on_self: bool, on_descendants: bool) -> Self {
        Self {
            on_self,
            on_descendants,
        }
    }

    /// `ALL` for true, `NONE` for false.
    pub const fn from_bool(enabled: bool) -> Self {
        Self::from_flags(enabled, enabled)
    }

    pub fn is_enabled(&self) -> bool {
        self.on_self || self.on_descendants
    }

    pub fn includes_self(&self) -> bool {
        self.on_self
    }

    pub fn includes_descendants(&self) -> bool {
        self.on_descendants
    }

    pub fn union(self, other: AppliesTo) -> AppliesTo {
        AppliesTo::from_flags(
            self.on_self || other.on_self,
            self.on_descendants || other.on_descendants,
        )
    }

    /// The value as seen one level down: a descendant of the node that set it.
    ///
    /// Whatever applied to descendants applies fully (to self and further down) at
    /// the child; a self-only value does not reach it.
    pub fn carried_to_child(self) -> AppliesTo {
        AppliesTo::from_bool(self.on_descendants)
    }

    /// Masked by an outer condition such as an account setting.
    pub fn when(self, allowed: bool) -> AppliesTo {
        if allowed { self } else { AppliesTo::NONE }
    }

    fn labels(&self) -> impl Iterator<Item = &'static str> {
        [(self.on_self, "self"), (self.on_descendants, "descendants")]
            .into_iter()
            .filter_map(|(set, label)| set.then_some(label))
    }
}

impl From<bool> for AppliesTo {
    fn from(enabled: bool) -> Self {
        AppliesTo::from_bool(enabled)
    }
}

impl fmt::Display for AppliesTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<&str> = self.labels().collect();
        write!(f, "[{}]", labels.join(", "))
    }
}

impl Serialize for AppliesTo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let labels: Vec<&str> = self.labels().collect();
        let mut seq = serializer.serialize_seq(Some(labels.len()))?;
        for label in labels {
            seq.serialize_element(label)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for AppliesTo {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AppliesToVisitor;

        impl<'de> Visitor<'de> for AppliesToVisitor {
            type Value = AppliesTo;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a boolean or a list of \"self\"/\"descendants\"")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<AppliesTo, E> {
                Ok(AppliesTo::from_bool(v))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<AppliesTo, A::Error> {
                let mut value = AppliesTo::NONE;
                while let Some(label) = seq.next_element::<String>()? {
                    value = match label.as_str() {
                        "self" => value.union(AppliesTo::SELF),
                        "descendants" => value.union(AppliesTo::DESCENDANTS),
                        other => {
                            return Err(de::Error::unknown_variant(
                                other,
                                &["self", "descendants"],
                            ));
                        }
                    };
                }
                Ok(value)
            }
        }

        deserializer.deserialize_any(AppliesToVisitor)
    }
}
