//! Strongly-typed identifiers for the entity model (spec §3).
//!
//! Entities are keyed by auto-incrementing `i64` primary keys in the
//! relational store. These newtypes exist so handlers can't accidentally
//! compare a `CollectionId` against an `ItemId`.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl $name {
            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(v: i64) -> Self {
                $name(v)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(ResourceId);
id_type!(CollectionId);
id_type!(ItemId);
id_type!(TagId);
