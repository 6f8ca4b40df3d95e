//! Newtype identifiers shared by every component.
//!
//! Modeled on the teacher's `utils::id::NodeId`: a bare integer wrapper with
//! `Display`/`serde` so it prints and (de)serializes as a plain number, but
//! can never be confused with a different table's primary key at the type
//! level.

use std::fmt;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(v: i64) -> Self {
                Self(v)
            }
        }
    };
}

id_type!(ProviderId);
id_type!(InstanceId);
id_type!(TaskId);
id_type!(UserId);
id_type!(PortId);
