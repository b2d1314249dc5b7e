//! Typed identifiers.
//!
//! Every persisted entity gets its own newtype over a UUIDv7 so that ids of
//! different kinds cannot be mixed up.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
        )]
        #[display("{_0}")]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new unique id using UUIDv7.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Create an id from an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

define_id!(
    /// Identifies a saved pipeline.
    PipelineId
);
define_id!(
    /// Identifies a job within a saved pipeline.
    JobId
);
define_id!(
    /// Identifies a resource within a saved pipeline.
    ResourceId
);
define_id!(
    /// Identifies a resource type within a saved pipeline.
    ResourceTypeId
);
define_id!(
    /// Identifies one discovered version of a resource.
    VersionId
);
define_id!(
    /// Identifies a build of a job.
    BuildId
);
