//! Resource checker trait.

use async_trait::async_trait;

use crate::Result;
use crate::pipeline::{ResourceTypes, Source, Version};

/// Talks to the external system behind a resource and reports its versions.
#[async_trait]
pub trait ResourceChecker: Send + Sync {
    /// Versions newer than `from` (inclusive of `from` is allowed), oldest first.
    ///
    /// `from` is `None` for the first check of a resource.
    async fn check(
        &self,
        type_name: &str,
        source: &Source,
        from: Option<&Version>,
        resource_types: &ResourceTypes,
    ) -> Result<Vec<Version>>;
}
