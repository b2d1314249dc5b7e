//! Pipeline configuration: resources, resource types and jobs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Resource source configuration, passed verbatim to the checker.
pub type Source = serde_json::Map<String, serde_json::Value>;

/// A concrete resource version, as reported by a check (e.g. `{"ref": "abc123"}`).
pub type Version = BTreeMap<String, String>;

/// A complete pipeline definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name.
    pub name: String,
    /// Custom resource types.
    pub resource_types: ResourceTypes,
    /// Resources whose versions feed jobs.
    pub resources: ResourceConfigs,
    /// Jobs.
    pub jobs: Vec<JobConfig>,
}

impl PipelineConfig {
    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

/// A resource declared by a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: String,
    /// Resource type name (builtin or a custom resource type).
    #[serde(rename = "type")]
    pub type_name: String,
    pub source: Source,
    /// Overrides the default periodic check interval.
    pub check_every: Option<Duration>,
}

impl ResourceConfig {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            source: Source::new(),
            check_every: None,
        }
    }
}

/// A custom resource type declared by a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceType {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub source: Source,
}

/// The resources of a pipeline, with lookup by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceConfigs(pub Vec<ResourceConfig>);

impl ResourceConfigs {
    pub fn lookup(&self, name: &str) -> Option<&ResourceConfig> {
        self.0.iter().find(|r| r.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceConfig> {
        self.0.iter()
    }
}

/// The custom resource types of a pipeline, with lookup by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceTypes(pub Vec<ResourceType>);

impl ResourceTypes {
    pub fn lookup(&self, name: &str) -> Option<&ResourceType> {
        self.0.iter().find(|t| t.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceType> {
        self.0.iter()
    }
}

/// A job: a set of inputs and the policy for building them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    /// `get` steps, in declaration order.
    pub inputs: Vec<JobInput>,
    /// Only one build of this job may run at a time.
    pub serial: bool,
    /// Maximum number of concurrently running builds.
    pub max_in_flight: Option<u32>,
}

impl JobConfig {
    /// Effective limit on running builds, if any.
    pub fn max_in_flight(&self) -> Option<u32> {
        if self.serial {
            Some(1)
        } else {
            self.max_in_flight
        }
    }

    pub fn input(&self, name: &str) -> Option<&JobInput> {
        self.inputs.iter().find(|i| i.name == name)
    }
}

/// A `get` step of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobInput {
    /// Input name, unique per job.
    pub name: String,
    /// Source resource name; equal to `name` unless the input is renamed.
    pub resource: String,
    /// Upstream jobs the version must have passed through.
    pub passed: Vec<String>,
    /// Whether a new version of this input triggers a build.
    pub trigger: bool,
}

impl JobInput {
    /// An input fetching the resource of the same name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            resource: name.clone(),
            name,
            passed: Vec::new(),
            trigger: false,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    pub fn with_passed<I, S>(mut self, jobs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.passed = jobs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_trigger(mut self, trigger: bool) -> Self {
        self.trigger = trigger;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_overrides_max_in_flight() {
        let job = JobConfig {
            name: "deploy".to_string(),
            serial: true,
            max_in_flight: Some(4),
            ..Default::default()
        };
        assert_eq!(job.max_in_flight(), Some(1));
    }

    #[test]
    fn test_renamed_input_keeps_resource() {
        let input = JobInput::new("code").with_resource("repo").with_trigger(true);
        assert_eq!(input.name, "code");
        assert_eq!(input.resource, "repo");
        assert!(input.trigger);
    }
}
