//! Hand-written fakes shared by the unit tests.

use async_trait::async_trait;
use conveyor_core::checker::ResourceChecker;
use conveyor_core::executor::{BuildExecutor, ExecutionStatus, ResolvedInput};
use conveyor_core::pipeline::{
    JobConfig, JobInput, PipelineConfig, ResourceConfig, ResourceConfigs, ResourceTypes, Source,
    Version,
};
use conveyor_core::{Build, BuildId, Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;

/// Records started builds and reports whatever status it was told to.
#[derive(Default)]
pub struct FakeExecutor {
    pub fail_start: bool,
    pub started: Mutex<Vec<(Build, Vec<ResolvedInput>)>>,
    pub statuses: Mutex<HashMap<BuildId, ExecutionStatus>>,
}

impl FakeExecutor {
    pub fn failing() -> Self {
        Self {
            fail_start: true,
            ..Default::default()
        }
    }

    pub fn started_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    pub fn set_status(&self, build: BuildId, status: ExecutionStatus) {
        self.statuses.lock().unwrap().insert(build, status);
    }
}

#[async_trait]
impl BuildExecutor for FakeExecutor {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn start(
        &self,
        build: &Build,
        inputs: &[ResolvedInput],
        _resource_types: &ResourceTypes,
    ) -> Result<()> {
        self.started
            .lock()
            .unwrap()
            .push((build.clone(), inputs.to_vec()));
        if self.fail_start {
            return Err(Error::ExecutionFailed("disaster".to_string()));
        }
        Ok(())
    }

    async fn status(&self, build: &Build) -> Result<ExecutionStatus> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(&build.id)
            .cloned()
            .unwrap_or(ExecutionStatus::Running))
    }
}

/// Reports a fixed list of versions, or fails.
#[derive(Default)]
pub struct FakeChecker {
    pub versions: Vec<Version>,
    pub fail: bool,
    /// (type, from) of every check.
    pub calls: Mutex<Vec<(String, Option<Version>)>>,
}

impl FakeChecker {
    pub fn returning(versions: Vec<Version>) -> Self {
        Self {
            versions,
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ResourceChecker for FakeChecker {
    async fn check(
        &self,
        type_name: &str,
        _source: &Source,
        from: Option<&Version>,
        _resource_types: &ResourceTypes,
    ) -> Result<Vec<Version>> {
        self.calls
            .lock()
            .unwrap()
            .push((type_name.to_string(), from.cloned()));
        if self.fail {
            return Err(Error::CheckFailed("disaster".to_string()));
        }
        Ok(self.versions.clone())
    }
}

/// A pipeline with one resource `repo` and one job `some-job` getting it with `trigger`.
pub fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        name: "main".to_string(),
        resources: ResourceConfigs(vec![ResourceConfig::new("repo", "git")]),
        jobs: vec![JobConfig {
            name: "some-job".to_string(),
            inputs: vec![JobInput::new("repo").with_trigger(true)],
            ..Default::default()
        }],
        ..Default::default()
    }
}
