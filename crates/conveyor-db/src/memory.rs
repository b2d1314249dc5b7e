//! In-memory store.
//!
//! Implements every repository trait with the same semantics as the
//! PostgreSQL repositories, taking timestamps from a [`Clock`]. Lets the
//! scheduler run, and be tested, without a database.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use conveyor_core::clock::{Clock, SystemClock};
use conveyor_core::executor::ProducedVersion;
use conveyor_core::pipeline::{PipelineConfig, Version};
use conveyor_core::versions::{BuildInput, BuildOutput, InputMapping, ResourceVersion, VersionsDb};
use conveyor_core::{
    Build, BuildId, BuildStatus, JobId, PipelineId, ResourceId, ResourceTypeId, VersionId,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::repo::{
    BuildRepo, InputMappingRepo, LeaseRecord, LeaseRepo, PipelineRepo, SavedJob, SavedPipeline,
    SavedResource, SavedResourceType, SavedVersion, VersionRepo,
};
use crate::{DbError, DbResult};

#[derive(Debug, Clone)]
struct JobRecord {
    id: JobId,
    pipeline_id: PipelineId,
    name: String,
    active: bool,
    paused: bool,
    build_number_seq: i64,
}

#[derive(Debug, Clone)]
struct ResourceRecord {
    id: ResourceId,
    pipeline_id: PipelineId,
    name: String,
    active: bool,
    paused: bool,
    check_error: Option<String>,
    last_checked: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct ResourceTypeRecord {
    id: ResourceTypeId,
    pipeline_id: PipelineId,
    name: String,
    active: bool,
    version: Option<Version>,
    check_error: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    pipelines: Vec<SavedPipeline>,
    jobs: Vec<JobRecord>,
    resources: Vec<ResourceRecord>,
    resource_types: Vec<ResourceTypeRecord>,
    versions: Vec<SavedVersion>,
    builds: Vec<Build>,
    /// (build, version, input name)
    build_inputs: Vec<(BuildId, VersionId, String)>,
    build_outputs: Vec<(BuildId, VersionId)>,
    next_inputs: HashMap<JobId, InputMapping>,
    leases: HashMap<String, LeaseRecord>,
}

impl State {
    fn job(&self, pipeline_id: PipelineId, name: &str) -> DbResult<&JobRecord> {
        self.jobs
            .iter()
            .find(|j| j.pipeline_id == pipeline_id && j.name == name && j.active)
            .ok_or_else(|| DbError::NotFound(format!("job {}", name)))
    }

    fn job_mut(&mut self, pipeline_id: PipelineId, name: &str) -> DbResult<&mut JobRecord> {
        self.jobs
            .iter_mut()
            .find(|j| j.pipeline_id == pipeline_id && j.name == name && j.active)
            .ok_or_else(|| DbError::NotFound(format!("job {}", name)))
    }

    fn resource_mut(
        &mut self,
        pipeline_id: PipelineId,
        name: &str,
    ) -> DbResult<&mut ResourceRecord> {
        self.resources
            .iter_mut()
            .find(|r| r.pipeline_id == pipeline_id && r.name == name && r.active)
            .ok_or_else(|| DbError::NotFound(format!("resource {}", name)))
    }

    fn build_mut(&mut self, id: BuildId) -> DbResult<&mut Build> {
        self.builds
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))
    }

    fn pipeline_job_ids(&self, pipeline_id: PipelineId) -> HashSet<JobId> {
        self.jobs
            .iter()
            .filter(|j| j.pipeline_id == pipeline_id)
            .map(|j| j.id)
            .collect()
    }

    fn version(&self, id: VersionId) -> DbResult<&SavedVersion> {
        self.versions
            .iter()
            .find(|v| v.id == id)
            .ok_or_else(|| DbError::NotFound(format!("version {}", id)))
    }

    fn insert_build(
        &mut self,
        pipeline_id: PipelineId,
        job_name: &str,
        manually_triggered: bool,
        now: DateTime<Utc>,
    ) -> DbResult<Build> {
        let job = self.job_mut(pipeline_id, job_name)?;
        job.build_number_seq += 1;
        let build = Build {
            id: BuildId::new(),
            pipeline_id,
            job_id: job.id,
            job_name: job.name.clone(),
            name: job.build_number_seq,
            status: BuildStatus::Pending,
            manually_triggered,
            created_at: now,
            started_at: None,
            finished_at: None,
        };
        self.builds.push(build.clone());
        Ok(build)
    }
}

/// Repository implementations over process memory.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
        }
    }
}

fn sync_names<T>(
    records: &mut Vec<T>,
    pipeline_id: PipelineId,
    names: &[&str],
    key: impl Fn(&mut T) -> (PipelineId, &str, &mut bool),
    create: impl Fn(&str) -> T,
) {
    for record in records.iter_mut() {
        let (owner, _, active) = key(record);
        if owner == pipeline_id {
            *active = false;
        }
    }
    for name in names {
        let existing = records.iter_mut().find_map(|record| {
            let (owner, record_name, active) = key(record);
            (owner == pipeline_id && record_name == *name).then_some(active)
        });
        match existing {
            Some(active) => *active = true,
            None => records.push(create(name)),
        }
    }
}

fn lease_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

fn plus(at: DateTime<Utc>, delta: TimeDelta) -> DateTime<Utc> {
    at.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl LeaseRepo for MemoryStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder: Uuid,
        duration: Duration,
        immediate: bool,
    ) -> DbResult<Option<LeaseRecord>> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let delta = lease_delta(duration);

        if let Some(existing) = state.leases.get(key) {
            let expired = existing.valid_until <= now;
            let interval_passed = plus(existing.acquired_at, delta) <= now;
            if !expired || !(immediate || interval_passed) {
                return Ok(None);
            }
        }

        let record = LeaseRecord {
            key: key.to_string(),
            holder,
            acquired_at: now,
            valid_until: plus(now, delta),
        };
        state.leases.insert(key.to_string(), record.clone());
        Ok(Some(record))
    }

    async fn release(&self, key: &str, holder: Uuid) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        if let Some(lease) = state.leases.get_mut(key) {
            if lease.holder == holder && lease.valid_until > now {
                lease.valid_until = now;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineRepo for MemoryStore {
    async fn save_config(&self, config: &PipelineConfig) -> DbResult<SavedPipeline> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        let saved = match state.pipelines.iter_mut().find(|p| p.name == config.name) {
            Some(existing) => {
                existing.config = config.clone();
                existing.updated_at = now;
                existing.clone()
            }
            None => {
                let saved = SavedPipeline {
                    id: PipelineId::new(),
                    name: config.name.clone(),
                    config: config.clone(),
                    paused: false,
                    created_at: now,
                    updated_at: now,
                };
                state.pipelines.push(saved.clone());
                saved
            }
        };
        let pipeline_id = saved.id;

        let jobs: Vec<&str> = config.jobs.iter().map(|j| j.name.as_str()).collect();
        let resources: Vec<&str> = config.resources.iter().map(|r| r.name.as_str()).collect();
        let types: Vec<&str> = config.resource_types.iter().map(|t| t.name.as_str()).collect();

        sync_names(
            &mut state.jobs,
            pipeline_id,
            &jobs,
            |j| (j.pipeline_id, j.name.as_str(), &mut j.active),
            |name| JobRecord {
                id: JobId::new(),
                pipeline_id,
                name: name.to_string(),
                active: true,
                paused: false,
                build_number_seq: 0,
            },
        );
        sync_names(
            &mut state.resources,
            pipeline_id,
            &resources,
            |r| (r.pipeline_id, r.name.as_str(), &mut r.active),
            |name| ResourceRecord {
                id: ResourceId::new(),
                pipeline_id,
                name: name.to_string(),
                active: true,
                paused: false,
                check_error: None,
                last_checked: None,
            },
        );
        sync_names(
            &mut state.resource_types,
            pipeline_id,
            &types,
            |t| (t.pipeline_id, t.name.as_str(), &mut t.active),
            |name| ResourceTypeRecord {
                id: ResourceTypeId::new(),
                pipeline_id,
                name: name.to_string(),
                active: true,
                version: None,
                check_error: None,
            },
        );

        Ok(saved)
    }

    async fn get(&self, id: PipelineId) -> DbResult<SavedPipeline> {
        let state = self.state.lock().await;
        state
            .pipelines
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("pipeline {}", id)))
    }

    async fn get_by_name(&self, name: &str) -> DbResult<SavedPipeline> {
        let state = self.state.lock().await;
        state
            .pipelines
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("pipeline {}", name)))
    }

    async fn list(&self) -> DbResult<Vec<SavedPipeline>> {
        let state = self.state.lock().await;
        let mut pipelines = state.pipelines.clone();
        pipelines.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(pipelines)
    }

    async fn set_paused(&self, id: PipelineId, paused: bool) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let pipeline = state
            .pipelines
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| DbError::NotFound(format!("pipeline {}", id)))?;
        pipeline.paused = paused;
        Ok(())
    }

    async fn get_job(&self, pipeline_id: PipelineId, name: &str) -> DbResult<SavedJob> {
        let state = self.state.lock().await;
        let job = state.job(pipeline_id, name)?;
        Ok(SavedJob {
            id: job.id,
            pipeline_id: job.pipeline_id,
            name: job.name.clone(),
            paused: job.paused,
        })
    }

    async fn set_job_paused(
        &self,
        pipeline_id: PipelineId,
        name: &str,
        paused: bool,
    ) -> DbResult<()> {
        let mut state = self.state.lock().await;
        state.job_mut(pipeline_id, name)?.paused = paused;
        Ok(())
    }

    async fn get_resource(&self, pipeline_id: PipelineId, name: &str) -> DbResult<SavedResource> {
        let mut state = self.state.lock().await;
        let resource = state.resource_mut(pipeline_id, name)?;
        Ok(SavedResource {
            id: resource.id,
            pipeline_id: resource.pipeline_id,
            name: resource.name.clone(),
            paused: resource.paused,
            check_error: resource.check_error.clone(),
            last_checked: resource.last_checked,
        })
    }

    async fn set_resource_paused(
        &self,
        pipeline_id: PipelineId,
        name: &str,
        paused: bool,
    ) -> DbResult<()> {
        let mut state = self.state.lock().await;
        state.resource_mut(pipeline_id, name)?.paused = paused;
        Ok(())
    }

    async fn set_resource_check_error(
        &self,
        id: ResourceId,
        error: Option<&str>,
    ) -> DbResult<()> {
        let mut state = self.state.lock().await;
        if let Some(resource) = state.resources.iter_mut().find(|r| r.id == id) {
            resource.check_error = error.map(str::to_string);
        }
        Ok(())
    }

    async fn get_resource_type(
        &self,
        pipeline_id: PipelineId,
        name: &str,
    ) -> DbResult<SavedResourceType> {
        let state = self.state.lock().await;
        state
            .resource_types
            .iter()
            .find(|t| t.pipeline_id == pipeline_id && t.name == name && t.active)
            .map(|t| SavedResourceType {
                id: t.id,
                pipeline_id: t.pipeline_id,
                name: t.name.clone(),
                version: t.version.clone(),
                check_error: t.check_error.clone(),
            })
            .ok_or_else(|| DbError::NotFound(format!("resource type {}", name)))
    }

    async fn save_resource_type_version(
        &self,
        id: ResourceTypeId,
        version: &Version,
    ) -> DbResult<()> {
        let mut state = self.state.lock().await;
        if let Some(resource_type) = state.resource_types.iter_mut().find(|t| t.id == id) {
            resource_type.version = Some(version.clone());
        }
        Ok(())
    }

    async fn set_resource_type_check_error(
        &self,
        id: ResourceTypeId,
        error: Option<&str>,
    ) -> DbResult<()> {
        let mut state = self.state.lock().await;
        if let Some(resource_type) = state.resource_types.iter_mut().find(|t| t.id == id) {
            resource_type.check_error = error.map(str::to_string);
        }
        Ok(())
    }
}

#[async_trait]
impl VersionRepo for MemoryStore {
    async fn load_versions_db(&self, pipeline_id: PipelineId) -> DbResult<VersionsDb> {
        let state = self.state.lock().await;

        let resource_ids: HashMap<String, ResourceId> = state
            .resources
            .iter()
            .filter(|r| r.pipeline_id == pipeline_id && r.active)
            .map(|r| (r.name.clone(), r.id))
            .collect();
        let job_ids: HashMap<String, JobId> = state
            .jobs
            .iter()
            .filter(|j| j.pipeline_id == pipeline_id && j.active)
            .map(|j| (j.name.clone(), j.id))
            .collect();
        let active_resources: HashSet<ResourceId> = resource_ids.values().copied().collect();
        let pipeline_jobs = state.pipeline_job_ids(pipeline_id);

        let resource_versions = state
            .versions
            .iter()
            .filter(|v| active_resources.contains(&v.resource_id))
            .map(|v| ResourceVersion {
                resource_id: v.resource_id,
                version_id: v.id,
                check_order: v.check_order,
                checked: v.checked,
            })
            .collect();

        let builds: HashMap<BuildId, &Build> = state
            .builds
            .iter()
            .filter(|b| pipeline_jobs.contains(&b.job_id))
            .map(|b| (b.id, b))
            .collect();

        let mut build_inputs = Vec::new();
        let mut build_outputs = Vec::new();
        let mut seen_outputs = HashSet::new();
        for (build_id, version_id, input_name) in &state.build_inputs {
            let Some(build) = builds.get(build_id) else {
                continue;
            };
            let version = state.version(*version_id)?;
            build_inputs.push(BuildInput {
                job_id: build.job_id,
                build_id: *build_id,
                resource_id: version.resource_id,
                version_id: *version_id,
                input_name: input_name.clone(),
            });
            if build.status == BuildStatus::Succeeded && seen_outputs.insert((*build_id, *version_id)) {
                build_outputs.push(BuildOutput {
                    job_id: build.job_id,
                    build_id: *build_id,
                    resource_id: version.resource_id,
                    version_id: *version_id,
                });
            }
        }
        for (build_id, version_id) in &state.build_outputs {
            let Some(build) = builds.get(build_id) else {
                continue;
            };
            if build.status != BuildStatus::Succeeded || !seen_outputs.insert((*build_id, *version_id)) {
                continue;
            }
            let version = state.version(*version_id)?;
            build_outputs.push(BuildOutput {
                job_id: build.job_id,
                build_id: *build_id,
                resource_id: version.resource_id,
                version_id: *version_id,
            });
        }

        Ok(VersionsDb {
            resource_versions,
            build_outputs,
            build_inputs,
            job_ids,
            resource_ids,
        })
    }

    async fn save_resource_versions(
        &self,
        resource_id: ResourceId,
        versions: &[Version],
    ) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        if !state.resources.iter().any(|r| r.id == resource_id) {
            return Err(DbError::NotFound(format!("resource {}", resource_id)));
        }

        let mut next_order = state
            .versions
            .iter()
            .filter(|v| v.resource_id == resource_id)
            .map(|v| v.check_order)
            .max()
            .unwrap_or(0)
            + 1;

        for version in versions {
            let existing = state
                .versions
                .iter_mut()
                .find(|v| v.resource_id == resource_id && v.version == *version);
            match existing {
                Some(saved) if saved.checked => {}
                Some(saved) => {
                    saved.checked = true;
                    saved.check_order = next_order;
                    next_order += 1;
                }
                None => {
                    state.versions.push(SavedVersion {
                        id: VersionId::new(),
                        resource_id,
                        version: version.clone(),
                        check_order: next_order,
                        checked: true,
                        created_at: now,
                    });
                    next_order += 1;
                }
            }
        }

        if let Some(resource) = state.resources.iter_mut().find(|r| r.id == resource_id) {
            resource.last_checked = Some(now);
        }
        Ok(())
    }

    async fn latest_version(&self, resource_id: ResourceId) -> DbResult<Option<SavedVersion>> {
        let state = self.state.lock().await;
        Ok(state
            .versions
            .iter()
            .filter(|v| v.resource_id == resource_id && v.checked)
            .max_by_key(|v| v.check_order)
            .cloned())
    }

    async fn get_version(&self, id: VersionId) -> DbResult<SavedVersion> {
        let state = self.state.lock().await;
        state.version(id).cloned()
    }
}

#[async_trait]
impl BuildRepo for MemoryStore {
    async fn create_job_build(&self, pipeline_id: PipelineId, job_name: &str) -> DbResult<Build> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        state.insert_build(pipeline_id, job_name, true, now)
    }

    async fn ensure_pending_build_exists(
        &self,
        pipeline_id: PipelineId,
        job_name: &str,
    ) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let job_id = state.job(pipeline_id, job_name)?.id;

        let exists = state.builds.iter().any(|b| {
            b.job_id == job_id && b.status == BuildStatus::Pending && !b.manually_triggered
        });
        if !exists {
            state.insert_build(pipeline_id, job_name, false, now)?;
        }
        Ok(())
    }

    async fn pending_builds(
        &self,
        pipeline_id: PipelineId,
        job_name: &str,
    ) -> DbResult<Vec<Build>> {
        let state = self.state.lock().await;
        let mut builds: Vec<Build> = state
            .builds
            .iter()
            .filter(|b| {
                b.pipeline_id == pipeline_id
                    && b.job_name == job_name
                    && b.status == BuildStatus::Pending
            })
            .cloned()
            .collect();
        builds.sort_by_key(|b| b.name);
        Ok(builds)
    }

    async fn running_builds_count(
        &self,
        pipeline_id: PipelineId,
        job_name: &str,
    ) -> DbResult<usize> {
        let state = self.state.lock().await;
        Ok(state
            .builds
            .iter()
            .filter(|b| {
                b.pipeline_id == pipeline_id
                    && b.job_name == job_name
                    && b.status == BuildStatus::Started
            })
            .count())
    }

    async fn start_build(&self, id: BuildId, inputs: &[(String, VersionId)]) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        let build = state.build_mut(id)?;
        if build.status != BuildStatus::Pending {
            return Ok(false);
        }
        build.status = BuildStatus::Started;
        build.started_at = Some(now);

        for (input_name, version_id) in inputs {
            state
                .build_inputs
                .push((id, *version_id, input_name.clone()));
        }
        Ok(true)
    }

    async fn finish_build(
        &self,
        id: BuildId,
        status: BuildStatus,
        outputs: &[ProducedVersion],
    ) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        let build = state.build_mut(id)?;
        if build.status != BuildStatus::Started {
            return Ok(false);
        }
        let pipeline_id = build.pipeline_id;

        // Resolve every output before touching the build so a bad output
        // leaves nothing half-recorded.
        let mut resource_ids = Vec::with_capacity(outputs.len());
        for output in outputs {
            resource_ids.push(state.resource_mut(pipeline_id, &output.resource)?.id);
        }

        let build = state.build_mut(id)?;
        build.status = status;
        build.finished_at = Some(now);

        for (output, resource_id) in outputs.iter().zip(resource_ids) {
            let version_id = match state
                .versions
                .iter()
                .find(|v| v.resource_id == resource_id && v.version == output.version)
            {
                Some(existing) => existing.id,
                None => {
                    let version_id = VersionId::new();
                    state.versions.push(SavedVersion {
                        id: version_id,
                        resource_id,
                        version: output.version.clone(),
                        check_order: 0,
                        checked: false,
                        created_at: now,
                    });
                    version_id
                }
            };
            if !state.build_outputs.contains(&(id, version_id)) {
                state.build_outputs.push((id, version_id));
            }
        }
        Ok(true)
    }

    async fn started_builds(&self, pipeline_id: PipelineId) -> DbResult<Vec<Build>> {
        let state = self.state.lock().await;
        let mut builds: Vec<Build> = state
            .builds
            .iter()
            .filter(|b| b.pipeline_id == pipeline_id && b.status == BuildStatus::Started)
            .cloned()
            .collect();
        builds.sort_by_key(|b| b.started_at);
        Ok(builds)
    }

    async fn get(&self, id: BuildId) -> DbResult<Build> {
        let state = self.state.lock().await;
        state
            .builds
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))
    }
}

#[async_trait]
impl InputMappingRepo for MemoryStore {
    async fn save_next_input_mapping(
        &self,
        job_id: JobId,
        mapping: &InputMapping,
    ) -> DbResult<()> {
        let mut state = self.state.lock().await;
        if mapping.is_empty() {
            state.next_inputs.remove(&job_id);
        } else {
            state.next_inputs.insert(job_id, mapping.clone());
        }
        Ok(())
    }

    async fn next_input_mapping(&self, job_id: JobId) -> DbResult<InputMapping> {
        let state = self.state.lock().await;
        Ok(state.next_inputs.get(&job_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::LeaseManager;
    use conveyor_core::clock::ManualClock;
    use conveyor_core::pipeline::{JobConfig, ResourceConfig, ResourceConfigs};

    const MINUTE: Duration = Duration::from_secs(60);

    fn store() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::default();
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    fn version(value: &str) -> Version {
        Version::from([("ref".to_string(), value.to_string())])
    }

    fn pipeline_config() -> PipelineConfig {
        PipelineConfig {
            name: "main".to_string(),
            resources: ResourceConfigs(vec![ResourceConfig::new("repo", "git")]),
            jobs: vec![JobConfig {
                name: "build".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_until_expiry() {
        let (store, clock) = store();
        let leases = LeaseManager::new(Arc::new(store));
        let pipeline = PipelineId::new();

        let held = leases
            .acquire_scheduling_lease(pipeline, MINUTE)
            .await
            .unwrap();
        assert!(held.is_some());
        assert!(
            leases
                .acquire_scheduling_lease(pipeline, MINUTE)
                .await
                .unwrap()
                .is_none()
        );

        clock.advance(MINUTE);

        assert!(
            leases
                .acquire_scheduling_lease(pipeline, MINUTE)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_yield_one_holder() {
        let (store, _clock) = store();
        let leases = LeaseManager::new(Arc::new(store));
        let pipeline = PipelineId::new();

        let attempts: Vec<_> = (0..16)
            .map(|_| {
                let leases = leases.clone();
                tokio::spawn(async move {
                    leases
                        .acquire_scheduling_lease(pipeline, MINUTE)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut acquired = Vec::new();
        for attempt in attempts {
            if let Some(lease) = attempt.await.unwrap() {
                acquired.push(lease);
            }
        }
        assert_eq!(acquired.len(), 1);
    }

    #[tokio::test]
    async fn test_released_lease_only_reclaimable_immediately_when_asked() {
        let (store, clock) = store();
        let leases = LeaseManager::new(Arc::new(store));
        let pipeline = PipelineId::new();

        let lease = leases
            .acquire_resource_checking_lease(pipeline, "repo", MINUTE, false)
            .await
            .unwrap()
            .unwrap();
        lease.release().await.unwrap();

        assert!(
            leases
                .acquire_resource_checking_lease(pipeline, "repo", MINUTE, false)
                .await
                .unwrap()
                .is_none()
        );

        clock.advance(Duration::from_secs(30));
        assert!(
            leases
                .acquire_resource_checking_lease(pipeline, "repo", MINUTE, false)
                .await
                .unwrap()
                .is_none()
        );

        let again = leases
            .acquire_resource_checking_lease(pipeline, "repo", MINUTE, true)
            .await
            .unwrap();
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn test_non_immediate_claim_allowed_once_interval_passed_after_release() {
        let (store, clock) = store();
        let leases = LeaseManager::new(Arc::new(store));
        let pipeline = PipelineId::new();

        let lease = leases
            .acquire_scheduling_lease(pipeline, MINUTE)
            .await
            .unwrap()
            .unwrap();
        lease.release().await.unwrap();
        clock.advance(MINUTE);

        assert!(
            leases
                .acquire_scheduling_lease(pipeline, MINUTE)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_release_by_previous_holder_is_a_no_op() {
        let (store, clock) = store();
        let leases = LeaseManager::new(Arc::new(store));
        let pipeline = PipelineId::new();

        let stale = leases
            .acquire_job_checking_lease(pipeline, "build", MINUTE)
            .await
            .unwrap()
            .unwrap();
        clock.advance(MINUTE);
        let current = leases
            .acquire_job_checking_lease(pipeline, "build", MINUTE)
            .await
            .unwrap()
            .unwrap();

        stale.release().await.unwrap();

        assert!(
            leases
                .acquire_job_checking_lease(pipeline, "build", MINUTE)
                .await
                .unwrap()
                .is_none()
        );

        current.release().await.unwrap();
        current.release().await.unwrap();
        assert!(
            leases
                .acquire_job_checking_lease(pipeline, "build", MINUTE)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_ensure_pending_build_exists_creates_one_build() {
        let (store, _) = store();
        let pipeline = store.save_config(&pipeline_config()).await.unwrap();

        store
            .ensure_pending_build_exists(pipeline.id, "build")
            .await
            .unwrap();
        store
            .ensure_pending_build_exists(pipeline.id, "build")
            .await
            .unwrap();
        store.create_job_build(pipeline.id, "build").await.unwrap();

        let pending = store.pending_builds(pipeline.id, "build").await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].name, 1);
        assert!(!pending[0].manually_triggered);
        assert!(pending[1].manually_triggered);
    }

    #[tokio::test]
    async fn test_check_promotes_version_seen_only_as_output() {
        let (store, _) = store();
        let pipeline = store.save_config(&pipeline_config()).await.unwrap();
        let resource = store.get_resource(pipeline.id, "repo").await.unwrap();

        store
            .save_resource_versions(resource.id, &[version("a")])
            .await
            .unwrap();

        let build = store.create_job_build(pipeline.id, "build").await.unwrap();
        assert!(store.start_build(build.id, &[]).await.unwrap());
        let produced = ProducedVersion {
            resource: "repo".to_string(),
            version: version("b"),
        };
        assert!(
            store
                .finish_build(build.id, BuildStatus::Succeeded, &[produced])
                .await
                .unwrap()
        );

        let latest = store.latest_version(resource.id).await.unwrap().unwrap();
        assert_eq!(latest.version, version("a"));

        store
            .save_resource_versions(resource.id, &[version("a"), version("b")])
            .await
            .unwrap();

        let latest = store.latest_version(resource.id).await.unwrap().unwrap();
        assert_eq!(latest.version, version("b"));
        assert_eq!(latest.check_order, 2);

        let db = store.load_versions_db(pipeline.id).await.unwrap();
        assert_eq!(db.resource_versions.len(), 2);
        assert_eq!(db.build_outputs.len(), 1);
    }

    #[tokio::test]
    async fn test_start_build_only_from_pending() {
        let (store, _) = store();
        let pipeline = store.save_config(&pipeline_config()).await.unwrap();
        let build = store.create_job_build(pipeline.id, "build").await.unwrap();

        assert!(store.start_build(build.id, &[]).await.unwrap());
        assert!(!store.start_build(build.id, &[]).await.unwrap());
        assert_eq!(
            store.running_builds_count(pipeline.id, "build").await.unwrap(),
            1
        );
    }
}
