//! Input version resolution.
//!
//! Picks one version per job input from a [`VersionsDb`] snapshot. Inputs
//! are considered in declaration order and each input's candidates from
//! newest to oldest, so the first combination found by the depth-first
//! search is the latest one.
//!
//! An input with `passed` jobs only accepts versions that flowed through a
//! succeeded build of every one of those jobs. Inputs sharing a passed job
//! must also have flowed through the *same* build of it: the search carries,
//! per passed job, the set of builds still compatible with every choice made
//! so far and backtracks as soon as one of those sets becomes empty.
//!
//! Inputs that share no passed job, directly or through other inputs, cannot
//! constrain each other. They are split into separate groups and each group
//! is searched on its own, so an input outside a group never multiplies the
//! work of a failing search inside it. Within a group, states already known
//! to fail are remembered and not explored twice.

use conveyor_core::pipeline::{JobConfig, JobInput};
use conveyor_core::versions::VersionsDb;
use conveyor_core::{BuildId, JobId, VersionId};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

type BuildSets = BTreeMap<JobId, BTreeSet<BuildId>>;

struct Candidate {
    version_id: VersionId,
    /// Builds of each passed job this version flowed through.
    passed: Vec<(JobId, BTreeSet<BuildId>)>,
}

/// Resolve the latest satisfiable version of every input of `job`.
///
/// Returns `None` when some input has no candidate, or when no combination
/// satisfies every `passed` constraint at once.
pub fn resolve(versions: &VersionsDb, job: &JobConfig) -> Option<BTreeMap<String, VersionId>> {
    let outputs = output_index(versions);

    let mut inputs = Vec::with_capacity(job.inputs.len());
    for input in &job.inputs {
        inputs.push(candidates(versions, &outputs, input)?);
    }

    let mut mapping = BTreeMap::new();
    for group in groups(&inputs) {
        let members: Vec<&[Candidate]> = group.iter().map(|&i| inputs[i].as_slice()).collect();
        let mut search = Search::new(&members);
        if !search.run(0, &BuildSets::new()) {
            return None;
        }
        for (&i, version_id) in group.iter().zip(search.chosen) {
            mapping.insert(job.inputs[i].name.clone(), version_id);
        }
    }
    Some(mapping)
}

/// (job, version) to the succeeded builds of that job the version flowed through.
fn output_index(versions: &VersionsDb) -> HashMap<(JobId, VersionId), BTreeSet<BuildId>> {
    let mut index: HashMap<(JobId, VersionId), BTreeSet<BuildId>> = HashMap::new();
    for output in &versions.build_outputs {
        index
            .entry((output.job_id, output.version_id))
            .or_default()
            .insert(output.build_id);
    }
    index
}

/// Checked versions of the input's resource that passed every required job, newest first.
fn candidates(
    versions: &VersionsDb,
    outputs: &HashMap<(JobId, VersionId), BTreeSet<BuildId>>,
    input: &JobInput,
) -> Option<Vec<Candidate>> {
    let resource_id = *versions.resource_ids.get(&input.resource)?;
    let passed_jobs = input
        .passed
        .iter()
        .map(|name| versions.job_ids.get(name).copied())
        .collect::<Option<Vec<JobId>>>()?;

    let mut known: Vec<_> = versions
        .resource_versions
        .iter()
        .filter(|v| v.resource_id == resource_id && v.checked)
        .collect();
    known.sort_by(|a, b| b.check_order.cmp(&a.check_order));

    let candidates: Vec<Candidate> = known
        .into_iter()
        .filter_map(|version| {
            let passed = passed_jobs
                .iter()
                .map(|job_id| {
                    outputs
                        .get(&(*job_id, version.version_id))
                        .filter(|builds| !builds.is_empty())
                        .map(|builds| (*job_id, builds.clone()))
                })
                .collect::<Option<Vec<_>>>()?;
            Some(Candidate {
                version_id: version.version_id,
                passed,
            })
        })
        .collect();

    if candidates.is_empty() {
        None
    } else {
        Some(candidates)
    }
}

fn passed_jobs(candidates: &[Candidate]) -> impl Iterator<Item = JobId> + '_ {
    candidates
        .first()
        .into_iter()
        .flat_map(|candidate| candidate.passed.iter().map(|(job_id, _)| *job_id))
}

/// Input indices grouped by shared passed jobs, each group in declaration order.
fn groups(inputs: &[Vec<Candidate>]) -> Vec<Vec<usize>> {
    let mut parent: Vec<usize> = (0..inputs.len()).collect();
    fn root(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    let mut first_user: HashMap<JobId, usize> = HashMap::new();
    for (i, candidates) in inputs.iter().enumerate() {
        for job_id in passed_jobs(candidates) {
            let other = *first_user.entry(job_id).or_insert(i);
            let (a, b) = (root(&mut parent, i), root(&mut parent, other));
            // The smaller index stays the root so groups keep declaration order.
            parent[a.max(b)] = a.min(b);
        }
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..inputs.len() {
        let r = root(&mut parent, i);
        groups.entry(r).or_default().push(i);
    }
    groups.into_values().collect()
}

struct Search<'a> {
    inputs: &'a [&'a [Candidate]],
    /// Passed jobs still used by the inputs from each depth onwards.
    live: Vec<HashSet<JobId>>,
    failed: HashSet<(usize, BuildSets)>,
    chosen: Vec<VersionId>,
}

impl<'a> Search<'a> {
    fn new(inputs: &'a [&'a [Candidate]]) -> Self {
        let mut live = vec![HashSet::new(); inputs.len() + 1];
        for depth in (0..inputs.len()).rev() {
            let mut jobs = live[depth + 1].clone();
            jobs.extend(passed_jobs(inputs[depth]));
            live[depth] = jobs;
        }
        Self {
            inputs,
            live,
            failed: HashSet::new(),
            chosen: Vec::with_capacity(inputs.len()),
        }
    }

    fn run(&mut self, depth: usize, constraints: &BuildSets) -> bool {
        let Some(current) = self.inputs.get(depth).copied() else {
            return true;
        };
        if self.failed.contains(&(depth, constraints.clone())) {
            return false;
        }

        for candidate in current {
            let Some(mut narrowed) = narrow(constraints, candidate) else {
                continue;
            };
            let live = &self.live[depth + 1];
            narrowed.retain(|job_id, _| live.contains(job_id));

            self.chosen.push(candidate.version_id);
            if self.run(depth + 1, &narrowed) {
                return true;
            }
            self.chosen.pop();
        }

        self.failed.insert((depth, constraints.clone()));
        false
    }
}

/// Intersect the running build sets with the candidate's. `None` if any becomes empty.
fn narrow(constraints: &BuildSets, candidate: &Candidate) -> Option<BuildSets> {
    let mut narrowed = constraints.clone();
    for (job_id, builds) in &candidate.passed {
        match narrowed.get_mut(job_id) {
            Some(compatible) => {
                compatible.retain(|build| builds.contains(build));
                if compatible.is_empty() {
                    return None;
                }
            }
            None => {
                narrowed.insert(*job_id, builds.clone());
            }
        }
    }
    Some(narrowed)
}
