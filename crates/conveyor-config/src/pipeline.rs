//! Pipeline configuration parsing.

use crate::{ConfigError, ConfigResult, parse_duration};
use conveyor_core::pipeline::{
    JobConfig, JobInput, PipelineConfig, ResourceConfig, ResourceConfigs, ResourceType,
    ResourceTypes, Source,
};
use kdl::{KdlDocument, KdlNode, KdlValue};
use std::collections::{HashMap, HashSet};

/// Parse a pipeline configuration from KDL text.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<PipelineConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut resource_types = Vec::new();
    let mut resources = Vec::new();
    let mut jobs = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
            }
            "resource-type" => {
                resource_types.push(parse_resource_type(node)?);
            }
            "resource" => {
                resources.push(parse_resource(node)?);
            }
            "job" => {
                jobs.push(parse_job(node)?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }

    let config = PipelineConfig {
        name,
        resource_types: ResourceTypes(resource_types),
        resources: ResourceConfigs(resources),
        jobs,
    };
    validate(&config)?;

    Ok(config)
}

/// Check names and references of an already-built pipeline configuration.
pub fn validate(config: &PipelineConfig) -> ConfigResult<()> {
    check_unique("resource type", config.resource_types.iter().map(|t| &t.name))?;
    check_unique("resource", config.resources.iter().map(|r| &r.name))?;
    check_unique("job", config.jobs.iter().map(|j| &j.name))?;

    for job in &config.jobs {
        check_unique(
            &format!("input of job '{}'", job.name),
            job.inputs.iter().map(|i| &i.name),
        )?;

        for input in &job.inputs {
            if config.resources.lookup(&input.resource).is_none() {
                return Err(ConfigError::InvalidReference(format!(
                    "job '{}' gets unknown resource '{}'",
                    job.name, input.resource
                )));
            }

            for upstream in &input.passed {
                let upstream_job = config.job(upstream).ok_or_else(|| {
                    ConfigError::InvalidReference(format!(
                        "job '{}' input '{}' passed unknown job '{}'",
                        job.name, input.name, upstream
                    ))
                })?;

                if !upstream_job
                    .inputs
                    .iter()
                    .any(|i| i.resource == input.resource)
                {
                    return Err(ConfigError::InvalidReference(format!(
                        "job '{}' input '{}' passed job '{}', which does not use resource '{}'",
                        job.name, input.name, upstream, input.resource
                    )));
                }
            }
        }
    }

    if let Err(cycle) = detect_cycle(&config.jobs) {
        return Err(ConfigError::CycleDetected(cycle));
    }

    Ok(())
}

fn check_unique<'a>(kind: &str, names: impl Iterator<Item = &'a String>) -> ConfigResult<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name.as_str()) {
            return Err(ConfigError::Duplicate(format!("{} '{}'", kind, name)));
        }
    }
    Ok(())
}

fn parse_resource_type(node: &KdlNode) -> ConfigResult<ResourceType> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("resource type name".to_string()))?;
    let type_name = get_string_prop(node, "type").ok_or_else(|| {
        ConfigError::MissingField(format!("type for resource type '{}'", name))
    })?;

    Ok(ResourceType {
        name,
        type_name,
        source: parse_source(node),
    })
}

fn parse_resource(node: &KdlNode) -> ConfigResult<ResourceConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("resource name".to_string()))?;
    let type_name = get_string_prop(node, "type")
        .ok_or_else(|| ConfigError::MissingField(format!("type for resource '{}'", name)))?;

    let check_every = match get_string_prop(node, "check-every") {
        Some(raw) => Some(parse_duration(&raw).ok_or_else(|| ConfigError::InvalidValue {
            field: format!("check-every of resource '{}'", name),
            message: format!("not a duration: {}", raw),
        })?),
        None => None,
    };

    Ok(ResourceConfig {
        name,
        type_name,
        source: parse_source(node),
        check_every,
    })
}

fn parse_job(node: &KdlNode) -> ConfigResult<JobConfig> {
    let name =
        get_first_string_arg(node).ok_or_else(|| ConfigError::MissingField("job name".to_string()))?;

    let serial = get_bool_prop(node, "serial").unwrap_or(false);
    let max_in_flight = match node.get("max-in-flight") {
        Some(value) => {
            let n = value
                .as_integer()
                .filter(|n| *n > 0 && *n <= u32::MAX as i128)
                .ok_or_else(|| ConfigError::InvalidValue {
                    field: format!("max-in-flight of job '{}'", name),
                    message: "must be a positive integer".to_string(),
                })?;
            Some(n as u32)
        }
        None => None,
    };

    let mut inputs = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "get" {
                inputs.push(parse_get(&name, child)?);
            }
        }
    }

    Ok(JobConfig {
        name,
        inputs,
        serial,
        max_in_flight,
    })
}

fn parse_get(job: &str, node: &KdlNode) -> ConfigResult<JobInput> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("get name in job '{}'", job)))?;
    let resource = get_string_prop(node, "resource").unwrap_or_else(|| name.clone());

    Ok(JobInput {
        name,
        resource,
        passed: get_string_list_prop(node, "passed"),
        trigger: get_bool_prop(node, "trigger").unwrap_or(false),
    })
}

fn parse_source(node: &KdlNode) -> Source {
    node.children()
        .and_then(|children| children.nodes().iter().find(|c| c.name().value() == "source"))
        .and_then(|source| source.children())
        .map(document_to_map)
        .unwrap_or_default()
}

fn document_to_map(doc: &KdlDocument) -> Source {
    doc.nodes()
        .iter()
        .map(|node| (node.name().value().to_string(), node_to_json(node)))
        .collect()
}

fn node_to_json(node: &KdlNode) -> serde_json::Value {
    if let Some(children) = node.children() {
        return serde_json::Value::Object(document_to_map(children));
    }

    let mut args: Vec<serde_json::Value> = node
        .entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| value_to_json(e.value()))
        .collect();

    match args.len() {
        0 => serde_json::Value::Null,
        1 => args.remove(0),
        _ => serde_json::Value::Array(args),
    }
}

fn value_to_json(value: &KdlValue) -> serde_json::Value {
    if let Some(s) = value.as_string() {
        serde_json::Value::from(s)
    } else if let Some(b) = value.as_bool() {
        serde_json::Value::from(b)
    } else if let Some(i) = value.as_integer() {
        i64::try_from(i)
            .map(serde_json::Value::from)
            .unwrap_or_else(|_| serde_json::Value::from(i.to_string()))
    } else if let Some(f) = value.as_float() {
        serde_json::Value::from(f)
    } else {
        serde_json::Value::Null
    }
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();

    // Repeated properties: passed="a" passed="b"
    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.push(s.to_string());
                }
            }
        }
    }

    if !result.is_empty() {
        return result;
    }

    // Block syntax: get "x" { passed "a" "b" }
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                return get_all_string_args(child);
            }
        }
    }

    Vec::new()
}

/// Detect cycles in the job graph formed by passed constraints, using DFS.
fn detect_cycle(jobs: &[JobConfig]) -> Result<(), String> {
    let mut visited = HashMap::new();
    let mut rec_stack = HashMap::new();

    let upstreams: HashMap<&str, Vec<&str>> = jobs
        .iter()
        .map(|job| {
            let deps = job
                .inputs
                .iter()
                .flat_map(|i| i.passed.iter().map(String::as_str))
                .collect();
            (job.name.as_str(), deps)
        })
        .collect();

    for job in jobs {
        if !visited.contains_key(job.name.as_str()) {
            if let Some(cycle) =
                dfs_detect_cycle(&job.name, &upstreams, &mut visited, &mut rec_stack)
            {
                return Err(cycle);
            }
        }
    }
    Ok(())
}

fn dfs_detect_cycle<'a>(
    node: &'a str,
    upstreams: &'a HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashMap<&'a str, bool>,
    rec_stack: &mut HashMap<&'a str, bool>,
) -> Option<String> {
    visited.insert(node, true);
    rec_stack.insert(node, true);

    if let Some(deps) = upstreams.get(node) {
        for dep in deps {
            if !visited.contains_key(dep) {
                if let Some(cycle) = dfs_detect_cycle(dep, upstreams, visited, rec_stack) {
                    return Some(cycle);
                }
            } else if rec_stack.get(dep).copied().unwrap_or(false) {
                return Some(format!("{} -> {}", node, dep));
            }
        }
    }

    rec_stack.insert(node, false);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const FAN_IN: &str = r#"
        pipeline "fan-in"

        resource "repo" type="git" check-every="30s" {
            source {
                uri "https://example.com/repo.git"
                branch "main"
                depth 1
            }
        }

        resource "lib" type="git" {
            source {
                uri "https://example.com/lib.git"
            }
        }

        job "unit" {
            get "repo" trigger=#true
        }

        job "lint" {
            get "repo" trigger=#true
        }

        job "package" serial=#true {
            get "code" resource="repo" trigger=#true passed="unit" passed="lint"
            get "lib"
        }
    "#;

    #[test]
    fn test_parse_pipeline_with_passed_constraints() {
        let pipeline = parse_pipeline(FAN_IN).unwrap();
        assert_eq!(pipeline.name, "fan-in");
        assert_eq!(pipeline.resources.0.len(), 2);
        assert_eq!(pipeline.jobs.len(), 3);

        let package = pipeline.job("package").unwrap();
        assert!(package.serial);
        assert_eq!(package.inputs[0].name, "code");
        assert_eq!(package.inputs[0].resource, "repo");
        assert_eq!(package.inputs[0].passed, vec!["unit", "lint"]);
        assert!(package.inputs[0].trigger);
        assert!(!package.inputs[1].trigger);
    }

    #[test]
    fn test_parse_resource_source_and_interval() {
        let pipeline = parse_pipeline(FAN_IN).unwrap();
        let repo = pipeline.resources.lookup("repo").unwrap();

        assert_eq!(repo.type_name, "git");
        assert_eq!(repo.check_every, Some(Duration::from_secs(30)));
        assert_eq!(repo.source["branch"], serde_json::json!("main"));
        assert_eq!(repo.source["depth"], serde_json::json!(1));
    }

    #[test]
    fn test_detect_unknown_resource() {
        let kdl = r#"
            pipeline "bad"

            job "build" {
                get "nonexistent"
            }
        "#;

        let result = parse_pipeline(kdl);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidReference(_)
        ));
    }

    #[test]
    fn test_detect_passed_job_without_resource() {
        let kdl = r#"
            pipeline "bad"

            resource "a" type="git"
            resource "b" type="git"

            job "first" {
                get "a"
            }

            job "second" {
                get "b" passed="first"
            }
        "#;

        let result = parse_pipeline(kdl);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidReference(_)
        ));
    }

    #[test]
    fn test_detect_duplicate_input() {
        let kdl = r#"
            pipeline "bad"

            resource "a" type="git"

            job "build" {
                get "a"
                get "a"
            }
        "#;

        let result = parse_pipeline(kdl);
        assert!(matches!(result.unwrap_err(), ConfigError::Duplicate(_)));
    }

    #[test]
    fn test_detect_cycle() {
        let kdl = r#"
            pipeline "cyclic"

            resource "a" type="git"

            job "x" {
                get "a" passed="y"
            }

            job "y" {
                get "a" passed="x"
            }
        "#;

        let result = parse_pipeline(kdl);
        assert!(matches!(result.unwrap_err(), ConfigError::CycleDetected(_)));
    }

    #[test]
    fn test_invalid_check_interval() {
        let kdl = r#"
            pipeline "bad"

            resource "a" type="git" check-every="soon"
        "#;

        let result = parse_pipeline(kdl);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }
}
