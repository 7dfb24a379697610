//! Job definitions declared by a setup script through `luadoop.job`, and
//! the `luadoop.sequence` / `luadoop.parallel` tree that groups them.

use serde::{Deserialize, Serialize};

use crate::bridge::BridgeError;
use crate::host::conf::Configuration;
use crate::host::datum::Datum;

/// One declared job: its name, configuration and raw input paths
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub configuration: Configuration,
    pub input_paths: Vec<String>,
}

impl JobDefinition {
    /// Parse the value returned by `luadoop.jobs()`.
    ///
    /// # Arguments
    /// * `datum` - A list of `{ name, configuration = {{k, v}, ...}, input_paths }` maps
    ///
    /// # Errors
    /// Returns `BridgeError::Configuration` when the value has another shape
    pub fn list_from_datum(datum: &Datum) -> Result<Vec<Self>, BridgeError> {
        match datum {
            Datum::Null => Ok(Vec::new()),
            Datum::List(items) => items.iter().map(Self::from_datum).collect(),
            other => Err(BridgeError::configuration(format!(
                "Expected a list of jobs, got {}",
                other
            ))),
        }
    }

    pub fn from_datum(datum: &Datum) -> Result<Self, BridgeError> {
        let fields = datum.as_map().ok_or_else(|| {
            BridgeError::configuration(format!("Invalid job definition: {}", datum))
        })?;

        let name = fields
            .get("name")
            .and_then(Datum::as_text)
            .ok_or_else(|| BridgeError::configuration("Job definition has no name"))?
            .to_string();

        let mut configuration = Configuration::new();
        for pair in list_field(fields.get("configuration")) {
            match pair.as_list() {
                Some([Datum::Text(key), value]) => configuration.set(key.clone(), scalar_text(value)),
                _ => {
                    return Err(BridgeError::configuration(format!(
                        "Invalid configuration entry in job '{}': {}",
                        name, pair
                    )))
                }
            }
        }

        let input_paths = list_field(fields.get("input_paths"))
            .iter()
            .map(scalar_text)
            .collect();

        Ok(Self {
            name,
            configuration,
            input_paths,
        })
    }
}

/// How declared jobs are grouped. `Job` leaves index into the job list.
///
/// A sequence runs its items in order and stops at the first failure. A
/// parallel group runs every item at once and fails if any item fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPlan {
    Job(usize),
    Sequence(Vec<JobPlan>),
    Parallel(Vec<JobPlan>),
}

impl JobPlan {
    /// Every job one after the other
    pub fn sequential(job_count: usize) -> Self {
        JobPlan::Sequence((0..job_count).map(JobPlan::Job).collect())
    }

    /// Parse the value returned by `luadoop.plan()`.
    ///
    /// # Arguments
    /// * `datum` - A `{ kind, items }` group whose items are groups or `{ job = n }` leaves
    /// * `job_count` - Number of declared jobs; leaves are 1-based and must be in range
    ///
    /// # Errors
    /// Returns `BridgeError::Configuration` for an unknown group kind or job index
    pub fn from_datum(datum: &Datum, job_count: usize) -> Result<Self, BridgeError> {
        let fields = datum
            .as_map()
            .ok_or_else(|| BridgeError::configuration(format!("Invalid job group: {}", datum)))?;

        if let Some(index) = fields.get("job") {
            return match index.as_int() {
                Some(n) if n >= 1 && n as usize <= job_count => Ok(JobPlan::Job(n as usize - 1)),
                _ => Err(BridgeError::configuration(format!(
                    "Job group refers to unknown job {}",
                    index
                ))),
            };
        }

        let items = list_field(fields.get("items"))
            .iter()
            .map(|item| Self::from_datum(item, job_count))
            .collect::<Result<Vec<_>, _>>()?;
        match fields.get("kind").and_then(Datum::as_text) {
            Some("sequence") => Ok(JobPlan::Sequence(items)),
            Some("parallel") => Ok(JobPlan::Parallel(items)),
            _ => Err(BridgeError::configuration(format!("Invalid job group: {}", datum))),
        }
    }

    /// Job indices in the order they appear in the tree
    pub fn job_indices(&self) -> Vec<usize> {
        let mut out = Vec::new();
        self.collect_indices(&mut out);
        out
    }

    fn collect_indices(&self, out: &mut Vec<usize>) {
        match self {
            JobPlan::Job(index) => out.push(*index),
            JobPlan::Sequence(items) | JobPlan::Parallel(items) => {
                for item in items {
                    item.collect_indices(out);
                }
            }
        }
    }
}

/// Declared jobs together with their grouping, as printed by a dry run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSet {
    pub jobs: Vec<JobDefinition>,
    pub plan: JobPlan,
}

fn list_field(value: Option<&Datum>) -> &[Datum] {
    value.and_then(Datum::as_list).unwrap_or(&[])
}

fn scalar_text(value: &Datum) -> String {
    match value {
        Datum::Text(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn job_datum(name: &str, conf: Vec<(&str, &str)>, paths: Vec<&str>) -> Datum {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), Datum::text(name));
        fields.insert(
            "configuration".to_string(),
            Datum::List(
                conf.into_iter()
                    .map(|(k, v)| Datum::List(vec![Datum::text(k), Datum::text(v)]))
                    .collect(),
            ),
        );
        fields.insert(
            "input_paths".to_string(),
            Datum::List(paths.into_iter().map(Datum::text).collect()),
        );
        Datum::Map(fields)
    }

    #[test]
    fn test_parses_jobs_in_order() {
        let raw = Datum::List(vec![
            job_datum("first", vec![("b", "1"), ("a", "2")], vec!["in"]),
            job_datum("second", vec![], vec![]),
        ]);
        let jobs = JobDefinition::list_from_datum(&raw).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].name, "first");
        let keys: Vec<&str> = jobs[0].configuration.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(jobs[0].input_paths, vec!["in".to_string()]);
        assert!(jobs[1].configuration.is_empty());
    }

    #[test]
    fn test_rejects_malformed_entries() {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), Datum::text("bad"));
        fields.insert(
            "configuration".to_string(),
            Datum::List(vec![Datum::text("not a pair")]),
        );
        let err = JobDefinition::from_datum(&Datum::Map(fields)).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.message().contains("bad"));

        assert!(JobDefinition::list_from_datum(&Datum::Int(3)).is_err());
        assert!(JobDefinition::list_from_datum(&Datum::Null).unwrap().is_empty());
    }

    fn group(kind: &str, items: Vec<Datum>) -> Datum {
        let mut fields = BTreeMap::new();
        fields.insert("kind".to_string(), Datum::text(kind));
        fields.insert("items".to_string(), Datum::List(items));
        Datum::Map(fields)
    }

    fn leaf(n: i64) -> Datum {
        let mut fields = BTreeMap::new();
        fields.insert("job".to_string(), Datum::Int(n));
        Datum::Map(fields)
    }

    #[test]
    fn test_parses_nested_job_groups() {
        let raw = group(
            "sequence",
            vec![leaf(1), group("parallel", vec![leaf(2), leaf(3)]), leaf(4)],
        );
        let plan = JobPlan::from_datum(&raw, 4).unwrap();
        assert_eq!(
            plan,
            JobPlan::Sequence(vec![
                JobPlan::Job(0),
                JobPlan::Parallel(vec![JobPlan::Job(1), JobPlan::Job(2)]),
                JobPlan::Job(3),
            ])
        );
        assert_eq!(plan.job_indices(), vec![0, 1, 2, 3]);
        assert_eq!(JobPlan::sequential(2), JobPlan::Sequence(vec![JobPlan::Job(0), JobPlan::Job(1)]));
    }

    #[test]
    fn test_rejects_unknown_groups_and_jobs() {
        let err = JobPlan::from_datum(&group("sequence", vec![leaf(3)]), 2).unwrap_err();
        assert!(err.message().contains("unknown job 3"));
        assert!(JobPlan::from_datum(&group("sequence", vec![leaf(0)]), 2).is_err());
        assert!(JobPlan::from_datum(&group("shuffle", vec![]), 2).is_err());
        assert!(JobPlan::from_datum(&Datum::Int(1), 2).is_err());
    }
}
