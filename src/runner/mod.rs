//! Driver side: load a job setup script and run the jobs it declares.
//!
//! The setup script is evaluated once in a non-embedded driver interpreter,
//! where `luadoop.run` calls its function with the job arguments. The
//! declared jobs then run through the local engine as grouped by
//! `luadoop.sequence` and `luadoop.parallel` (one sequence by default).
//! Tasks load the same script in embedded interpreters.

mod definition;

pub use definition::{JobDefinition, JobPlan, JobSet};

use std::error::Error;
use std::fmt;
use std::fs;
use std::panic;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use crate::adapters::InputFormatProxy;
use crate::bridge::{BridgeError, InterpreterHandle, InterpreterOptions, JOB_SETUP_SCRIPT_KEY};
use crate::host::api::{JobContext, TaskError};
use crate::host::conf::Configuration;
use crate::host::local::{JobReport, LocalJobRunner};

/// Failure of a runner invocation
#[derive(Debug)]
pub enum RunnerError {
    /// The setup script or the job configuration is unusable
    Configuration(BridgeError),
    /// A declared job failed while running
    JobFailed { job: String, source: TaskError },
}

impl RunnerError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> i32 {
        1
    }
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerError::Configuration(err) => write!(f, "{}", err),
            RunnerError::JobFailed { job, source } => write!(f, "Job '{}' failed: {}", job, source),
        }
    }
}

impl Error for RunnerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RunnerError::Configuration(err) => Some(err),
            RunnerError::JobFailed { source, .. } => Some(source),
        }
    }
}

impl From<BridgeError> for RunnerError {
    fn from(err: BridgeError) -> Self {
        RunnerError::Configuration(err)
    }
}

/// Runs the jobs of one setup script.
///
/// Configuration precedence, lowest first: `base` (e.g. a YAML file), the
/// script's own `job:set` calls, then `overrides` (e.g. `-D key=value`).
///
/// # Example
/// ```ignore
/// use luadoop::runner::JobRunner;
///
/// let runner = JobRunner::new("word_count.lua", vec!["in".into(), "out".into()]);
/// std::process::exit(runner.run());
/// ```
pub struct JobRunner {
    setup_script: PathBuf,
    arguments: Vec<String>,
    base: Configuration,
    overrides: Configuration,
    interpreter: Option<Arc<InterpreterHandle>>,
}

impl JobRunner {
    pub fn new(setup_script: impl Into<PathBuf>, arguments: Vec<String>) -> Self {
        Self {
            setup_script: setup_script.into(),
            arguments,
            base: Configuration::new(),
            overrides: Configuration::new(),
            interpreter: None,
        }
    }

    pub fn with_base_configuration(mut self, base: Configuration) -> Self {
        self.base = base;
        self
    }

    pub fn with_overrides(mut self, overrides: Configuration) -> Self {
        self.overrides = overrides;
        self
    }

    /// Run tasks in `interpreter` instead of the process-wide one
    pub fn with_interpreter(mut self, interpreter: Arc<InterpreterHandle>) -> Self {
        self.interpreter = Some(interpreter);
        self
    }

    pub fn setup_script(&self) -> &Path {
        &self.setup_script
    }

    /// Evaluate the setup script and collect the jobs it declares.
    ///
    /// Each returned configuration carries the script path under
    /// `luadoop.job_setup_script` and its input paths as registered by the
    /// configured input format.
    pub fn load_jobs(&self) -> Result<Vec<JobDefinition>, RunnerError> {
        Ok(self.load_job_set()?.jobs)
    }

    /// Like [`load_jobs`](Self::load_jobs), plus the sequence and parallel
    /// grouping of the jobs
    pub fn load_job_set(&self) -> Result<JobSet, RunnerError> {
        let script = fs::canonicalize(&self.setup_script).map_err(|e| {
            BridgeError::configuration(format!(
                "Could not load job setup script ({}): {}",
                self.setup_script.display(),
                e
            ))
        })?;

        let driver = Arc::new(InterpreterHandle::with_options(InterpreterOptions {
            embedded: false,
            ..InterpreterOptions::default()
        })?);
        driver.set_arguments(&self.arguments)?;
        driver.load_setup_script_once(&script)?;

        let declared = driver.evaluate_datum("return luadoop.jobs()")?;
        let mut jobs = JobDefinition::list_from_datum(&declared)?;
        if jobs.is_empty() {
            tracing::warn!(script = %script.display(), "setup script declared no jobs");
        }
        let plan = JobPlan::from_datum(&driver.evaluate_datum("return luadoop.plan()")?, jobs.len())?;

        let input_format = InputFormatProxy::with_interpreter(Arc::clone(&driver));
        for job in &mut jobs {
            let mut conf = self.base.clone();
            conf.set(JOB_SETUP_SCRIPT_KEY, script.display().to_string());
            conf.merge(&job.configuration);
            conf.merge(&self.overrides);

            if !job.input_paths.is_empty() {
                input_format.set_input_paths(&mut conf, &job.input_paths.join(","))?;
            }
            job.configuration = conf;
            tracing::debug!(job = %job.name, keys = job.configuration.len(), "loaded job definition");
        }

        Ok(JobSet { jobs, plan })
    }

    /// Run the declared jobs as grouped by the script. Reports follow
    /// declaration order.
    ///
    /// # Errors
    /// A sequence stops at its first failed job. A parallel group waits for
    /// all of its jobs, then reports the first failure in declaration order.
    pub fn run_jobs(&self) -> Result<Vec<JobReport>, RunnerError> {
        let JobSet { jobs, plan } = self.load_job_set()?;
        let engine = match &self.interpreter {
            Some(interpreter) => LocalJobRunner::with_interpreter(Arc::clone(interpreter)),
            None => LocalJobRunner::new(),
        };
        run_plan(&engine, &jobs, &plan)
    }

    /// Run all jobs and return the process exit code
    pub fn run(&self) -> i32 {
        match self.run_jobs() {
            Ok(_) => 0,
            Err(err) => {
                tracing::error!(error = %err, "job run failed");
                err.exit_code()
            }
        }
    }
}

fn run_plan(engine: &LocalJobRunner, jobs: &[JobDefinition], plan: &JobPlan) -> Result<Vec<JobReport>, RunnerError> {
    match plan {
        JobPlan::Job(index) => {
            let job = jobs.get(*index).ok_or_else(|| {
                BridgeError::configuration(format!("Job group refers to unknown job {}", index + 1))
            })?;
            tracing::info!(job = %job.name, "running job");
            let context = JobContext::new(job.name.clone(), job.configuration.clone());
            let report = engine.run(&context).map_err(|source| RunnerError::JobFailed {
                job: job.name.clone(),
                source,
            })?;
            Ok(vec![report])
        }
        JobPlan::Sequence(items) => {
            let mut reports = Vec::new();
            for item in items {
                reports.extend(run_plan(engine, jobs, item)?);
            }
            Ok(reports)
        }
        JobPlan::Parallel(items) => {
            let outcomes: Vec<Result<Vec<JobReport>, RunnerError>> = thread::scope(|scope| {
                let running: Vec<_> = items
                    .iter()
                    .map(|item| scope.spawn(move || run_plan(engine, jobs, item)))
                    .collect();
                running
                    .into_iter()
                    .map(|handle| handle.join().unwrap_or_else(|payload| panic::resume_unwind(payload)))
                    .collect()
            });

            let mut reports = Vec::new();
            let mut failure = None;
            for outcome in outcomes {
                match outcome {
                    Ok(finished) => reports.extend(finished),
                    Err(err) if failure.is_none() => failure = Some(err),
                    Err(err) => tracing::error!(error = %err, "parallel job failed"),
                }
            }
            match failure {
                Some(err) => Err(err),
                None => Ok(reports),
            }
        }
    }
}
