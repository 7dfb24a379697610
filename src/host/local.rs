//! Sequential in-process execution of jobs.
//!
//! [`LocalJobRunner`] plays the framework's part for a single job: it plans
//! splits, runs one map task per split, optionally combines, partitions,
//! sorts and groups, runs one reduce task per partition and writes
//! `part-*` files of `key\tvalue` lines into the output directory.
//!
//! Roles without a configured class fall back to the native components in
//! this module (text input, identity map and reduce, hash partitioning).

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::adapters::{ComparatorProxy, InputFormatProxy, MapperProxy, PartitionerProxy, ReducerProxy};
use crate::bridge::{InterpreterHandle, Role};
use crate::host::api::{
    Configurable, InputFormat, JobContext, Mapper, Partitioner, RawComparator, RecordReader, Reducer,
    TaskContext, TaskError, TaskResult,
};
use crate::host::conf::{Configuration, INPUT_PATHS_KEY, OUTPUT_PATH_KEY, REDUCE_TASKS_KEY};
use crate::host::datum::Datum;

/// Counter group used by the engine itself
pub const ENGINE_COUNTERS: &str = "luadoop";

/// group -> name -> value
pub type Counters = BTreeMap<String, BTreeMap<String, i64>>;

fn bump(counters: &mut Counters, group: &str, name: &str, amount: i64) {
    *counters
        .entry(group.to_string())
        .or_default()
        .entry(name.to_string())
        .or_insert(0) += amount;
}

fn merge_counters(into: &mut Counters, from: &Counters) {
    for (group, names) in from {
        for (name, value) in names {
            bump(into, group, name, *value);
        }
    }
}

/// Task context that buffers output in memory
#[derive(Debug, Clone)]
pub struct MemoryContext {
    configuration: Configuration,
    task_attempt_id: String,
    output: Vec<(Datum, Datum)>,
    counters: Counters,
    status: String,
}

impl MemoryContext {
    pub fn new(configuration: Configuration) -> Self {
        Self::with_attempt_id(configuration, format!("attempt_{}", Uuid::new_v4().simple()))
    }

    pub fn with_attempt_id(configuration: Configuration, task_attempt_id: impl Into<String>) -> Self {
        Self {
            configuration,
            task_attempt_id: task_attempt_id.into(),
            output: Vec::new(),
            counters: Counters::new(),
            status: String::new(),
        }
    }

    pub fn output(&self) -> &[(Datum, Datum)] {
        &self.output
    }

    pub fn take_output(&mut self) -> Vec<(Datum, Datum)> {
        std::mem::take(&mut self.output)
    }

    pub fn counter(&self, group: &str, name: &str) -> i64 {
        self.counters
            .get(group)
            .and_then(|names| names.get(name))
            .copied()
            .unwrap_or(0)
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn status(&self) -> &str {
        &self.status
    }
}

impl TaskContext for MemoryContext {
    fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    fn task_attempt_id(&self) -> &str {
        &self.task_attempt_id
    }

    fn write(&mut self, key: Datum, value: Datum) -> TaskResult<()> {
        self.output.push((key, value));
        Ok(())
    }

    fn increment_counter(&mut self, group: &str, name: &str, amount: i64) {
        bump(&mut self.counters, group, name, amount);
    }

    fn set_status(&mut self, status: &str) {
        self.status = status.to_string();
    }
}

fn split_path(split: &Datum) -> TaskResult<PathBuf> {
    match split {
        Datum::Text(path) => Ok(PathBuf::from(path)),
        Datum::Map(map) => match map.get("path") {
            Some(Datum::Text(path)) => Ok(PathBuf::from(path)),
            _ => Err(TaskError::new(format!("Split has no path: {}", split))),
        },
        other => Err(TaskError::new(format!("Unsupported split: {}", other))),
    }
}

/// Reads a file split line by line: key is the byte offset, value the line
#[derive(Debug, Default)]
pub struct LineRecordReader {
    source: Option<BufReader<File>>,
    offset: u64,
    length: u64,
    key: Option<Datum>,
    value: Option<Datum>,
}

impl LineRecordReader {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordReader for LineRecordReader {
    fn initialize(&mut self, split: &Datum, _ctx: &mut dyn TaskContext) -> TaskResult<()> {
        let path = split_path(split)?;
        let file = File::open(&path)
            .map_err(|e| TaskError::new(format!("Cannot open {}: {}", path.display(), e)))?;
        self.length = file.metadata()?.len();
        self.source = Some(BufReader::new(file));
        self.offset = 0;
        self.key = None;
        self.value = None;
        Ok(())
    }

    fn next_key_value(&mut self) -> TaskResult<bool> {
        let source = self
            .source
            .as_mut()
            .ok_or_else(|| TaskError::new("Line reader is not initialized"))?;

        let mut line = Vec::new();
        let read = source.read_until(b'\n', &mut line)?;
        if read == 0 {
            self.key = None;
            self.value = None;
            return Ok(false);
        }

        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }

        self.key = Some(Datum::Int(self.offset as i64));
        self.value = Some(match String::from_utf8(line) {
            Ok(text) => Datum::Text(text),
            Err(e) => Datum::Bytes(e.into_bytes()),
        });
        self.offset += read as u64;
        Ok(true)
    }

    fn current_key(&mut self) -> TaskResult<Datum> {
        self.key.clone().ok_or_else(|| TaskError::new("No current record"))
    }

    fn current_value(&mut self) -> TaskResult<Datum> {
        self.value.clone().ok_or_else(|| TaskError::new("No current record"))
    }

    fn progress(&mut self) -> TaskResult<f64> {
        if self.length == 0 {
            return Ok(1.0);
        }
        Ok((self.offset as f64 / self.length as f64).min(1.0))
    }

    fn close(&mut self) -> TaskResult<()> {
        self.source = None;
        Ok(())
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.') || name.starts_with('_'))
        .unwrap_or(false)
}

fn file_split(path: &Path) -> TaskResult<Datum> {
    let length = fs::metadata(path)?.len();
    let mut split = BTreeMap::new();
    split.insert("path".to_string(), Datum::Text(path.display().to_string()));
    split.insert("length".to_string(), Datum::Int(length as i64));
    Ok(Datum::Map(split))
}

/// One split per file under `luadoop.input.paths`, read with [`LineRecordReader`]
#[derive(Debug, Default)]
pub struct TextInputFormat;

impl InputFormat for TextInputFormat {
    fn get_splits(&mut self, job: &JobContext) -> TaskResult<Vec<Datum>> {
        let raw = job.configuration.get(INPUT_PATHS_KEY).ok_or_else(|| {
            TaskError::new(format!("Missing required configuration key {}", INPUT_PATHS_KEY))
        })?;

        let mut splits = Vec::new();
        for entry in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let path = Path::new(entry);
            if path.is_dir() {
                let mut files = Vec::new();
                for dir_entry in fs::read_dir(path)? {
                    let file = dir_entry?.path();
                    if file.is_file() && !is_hidden(&file) {
                        files.push(file);
                    }
                }
                files.sort();
                for file in files {
                    splits.push(file_split(&file)?);
                }
            } else if path.is_file() {
                splits.push(file_split(path)?);
            } else {
                return Err(TaskError::new(format!("Input path does not exist: {}", entry)));
            }
        }
        Ok(splits)
    }

    fn create_record_reader(
        &mut self,
        _split: &Datum,
        _ctx: &mut dyn TaskContext,
    ) -> TaskResult<Box<dyn RecordReader>> {
        Ok(Box::new(LineRecordReader::new()))
    }
}

/// Writes every input record unchanged
#[derive(Debug, Default)]
pub struct IdentityMapper;

impl Mapper for IdentityMapper {
    fn map(&mut self, key: Datum, value: Datum, ctx: &mut dyn TaskContext) -> TaskResult<()> {
        ctx.write(key, value)
    }
}

/// Writes every value of a group under the group's key
#[derive(Debug, Default)]
pub struct IdentityReducer;

impl Reducer for IdentityReducer {
    fn reduce(
        &mut self,
        key: Datum,
        values: &mut dyn Iterator<Item = Datum>,
        ctx: &mut dyn TaskContext,
    ) -> TaskResult<()> {
        for value in values {
            ctx.write(key.clone(), value)?;
        }
        Ok(())
    }
}

/// Partitions by a 31-multiplier hash of the key's bytes
#[derive(Debug, Default)]
pub struct HashPartitioner;

impl Partitioner for HashPartitioner {
    fn get_partition(&mut self, key: &Datum, _value: &Datum, num_partitions: i32) -> TaskResult<i32> {
        if num_partitions <= 0 {
            return Err(TaskError::new("Number of partitions must be positive"));
        }
        let hash = key
            .to_bytes()
            .iter()
            .fold(0i32, |h, b| h.wrapping_mul(31).wrapping_add(i32::from(*b)));
        Ok((hash & i32::MAX) % num_partitions)
    }
}

/// Stable merge sort with a fallible comparison
fn merge_sort<T, F>(mut items: Vec<T>, compare: &mut F) -> TaskResult<Vec<T>>
where
    F: FnMut(&T, &T) -> TaskResult<Ordering>,
{
    if items.len() <= 1 {
        return Ok(items);
    }

    let right = items.split_off(items.len() / 2);
    let left = merge_sort(items, compare)?;
    let right = merge_sort(right, compare)?;

    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    loop {
        let take_left = match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => compare(l, r)? != Ordering::Greater,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let next = if take_left { left.next() } else { right.next() };
        merged.extend(next);
    }
    Ok(merged)
}

/// Order two keys: raw comparison when the comparator has one, otherwise
/// object comparison, otherwise the natural order
fn compare_keys(comparator: Option<&mut ComparatorProxy>, a: &Datum, b: &Datum) -> TaskResult<Ordering> {
    let Some(comparator) = comparator else {
        return Ok(a.total_cmp(b));
    };
    let result = if comparator.supports_raw() {
        let (left, right) = (a.to_bytes(), b.to_bytes());
        comparator.compare_raw(&left, 0, left.len(), &right, 0, right.len())?
    } else {
        comparator.compare(a, b)?
    };
    Ok(result.cmp(&0))
}

fn reduce_groups(
    sorted: Vec<(Datum, Datum)>,
    mut grouping: Option<&mut ComparatorProxy>,
    reducer: &mut dyn Reducer,
    ctx: &mut dyn TaskContext,
) -> TaskResult<usize> {
    let mut groups = 0;
    let mut records = sorted.into_iter().peekable();

    while let Some((key, first)) = records.next() {
        let mut values = vec![first];
        loop {
            let same_group = match records.peek() {
                Some((next_key, _)) => {
                    compare_keys(grouping.as_deref_mut(), &key, next_key)? == Ordering::Equal
                }
                None => false,
            };
            if !same_group {
                break;
            }
            if let Some((_, value)) = records.next() {
                values.push(value);
            }
        }
        reducer.reduce(key, &mut values.into_iter(), ctx)?;
        groups += 1;
    }
    Ok(groups)
}

fn write_part(dir: &Path, name: &str, records: &[(Datum, Datum)]) -> TaskResult<String> {
    let path = dir.join(name);
    let mut writer = BufWriter::new(File::create(&path)?);
    for (key, value) in records {
        writeln!(writer, "{}\t{}", key, value)?;
    }
    writer.flush()?;
    Ok(path.display().to_string())
}

/// Summary of a finished local job
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub map_tasks: usize,
    pub reduce_tasks: usize,
    pub output_path: String,
    pub output_files: Vec<String>,
    pub counters: Counters,
}

impl JobReport {
    pub fn counter(&self, group: &str, name: &str) -> i64 {
        self.counters
            .get(group)
            .and_then(|names| names.get(name))
            .copied()
            .unwrap_or(0)
    }
}

/// Runs jobs sequentially in the current process
#[derive(Debug, Default)]
pub struct LocalJobRunner {
    interpreter: Option<Arc<InterpreterHandle>>,
}

impl LocalJobRunner {
    /// Runner whose script components use the process-wide interpreter
    pub fn new() -> Self {
        Self::default()
    }

    /// Runner whose script components use `interpreter`
    pub fn with_interpreter(interpreter: Arc<InterpreterHandle>) -> Self {
        Self {
            interpreter: Some(interpreter),
        }
    }

    /// Run one job to completion.
    ///
    /// # Errors
    /// Fails on the first task error; partial output is left in place.
    pub fn run(&self, job: &JobContext) -> TaskResult<JobReport> {
        let started_at = Utc::now();
        let job_id = Uuid::new_v4();
        let conf = &job.configuration;

        let output_path = conf
            .get(OUTPUT_PATH_KEY)
            .ok_or_else(|| {
                TaskError::new(format!("Missing required configuration key {}", OUTPUT_PATH_KEY))
            })?
            .to_string();
        let output_dir = PathBuf::from(&output_path);
        if output_dir.exists() {
            return Err(TaskError::new(format!(
                "Output directory {} already exists",
                output_path
            )));
        }

        let reduce_tasks = match conf.get_int(REDUCE_TASKS_KEY)? {
            None => 1,
            Some(n) if n >= 0 => n as usize,
            Some(n) => {
                return Err(TaskError::new(format!(
                    "Invalid {}: {}",
                    REDUCE_TASKS_KEY, n
                )))
            }
        };

        tracing::info!(job = %job.job_name, %job_id, reduce_tasks, "starting local job");

        let mut input_format = self.input_format(conf);
        let splits = input_format.get_splits(job)?;
        fs::create_dir_all(&output_dir)?;

        let attempt_base = job_id.simple().to_string();
        let mut counters = Counters::new();
        let mut output_files = Vec::new();
        let mut partitions: Vec<Vec<(Datum, Datum)>> = vec![Vec::new(); reduce_tasks];
        let mut partitioner = if reduce_tasks > 0 {
            Some(self.partitioner(conf)?)
        } else {
            None
        };

        for (index, split) in splits.iter().enumerate() {
            let attempt = format!("attempt_{}_m_{:06}_0", attempt_base, index);
            tracing::debug!(%attempt, %split, "map task");
            let mut ctx = MemoryContext::with_attempt_id(conf.clone(), attempt);
            self.run_map_task(input_format.as_mut(), split, &mut ctx)?;

            let mut records = ctx.take_output();
            merge_counters(&mut counters, ctx.counters());
            bump(&mut counters, ENGINE_COUNTERS, "map_output_records", records.len() as i64);

            let Some(partitioner) = partitioner.as_mut() else {
                let name = format!("part-m-{:05}", index);
                output_files.push(write_part(&output_dir, &name, &records)?);
                continue;
            };

            if conf.contains_key(Role::Combiner.config_key()) {
                let mut combine_ctx = MemoryContext::with_attempt_id(conf.clone(), ctx.task_attempt_id());
                let mut combiner = self.reducer(conf, Role::Combiner);
                self.sort_and_reduce(conf, records, combiner.as_mut(), &mut combine_ctx)?;
                records = combine_ctx.take_output();
                merge_counters(&mut counters, combine_ctx.counters());
                bump(&mut counters, ENGINE_COUNTERS, "combine_output_records", records.len() as i64);
            }

            for (key, value) in records {
                let partition = partitioner.get_partition(&key, &value, reduce_tasks as i32)?;
                if partition < 0 || partition as usize >= reduce_tasks {
                    return Err(TaskError::new(format!(
                        "Illegal partition for {} ({})",
                        key, partition
                    )));
                }
                partitions[partition as usize].push((key, value));
            }
        }

        if let Some(partitioner) = partitioner.as_mut() {
            partitioner.close()?;
        }

        for (index, records) in partitions.into_iter().enumerate() {
            let attempt = format!("attempt_{}_r_{:06}_0", attempt_base, index);
            tracing::debug!(%attempt, records = records.len(), "reduce task");
            let mut ctx = MemoryContext::with_attempt_id(conf.clone(), attempt);
            let mut reducer = self.reducer(conf, Role::Reducer);
            let groups = self.sort_and_reduce(conf, records, reducer.as_mut(), &mut ctx)?;

            let records = ctx.take_output();
            merge_counters(&mut counters, ctx.counters());
            bump(&mut counters, ENGINE_COUNTERS, "reduce_input_groups", groups as i64);
            bump(&mut counters, ENGINE_COUNTERS, "reduce_output_records", records.len() as i64);
            let name = format!("part-r-{:05}", index);
            output_files.push(write_part(&output_dir, &name, &records)?);
        }

        File::create(output_dir.join("_SUCCESS"))?;

        let report = JobReport {
            job_id,
            job_name: job.job_name.clone(),
            started_at,
            finished_at: Utc::now(),
            map_tasks: splits.len(),
            reduce_tasks,
            output_path,
            output_files,
            counters,
        };
        tracing::info!(job = %report.job_name, %job_id, map_tasks = report.map_tasks, "local job finished");
        Ok(report)
    }

    fn run_map_task(
        &self,
        input_format: &mut dyn InputFormat,
        split: &Datum,
        ctx: &mut MemoryContext,
    ) -> TaskResult<()> {
        let mut reader = input_format.create_record_reader(split, ctx)?;
        reader.initialize(split, ctx)?;

        let mut mapper = self.mapper(ctx.configuration());
        let mut counting = CountingReader {
            inner: reader.as_mut(),
            records: 0,
        };
        let mapped = mapper.run(&mut counting, ctx);
        let records = counting.records;
        let closed = reader.close();

        ctx.increment_counter(ENGINE_COUNTERS, "map_input_records", records);
        mapped.and(closed)
    }

    /// Sort a task's records, group them and feed each group to `reducer`
    fn sort_and_reduce(
        &self,
        conf: &Configuration,
        records: Vec<(Datum, Datum)>,
        reducer: &mut dyn Reducer,
        ctx: &mut MemoryContext,
    ) -> TaskResult<usize> {
        let mut sort = self.comparator(conf, Role::SortComparator)?;
        let mut grouping = self.comparator(conf, Role::GroupingComparator)?;

        let sorted = merge_sort(records, &mut |a: &(Datum, Datum), b: &(Datum, Datum)| {
            compare_keys(sort.as_mut(), &a.0, &b.0)
        })?;

        reducer.setup(ctx)?;
        let group_order = if grouping.is_some() { grouping.as_mut() } else { sort.as_mut() };
        let reduced = reduce_groups(sorted, group_order, reducer, ctx);
        let cleaned = reducer.cleanup(ctx);

        for comparator in [sort.as_mut(), grouping.as_mut()].into_iter().flatten() {
            comparator.close()?;
        }
        let groups = reduced?;
        cleaned?;
        Ok(groups)
    }

    fn input_format(&self, conf: &Configuration) -> Box<dyn InputFormat> {
        if !conf.contains_key(Role::InputFormat.config_key()) {
            return Box::new(TextInputFormat);
        }
        match &self.interpreter {
            Some(interpreter) => Box::new(InputFormatProxy::with_interpreter(Arc::clone(interpreter))),
            None => Box::new(InputFormatProxy::new()),
        }
    }

    fn mapper(&self, conf: &Configuration) -> Box<dyn Mapper> {
        if !conf.contains_key(Role::Mapper.config_key()) {
            return Box::new(IdentityMapper);
        }
        match &self.interpreter {
            Some(interpreter) => Box::new(MapperProxy::with_interpreter(Arc::clone(interpreter))),
            None => Box::new(MapperProxy::new()),
        }
    }

    fn reducer(&self, conf: &Configuration, role: Role) -> Box<dyn Reducer> {
        if !conf.contains_key(role.config_key()) {
            return Box::new(IdentityReducer);
        }
        match (&self.interpreter, role) {
            (Some(interpreter), role) => Box::new(ReducerProxy::with_interpreter(role, Arc::clone(interpreter))),
            (None, Role::Combiner) => Box::new(ReducerProxy::combiner()),
            (None, _) => Box::new(ReducerProxy::reducer()),
        }
    }

    fn partitioner(&self, conf: &Configuration) -> TaskResult<Box<dyn Partitioner>> {
        if !conf.contains_key(Role::Partitioner.config_key()) {
            return Ok(Box::new(HashPartitioner));
        }
        let mut partitioner = match &self.interpreter {
            Some(interpreter) => PartitionerProxy::with_interpreter(Arc::clone(interpreter)),
            None => PartitionerProxy::new(),
        };
        partitioner.set_conf(conf)?;
        Ok(Box::new(partitioner))
    }

    fn comparator(&self, conf: &Configuration, role: Role) -> TaskResult<Option<ComparatorProxy>> {
        if !conf.contains_key(role.config_key()) {
            return Ok(None);
        }
        let mut comparator = match (&self.interpreter, role) {
            (Some(interpreter), role) => ComparatorProxy::with_interpreter(role, Arc::clone(interpreter)),
            (None, Role::GroupingComparator) => ComparatorProxy::grouping(),
            (None, _) => ComparatorProxy::sort(),
        };
        comparator.set_conf(conf)?;
        Ok(Some(comparator))
    }
}

struct CountingReader<'a> {
    inner: &'a mut dyn RecordReader,
    records: i64,
}

impl RecordReader for CountingReader<'_> {
    fn initialize(&mut self, split: &Datum, ctx: &mut dyn TaskContext) -> TaskResult<()> {
        self.inner.initialize(split, ctx)
    }

    fn next_key_value(&mut self) -> TaskResult<bool> {
        let more = self.inner.next_key_value()?;
        if more {
            self.records += 1;
        }
        Ok(more)
    }

    fn current_key(&mut self) -> TaskResult<Datum> {
        self.inner.current_key()
    }

    fn current_value(&mut self) -> TaskResult<Datum> {
        self.inner.current_value()
    }

    fn progress(&mut self) -> TaskResult<f64> {
        self.inner.progress()
    }

    fn close(&mut self) -> TaskResult<()> {
        self.inner.close()
    }
}
