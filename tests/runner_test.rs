//! End-to-end runs of setup scripts through the runner and the local engine.

use std::fs;
use std::path::{Path, PathBuf};

use luadoop::bridge::InterpreterHandle;
use luadoop::host::conf::{INPUT_PATHS_KEY, REDUCE_TASKS_KEY};
use luadoop::host::local::{JobReport, ENGINE_COUNTERS};
use luadoop::{Configuration, JobPlan, JobRunner, RunnerError};
use tempfile::TempDir;

const WORD_COUNT_CLASSES: &str = r#"
WordCount = {}

WordCount.Mapper = luadoop.class()
function WordCount.Mapper:map(offset, line, ctx)
  for word in string.gmatch(line, '%a+') do
    ctx:write(string.lower(word), 1)
  end
end

WordCount.Reducer = luadoop.class()
function WordCount.Reducer:reduce(word, counts, ctx)
  local total = 0
  for n in counts do total = total + n end
  ctx:write(word, total)
end
"#;

const WORD_COUNT_JOB: &str = r#"
luadoop.run(function(input, output)
  luadoop.job('word_count', function(job)
    job:input(input)
    job:output(output)
    job:mapper('WordCount.Mapper')
    job:reducer('WordCount.Reducer')
    job:combiner('WordCount.Reducer')
  end)
end)
"#;

fn word_count_script() -> String {
    format!("{}{}", WORD_COUNT_CLASSES, WORD_COUNT_JOB)
}

fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path
}

fn arg(path: &Path) -> String {
    path.display().to_string()
}

/// All `key\tvalue` lines of a job's part files, sorted
fn output_lines(dir: &Path) -> Vec<String> {
    let mut lines = Vec::new();
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        let is_part = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("part-"))
            .unwrap_or(false);
        if is_part {
            lines.extend(fs::read_to_string(&path).unwrap().lines().map(str::to_string));
        }
    }
    lines.sort();
    lines
}

#[test]
fn test_word_count_end_to_end() {
    let dir = TempDir::new().unwrap();
    let script = write(dir.path(), "word_count.lua", &word_count_script());
    let input = write(dir.path(), "input.txt", "The cat\nthe hat\n");
    let output = dir.path().join("out");

    let runner = JobRunner::new(&script, vec![arg(&input), arg(&output)])
        .with_interpreter(InterpreterHandle::isolated().unwrap());
    let reports = runner.run_jobs().unwrap();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].job_name, "word_count");
    assert_eq!(reports[0].counter(ENGINE_COUNTERS, "map_input_records"), 2);
    assert_eq!(output_lines(&output), vec!["cat\t1", "hat\t1", "the\t2"]);
    assert!(output.join("_SUCCESS").exists());
}

#[test]
fn test_reduce_task_override_spreads_output() {
    let dir = TempDir::new().unwrap();
    let script = write(dir.path(), "word_count.lua", &word_count_script());
    let input = write(dir.path(), "input.txt", "one two three four five six\none two\n");
    let output = dir.path().join("out");

    let mut overrides = Configuration::new();
    overrides.apply_override(&format!("{}=2", REDUCE_TASKS_KEY)).unwrap();
    let runner = JobRunner::new(&script, vec![arg(&input), arg(&output)])
        .with_overrides(overrides)
        .with_interpreter(InterpreterHandle::isolated().unwrap());
    let reports = runner.run_jobs().unwrap();

    assert_eq!(reports[0].reduce_tasks, 2);
    assert!(output.join("part-r-00000").exists());
    assert!(output.join("part-r-00001").exists());
    assert_eq!(
        output_lines(&output),
        vec!["five\t1", "four\t1", "one\t2", "six\t1", "three\t1", "two\t2"]
    );
}

#[test]
fn test_dry_run_definitions_serialize() {
    let dir = TempDir::new().unwrap();
    let script = write(dir.path(), "word_count.lua", &word_count_script());

    let runner = JobRunner::new(&script, vec!["in.txt".into(), "out".into()]);
    let jobs = runner.load_jobs().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].configuration.get("luadoop.combiner"), Some("WordCount.Reducer"));
    assert_eq!(jobs[0].configuration.get(INPUT_PATHS_KEY), Some("in.txt"));

    let yaml = serde_yaml::to_string(&jobs).unwrap();
    assert!(yaml.contains("name: word_count"));
    assert!(yaml.contains("luadoop.mapper: WordCount.Mapper"));
}

#[test]
fn test_chained_jobs_with_intermediate_output() {
    let dir = TempDir::new().unwrap();
    let script = write(
        dir.path(),
        "chain.lua",
        &format!(
            "{}\n{}",
            WORD_COUNT_CLASSES,
            r#"
ByCount = luadoop.class()
function ByCount:map(offset, line, ctx)
  local word, n = string.match(line, '^(%S+)\t(%d+)$')
  ctx:write(tonumber(n), word)
end

luadoop.run(function(input, base, output)
  local stage
  luadoop.job('count', function(job)
    job:input(input)
    stage = job:output(base, { intermediate = true })
    job:mapper('WordCount.Mapper')
    job:reducer('WordCount.Reducer')
  end)
  luadoop.job('by_count', function(job)
    job:input(stage)
    job:output(output)
    job:mapper('ByCount')
  end)
end)
"#
        ),
    );
    let input = write(dir.path(), "input.txt", "b a b\nc b a\n");
    let output = dir.path().join("final");

    let runner = JobRunner::new(&script, vec![arg(&input), arg(&dir.path().join("stage")), arg(&output)])
        .with_interpreter(InterpreterHandle::isolated().unwrap());
    let reports = runner.run_jobs().unwrap();

    assert_eq!(reports.len(), 2);
    assert!(reports[0].output_path.starts_with(&arg(&dir.path().join("stage-"))));
    assert_eq!(output_lines(&output), vec!["1\tc", "2\ta", "3\tb"]);
}

#[test]
fn test_custom_input_format_through_the_dsl() {
    let dir = TempDir::new().unwrap();
    let script = write(
        dir.path(),
        "fixed.lua",
        r#"
Fixed = luadoop.class()
function Fixed.set_input_paths(klass, job, paths) job:set('fixed.words', paths) end
function Fixed:splits(job)
  local out = {}
  for word in string.gmatch(job:get('fixed.words'), '[^,]+') do out[#out + 1] = word end
  return out
end
function Fixed:create_record_reader(split, ctx) return Fixed.Reader:new() end

Fixed.Reader = luadoop.class()
function Fixed.Reader:initialize(split, ctx) self.word = split; self.done = false end
function Fixed.Reader:next_key_value()
  if self.done then return false end
  self.done = true
  return true
end
function Fixed.Reader:current_key() return self.word end
function Fixed.Reader:current_value() return #self.word end
function Fixed.Reader:progress() return self.done and 1.0 or 0.0 end
function Fixed.Reader:close() end

luadoop.run(function(output)
  luadoop.job('lengths', function(job)
    job:input({ 'apple', 'fig' }, { format = 'Fixed' })
    job:output(output)
  end)
end)
"#,
    );
    let output = dir.path().join("lengths");

    let runner = JobRunner::new(&script, vec![arg(&output)])
        .with_interpreter(InterpreterHandle::isolated().unwrap());
    let jobs = runner.load_jobs().unwrap();
    assert_eq!(jobs[0].configuration.get("fixed.words"), Some("apple,fig"));
    assert_eq!(jobs[0].configuration.get(INPUT_PATHS_KEY), None);

    let reports = runner.run_jobs().unwrap();
    assert_eq!(reports[0].map_tasks, 2);
    assert_eq!(output_lines(&output), vec!["apple\t5", "fig\t3"]);
}

#[test]
fn test_failing_job_exits_with_one() {
    let dir = TempDir::new().unwrap();
    let script = write(
        dir.path(),
        "explode.lua",
        r#"
Explode = luadoop.class()
function Explode:map(offset, line, ctx) error('boom on ' .. line) end

luadoop.run(function(input, output)
  luadoop.job('explode', function(job)
    job:input(input)
    job:output(output)
    job:mapper('Explode')
  end)
end)
"#,
    );
    let input = write(dir.path(), "input.txt", "first\n");

    let inspected = JobRunner::new(&script, vec![arg(&input), arg(&dir.path().join("a"))])
        .with_interpreter(InterpreterHandle::isolated().unwrap());
    match inspected.run_jobs().unwrap_err() {
        RunnerError::JobFailed { job, source } => {
            assert_eq!(job, "explode");
            assert!(source.message().contains("boom on first"));
            assert!(source.bridge_error().unwrap().is_invocation());
        }
        other => panic!("expected a job failure, got {}", other),
    }

    let runner = JobRunner::new(&script, vec![arg(&input), arg(&dir.path().join("b"))])
        .with_interpreter(InterpreterHandle::isolated().unwrap());
    assert_eq!(runner.run(), 1);
}

#[test]
fn test_broken_setup_script_is_a_configuration_error() {
    let dir = TempDir::new().unwrap();
    let script = write(dir.path(), "broken.lua", "luadoop.run(function( end");

    let err = JobRunner::new(&script, vec![]).load_jobs().unwrap_err();
    assert!(matches!(err, RunnerError::Configuration(_)));
    assert!(err.to_string().contains("Could not load job setup script"));
}

/// Map-only copy jobs named by `groups`, each writing to `<base>/<name>`
fn grouped_script(groups: &str) -> String {
    format!(
        r#"
Explode = luadoop.class()
function Explode:map(offset, line, ctx) error('boom on ' .. line) end

luadoop.run(function(input, base)
  local function copy(name, mapper)
    luadoop.job(name, function(job)
      job:input(input)
      job:output(base .. '/' .. name)
      job:reduce_tasks(0)
      if mapper then job:mapper(mapper) end
    end)
  end
{}
end)
"#,
        groups
    )
}

fn run_grouped(dir: &Path, groups: &str) -> (PathBuf, Result<Vec<JobReport>, RunnerError>) {
    let script = write(dir, "groups.lua", &grouped_script(groups));
    let input = write(dir, "input.txt", "only line\n");
    let base = dir.join("out");
    let runner = JobRunner::new(&script, vec![arg(&input), arg(&base)])
        .with_interpreter(InterpreterHandle::isolated().unwrap());
    (base, runner.run_jobs())
}

#[test]
fn test_sequence_stops_at_first_failed_job() {
    let dir = TempDir::new().unwrap();
    let (base, result) = run_grouped(
        dir.path(),
        r#"
  luadoop.sequence(function()
    copy('first')
    copy('broken', 'Explode')
    copy('never')
  end)
"#,
    );

    match result.unwrap_err() {
        RunnerError::JobFailed { job, source } => {
            assert_eq!(job, "broken");
            assert!(source.message().contains("boom on only line"));
        }
        other => panic!("expected a job failure, got {}", other),
    }
    assert!(base.join("first").join("_SUCCESS").exists());
    assert!(!base.join("broken").join("_SUCCESS").exists());
    assert!(!base.join("never").exists());
}

#[test]
fn test_parallel_group_runs_every_job_and_fails_if_any_fails() {
    let dir = TempDir::new().unwrap();
    let (base, result) = run_grouped(
        dir.path(),
        r#"
  luadoop.parallel(function()
    copy('left')
    copy('broken', 'Explode')
    copy('right')
  end)
"#,
    );

    match result.unwrap_err() {
        RunnerError::JobFailed { job, .. } => assert_eq!(job, "broken"),
        other => panic!("expected a job failure, got {}", other),
    }
    assert!(base.join("left").join("_SUCCESS").exists());
    assert!(base.join("right").join("_SUCCESS").exists());
    assert_eq!(output_lines(&base.join("left")), vec!["0\tonly line"]);
}

#[test]
fn test_parallel_group_then_job_in_declaration_order() {
    let dir = TempDir::new().unwrap();
    let groups = r#"
  luadoop.parallel(function()
    copy('a')
    copy('b')
    copy('c')
  end)
  copy('after')
"#;
    let script = write(dir.path(), "plan.lua", &grouped_script(groups));
    let job_set = JobRunner::new(&script, vec!["in.txt".into(), "out".into()])
        .load_job_set()
        .unwrap();
    assert_eq!(
        job_set.plan,
        JobPlan::Sequence(vec![
            JobPlan::Parallel(vec![JobPlan::Job(0), JobPlan::Job(1), JobPlan::Job(2)]),
            JobPlan::Job(3),
        ])
    );
    let yaml = serde_yaml::to_string(&job_set).unwrap();
    assert!(yaml.contains("parallel"));

    let (base, result) = run_grouped(dir.path(), groups);
    let reports = result.unwrap();
    let names: Vec<&str> = reports.iter().map(|r| r.job_name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c", "after"]);
    for name in ["a", "b", "c", "after"] {
        assert!(base.join(name).join("_SUCCESS").exists());
    }
}

#[test]
fn test_scripts_without_groups_run_as_one_sequence() {
    let dir = TempDir::new().unwrap();
    let script = write(dir.path(), "word_count.lua", &word_count_script());
    let job_set = JobRunner::new(&script, vec!["in.txt".into(), "out".into()])
        .load_job_set()
        .unwrap();
    assert_eq!(job_set.plan, JobPlan::sequential(1));
}
