/// Clip each node's raw archives to the node's window and merge them into one archive per node in
/// the job's working directory.
///
/// The node window starts as the accounting window.  If the node has the job's begin (end) marker
/// archive and the marker's start (end) time is within CLIP_SLACK_SECS of the accounting start
/// (end), the marker time is adopted instead.  Local job ids can be reused, e.g. on requeue, and the
/// slack keeps markers from an earlier life of the id out while tolerating clock skew between the
/// resource manager and the collectors.
///
/// Merging is done either in-process or by an external tool invoked as
///
///   <tool> -S "@YYYY-MM-DD HH:MM:SS UTC" -T "@YYYY-MM-DD HH:MM:SS UTC" <in> ... <out>
///
/// where a nonzero exit status or any output on stderr is a failure.
///
use crate::archive::{merge_records, write_archive, Archive};
use crate::job::{Job, CLIP_SLACK_SECS};

use anyhow::{bail, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use summutils::{
    epoch_secs, epoch_secs_f64, expand_path_template, grab_string, grab_string_opt, grab_u64_opt,
    merge_tool_time, run_with_timeout, timestamp_from_epoch, ClassifiedError, Config,
    ProcessingError, Timestamp,
};
use tracing::{debug, info, warn};
use ustr::Ustr;

pub const DEFAULT_FORCE_TIMEOUT_SECS: u64 = 2 * 24 * 3600;
pub const DEFAULT_NODE_TIMEOUT_SECS: u64 = 600;

#[derive(Clone, Debug, PartialEq)]
pub enum MergeTool {
    Library,
    External(String),
}

#[derive(Clone, Debug)]
pub struct MergeSettings {
    pub resource_name: String,
    pub archive_out_dir: PathBuf,
    pub subdir_out_format: String,
    pub job_output_dir: Option<PathBuf>,
    pub tool: MergeTool,
    pub node_timeout: u64,
    pub force_timeout: u64,
}

impl MergeSettings {
    /// `summary.archive_out_dir` and `summary.subdir_out_format` from the configuration, and
    /// `job_output_dir`, `merge_tool` ("library" or a program) and `merge_timeout` from the
    /// resource.

    pub fn from_config(conf: &Config, resconf: &Map<String, Value>) -> Result<MergeSettings> {
        let Value::Object(summary) = conf.getsection("summary")? else {
            bail!("The section 'summary' must be an object")
        };
        let tool = match grab_string_opt(resconf, "merge_tool")?.as_deref() {
            None | Some("library") => MergeTool::Library,
            Some(program) => MergeTool::External(program.to_string()),
        };
        Ok(MergeSettings {
            resource_name: grab_string(resconf, "name")?,
            archive_out_dir: PathBuf::from(grab_string(&summary, "archive_out_dir")?),
            subdir_out_format: grab_string(&summary, "subdir_out_format")?,
            job_output_dir: grab_string_opt(resconf, "job_output_dir")?.map(PathBuf::from),
            tool,
            node_timeout: grab_u64_opt(resconf, "merge_timeout")?.unwrap_or(DEFAULT_NODE_TIMEOUT_SECS),
            force_timeout: DEFAULT_FORCE_TIMEOUT_SECS,
        })
    }
}

/// The job's working directory: the resource's `job_output_dir` if set, otherwise
/// `archive_out_dir/<subdir_out_format>` with %r, %j and strftime (against the job end time)
/// expanded.

pub fn job_output_dir(job: &Job, settings: &MergeSettings) -> Result<PathBuf> {
    if let Some(dir) = &settings.job_output_dir {
        return Ok(dir.clone());
    }
    let subdir = expand_path_template(
        &settings.subdir_out_format,
        &settings.resource_name,
        job.local_job_id(),
        job.end_time(),
    )?;
    Ok(settings.archive_out_dir.join(subdir))
}

/// Adopt marker archive times as node windows where they are close enough to the accounting
/// times.  Marker archives that cannot be read are marked bad.

pub fn adjust_job_start_end(job: &mut Job) -> Result<()> {
    let begin_marker = format!("job-{}-begin", job.local_job_id());
    let end_marker = format!("job-{}-end", job.local_job_id());
    let job_start = epoch_secs(job.start_time());
    let job_end = epoch_secs(job.end_time());

    let nodes = job
        .raw_archives()
        .into_iter()
        .map(|(node, paths)| (node, paths.to_vec()))
        .collect::<Vec<(Ustr, Vec<PathBuf>)>>();
    for (node, paths) in nodes {
        let mut begin = None;
        let mut end = None;
        for path in paths {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let is_begin = name.starts_with(&begin_marker);
            let is_end = name.starts_with(&end_marker);
            if !is_begin && !is_end {
                continue;
            }
            let archive = match Archive::open(&path) {
                Ok(a) => a,
                Err(e) => {
                    warn!("Marker archive {}: {e:#}", path.display());
                    job.mark_bad_raw_archive(node, &path, &format!("{e:#}"))?;
                    continue;
                }
            };
            if is_begin {
                let t = archive.start().floor() as i64;
                if (t - job_start).abs() <= CLIP_SLACK_SECS {
                    begin = Some(timestamp_from_epoch(t)?);
                } else {
                    debug!("Ignoring begin marker {} for {node}: {t} vs {job_start}", path.display());
                }
            }
            if is_end {
                let t = archive.end().ceil() as i64;
                if (t - job_end).abs() <= CLIP_SLACK_SECS {
                    end = Some(timestamp_from_epoch(t)?);
                } else {
                    debug!("Ignoring end marker {} for {node}: {t} vs {job_end}", path.display());
                }
            }
        }
        job.set_node_begin_end(node, begin, end)?;
    }
    Ok(())
}

/// Clip and merge every node's raw archives into the job directory.  Returns zero on complete
/// success and otherwise minus the number of problems: nodes whose merge failed plus declared
/// nodes that had no raw archives at all.
///
/// Using up the job's time budget, or a node's, aborts with a summarization error.

pub fn extract_and_merge_logs(job: &mut Job, settings: &MergeSettings) -> Result<i64> {
    let started = Instant::now();
    let budget = Duration::from_secs(settings.force_timeout);

    adjust_job_start_end(job)?;

    let jobdir = job_output_dir(job, settings)?;
    debug!("jobdir is {}", jobdir.display());
    if jobdir.exists() {
        if let Err(e) = fs::remove_dir_all(&jobdir) {
            warn!("Could not remove {}: {e}", jobdir.display());
        }
    }
    fs::create_dir_all(&jobdir)?;
    job.set_jobdir(jobdir.clone());

    let nodes = job
        .raw_archives()
        .into_iter()
        .map(|(node, paths)| (node, paths.to_vec()))
        .collect::<Vec<(Ustr, Vec<PathBuf>)>>();
    let nodes_seen = nodes.len() as i64;
    let mut node_error = 0i64;

    for (node, archives) in nodes {
        let elapsed = started.elapsed();
        if elapsed >= budget {
            return Err(ClassifiedError::new(
                ProcessingError::SummarizationError,
                format!("archive merge exceeded {}s", settings.force_timeout),
            )
            .into());
        }
        let out = jobdir.join(node.as_str());
        let begin = job.node_begin(node);
        let end = job.node_end(node);
        let result = match &settings.tool {
            MergeTool::Library => merge_in_process(job, node, &archives, begin, end, &out),
            MergeTool::External(program) => {
                let timeout = settings.node_timeout.min(budget.saturating_sub(elapsed).as_secs().max(1));
                merge_external(program, &archives, begin, end, &out, timeout)?
            }
        };
        match result {
            Ok(()) => job.add_node_archive(node, out)?,
            Err(msg) => {
                warn!("Merge failed for {node}: {msg}");
                job.record_error(&format!("{node}: {msg}"));
                node_error -= 1;
            }
        }
    }

    let missing = job.node_count() as i64 - nodes_seen;
    info!(
        "Merged {} of {} nodes in {:.1}s",
        job.node_archives().len(),
        job.node_count(),
        started.elapsed().as_secs_f64()
    );
    Ok(node_error - missing)
}

// The inner Result is the node's outcome; the outer one aborts the job.

fn merge_external(
    program: &str,
    archives: &[PathBuf],
    begin: Timestamp,
    end: Timestamp,
    out: &Path,
    timeout: u64,
) -> Result<Result<(), String>> {
    let mut args = vec![
        "-S".to_string(),
        merge_tool_time(begin),
        "-T".to_string(),
        merge_tool_time(end),
    ];
    args.extend(archives.iter().map(|p| p.to_string_lossy().to_string()));
    args.push(out.to_string_lossy().to_string());
    debug!("{program} {}", args.join(" "));

    let started = Instant::now();
    match run_with_timeout(program, &args, timeout) {
        Ok(_) => Ok(Ok(())),
        Err(msg) if started.elapsed() >= Duration::from_secs(timeout) => Err(ClassifiedError::new(
            ProcessingError::SummarizationError,
            format!("{program} did not finish within {timeout}s: {msg}"),
        )
        .into()),
        Err(msg) => Ok(Err(msg)),
    }
}

fn merge_in_process(
    job: &mut Job,
    node: Ustr,
    archives: &[PathBuf],
    begin: Timestamp,
    end: Timestamp,
    out: &Path,
) -> Result<(), String> {
    let (lo, hi) = (epoch_secs_f64(begin), epoch_secs_f64(end));
    let mut streams = vec![];
    let mut units = BTreeMap::new();
    for path in archives {
        match Archive::open(path) {
            Ok(a) => {
                streams.push(a.clip(lo, hi));
                for (metric, unit) in a.units {
                    units.entry(metric).or_insert(unit);
                }
            }
            Err(e) => {
                warn!("Raw archive {}: {e:#}", path.display());
                job.mark_bad_raw_archive(node, path, &format!("{e:#}"))
                    .map_err(|e| e.to_string())?;
            }
        }
    }
    let merged = merge_records(streams);
    if merged.is_empty() {
        return Err(format!("no data between {begin} and {end}"));
    }
    write_archive(out, &units, &merged).map_err(|e| format!("{e:#}"))
}

#[cfg(test)]
fn test_settings(out: &Path, tool: MergeTool) -> MergeSettings {
    MergeSettings {
        resource_name: "ub-hpc".to_string(),
        archive_out_dir: out.to_path_buf(),
        subdir_out_format: "%r/%Y-%m-%d/%j".to_string(),
        job_output_dir: None,
        tool,
        node_timeout: 60,
        force_timeout: DEFAULT_FORCE_TIMEOUT_SECS,
    }
}

#[cfg(test)]
fn copy_tree(from: &Path, to: &Path) {
    for node in ["n1", "n2"] {
        fs::create_dir_all(to.join(node)).unwrap();
        for entry in from.join(node).read_dir().unwrap() {
            let p = entry.unwrap().path();
            fs::copy(&p, to.join(node).join(p.file_name().unwrap())).unwrap();
        }
    }
}

#[test]
fn test_job_output_dir() {
    let job = crate::job::test_job("1001", &["n1"]);
    let mut settings = test_settings(Path::new("/data/jobs"), MergeTool::Library);
    assert!(job_output_dir(&job, &settings).unwrap() == PathBuf::from("/data/jobs/ub-hpc/2020-06-01/1001"));
    settings.job_output_dir = Some(PathBuf::from("/scratch/job"));
    assert!(job_output_dir(&job, &settings).unwrap() == PathBuf::from("/scratch/job"));
}

#[test]
fn test_merge_with_markers() {
    let out = tempfile::tempdir().unwrap();
    let mut job = crate::job::test_job("1001", &["n1", "n2"]);
    crate::logtree::attach_raw_archives(&mut job, Path::new("../tests/archives")).unwrap();
    let settings = test_settings(out.path(), MergeTool::Library);

    assert!(extract_and_merge_logs(&mut job, &settings).unwrap() == 0);
    let begin = summutils::timestamp_from_ymdhms(2020, 6, 1, 0, 0, 3).unwrap();
    let end = summutils::timestamp_from_ymdhms(2020, 6, 1, 0, 9, 58).unwrap();
    for node in job.node_names() {
        assert!(job.node_begin(node) == begin);
        assert!(job.node_end(node) == end);
    }
    let merged = job.node_archives();
    assert!(merged.len() == 2);
    let jobdir = out.path().join("ub-hpc/2020-06-01/1001");
    assert!(job.jobdir() == Some(jobdir.as_path()));
    assert!(merged[0].2 == jobdir.join("n1"));

    let a = Archive::open(merged[0].2).unwrap();
    assert!(a.start() == 1590969603.0);
    assert!(a.end() == 1590970198.0);
    // Marker record, then 00:01 through 00:09, then the end marker.
    assert!(a.records.len() == 11);
    assert!(a.units[&Ustr::from("network.interface.in.bytes")] == "byte");
    assert!(job.summary_id() == "1001-1590970200");
}

#[test]
fn test_marker_outside_slack_is_ignored() {
    let logs = tempfile::tempdir().unwrap();
    copy_tree(Path::new("../tests/archives"), logs.path());
    // 40s early is rejected; the end marker 29s late is adopted.
    fs::remove_file(logs.path().join("n1/job-1001-begin-20200601.00.00.03")).unwrap();
    fs::remove_file(logs.path().join("n1/job-1001-end-20200601.00.09.58")).unwrap();
    fs::write(
        logs.path().join("n1/job-1001-begin-20200531.23.59.20"),
        "1590969560,hinv.ncpu,-1,,16\n",
    )
    .unwrap();
    fs::write(
        logs.path().join("n1/job-1001-end-20200601.00.10.29"),
        "1590970229,hinv.ncpu,-1,,16\n",
    )
    .unwrap();

    let out = tempfile::tempdir().unwrap();
    let mut job = crate::job::test_job("1001", &["n1"]);
    crate::logtree::attach_raw_archives(&mut job, logs.path()).unwrap();
    let settings = test_settings(out.path(), MergeTool::Library);
    assert!(extract_and_merge_logs(&mut job, &settings).unwrap() == 0);
    let n1 = Ustr::from("n1");
    assert!(job.node_begin(n1) == job.start_time());
    assert!(epoch_secs(job.node_end(n1)) == 1590970229);
}

#[test]
fn test_merge_problems() {
    let logs = tempfile::tempdir().unwrap();
    copy_tree(Path::new("../tests/archives"), logs.path());
    fs::write(logs.path().join("n2/20200601.00.05"), "garbage\n").unwrap();

    let out = tempfile::tempdir().unwrap();
    let mut job = crate::job::test_job("1001", &["n1", "n2", "n3"]);
    crate::logtree::attach_raw_archives(&mut job, logs.path()).unwrap();
    let settings = test_settings(out.path(), MergeTool::Library);

    // n3 has no archives; the garbage archive on n2 is dropped but n2 still merges.
    assert!(extract_and_merge_logs(&mut job, &settings).unwrap() == -1);
    assert!(job.node_archives().len() == 2);
    let n2 = job.node(Ustr::from("n2")).unwrap();
    assert!(n2.bad.len() == 1);
    assert!(job.errors().contains_key("job"));
}

#[test]
fn test_external_tool_failure() {
    let out = tempfile::tempdir().unwrap();
    let mut job = crate::job::test_job("1001", &["n1", "n2"]);
    crate::logtree::attach_raw_archives(&mut job, Path::new("../tests/archives")).unwrap();

    let settings = test_settings(out.path(), MergeTool::External("false".to_string()));
    assert!(extract_and_merge_logs(&mut job, &settings).unwrap() == -2);
    assert!(job.node_archives().is_empty());
    assert!(job.errors()["job"].len() == 2);

    let settings = test_settings(out.path(), MergeTool::External("true".to_string()));
    assert!(extract_and_merge_logs(&mut job, &settings).unwrap() == 0);
    assert!(job.node_archives().len() == 2);
}

#[cfg(test)]
fn slow_tool(dir: &Path) -> MergeTool {
    use std::os::unix::fs::PermissionsExt;
    let script = dir.join("slow-merge");
    fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    MergeTool::External(script.to_string_lossy().to_string())
}

#[test]
fn test_merge_budgets() {
    let tools = tempfile::tempdir().unwrap();
    let slow = slow_tool(tools.path());
    let out = tempfile::tempdir().unwrap();

    // A node that does not finish within merge_timeout.
    let mut job = crate::job::test_job("1001", &["n1", "n2"]);
    crate::logtree::attach_raw_archives(&mut job, Path::new("../tests/archives")).unwrap();
    let mut settings = test_settings(out.path(), slow.clone());
    settings.node_timeout = 1;
    let started = Instant::now();
    let err = extract_and_merge_logs(&mut job, &settings).unwrap_err();
    assert!(summutils::classify(&err) == ProcessingError::SummarizationError);
    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(job.node_archives().is_empty());

    // The job budget bounds each node's time as well.
    let mut job = crate::job::test_job("1001", &["n1", "n2"]);
    crate::logtree::attach_raw_archives(&mut job, Path::new("../tests/archives")).unwrap();
    let mut settings = test_settings(out.path(), slow.clone());
    settings.force_timeout = 1;
    let err = extract_and_merge_logs(&mut job, &settings).unwrap_err();
    assert!(summutils::classify(&err) == ProcessingError::SummarizationError);

    // An exhausted job budget stops before any node is merged.
    let mut job = crate::job::test_job("1001", &["n1", "n2"]);
    crate::logtree::attach_raw_archives(&mut job, Path::new("../tests/archives")).unwrap();
    let mut settings = test_settings(out.path(), MergeTool::Library);
    settings.force_timeout = 0;
    let err = extract_and_merge_logs(&mut job, &settings).unwrap_err();
    assert!(summutils::classify(&err) == ProcessingError::SummarizationError);
    assert!(job.node_archives().is_empty());
}
