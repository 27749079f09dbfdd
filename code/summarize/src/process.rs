// Processing of one job from its accounting record to its stored summary.
//
// A job first passes a series of gates, in this order, each of which skips it with a flag in the
// job metadata and a classified error:
//
//   skipped_parallel_too_short  multi-node job shorter than min_parallel_duration
//   skipped_too_short           shorter than min_duration
//   skipped_invalid_nodecount   fewer than one node
//   skipped_noarchives          (pcp) no node has raw archives
//   skipped_rawarchives         (pcp) not more than 95% of the nodes have raw archives
//   skipped_job_too_big         more than max_nodes nodes
//   skipped_job_nodehours       nodes * walltime above max_nodetime
//   skipped_too_long            walltime at least max_duration
//
// A job that passes has its archives merged.  It is summarized if the merge succeeded for all but
// less than 5% of the nodes, and otherwise is flagged skipped_pmlogextract_error.  A summarized job
// for which too few nodes could be processed is flagged skipped_summarization_error.  Skipped jobs
// still get a summary document with their accounting data.

use crate::accounting::{Accounting, JobRecord};
use crate::output::Output;
use crate::plugins::{all_analytics, all_preprocessors, filter_plugins};
use crate::summarize::Summarize;

use anyhow::{bail, Result};
use pcplog::{
    attach_raw_archives, extract_and_merge_logs, node_names, ArchiveSource, Job, JobInfo,
    MergeSettings, MetricSource, PromSource,
};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use summutils::{classify, epoch_secs, grab_string, grab_string_opt, now, Config, ProcessingError};
use tracing::{error, info, warn};

// Fraction of the nodes whose archives may fail to merge before the job is not summarized.

const MISSING_NODES_LIMIT: f64 = 0.05;

// Ten days.

pub const DEFAULT_MAX_DURATION_SECS: i64 = 864000;

#[derive(Clone, Debug)]
pub struct Options {
    pub min_parallel_duration: Option<i64>,
    pub min_duration: Option<i64>,
    // 0 means no limit.
    pub max_nodes: usize,
    pub max_nodetime: Option<i64>,
    pub max_duration: i64,
    pub force_timeout: i64,
    pub tag: Option<String>,
    pub extract_only: bool,
    pub dodelete: bool,
    pub dry_run: bool,
    pub fail_fast: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            min_parallel_duration: None,
            min_duration: None,
            max_nodes: 0,
            max_nodetime: None,
            max_duration: DEFAULT_MAX_DURATION_SECS,
            force_timeout: pcplog::DEFAULT_FORCE_TIMEOUT_SECS as i64,
            tag: None,
            extract_only: false,
            dodelete: true,
            dry_run: false,
            fail_fast: false,
        }
    }
}

/// Where a resource's node data come from: merged local archives, or a remote time-series
/// service.

pub enum DataSource {
    Pcp {
        log_dir: PathBuf,
        merge: MergeSettings,
        source: ArchiveSource,
    },
    Prometheus(PromSource),
}

impl DataSource {
    /// From the resource's `datasource` ("pcp" by default, or "prometheus").

    pub fn from_config(conf: &Config, resconf: &Map<String, Value>) -> Result<DataSource> {
        let normalization = conf.normalization()?;
        match grab_string_opt(resconf, "datasource")?.as_deref() {
            None | Some("pcp") => Ok(DataSource::Pcp {
                log_dir: PathBuf::from(grab_string(resconf, "pcp_log_dir")?),
                merge: MergeSettings::from_config(conf, resconf)?,
                source: ArchiveSource::new(normalization),
            }),
            Some("prometheus") => Ok(DataSource::Prometheus(PromSource::from_config(
                resconf,
                normalization,
            )?)),
            Some(other) => bail!("Unknown datasource '{other}'"),
        }
    }

    fn source(&self) -> &dyn MetricSource {
        match self {
            DataSource::Pcp { source, .. } => source,
            DataSource::Prometheus(source) => source,
        }
    }
}

/// The result of summarizing one job.  There is no summary if the job had no nodes or only its
/// archives were wanted.

pub struct JobOutcome {
    pub summary: Option<Value>,
    pub mdata: Map<String, Value>,
    pub success: bool,
    pub error: Option<ProcessingError>,
    pub jobdir: Option<PathBuf>,
}

// has_any, has_enough
type ArchiveState = (bool, bool);

/// The first gate the job fails, as its metadata flag and error.

pub fn gate(
    info: &JobInfo,
    archives: Option<ArchiveState>,
    opts: &Options,
) -> Option<(&'static str, ProcessingError)> {
    let walltime = epoch_secs(info.end_time) - epoch_secs(info.start_time);
    let nodes = info.node_count as i64;
    if let Some(min) = opts.min_parallel_duration {
        if nodes > 1 && walltime < min {
            return Some(("skipped_parallel_too_short", ProcessingError::ParallelTooShort));
        }
    }
    if let Some(min) = opts.min_duration {
        if walltime < min {
            return Some(("skipped_too_short", ProcessingError::TimeTooShort));
        }
    }
    if nodes < 1 {
        return Some(("skipped_invalid_nodecount", ProcessingError::InvalidNodecount));
    }
    if let Some((has_any, has_enough)) = archives {
        if !has_any {
            return Some(("skipped_noarchives", ProcessingError::NoArchives));
        }
        if !has_enough {
            return Some(("skipped_rawarchives", ProcessingError::RawArchivesMissing));
        }
    }
    if opts.max_nodes > 0 && info.node_count > opts.max_nodes {
        return Some(("skipped_job_too_big", ProcessingError::JobTooBig));
    }
    if let Some(max) = opts.max_nodetime {
        if nodes * walltime > max {
            return Some(("skipped_job_nodehours", ProcessingError::JobTooManyNodehours));
        }
    }
    if walltime >= opts.max_duration {
        return Some(("skipped_too_long", ProcessingError::TimeTooLong));
    }
    None
}

pub fn summarize_job(
    record: &JobRecord,
    resconf: &Map<String, Value>,
    datasource: &DataSource,
    opts: &Options,
    cancel: &AtomicBool,
) -> Result<JobOutcome> {
    let mergestart = Instant::now();
    let info = &record.info;
    let mut mdata = Map::new();

    let mut job = if info.node_count >= 1 {
        let mut job = Job::new(info.clone())?;
        job.set_nodes(&node_names(&record.nodes));
        Some(job)
    } else {
        None
    };
    let archives = match (&mut job, datasource) {
        (Some(job), DataSource::Pcp { log_dir, .. }) => {
            attach_raw_archives(job, log_dir)?;
            Some((job.has_any_archives(), job.has_enough_raw_archives()))
        }
        _ => None,
    };

    let mut summarizeerror = None;
    let (mergeresult, missingnodes) = match gate(info, archives, opts) {
        Some((flag, kind)) => {
            info!("Skipping {}, {flag}", info.local_job_id);
            mdata.insert(flag.to_string(), json!(true));
            summarizeerror = Some(kind);
            (1, info.node_count as f64)
        }
        None => match (&mut job, datasource) {
            (Some(job), DataSource::Pcp { merge, .. }) => {
                let result = extract_and_merge_logs(job, merge)?;
                (result, -result as f64)
            }
            _ => (0, 0.0),
        },
    };
    let mergetime = mergestart.elapsed().as_secs_f64();

    let Some(job) = job else {
        return Ok(JobOutcome {
            summary: None,
            mdata,
            success: false,
            error: summarizeerror,
            jobdir: None,
        });
    };
    let jobdir = job.jobdir().map(|p| p.to_path_buf());
    if opts.extract_only {
        return Ok(JobOutcome {
            summary: None,
            mdata,
            success: mergeresult == 0,
            error: summarizeerror,
            jobdir,
        });
    }

    let (preprocs, analytics) = filter_plugins(resconf, all_preprocessors(), all_analytics(&job))?;
    let nodecount = job.node_count() as f64;
    let mut s = Summarize::new(job, preprocs, analytics, opts.fail_fast);

    let mut enough_nodes = false;
    if mergeresult == 0 || missingnodes / nodecount < MISSING_NODES_LIMIT {
        enough_nodes = true;
        info!(
            "Success for {} files in {} ({missingnodes}/{nodecount})",
            info.local_job_id,
            jobdir.as_ref().map(|d| d.display().to_string()).unwrap_or_default()
        );
        s.process(datasource.source(), cancel)?;
    } else if summarizeerror.is_none() {
        info!("Skipping {}, skipped_pmlogextract_error", info.local_job_id);
        mdata.insert("skipped_pmlogextract_error".to_string(), json!(true));
        summarizeerror = Some(ProcessingError::MergeError);
    }

    mdata.insert("mergetime".to_string(), json!(mergetime));
    if let Some(tag) = &opts.tag {
        mdata.insert("tag".to_string(), json!(tag));
    }
    if missingnodes > 0.0 {
        mdata.insert("missingnodes".to_string(), json!(missingnodes));
    }

    let success = s.good_enough();
    if !success && enough_nodes {
        info!("Skipping {}, skipped_summarization_error", info.local_job_id);
        mdata.insert("skipped_summarization_error".to_string(), json!(true));
        summarizeerror = Some(ProcessingError::SummarizationError);
    }

    // Data that has not shown up long after the job ended never will.
    let force_success = !success && epoch_secs(now()) - epoch_secs(info.end_time) > opts.force_timeout;

    Ok(JobOutcome {
        summary: Some(s.get()),
        mdata,
        success: success || force_success,
        error: summarizeerror,
        jobdir,
    })
}

/// Everything one resource's jobs are processed with.  Shared by the worker threads.

pub struct Driver<'a> {
    pub resconf: &'a Map<String, Value>,
    pub datasource: &'a DataSource,
    pub output: &'a Output,
    pub accounting: &'a Accounting,
    pub options: &'a Options,
    pub cancel: &'a AtomicBool,
}

impl<'a> Driver<'a> {
    /// Summarize, store, log and clean up after one job.  Returns whether it succeeded.  Failures
    /// are logged; with fail_fast they also cancel the remaining work.

    pub fn process_job(&self, record: &JobRecord) -> bool {
        let started = Instant::now();
        let jobid = &record.info.local_job_id;
        let (success, jobdir) = match self.store_job(record, started) {
            Ok(result) => result,
            Err(e) => {
                error!("Failure for job {jobid}: {e:#}");
                if !self.options.dry_run {
                    let kind = classify(&e);
                    if let Err(e) = self.accounting.mark_as_done(
                        record,
                        false,
                        started.elapsed().as_secs_f64(),
                        Some(kind),
                    ) {
                        warn!("Could not log job {jobid}: {e}");
                    }
                }
                if self.options.fail_fast {
                    self.cancel.store(true, Ordering::Relaxed);
                }
                (false, None)
            }
        };
        if self.options.dodelete {
            if let Some(dir) = jobdir {
                if dir.exists() {
                    if let Err(e) = fs::remove_dir_all(&dir) {
                        warn!("Could not remove {}: {e}", dir.display());
                    }
                }
            }
        }
        success
    }

    fn store_job(&self, record: &JobRecord, started: Instant) -> Result<(bool, Option<PathBuf>)> {
        let outcome = summarize_job(record, self.resconf, self.datasource, self.options, self.cancel)?;
        if let Some(summary) = outcome.summary {
            self.output.process(summary, Value::Object(outcome.mdata))?;
        }
        if !self.options.dry_run && !self.options.extract_only {
            self.accounting.mark_as_done(
                record,
                outcome.success,
                started.elapsed().as_secs_f64(),
                outcome.error,
            )?;
        }
        Ok((outcome.success, outcome.jobdir))
    }
}

#[cfg(test)]
fn test_record(nodes: &[&str]) -> JobRecord {
    JobRecord {
        info: JobInfo {
            cluster: "ub-hpc".to_string(),
            local_job_id: "1001".to_string(),
            user: "alice".to_string(),
            account: "physics".to_string(),
            start_time: summutils::timestamp_from_ymdhms(2020, 6, 1, 0, 0, 0).unwrap(),
            end_time: summutils::timestamp_from_ymdhms(2020, 6, 1, 0, 10, 0).unwrap(),
            node_count: nodes.len(),
        },
        nodes: nodes.iter().map(|n| n.to_string()).collect::<Vec<String>>(),
    }
}

#[cfg(test)]
fn test_datasource(out: &std::path::Path) -> DataSource {
    let mut normalization = std::collections::HashMap::new();
    normalization.insert("network.interface.in.bytes".to_string(), 32);
    DataSource::Pcp {
        log_dir: PathBuf::from("../tests/archives"),
        merge: MergeSettings {
            resource_name: "ub-hpc".to_string(),
            archive_out_dir: out.to_path_buf(),
            subdir_out_format: "%r/%j".to_string(),
            job_output_dir: None,
            tool: pcplog::MergeTool::Library,
            node_timeout: 60,
            force_timeout: pcplog::DEFAULT_FORCE_TIMEOUT_SECS,
        },
        source: ArchiveSource::new(normalization),
    }
}

#[test]
fn test_gates() {
    let info = test_record(&["n1", "n2"]).info;
    let opts = Options::default();
    assert!(gate(&info, Some((true, true)), &opts).is_none());
    assert!(gate(&info, None, &opts).is_none());

    let first = |opts: &Options, archives| gate(&info, archives, opts).map(|(flag, _)| flag);
    assert!(first(&opts, Some((false, false))) == Some("skipped_noarchives"));
    assert!(first(&opts, Some((true, false))) == Some("skipped_rawarchives"));

    let short = Options {
        min_parallel_duration: Some(900),
        min_duration: Some(700),
        ..Options::default()
    };
    assert!(first(&short, Some((false, false))) == Some("skipped_parallel_too_short"));
    let single = test_record(&["n1"]).info;
    assert!(gate(&single, None, &short) == Some(("skipped_too_short", ProcessingError::TimeTooShort)));

    let big = Options {
        max_nodes: 1,
        max_nodetime: Some(1000),
        ..Options::default()
    };
    assert!(first(&big, None) == Some("skipped_job_too_big"));
    let nodetime = Options {
        max_nodetime: Some(1000),
        ..Options::default()
    };
    assert!(first(&nodetime, None) == Some("skipped_job_nodehours"));
    let long = Options {
        max_duration: 600,
        ..Options::default()
    };
    assert!(gate(&info, None, &long) == Some(("skipped_too_long", ProcessingError::TimeTooLong)));

    let mut empty = info.clone();
    empty.node_count = 0;
    assert!(gate(&empty, Some((false, false)), &opts).map(|(_, e)| e) == Some(ProcessingError::InvalidNodecount));
}

#[test]
fn test_summarize_job() {
    let out = tempfile::tempdir().unwrap();
    let ds = test_datasource(out.path());
    let opts = Options {
        tag: Some("nightly".to_string()),
        ..Options::default()
    };
    let outcome = summarize_job(
        &test_record(&["n1", "n2"]),
        &Map::new(),
        &ds,
        &opts,
        &AtomicBool::new(false),
    )
    .unwrap();
    assert!(outcome.success);
    assert!(outcome.error.is_none());
    assert!(outcome.jobdir == Some(out.path().join("ub-hpc/1001")));
    assert!(outcome.mdata["tag"] == json!("nightly"));
    assert!(outcome.mdata.contains_key("mergetime"));
    assert!(!outcome.mdata.contains_key("missingnodes"));
    let summary = outcome.summary.unwrap();
    assert!(summary["summarization"]["complete"] == json!(true));
    assert!(summary["acct"]["local_job_id"] == json!("1001"));
    assert!(summary.get("load1").is_some());
}

#[test]
fn test_skipped_job_still_has_summary() {
    let out = tempfile::tempdir().unwrap();
    let ds = test_datasource(out.path());
    // n3 has no archives at all, so not enough of the nodes do.
    let outcome = summarize_job(
        &test_record(&["n1", "n2", "n3"]),
        &Map::new(),
        &ds,
        &Options::default(),
        &AtomicBool::new(false),
    )
    .unwrap();
    assert!(outcome.mdata["skipped_rawarchives"] == json!(true));
    assert!(outcome.mdata["missingnodes"] == json!(3.0));
    assert!(outcome.error == Some(ProcessingError::RawArchivesMissing));
    assert!(outcome.jobdir.is_none());
    let summary = outcome.summary.unwrap();
    assert!(summary["summarization"]["complete"] == json!(false));
    assert!(summary.get("load1").is_none());
    // The job ended long ago, so it will not get any better.
    assert!(outcome.success);

    let outcome = summarize_job(
        &test_record(&[]),
        &Map::new(),
        &ds,
        &Options::default(),
        &AtomicBool::new(false),
    )
    .unwrap();
    assert!(outcome.summary.is_none());
    assert!(outcome.error == Some(ProcessingError::InvalidNodecount));
}

#[test]
fn test_process_job() {
    use crate::accounting::ProcessLog;
    use crate::output::{DirectoryStore, DocumentStore};

    let out = tempfile::tempdir().unwrap();
    let store_dir = tempfile::tempdir().unwrap();
    let uri = store_dir.path().to_string_lossy().to_string();
    let ds = test_datasource(out.path());
    let record = test_record(&["n1", "n2"]);
    let accounting = Accounting::new(vec![record.clone()], ProcessLog::in_memory());
    let output = Output::with_store(Box::new(DirectoryStore::open(&uri, "supremm").unwrap()), 1);
    let resconf = Map::new();
    let cancel = AtomicBool::new(false);
    let opts = Options::default();
    let driver = Driver {
        resconf: &resconf,
        datasource: &ds,
        output: &output,
        accounting: &accounting,
        options: &opts,
        cancel: &cancel,
    };
    assert!(driver.process_job(&record));
    assert!(accounting.process_version(&record) == Some(crate::accounting::PROCESS_VERSION));
    // The job directory is removed afterwards.
    assert!(!out.path().join("ub-hpc/1001").exists());

    let store = DirectoryStore::open(&uri, "supremm").unwrap();
    let doc = store.get("resource_1", "1001-1590970200").unwrap().unwrap();
    assert!(doc["summarization"]["complete"] == json!(true));
    assert!(doc["summarization"].get("mergetime").is_some());
    assert!(store.get("timeseries-resource_1", "1001-1590970200").unwrap().is_some());
}
