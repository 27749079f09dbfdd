/// Job accounting records and the log of which jobs have been processed.
///
/// The records are a json array of objects:
///
///   { "cluster": "ub-hpc", "local_job_id": "1001", "user": "alice", "account": "physics",
///     "start_time": "2020-06-01T00:00:00Z", "end_time": 1590970200,
///     "nodes": ["n1", "n2"], "node_count": 2 }
///
/// Times are RFC 3339 strings or integer seconds since the epoch; `node_count` defaults to the
/// length of `nodes`.
///
/// The process log is a headerless csv file, one line per processing attempt:
///
///   cluster,local_job_id,end_time,process_version,process_timestamp,process_time
///
/// where `process_version` is PROCESS_VERSION on success, its negation on failure, and
/// -1000 - code when the job failed with a classified error.  The last line for a job wins.
///
use anyhow::{bail, Context, Result};
use pcplog::JobInfo;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use summutils::{
    epoch_secs, grab_string, grab_string_opt, grab_strings_opt, grab_u64_opt, now, parse_timestamp,
    timestamp_from_epoch, ProcessingError, Timestamp,
};
use tracing::debug;

pub const PROCESS_VERSION: i64 = 1;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AccountingError {
    #[error("No accounting records for cluster '{0}'")]
    UnknownCluster(String),
}

#[derive(Clone, Debug)]
pub struct JobRecord {
    pub info: JobInfo,
    pub nodes: Vec<String>,
}

impl JobRecord {
    fn key(&self) -> (String, String, i64) {
        (
            self.info.cluster.clone(),
            self.info.local_job_id.clone(),
            epoch_secs(self.info.end_time),
        )
    }
}

/// Which jobs a query returns, by their state in the process log.

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Selection {
    pub notdone: bool,
    pub bad: bool,
    pub old: bool,
    pub current: bool,
}

impl Selection {
    pub fn all() -> Selection {
        Selection {
            notdone: true,
            bad: true,
            old: true,
            current: true,
        }
    }

    // Everything that still needs work.

    pub fn unprocessed() -> Selection {
        Selection {
            current: false,
            ..Selection::all()
        }
    }

    pub fn is_all(&self) -> bool {
        *self == Selection::all()
    }

    fn admits(&self, version: Option<i64>) -> bool {
        match version {
            None => self.notdone,
            Some(v) if v < 0 => self.bad,
            Some(v) if v < PROCESS_VERSION => self.old,
            Some(_) => self.current,
        }
    }
}

pub struct Accounting {
    records: Vec<JobRecord>,
    clusters: BTreeSet<String>,
    log: ProcessLog,
}

impl Accounting {
    pub fn load(records: &Path, process_log: &Path) -> Result<Accounting> {
        let text = fs::read_to_string(records)
            .with_context(|| format!("Reading accounting records {}", records.display()))?;
        let records = parse_records(&serde_json::from_str(&text)?)
            .with_context(|| format!("In {}", records.display()))?;
        Ok(Accounting::new(records, ProcessLog::open(process_log)?))
    }

    pub fn new(records: Vec<JobRecord>, log: ProcessLog) -> Accounting {
        let clusters = records
            .iter()
            .map(|r| r.info.cluster.clone())
            .collect::<BTreeSet<String>>();
        Accounting {
            records,
            clusters,
            log,
        }
    }

    fn for_cluster<'a>(&'a self, cluster: &'a str) -> Result<impl Iterator<Item = &'a JobRecord>> {
        if !self.clusters.contains(cluster) {
            return Err(AccountingError::UnknownCluster(cluster.to_string()).into());
        }
        Ok(self.records.iter().filter(move |r| r.info.cluster == cluster))
    }

    pub fn get_by_local_job_id(&self, cluster: &str, local_job_id: &str) -> Result<Vec<JobRecord>> {
        Ok(self
            .for_cluster(cluster)?
            .filter(|r| r.info.local_job_id == local_job_id)
            .cloned()
            .collect::<Vec<JobRecord>>())
    }

    /// Jobs that ended in [start, end].

    pub fn get_by_time_range(
        &self,
        cluster: &str,
        start: Timestamp,
        end: Timestamp,
        selection: Selection,
    ) -> Result<Vec<JobRecord>> {
        Ok(self
            .for_cluster(cluster)?
            .filter(|r| r.info.end_time >= start && r.info.end_time <= end)
            .filter(|r| self.log.admits(r, selection))
            .cloned()
            .collect::<Vec<JobRecord>>())
    }

    pub fn get(&self, cluster: &str, selection: Selection) -> Result<Vec<JobRecord>> {
        Ok(self
            .for_cluster(cluster)?
            .filter(|r| self.log.admits(r, selection))
            .cloned()
            .collect::<Vec<JobRecord>>())
    }

    pub fn mark_as_done(
        &self,
        record: &JobRecord,
        success: bool,
        elapsed: f64,
        error: Option<ProcessingError>,
    ) -> Result<()> {
        let version = match error {
            Some(e) => -1000 - e.code() as i64,
            None if success => PROCESS_VERSION,
            None => -PROCESS_VERSION,
        };
        self.log.append(record, version, elapsed)
    }

    pub fn process_version(&self, record: &JobRecord) -> Option<i64> {
        self.log.version(record)
    }
}

pub struct ProcessLog {
    path: Option<PathBuf>,
    versions: Mutex<HashMap<(String, String, i64), i64>>,
}

type LogRow = (String, String, i64, i64, i64, f64);

impl ProcessLog {
    pub fn open(path: &Path) -> Result<ProcessLog> {
        let mut versions = HashMap::new();
        if path.exists() {
            let mut rdr = csv::ReaderBuilder::new()
                .has_headers(false)
                .trim(csv::Trim::All)
                .from_path(path)
                .with_context(|| format!("Opening process log {}", path.display()))?;
            for row in rdr.deserialize::<LogRow>() {
                let (cluster, jobid, end, version, _, _) =
                    row.with_context(|| format!("Reading process log {}", path.display()))?;
                versions.insert((cluster, jobid, end), version);
            }
            debug!("{} jobs in process log {}", versions.len(), path.display());
        }
        Ok(ProcessLog {
            path: Some(path.to_path_buf()),
            versions: Mutex::new(versions),
        })
    }

    // Nothing is persisted.

    pub fn in_memory() -> ProcessLog {
        ProcessLog {
            path: None,
            versions: Mutex::new(HashMap::new()),
        }
    }

    fn version(&self, record: &JobRecord) -> Option<i64> {
        match self.versions.lock() {
            Ok(v) => v.get(&record.key()).copied(),
            Err(_) => None,
        }
    }

    fn admits(&self, record: &JobRecord, selection: Selection) -> bool {
        selection.admits(self.version(record))
    }

    fn append(&self, record: &JobRecord, version: i64, elapsed: f64) -> Result<()> {
        let Ok(mut versions) = self.versions.lock() else {
            bail!("Process log lock poisoned")
        };
        let key = record.key();
        if let Some(path) = &self.path {
            let f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Opening process log {}", path.display()))?;
            let mut wtr = csv::WriterBuilder::new().has_headers(false).from_writer(f);
            let row: LogRow = (
                key.0.clone(),
                key.1.clone(),
                key.2,
                version,
                epoch_secs(now()),
                elapsed,
            );
            wtr.serialize(row)?;
            wtr.flush()?;
        }
        versions.insert(key, version);
        Ok(())
    }
}

fn grab_time(fields: &serde_json::Map<String, Value>, name: &str) -> Result<Timestamp> {
    match fields.get(name) {
        Some(Value::String(s)) => parse_timestamp(s),
        Some(Value::Number(_)) => match grab_u64_opt(fields, name)? {
            Some(secs) => timestamp_from_epoch(secs as i64),
            None => bail!("Field '{name}' must be a nonnegative integer"),
        },
        _ => bail!("Field '{name}' is required and must be a time"),
    }
}

pub fn parse_records(v: &Value) -> Result<Vec<JobRecord>> {
    let Value::Array(items) = v else {
        bail!("Accounting records must be an array")
    };
    let mut records = vec![];
    for (i, item) in items.iter().enumerate() {
        let Value::Object(fields) = item else {
            bail!("Accounting record {i} must be an object")
        };
        let local_job_id = match fields.get("local_job_id") {
            Some(Value::Number(n)) => n.to_string(),
            _ => grab_string(fields, "local_job_id")?,
        };
        let nodes = grab_strings_opt(fields, "nodes")?;
        let node_count = match grab_u64_opt(fields, "node_count")? {
            Some(n) => n as usize,
            None => nodes.len(),
        };
        records.push(JobRecord {
            info: JobInfo {
                cluster: grab_string(fields, "cluster")?,
                local_job_id,
                user: grab_string_opt(fields, "user")?.unwrap_or_default(),
                account: grab_string_opt(fields, "account")?.unwrap_or_default(),
                start_time: grab_time(fields, "start_time")?,
                end_time: grab_time(fields, "end_time")?,
                node_count,
            },
            nodes,
        });
    }
    Ok(records)
}

#[cfg(test)]
fn test_records() -> Vec<JobRecord> {
    parse_records(&serde_json::json!([
        { "cluster": "ub-hpc", "local_job_id": "1001", "user": "alice", "account": "physics",
          "start_time": "2020-06-01T00:00:00Z", "end_time": "2020-06-01T00:10:00Z",
          "nodes": ["n1", "n2"] },
        { "cluster": "ub-hpc", "local_job_id": 1002, "user": "bob",
          "start_time": 1590973200, "end_time": 1590976800, "nodes": ["n3"], "node_count": 1 },
        { "cluster": "other", "local_job_id": "1001",
          "start_time": 1590969600, "end_time": 1590970200, "nodes": [] },
    ]))
    .unwrap()
}

#[test]
fn test_parse_records() {
    let recs = test_records();
    assert!(recs.len() == 3);
    assert!(recs[0].info.node_count == 2);
    assert!(epoch_secs(recs[0].info.end_time) == 1590970200);
    assert!(recs[1].info.local_job_id == "1002");
    assert!(recs[1].info.account == "");
    assert!(recs[2].info.node_count == 0);

    assert!(parse_records(&serde_json::json!({})).is_err());
    assert!(parse_records(&serde_json::json!([{ "cluster": "x", "local_job_id": "1" }])).is_err());
}

#[test]
fn test_queries() {
    let acct = Accounting::new(test_records(), ProcessLog::in_memory());
    let one = acct.get_by_local_job_id("ub-hpc", "1001").unwrap();
    assert!(one.len() == 1 && one[0].nodes == vec!["n1", "n2"]);

    let start = summutils::timestamp_from_ymdhms(2020, 6, 1, 0, 0, 0).unwrap();
    let end = summutils::timestamp_from_ymdhms(2020, 6, 1, 0, 30, 0).unwrap();
    let ranged = acct.get_by_time_range("ub-hpc", start, end, Selection::all()).unwrap();
    assert!(ranged.len() == 1 && ranged[0].info.local_job_id == "1001");

    let err = acct.get("nosuch", Selection::all()).unwrap_err();
    assert!(
        err.downcast_ref::<AccountingError>()
            == Some(&AccountingError::UnknownCluster("nosuch".to_string()))
    );
}

#[test]
fn test_mark_as_done() {
    let dir = tempfile::tempdir().unwrap();
    let logpath = dir.path().join("processed.csv");
    let recs = test_records();
    {
        let acct = Accounting::new(recs.clone(), ProcessLog::open(&logpath).unwrap());
        assert!(acct.get("ub-hpc", Selection::unprocessed()).unwrap().len() == 2);
        acct.mark_as_done(&recs[0], true, 1.5, None).unwrap();
        acct.mark_as_done(&recs[1], false, 0.5, Some(ProcessingError::NoArchives)).unwrap();
        assert!(acct.process_version(&recs[1]) == Some(-1015));
    }

    // The log survives a restart.
    let acct = Accounting::new(recs.clone(), ProcessLog::open(&logpath).unwrap());
    assert!(acct.process_version(&recs[0]) == Some(PROCESS_VERSION));
    let todo = acct.get("ub-hpc", Selection::unprocessed()).unwrap();
    assert!(todo.len() == 1 && todo[0].info.local_job_id == "1002");
    let bad_only = Selection {
        bad: true,
        ..Selection::default()
    };
    assert!(acct.get("ub-hpc", bad_only).unwrap().len() == 1);
    assert!(acct.get("ub-hpc", Selection::all()).unwrap().len() == 2);

    // A later success replaces the failure.
    acct.mark_as_done(&recs[1], true, 2.0, None).unwrap();
    let acct = Accounting::new(recs, ProcessLog::open(&logpath).unwrap());
    assert!(acct.get("ub-hpc", Selection::unprocessed()).unwrap().is_empty());
}
