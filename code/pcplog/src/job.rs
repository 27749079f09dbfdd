/// The job being summarized: its accounting identity, its nodes and their archives, the per-node
/// time window the data are clipped to, and the errors collected along the way.
///
/// Nodes are kept in the order they were given; the first is the head node.  A node's index is its
/// position in that order and is what the timeseries output uses to refer to it.
///
use anyhow::{bail, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use summutils::{epoch_secs, ClassifiedError, ProcessingError, Timestamp};
use ustr::Ustr;

// How far a node's clipped window may extend beyond the accounting window.

pub const CLIP_SLACK_SECS: i64 = 30;

/// Accounting data for a job, as delivered by the resource manager.

#[derive(Clone, Debug)]
pub struct JobInfo {
    pub cluster: String,
    pub local_job_id: String,
    pub user: String,
    pub account: String,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub node_count: usize,
}

#[derive(Clone, Debug)]
pub struct JobNode {
    pub name: Ustr,
    pub index: usize,
    pub raw_archives: Vec<PathBuf>,
    pub merged_archive: Option<PathBuf>,
    pub begin: Option<Timestamp>,
    pub end: Option<Timestamp>,
    pub bad: Vec<(PathBuf, String)>,
}

impl JobNode {
    fn new(name: Ustr, index: usize) -> JobNode {
        JobNode {
            name,
            index,
            raw_archives: vec![],
            merged_archive: None,
            begin: None,
            end: None,
            bad: vec![],
        }
    }
}

#[derive(Debug)]
pub struct Job {
    info: JobInfo,
    nodes: Vec<JobNode>,
    errors: BTreeMap<String, BTreeSet<String>>,
    jobdir: Option<PathBuf>,
    data: BTreeMap<String, Value>,
}

impl Job {
    pub fn new(info: JobInfo) -> Result<Job> {
        if info.start_time > info.end_time {
            bail!(
                "Job {} ends ({}) before it starts ({})",
                info.local_job_id,
                info.end_time,
                info.start_time
            );
        }
        if info.node_count < 1 {
            return Err(ClassifiedError::new(
                ProcessingError::InvalidNodecount,
                format!("job {} has node count {}", info.local_job_id, info.node_count),
            )
            .into());
        }
        Ok(Job {
            info,
            nodes: vec![],
            errors: BTreeMap::new(),
            jobdir: None,
            data: BTreeMap::new(),
        })
    }

    pub fn info(&self) -> &JobInfo {
        &self.info
    }

    pub fn local_job_id(&self) -> &str {
        &self.info.local_job_id
    }

    pub fn start_time(&self) -> Timestamp {
        self.info.start_time
    }

    pub fn end_time(&self) -> Timestamp {
        self.info.end_time
    }

    pub fn node_count(&self) -> usize {
        self.info.node_count
    }

    // Seconds.

    pub fn walltime(&self) -> i64 {
        epoch_secs(self.info.end_time) - epoch_secs(self.info.start_time)
    }

    /// The key a summary of this job is stored under.

    pub fn summary_id(&self) -> String {
        format!("{}-{}", self.info.local_job_id, epoch_secs(self.info.end_time))
    }

    /// Replaces the node set.  The first node is the head node.

    pub fn set_nodes(&mut self, names: &[Ustr]) {
        self.nodes = names
            .iter()
            .enumerate()
            .map(|(index, name)| JobNode::new(*name, index))
            .collect::<Vec<JobNode>>();
    }

    pub fn nodes(&self) -> &[JobNode] {
        &self.nodes
    }

    pub fn node_names(&self) -> Vec<Ustr> {
        self.nodes.iter().map(|n| n.name).collect::<Vec<Ustr>>()
    }

    pub fn node(&self, name: Ustr) -> Option<&JobNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    fn node_mut(&mut self, name: Ustr) -> Result<&mut JobNode> {
        match self.nodes.iter_mut().find(|n| n.name == name) {
            Some(n) => Ok(n),
            None => bail!("Node {name} is not part of job {}", self.info.local_job_id),
        }
    }

    pub fn set_raw_archives(&mut self, node: Ustr, archives: Vec<PathBuf>) -> Result<()> {
        self.node_mut(node)?.raw_archives = archives;
        Ok(())
    }

    /// `None` leaves that end of the node's window at its current value, which defaults to the
    /// accounting window.  Times more than CLIP_SLACK_SECS outside the accounting window are
    /// rejected.

    pub fn set_node_begin_end(
        &mut self,
        node: Ustr,
        begin: Option<Timestamp>,
        end: Option<Timestamp>,
    ) -> Result<()> {
        let (start, stop) = (epoch_secs(self.info.start_time), epoch_secs(self.info.end_time));
        if let Some(b) = begin {
            if epoch_secs(b) < start - CLIP_SLACK_SECS {
                bail!("Begin time {b} for {node} is too far before the job start");
            }
        }
        if let Some(e) = end {
            if epoch_secs(e) > stop + CLIP_SLACK_SECS {
                bail!("End time {e} for {node} is too far after the job end");
            }
        }
        let n = self.node_mut(node)?;
        if begin.is_some() {
            n.begin = begin;
        }
        if end.is_some() {
            n.end = end;
        }
        Ok(())
    }

    pub fn node_begin(&self, node: Ustr) -> Timestamp {
        self.node(node)
            .and_then(|n| n.begin)
            .unwrap_or(self.info.start_time)
    }

    pub fn node_end(&self, node: Ustr) -> Timestamp {
        self.node(node)
            .and_then(|n| n.end)
            .unwrap_or(self.info.end_time)
    }

    pub fn add_node_archive(&mut self, node: Ustr, path: PathBuf) -> Result<()> {
        self.node_mut(node)?.merged_archive = Some(path);
        Ok(())
    }

    /// Record why the archive is unusable and drop it from the node's raw archives.

    pub fn mark_bad_raw_archive(&mut self, node: Ustr, path: &Path, reason: &str) -> Result<()> {
        let n = self.node_mut(node)?;
        n.raw_archives.retain(|p| p != path);
        n.bad.push((path.to_path_buf(), reason.to_string()));
        self.record_error(reason);
        Ok(())
    }

    /// Nodes with at least one raw archive, in node order.

    pub fn raw_archives(&self) -> Vec<(Ustr, &[PathBuf])> {
        self.nodes
            .iter()
            .filter(|n| !n.raw_archives.is_empty())
            .map(|n| (n.name, n.raw_archives.as_slice()))
            .collect::<Vec<(Ustr, &[PathBuf])>>()
    }

    /// Nodes with a merged archive, in node order: name, index, path.

    pub fn node_archives(&self) -> Vec<(Ustr, usize, &Path)> {
        self.nodes
            .iter()
            .filter_map(|n| n.merged_archive.as_deref().map(|p| (n.name, n.index, p)))
            .collect::<Vec<(Ustr, usize, &Path)>>()
    }

    pub fn has_any_archives(&self) -> bool {
        self.nodes.iter().any(|n| !n.raw_archives.is_empty())
    }

    // Strictly more than 95% of the declared nodes.

    pub fn has_enough_raw_archives(&self) -> bool {
        let with_archives = self.nodes.iter().filter(|n| !n.raw_archives.is_empty()).count();
        with_archives as f64 / self.info.node_count as f64 > 0.95
    }

    pub fn set_jobdir(&mut self, path: PathBuf) {
        self.jobdir = Some(path)
    }

    pub fn jobdir(&self) -> Option<&Path> {
        self.jobdir.as_deref()
    }

    pub fn record_error(&mut self, msg: &str) {
        self.add_error("job", msg);
    }

    pub fn add_error(&mut self, category: &str, msg: &str) {
        self.errors
            .entry(category.to_string())
            .or_default()
            .insert(msg.to_string());
    }

    pub fn errors(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.errors
    }

    pub fn add_data(&mut self, name: &str, data: Value) {
        self.data.insert(name.to_string(), data);
    }

    pub fn get_data(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    pub fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }
}

#[cfg(test)]
pub fn test_job(id: &str, nodes: &[&str]) -> Job {
    let mut job = Job::new(JobInfo {
        cluster: "ub-hpc".to_string(),
        local_job_id: id.to_string(),
        user: "alice".to_string(),
        account: "physics".to_string(),
        start_time: summutils::timestamp_from_ymdhms(2020, 6, 1, 0, 0, 0).unwrap(),
        end_time: summutils::timestamp_from_ymdhms(2020, 6, 1, 0, 10, 0).unwrap(),
        node_count: nodes.len(),
    })
    .unwrap();
    job.set_nodes(&nodes.iter().map(|n| Ustr::from(*n)).collect::<Vec<Ustr>>());
    job
}

#[test]
fn test_job_validation() {
    let mut info = test_job("1", &["n1"]).info().clone();
    info.node_count = 0;
    let err = Job::new(info.clone()).unwrap_err();
    assert!(summutils::classify(&err) == ProcessingError::InvalidNodecount);
    info.node_count = 1;
    info.end_time = info.start_time - chrono::Duration::seconds(1);
    assert!(Job::new(info).is_err());
}

#[test]
fn test_summary_id() {
    let job = test_job("1001", &["n1", "n2"]);
    assert!(job.summary_id() == "1001-1590970200");
    assert!(job.walltime() == 600);
}

#[test]
fn test_node_windows() {
    let mut job = test_job("1001", &["n1", "n2"]);
    let n1 = Ustr::from("n1");
    let n2 = Ustr::from("n2");
    let b = summutils::timestamp_from_ymdhms(2020, 6, 1, 0, 0, 3).unwrap();
    job.set_node_begin_end(n1, Some(b), None).unwrap();
    assert!(job.node_begin(n1) == b);
    assert!(job.node_end(n1) == job.end_time());
    assert!(job.node_begin(n2) == job.start_time());

    let too_early = summutils::timestamp_from_ymdhms(2020, 5, 31, 23, 59, 20).unwrap();
    assert!(job.set_node_begin_end(n2, Some(too_early), None).is_err());
    assert!(job.set_node_begin_end(Ustr::from("n9"), None, None).is_err());
}

#[test]
fn test_archives() {
    let mut job = test_job("7", &["n1", "n2", "n3"]);
    let n1 = Ustr::from("n1");
    let n3 = Ustr::from("n3");
    assert!(!job.has_any_archives());
    job.set_raw_archives(n1, vec![PathBuf::from("/a/n1/x"), PathBuf::from("/a/n1/y")]).unwrap();
    job.set_raw_archives(n3, vec![PathBuf::from("/a/n3/x")]).unwrap();
    assert!(job.has_any_archives());
    assert!(!job.has_enough_raw_archives());
    assert!(job.raw_archives().len() == 2);
    assert!(job.raw_archives()[1].0 == n3);

    job.mark_bad_raw_archive(n1, Path::new("/a/n1/x"), "truncated").unwrap();
    assert!(job.raw_archives()[0].1 == [PathBuf::from("/a/n1/y")]);
    assert!(job.node(n1).unwrap().bad.len() == 1);
    assert!(job.errors()["job"].contains("truncated"));

    job.add_node_archive(n3, PathBuf::from("/jobs/7/n3")).unwrap();
    let merged = job.node_archives();
    assert!(merged.len() == 1);
    assert!(merged[0].0 == n3 && merged[0].1 == 2);
}
