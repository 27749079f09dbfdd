/// Drive the preprocessors and analytics over every node of a job and assemble the summary
/// document.
///
/// Nodes are processed one at a time, in job order.  For each node a single stream is opened for
/// the union of the metrics the preprocessors and analytics want, wrapping counters among them are
/// widened, and each sample goes first through the preprocessors and then to the analytics of mode
/// All and Timeseries.  FirstLast analytics are shown the first and last samples that survived the
/// preprocessors.  An analytic that lacks a required metric on a node is not shown that node, and
/// an analytic that was never shown anything is left out of the summary.
///
/// A node counts as processed when its stream was read to the end and yielded at least one sample.
/// A node that fails is recorded under "node" and skipped; an analytic that fails on a sample is
/// recorded under its own name and is still shown the samples that follow.
///
use crate::plugins::{Analytic, Mode, NodeMeta, PreprocAction, Preprocessor};

use anyhow::{bail, Result};
use pcplog::{Job, MetricDesc, MetricSource, MetricStream, NodeSpec, RangeChange, Sample};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use summutils::{epoch_secs, epoch_secs_f64, now, ClassifiedError, ProcessingError};
use tracing::{debug, info, warn};
use ustr::Ustr;

pub const VERSION: &str = "1.0.6";
pub const TIMESERIES_VERSION: u32 = 4;

// Fraction of the nodes that must be processed for the summary to be usable.

const GOOD_ENOUGH: f64 = 0.95;

struct Slot {
    analytic: Box<dyn Analytic>,
    touched: bool,
}

// Where an analytic's metrics are among the node's fetched metrics.

struct Binding {
    indices: Vec<usize>,
    desc: Vec<MetricDesc>,
    stopped: bool,
}

type ErrorMap = BTreeMap<String, BTreeSet<String>>;

pub struct Summarize {
    job: Job,
    preprocs: Vec<Box<dyn Preprocessor>>,
    analytics: Vec<Slot>,
    errors: ErrorMap,
    nodes_processed: usize,
    fail_fast: bool,
    started: Instant,
}

impl Summarize {
    pub fn new(
        job: Job,
        preprocs: Vec<Box<dyn Preprocessor>>,
        analytics: Vec<Box<dyn Analytic>>,
        fail_fast: bool,
    ) -> Summarize {
        Summarize {
            job,
            preprocs,
            analytics: analytics
                .into_iter()
                .map(|analytic| Slot {
                    analytic,
                    touched: false,
                })
                .collect::<Vec<Slot>>(),
            errors: BTreeMap::new(),
            nodes_processed: 0,
            fail_fast,
            started: Instant::now(),
        }
    }

    pub fn into_job(self) -> Job {
        self.job
    }

    pub fn nodes_processed(&self) -> usize {
        self.nodes_processed
    }

    pub fn add_error(&mut self, category: &str, msg: &str) {
        self.errors
            .entry(category.to_string())
            .or_default()
            .insert(msg.to_string());
    }

    /// Every declared node was processed.

    pub fn complete(&self) -> bool {
        self.nodes_processed == self.job.node_count()
    }

    pub fn good_enough(&self) -> bool {
        self.nodes_processed as f64 >= GOOD_ENOUGH * self.job.node_count() as f64
    }

    /// Run every node through the preprocessors and analytics.  Fails only if cancelled, or on the
    /// first failing node when failing fast.

    pub fn process(&mut self, source: &dyn MetricSource, cancel: &AtomicBool) -> Result<()> {
        let metrics = self.fetch_list();
        debug!("Fetching {} metrics per node", metrics.len());
        for spec in self.node_specs(source) {
            if cancel.load(Ordering::Relaxed) {
                bail!("Summarization of job {} cancelled", self.job.local_job_id());
            }
            match self.process_node(source, &spec, &metrics) {
                Ok(()) => self.nodes_processed += 1,
                Err(e) => {
                    warn!("Job {} node {}: {e}", self.job.local_job_id(), spec.name);
                    self.add_error("node", &format!("{}: {e}", spec.name));
                    if self.fail_fast {
                        return Err(e);
                    }
                }
            }
        }
        info!(
            "Job {}: processed {} of {} nodes",
            self.job.local_job_id(),
            self.nodes_processed,
            self.job.node_count()
        );
        Ok(())
    }

    // Preprocessor metrics first, then analytic metrics, without duplicates.

    fn fetch_list(&self) -> Vec<Ustr> {
        let mut wanted = vec![];
        for p in &self.preprocs {
            wanted.extend(p.required_metrics());
        }
        for s in &self.analytics {
            wanted.extend(s.analytic.required_metrics());
            wanted.extend(s.analytic.optional_metrics());
        }
        let mut metrics = vec![];
        for m in wanted {
            if !metrics.contains(&m) {
                metrics.push(m);
            }
        }
        metrics
    }

    // A source that reads merged archives is only asked about nodes that have one.

    fn node_specs(&self, source: &dyn MetricSource) -> Vec<NodeSpec> {
        self.job
            .nodes()
            .iter()
            .filter(|n| !source.needs_archive() || n.merged_archive.is_some())
            .map(|n| NodeSpec {
                name: n.name,
                index: n.index,
                jobid: self.job.local_job_id().to_string(),
                archive: n.merged_archive.clone(),
                begin: self.job.node_begin(n.name),
                end: self.job.node_end(n.name),
            })
            .collect::<Vec<NodeSpec>>()
    }

    fn process_node(&mut self, source: &dyn MetricSource, spec: &NodeSpec, metrics: &[Ustr]) -> Result<()> {
        let node = NodeMeta {
            name: spec.name,
            index: spec.index,
        };
        let mut stream = source.open(spec, metrics)?;
        let desc = stream.descriptions().to_vec();
        if desc.len() != metrics.len() {
            bail!("Source described {} metrics, {} were requested", desc.len(), metrics.len());
        }

        let mut rc = RangeChange::new(
            desc.iter()
                .filter_map(|d| d.fixup_bits.map(|bits| (d.name.to_string(), bits)))
                .collect::<HashMap<String, u32>>(),
        );
        rc.set_fetched_metrics(metrics);
        let mut bindings = self
            .analytics
            .iter()
            .map(|s| bind(s.analytic.as_ref(), metrics, &desc))
            .collect::<Vec<Option<Binding>>>();

        for p in self.preprocs.iter_mut() {
            p.host_start(&node);
        }
        let outcome = self.run_samples(&node, stream.as_mut(), &mut rc, &desc, &mut bindings);
        stream.close();
        for p in self.preprocs.iter_mut() {
            if let Some(v) = p.host_end() {
                store_node_data(&mut self.job, p.name(), node.name, v);
            }
        }
        let (first, last, count) = outcome?;
        let Some(first) = first else {
            return Err(ClassifiedError::new(
                ProcessingError::InsufficientData,
                format!("no samples between {} and {}", spec.begin, spec.end),
            )
            .into());
        };
        debug!("{}: {count} samples", node.name);

        for (slot, binding) in self.analytics.iter_mut().zip(bindings.iter_mut()) {
            if slot.analytic.mode() != Mode::FirstLast {
                continue;
            }
            let Some(binding) = binding else {
                continue;
            };
            if deliver(slot, binding, &node, &first, &mut self.errors) {
                if let Some(last) = &last {
                    deliver(slot, binding, &node, last, &mut self.errors);
                }
            }
        }
        Ok(())
    }

    // Returns the first and last samples that survived the preprocessors, and how many did.

    fn run_samples(
        &mut self,
        node: &NodeMeta,
        stream: &mut dyn MetricStream,
        rc: &mut RangeChange,
        desc: &[MetricDesc],
        bindings: &mut [Option<Binding>],
    ) -> Result<(Option<Sample>, Option<Sample>, usize)> {
        let mut first = None;
        let mut last = None;
        let mut count = 0;
        while let Some(mut sample) = stream.next()? {
            rc.normalise_data(&mut sample.values)?;
            if !self.preprocess(&mut sample, desc)? {
                continue;
            }
            count += 1;
            for (slot, binding) in self.analytics.iter_mut().zip(bindings.iter_mut()) {
                if slot.analytic.mode() == Mode::FirstLast {
                    continue;
                }
                if let Some(binding) = binding {
                    if !binding.stopped {
                        deliver(slot, binding, node, &sample, &mut self.errors);
                    }
                }
            }
            if first.is_none() {
                first = Some(sample);
            } else {
                last = Some(sample);
            }
        }
        Ok((first, last, count))
    }

    // False if the sample was dropped.

    fn preprocess(&mut self, sample: &mut Sample, desc: &[MetricDesc]) -> Result<bool> {
        for p in self.preprocs.iter_mut() {
            match p.process(sample.timestamp, &sample.values, desc) {
                PreprocAction::Keep => {}
                PreprocAction::Drop => return Ok(false),
                PreprocAction::Emit(values) => {
                    if values.len() != sample.values.len() {
                        bail!(
                            "Preprocessor {} emitted {} metrics, expected {}",
                            p.name(),
                            values.len(),
                            sample.values.len()
                        );
                    }
                    sample.values = values;
                }
            }
        }
        Ok(true)
    }

    /// The summary document.

    pub fn get(&self) -> Value {
        let mut output = Map::new();
        let mut timeseries = Map::new();

        let mut errors = self.errors.clone();
        for (category, msgs) in self.job.errors() {
            errors
                .entry(category.clone())
                .or_default()
                .extend(msgs.iter().cloned());
        }

        for slot in self.analytics.iter().filter(|s| s.touched) {
            let result = slot.analytic.results(&self.job);
            match slot.analytic.mode() {
                Mode::Timeseries => timeseries.insert(slot.analytic.name().to_string(), result),
                Mode::All | Mode::FirstLast => output.insert(slot.analytic.name().to_string(), result),
            };
        }

        let created = now();
        output.insert(
            "summarization".to_string(),
            json!({
                "version": VERSION,
                "timeseries_version": TIMESERIES_VERSION,
                "elapsed": self.started.elapsed().as_secs_f64(),
                "created": epoch_secs_f64(created),
                "srcdir": self.job.jobdir().map(|p| p.to_string_lossy().to_string()),
                "complete": self.complete(),
                "good_enough": self.good_enough(),
            }),
        );
        output.insert("created".to_string(), json!(created.to_rfc3339()));
        output.insert("acct".to_string(), self.acct());

        if !timeseries.is_empty() {
            let hosts = self
                .job
                .nodes()
                .iter()
                .map(|n| (n.index.to_string(), Value::String(n.name.to_string())))
                .collect::<Map<String, Value>>();
            timeseries.insert("hosts".to_string(), Value::Object(hosts));
            timeseries.insert("version".to_string(), json!(TIMESERIES_VERSION));
            output.insert("timeseries".to_string(), Value::Object(timeseries));
        }

        for p in &self.preprocs {
            if let Some(Value::Object(extra)) = p.results() {
                output.extend(extra);
            }
        }

        // Errors reported by preprocessors, for the job or for a node.
        for (source, data) in self.job.data() {
            let mut found = vec![];
            if let Some(e) = data.get("errors") {
                found.push(error_text(e));
            }
            if let Value::Object(nodes) = data {
                for (node, v) in nodes {
                    if let Some(e) = v.get("errors") {
                        found.push(format!("{node}: {}", error_text(e)));
                    }
                }
            }
            if !found.is_empty() {
                errors.entry(source.clone()).or_default().extend(found);
            }
        }
        if !errors.is_empty() {
            output.insert("errors".to_string(), json!(errors));
        }

        Value::Object(output)
    }

    fn acct(&self) -> Value {
        let info = self.job.info();
        json!({
            "id": info.local_job_id,
            "local_job_id": info.local_job_id,
            "cluster": info.cluster,
            "user": info.user,
            "account": info.account,
            "start_time": epoch_secs(info.start_time),
            "end_time": epoch_secs(info.end_time),
            "nodes": info.node_count,
            "host_list": self
                .job
                .node_names()
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<String>>(),
        })
    }
}

fn bind(analytic: &dyn Analytic, metrics: &[Ustr], desc: &[MetricDesc]) -> Option<Binding> {
    let mut indices = vec![];
    for m in analytic.required_metrics() {
        let i = metrics.iter().position(|x| *x == m)?;
        if !desc[i].present {
            return None;
        }
        indices.push(i);
    }
    for m in analytic.optional_metrics() {
        indices.push(metrics.iter().position(|x| *x == m)?);
    }
    let desc = indices
        .iter()
        .map(|i| desc[*i].clone())
        .collect::<Vec<MetricDesc>>();
    Some(Binding {
        indices,
        desc,
        stopped: false,
    })
}

// Show one sample to one analytic.  Returns false if the analytic wants no more of this node.

fn deliver(slot: &mut Slot, binding: &mut Binding, node: &NodeMeta, sample: &Sample, errors: &mut ErrorMap) -> bool {
    let data = binding
        .indices
        .iter()
        .map(|i| sample.values[*i].clone())
        .collect::<Vec<Vec<f64>>>();
    slot.touched = true;
    match slot
        .analytic
        .process(node, sample.timestamp, &data, &binding.desc)
    {
        Ok(true) => true,
        Ok(false) => {
            binding.stopped = true;
            false
        }
        Err(e) => {
            debug!("{} {} @ {}: {e}", node.name, slot.analytic.name(), sample.timestamp);
            errors
                .entry(slot.analytic.name().to_string())
                .or_default()
                .insert(format!("{}: {e}", node.name));
            true
        }
    }
}

fn error_text(e: &Value) -> String {
    match e.as_str() {
        Some(s) => s.to_string(),
        None => e.to_string(),
    }
}

// Preprocessor output is kept on the job as {node name: output} under the preprocessor's name.

fn store_node_data(job: &mut Job, name: &str, node: Ustr, value: Value) {
    let mut entry = match job.get_data(name) {
        Some(Value::Object(m)) => m.clone(),
        _ => Map::new(),
    };
    entry.insert(node.to_string(), value);
    job.add_data(name, Value::Object(entry));
}

#[cfg(test)]
pub fn fixture_job() -> Job {
    fixture_job_on(&["n1", "n2"])
}

// Nodes without a fixture archive get a merged archive path that does not exist.

#[cfg(test)]
pub fn fixture_job_on(nodes: &[&str]) -> Job {
    let mut job = Job::new(pcplog::JobInfo {
        cluster: "ub-hpc".to_string(),
        local_job_id: "1001".to_string(),
        user: "alice".to_string(),
        account: "physics".to_string(),
        start_time: summutils::timestamp_from_ymdhms(2020, 6, 1, 0, 0, 0).unwrap(),
        end_time: summutils::timestamp_from_ymdhms(2020, 6, 1, 0, 10, 0).unwrap(),
        node_count: nodes.len(),
    })
    .unwrap();
    let names = nodes.iter().map(|n| Ustr::from(*n)).collect::<Vec<Ustr>>();
    job.set_nodes(&names);
    for n in names {
        let archive = std::path::PathBuf::from(format!("../tests/archives/{n}/20200601.00.00"));
        job.add_node_archive(n, archive).unwrap();
    }
    job
}

#[cfg(test)]
fn fixture_source() -> pcplog::ArchiveSource {
    let mut norm = HashMap::new();
    norm.insert("network.interface.in.bytes".to_string(), 32);
    pcplog::ArchiveSource::new(norm)
}

#[cfg(test)]
fn fixture_summarize(job: Job, fail_fast: bool) -> Summarize {
    let analytics = crate::plugins::all_analytics(&job);
    Summarize::new(job, crate::plugins::all_preprocessors(), analytics, fail_fast)
}

#[test]
fn test_summarize_fixture_job() {
    let mut s = fixture_summarize(fixture_job(), false);
    s.process(&fixture_source(), &AtomicBool::new(false)).unwrap();
    assert!(s.nodes_processed() == 2);
    assert!(s.complete() && s.good_enough());

    let doc = s.get();
    assert!(doc["acct"]["id"] == json!("1001"));
    assert!(doc["acct"]["end_time"] == json!(1590970200));
    assert!(doc["summarization"]["version"] == json!(VERSION));
    assert!(doc["summarization"]["complete"] == json!(true));
    assert!(doc.get("errors").is_none());

    // n1 averages 3.925 and n2 7.425 over the samples after the first; both have 16 cores.
    let load = &doc["load1"];
    assert!((load["mean"]["avg"].as_f64().unwrap() - 5.675).abs() < 1e-9);
    assert!(load["max"]["max"] == json!(7.75));
    assert!((load["meanpercore"]["avg"].as_f64().unwrap() - 5.675 / 16.0).abs() < 1e-9);

    // eth0 on n1 wraps its 32-bit counter during the job.
    assert!(doc["network"]["eth0"]["in-bytes"] == json!({"avg": 1200000.0, "cnt": 2}));
    assert!(doc["network"]["ib0"]["in-bytes"] == json!({"avg": 9000000.0, "cnt": 2}));
    assert!(doc["block"]["sda"]["read_bytes"] == json!({"avg": 491520.0, "cnt": 2}));

    assert!(doc["power"]["power"]["mean"] == json!({"avg": 250.0, "cnt": 2}));
    assert!(doc["power"]["energy"]["total"] == json!(300000.0));

    let ts = &doc["timeseries"];
    assert!(ts["version"] == json!(4));
    assert!(ts["hosts"] == json!({"0": "n1", "1": "n2"}));
    assert!(ts["cpuuser"]["times"].as_array().unwrap().len() == 10);
    assert!(doc.get("cpuuser").is_none());

    let job = s.into_job();
    assert!(job.get_data("hinv") == Some(&json!({"n1": {"cores": 16}, "n2": {"cores": 16}})));
}

#[test]
fn test_failing_node() {
    let job = fixture_job_on(&["n1", "n2", "n3"]);
    let mut s = fixture_summarize(job, false);
    s.process(&fixture_source(), &AtomicBool::new(false)).unwrap();
    assert!(s.nodes_processed() == 2);
    assert!(!s.complete() && !s.good_enough());
    let doc = s.get();
    let node_errors = doc["errors"]["node"].as_array().unwrap();
    assert!(node_errors.len() == 1);
    assert!(node_errors[0].as_str().unwrap().starts_with("n3: "));
    assert!(doc["summarization"]["good_enough"] == json!(false));

    let job = fixture_job_on(&["n3", "n1"]);
    let mut s = fixture_summarize(job, true);
    assert!(s.process(&fixture_source(), &AtomicBool::new(false)).is_err());
    assert!(s.nodes_processed() == 0);
}

#[test]
fn test_cancel() {
    let mut s = fixture_summarize(fixture_job(), false);
    assert!(s.process(&fixture_source(), &AtomicBool::new(true)).is_err());
    assert!(s.nodes_processed() == 0);
}

#[cfg(test)]
struct Picky {
    metric: &'static str,
    calls: usize,
}

#[cfg(test)]
impl Analytic for Picky {
    fn name(&self) -> &'static str {
        self.metric
    }

    fn mode(&self) -> Mode {
        Mode::All
    }

    fn required_metrics(&self) -> Vec<Ustr> {
        vec![Ustr::from(self.metric)]
    }

    fn process(&mut self, _: &NodeMeta, timestamp: f64, _: &[Vec<f64>], _: &[MetricDesc]) -> Result<bool> {
        self.calls += 1;
        if timestamp == 1590969900.0 {
            bail!("bad sample");
        }
        Ok(true)
    }

    fn results(&self, _: &Job) -> Value {
        json!({ "calls": self.calls })
    }
}

#[test]
fn test_analytic_errors_and_missing_metrics() {
    let analytics: Vec<Box<dyn Analytic>> = vec![
        Box::new(Picky {
            metric: "kernel.all.load",
            calls: 0,
        }),
        Box::new(Picky {
            metric: "no.such.metric",
            calls: 0,
        }),
    ];
    let mut s = Summarize::new(fixture_job(), vec![], analytics, false);
    s.process(&fixture_source(), &AtomicBool::new(false)).unwrap();
    assert!(s.complete());
    let doc = s.get();
    // Every sample of both nodes was delivered despite the failures.
    assert!(doc["kernel.all.load"]["calls"] == json!(22));
    assert!(doc["errors"]["kernel.all.load"] == json!(["n1: bad sample", "n2: bad sample"]));
    assert!(doc.get("no.such.metric").is_none());
    assert!(doc.get("timeseries").is_none());
}

#[cfg(test)]
struct Widen;

#[cfg(test)]
impl Preprocessor for Widen {
    fn name(&self) -> &'static str {
        "widen"
    }

    fn required_metrics(&self) -> Vec<Ustr> {
        vec![]
    }

    fn host_start(&mut self, _: &NodeMeta) {}

    fn process(&mut self, _: f64, data: &[Vec<f64>], _: &[MetricDesc]) -> PreprocAction {
        let mut more = data.to_vec();
        more.push(vec![]);
        PreprocAction::Emit(more)
    }

    fn host_end(&mut self) -> Option<Value> {
        Some(json!({ "errors": "widened" }))
    }
}

#[test]
fn test_preprocessor_shape_change_fails_node() {
    let job = fixture_job();
    let analytics = crate::plugins::all_analytics(&job);
    let mut s = Summarize::new(job, vec![Box::new(Widen)], analytics, false);
    s.process(&fixture_source(), &AtomicBool::new(false)).unwrap();
    assert!(s.nodes_processed() == 0);
    let doc = s.get();
    assert!(doc["errors"]["node"].as_array().unwrap().len() == 2);
    // Preprocessor output that reports errors shows up in the summary's errors.
    assert!(doc["errors"]["widen"] == json!(["n1: widened", "n2: widened"]));
}
