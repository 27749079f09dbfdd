/// The interfaces between the summarizer and the code that computes the sections of a summary.
///
/// An analytic is shown the samples of every node of the job, one node at a time, for the metrics it
/// asks for, and produces one section of the summary document when all nodes are done.  The
/// analytic's name is the section's key.
///
/// A preprocessor is shown each sample before the analytics are and may drop it or replace it.
/// Whatever it learns about a node is stored on the job under the preprocessor's name, keyed by node
/// name, where analytics can find it when they compute their results.  Preprocessors are reset at
/// the start of every node and must not carry state from one node to the next.
///
use crate::cputimeseries::CpuUserTimeseries;
use crate::devicedelta::DeviceDelta;
use crate::loadavg::LoadAvg;
use crate::power::PowerUsage;
use crate::preprocs::{HardwareInventory, SparseFilter};

use anyhow::Result;
use pcplog::{Job, MetricDesc};
use serde_json::{json, Map, Value};
use summutils::{grab_strings_opt, ProcessingError};
use ustr::Ustr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    // Every sample.
    All,
    // Every sample; the result goes into the timeseries document.
    Timeseries,
    // The first and last sample of each node.
    FirstLast,
}

#[derive(Clone, Copy, Debug)]
pub struct NodeMeta {
    pub name: Ustr,
    pub index: usize,
}

pub trait Analytic: Send {
    fn name(&self) -> &'static str;

    fn mode(&self) -> Mode;

    /// The analytic is not run on a node that lacks any of these.

    fn required_metrics(&self) -> Vec<Ustr>;

    fn optional_metrics(&self) -> Vec<Ustr> {
        vec![]
    }

    /// `data[i]` and `desc[i]` belong to the i'th metric of the required metrics followed by the
    /// optional ones.  A missing optional metric has no values.  Returning false ends delivery of
    /// the node's remaining samples to this analytic.

    fn process(
        &mut self,
        node: &NodeMeta,
        timestamp: f64,
        data: &[Vec<f64>],
        desc: &[MetricDesc],
    ) -> Result<bool>;

    /// The analytic's section of the summary, computed after all nodes have been processed.

    fn results(&self, job: &Job) -> Value;
}

#[derive(Clone, Debug, PartialEq)]
pub enum PreprocAction {
    Keep,
    Drop,
    // Replace the sample's values; the shape must be unchanged.
    Emit(Vec<Vec<f64>>),
}

pub trait Preprocessor: Send {
    fn name(&self) -> &'static str;

    fn required_metrics(&self) -> Vec<Ustr>;

    fn host_start(&mut self, node: &NodeMeta);

    /// `data` and `desc` cover every metric fetched for the node, not just the required ones.

    fn process(&mut self, timestamp: f64, data: &[Vec<f64>], desc: &[MetricDesc]) -> PreprocAction;

    /// What was learned about the node, if anything.

    fn host_end(&mut self) -> Option<Value>;

    /// Extra top-level fields for the summary.

    fn results(&self) -> Option<Value> {
        None
    }
}

/// The result section of an analytic that could not produce one.

pub fn error_result(kind: ProcessingError) -> Value {
    json!({ "error": kind.code() })
}

pub fn metric_names(names: &[&str]) -> Vec<Ustr> {
    names.iter().map(|n| Ustr::from(*n)).collect::<Vec<Ustr>>()
}

/// Every built-in preprocessor, in the order they see samples.

pub fn all_preprocessors() -> Vec<Box<dyn Preprocessor>> {
    vec![Box::new(SparseFilter::new()), Box::new(HardwareInventory::new())]
}

/// Every built-in analytic, sized for the job.

pub fn all_analytics(job: &Job) -> Vec<Box<dyn Analytic>> {
    vec![
        Box::new(LoadAvg::new()),
        Box::new(PowerUsage::new()),
        Box::new(DeviceDelta::network()),
        Box::new(DeviceDelta::block()),
        Box::new(CpuUserTimeseries::new(job.node_count(), job.walltime() as f64)),
    ]
}

/// Apply the resource's `plugin_whitelist`, or failing that its `plugin_blacklist`, to the
/// preprocessors and analytics by name.

pub fn filter_plugins(
    resconf: &Map<String, Value>,
    preprocs: Vec<Box<dyn Preprocessor>>,
    analytics: Vec<Box<dyn Analytic>>,
) -> Result<(Vec<Box<dyn Preprocessor>>, Vec<Box<dyn Analytic>>)> {
    let whitelist = grab_strings_opt(resconf, "plugin_whitelist")?;
    let blacklist = grab_strings_opt(resconf, "plugin_blacklist")?;
    let wanted = |name: &str| -> bool {
        if resconf.contains_key("plugin_whitelist") {
            whitelist.iter().any(|w| w == name)
        } else {
            !blacklist.iter().any(|b| b == name)
        }
    };
    let preprocs = preprocs
        .into_iter()
        .filter(|p| wanted(p.name()))
        .collect::<Vec<Box<dyn Preprocessor>>>();
    let analytics = analytics
        .into_iter()
        .filter(|a| wanted(a.name()))
        .collect::<Vec<Box<dyn Analytic>>>();
    Ok((preprocs, analytics))
}

#[cfg(test)]
fn names(
    plugins: &(Vec<Box<dyn Preprocessor>>, Vec<Box<dyn Analytic>>),
) -> (Vec<&'static str>, Vec<&'static str>) {
    (
        plugins.0.iter().map(|p| p.name()).collect::<Vec<&'static str>>(),
        plugins.1.iter().map(|a| a.name()).collect::<Vec<&'static str>>(),
    )
}

#[test]
fn test_filter_plugins() {
    let job = crate::summarize::fixture_job();
    let all = || (all_preprocessors(), all_analytics(&job));

    let (p, a) = all();
    let everything = filter_plugins(&Map::new(), p, a).unwrap();
    let (pn, an) = names(&everything);
    assert!(pn == vec!["sparse", "hinv"]);
    assert!(an == vec!["load1", "power", "network", "block", "cpuuser"]);

    let mut resconf = Map::new();
    resconf.insert("plugin_whitelist".to_string(), json!(["hinv", "load1"]));
    resconf.insert("plugin_blacklist".to_string(), json!(["load1"]));
    let (p, a) = all();
    let white = filter_plugins(&resconf, p, a).unwrap();
    let (pn, an) = names(&white);
    assert!(pn == vec!["hinv"]);
    assert!(an == vec!["load1"]);

    resconf.remove("plugin_whitelist");
    let (p, a) = all();
    let black = filter_plugins(&resconf, p, a).unwrap();
    let (pn, an) = names(&black);
    assert!(pn.len() == 2);
    assert!(!an.contains(&"load1") && an.len() == 4);
}

#[test]
fn test_error_result() {
    assert!(error_result(ProcessingError::InsufficientData) == json!({"error": 3}));
}
