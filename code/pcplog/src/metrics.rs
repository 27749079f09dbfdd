/// The uniform view of a node's data that the summarizer consumes, whatever the data came from.
///
/// A source is opened once per node for a fixed list of metric names and yields samples in strictly
/// increasing time order within the node's window.  Each sample holds, for every requested metric
/// in request order, one value per instance; the instance set of every metric is fixed for the
/// lifetime of the stream and described by `descriptions()`.  A metric the source does not have is
/// described with `present == false` and always has an empty value vector.
///
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;
use summutils::Timestamp;
use ustr::Ustr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricKind {
    Gauge,
    Counter,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetricDesc {
    pub name: Ustr,
    pub unit: String,
    pub kind: MetricKind,
    // Register width of a counter that is known to wrap.
    pub fixup_bits: Option<u32>,
    // instance id -> label; a singular metric has the single instance -1.
    pub indom: BTreeMap<i64, String>,
    pub present: bool,
}

impl MetricDesc {
    pub fn missing(name: Ustr) -> MetricDesc {
        MetricDesc {
            name,
            unit: "".to_string(),
            kind: MetricKind::Gauge,
            fixup_bits: None,
            indom: BTreeMap::new(),
            present: false,
        }
    }

    pub fn instance_labels(&self) -> Vec<String> {
        self.indom.values().cloned().collect::<Vec<String>>()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    // Seconds since the epoch.
    pub timestamp: f64,
    // values[metric][instance], instances in the order of the metric's indom.
    pub values: Vec<Vec<f64>>,
}

/// What a source needs to know about the node it is opening.

#[derive(Clone, Debug)]
pub struct NodeSpec {
    pub name: Ustr,
    pub index: usize,
    pub jobid: String,
    pub archive: Option<PathBuf>,
    pub begin: Timestamp,
    pub end: Timestamp,
}

pub trait MetricSource: Send + Sync {
    fn open(&self, node: &NodeSpec, metrics: &[Ustr]) -> Result<Box<dyn MetricStream>>;

    /// True if the source reads the node's merged archive, so that archives must be located and
    /// merged before summarization.

    fn needs_archive(&self) -> bool {
        false
    }
}

pub trait MetricStream {
    fn descriptions(&self) -> &[MetricDesc];

    /// The next sample, or None at the end of the window.

    fn next(&mut self) -> Result<Option<Sample>>;

    fn close(&mut self);
}

// Metric naming conventions that decide the semantic kind when a source does not say.

pub fn guess_kind(name: &str) -> MetricKind {
    const COUNTER_HINTS: [&str; 6] = [".bytes", ".packets", ".cpu.", "_total", ".read", ".write"];
    if COUNTER_HINTS.iter().any(|h| name.contains(h)) {
        MetricKind::Counter
    } else {
        MetricKind::Gauge
    }
}

#[test]
fn test_guess_kind() {
    assert!(guess_kind("network.interface.in.bytes") == MetricKind::Counter);
    assert!(guess_kind("kernel.all.cpu.user") == MetricKind::Counter);
    assert!(guess_kind("disk.dev.read_bytes") == MetricKind::Counter);
    assert!(guess_kind("kernel.all.load") == MetricKind::Gauge);
    assert!(guess_kind("ipmi.dcmi.power") == MetricKind::Gauge);
}
