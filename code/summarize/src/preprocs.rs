// Built-in preprocessors.

use crate::plugins::{metric_names, NodeMeta, PreprocAction, Preprocessor};

use pcplog::MetricDesc;
use serde_json::{json, Value};
use ustr::Ustr;

/// Records the node's core count as `{"cores": n}` under "hinv".

pub struct HardwareInventory {
    ncpu: Ustr,
    cores: Option<f64>,
}

impl HardwareInventory {
    pub fn new() -> HardwareInventory {
        HardwareInventory {
            ncpu: Ustr::from("hinv.ncpu"),
            cores: None,
        }
    }
}

impl Preprocessor for HardwareInventory {
    fn name(&self) -> &'static str {
        "hinv"
    }

    fn required_metrics(&self) -> Vec<Ustr> {
        vec![self.ncpu]
    }

    fn host_start(&mut self, _node: &NodeMeta) {
        self.cores = None;
    }

    fn process(&mut self, _timestamp: f64, data: &[Vec<f64>], desc: &[MetricDesc]) -> PreprocAction {
        if self.cores.is_none() {
            if let Some(i) = desc.iter().position(|d| d.name == self.ncpu) {
                if let Some(n) = data[i].first() {
                    if *n > 0.0 {
                        self.cores = Some(*n);
                    }
                }
            }
        }
        PreprocAction::Keep
    }

    fn host_end(&mut self) -> Option<Value> {
        self.cores.take().map(|c| json!({ "cores": c as u64 }))
    }
}

/// Drops timesteps at which none of the fetched metrics has a value.

pub struct SparseFilter {
    dropped: usize,
}

impl SparseFilter {
    pub fn new() -> SparseFilter {
        SparseFilter { dropped: 0 }
    }
}

impl Preprocessor for SparseFilter {
    fn name(&self) -> &'static str {
        "sparse"
    }

    fn required_metrics(&self) -> Vec<Ustr> {
        metric_names(&[])
    }

    fn host_start(&mut self, _node: &NodeMeta) {
        self.dropped = 0;
    }

    fn process(&mut self, _timestamp: f64, data: &[Vec<f64>], _desc: &[MetricDesc]) -> PreprocAction {
        if data.iter().all(|d| d.is_empty()) {
            self.dropped += 1;
            PreprocAction::Drop
        } else {
            PreprocAction::Keep
        }
    }

    fn host_end(&mut self) -> Option<Value> {
        if self.dropped > 0 {
            Some(json!({ "dropped": self.dropped }))
        } else {
            None
        }
    }
}

#[cfg(test)]
fn descs(names: &[&str]) -> Vec<MetricDesc> {
    names
        .iter()
        .map(|n| MetricDesc::missing(Ustr::from(*n)))
        .collect::<Vec<MetricDesc>>()
}

#[test]
fn test_hardware_inventory() {
    let node = NodeMeta {
        name: Ustr::from("n1"),
        index: 0,
    };
    let desc = descs(&["kernel.all.load", "hinv.ncpu"]);
    let mut hinv = HardwareInventory::new();
    hinv.host_start(&node);
    assert!(hinv.process(1.0, &[vec![1.0], vec![]], &desc) == PreprocAction::Keep);
    assert!(hinv.process(2.0, &[vec![1.0], vec![16.0]], &desc) == PreprocAction::Keep);
    assert!(hinv.process(3.0, &[vec![1.0], vec![8.0]], &desc) == PreprocAction::Keep);
    assert!(hinv.host_end() == Some(json!({"cores": 16})));

    // Nothing leaks into the next node.
    hinv.host_start(&node);
    hinv.process(1.0, &[vec![1.0], vec![]], &desc);
    assert!(hinv.host_end().is_none());
}

#[test]
fn test_sparse_filter() {
    let node = NodeMeta {
        name: Ustr::from("n1"),
        index: 0,
    };
    let desc = descs(&["a", "b"]);
    let mut sparse = SparseFilter::new();
    sparse.host_start(&node);
    assert!(sparse.process(1.0, &[vec![], vec![]], &desc) == PreprocAction::Drop);
    assert!(sparse.process(2.0, &[vec![], vec![1.0]], &desc) == PreprocAction::Keep);
    assert!(sparse.host_end() == Some(json!({"dropped": 1})));
    sparse.host_start(&node);
    assert!(sparse.host_end().is_none());
}
