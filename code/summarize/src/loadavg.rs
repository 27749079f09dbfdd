// The one-minute load average: per-node mean and maximum, described across nodes, and the same per
// core when the hardware inventory knows the node's core count.  The first sample of each node is
// not counted.

use crate::plugins::{error_result, metric_names, Analytic, Mode, NodeMeta};

use anyhow::Result;
use pcplog::{Job, MetricDesc};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use summutils::{describe, ProcessingError, RollingStats};
use ustr::Ustr;

pub struct LoadAvg {
    data: BTreeMap<Ustr, RollingStats>,
}

impl LoadAvg {
    pub fn new() -> LoadAvg {
        LoadAvg {
            data: BTreeMap::new(),
        }
    }
}

impl Analytic for LoadAvg {
    fn name(&self) -> &'static str {
        "load1"
    }

    fn mode(&self) -> Mode {
        Mode::All
    }

    fn required_metrics(&self) -> Vec<Ustr> {
        metric_names(&["kernel.all.load"])
    }

    fn process(
        &mut self,
        node: &NodeMeta,
        _timestamp: f64,
        data: &[Vec<f64>],
        _desc: &[MetricDesc],
    ) -> Result<bool> {
        let Some(load) = data[0].first() else {
            return Ok(true);
        };
        match self.data.get_mut(&node.name) {
            None => {
                self.data.insert(node.name, RollingStats::new());
            }
            Some(stats) => stats.append(*load),
        }
        Ok(true)
    }

    fn results(&self, job: &Job) -> Value {
        let hinv = job.get_data("hinv");
        let mut meanval = vec![];
        let mut maxval = vec![];
        let mut meanpercore = vec![];
        let mut maxpercore = vec![];

        for (node, stats) in &self.data {
            if stats.count() == 0 {
                continue;
            }
            meanval.push(stats.mean());
            maxval.push(stats.max());
            let cores = hinv
                .and_then(|h| h.get(node.as_str()))
                .and_then(|n| n.get("cores"))
                .and_then(|c| c.as_f64());
            if let Some(cores) = cores {
                meanpercore.push(stats.mean() / cores);
                maxpercore.push(stats.max() / cores);
            }
        }

        if meanval.is_empty() {
            return error_result(ProcessingError::InsufficientData);
        }

        let mut results = json!({
            "mean": describe(&meanval),
            "max": describe(&maxval),
        });
        if !meanpercore.is_empty() {
            results["meanpercore"] = json!(describe(&meanpercore));
            results["maxpercore"] = json!(describe(&maxpercore));
        }
        results
    }
}

#[test]
fn test_load_average() {
    let mut job = crate::summarize::fixture_job();
    let mut load = LoadAvg::new();
    let desc = vec![MetricDesc::missing(Ustr::from("kernel.all.load"))];
    let n1 = NodeMeta {
        name: Ustr::from("n1"),
        index: 0,
    };
    let n2 = NodeMeta {
        name: Ustr::from("n2"),
        index: 1,
    };

    assert!(load.results(&job) == error_result(ProcessingError::InsufficientData));

    for (t, v) in [100.0, 2.0, 4.0].iter().enumerate() {
        assert!(load.process(&n1, t as f64, &[vec![*v]], &desc).unwrap());
    }
    for (t, v) in [100.0, 8.0, 8.0].iter().enumerate() {
        load.process(&n2, t as f64, &[vec![*v]], &desc).unwrap();
    }
    load.process(&n2, 9.0, &[vec![]], &desc).unwrap();

    let r = load.results(&job);
    assert!(r["mean"]["avg"] == json!(5.5));
    assert!(r["mean"]["min"] == json!(3.0));
    assert!(r["max"]["max"] == json!(8.0));
    assert!(r.get("meanpercore").is_none());

    job.add_data("hinv", json!({"n1": {"cores": 2}, "n2": {"cores": 4}}));
    let r = load.results(&job);
    assert!(r["meanpercore"]["avg"] == json!(1.75));
    assert!(r["maxpercore"] == json!({"avg": 2.0, "cnt": 2}));
}
