/// How much each device's counters advanced over the job.  For every node the first and last
/// samples are subtracted, and the per-node deltas of each device and metric are described across
/// the nodes.  The result is keyed by device name (dots replaced by dashes) and then by the metric
/// name without its first two components, so `network.interface.in.bytes` on `eth0` becomes
/// `eth0` / `in-bytes`.
///
use crate::plugins::{error_result, metric_names, Analytic, Mode, NodeMeta};

use anyhow::Result;
use pcplog::{Job, MetricDesc};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use summutils::{describe, ProcessingError};
use ustr::Ustr;

pub struct DeviceDelta {
    name: &'static str,
    required: Vec<Ustr>,
    optional: Vec<Ustr>,
    first: BTreeMap<Ustr, Vec<Vec<f64>>>,
    // device -> metric -> one delta per node
    data: BTreeMap<String, BTreeMap<String, Vec<f64>>>,
    error: Option<ProcessingError>,
}

impl DeviceDelta {
    pub fn new(name: &'static str, required: &[&str], optional: &[&str]) -> DeviceDelta {
        DeviceDelta {
            name,
            required: metric_names(required),
            optional: metric_names(optional),
            first: BTreeMap::new(),
            data: BTreeMap::new(),
            error: None,
        }
    }

    pub fn network() -> DeviceDelta {
        DeviceDelta::new(
            "network",
            &["network.interface.in.bytes"],
            &[
                "network.interface.out.bytes",
                "network.interface.in.packets",
                "network.interface.out.packets",
            ],
        )
    }

    pub fn block() -> DeviceDelta {
        DeviceDelta::new(
            "block",
            &["disk.dev.read_bytes"],
            &["disk.dev.write_bytes", "disk.dev.read", "disk.dev.write"],
        )
    }
}

fn pretty_metric_name(metric: &str) -> String {
    metric.split('.').skip(2).collect::<Vec<&str>>().join("-")
}

impl Analytic for DeviceDelta {
    fn name(&self) -> &'static str {
        self.name
    }

    fn mode(&self) -> Mode {
        Mode::FirstLast
    }

    fn required_metrics(&self) -> Vec<Ustr> {
        self.required.clone()
    }

    fn optional_metrics(&self) -> Vec<Ustr> {
        self.optional.clone()
    }

    fn process(
        &mut self,
        node: &NodeMeta,
        _timestamp: f64,
        data: &[Vec<f64>],
        desc: &[MetricDesc],
    ) -> Result<bool> {
        if data[0].is_empty() {
            return Ok(false);
        }
        let Some(first) = self.first.get(&node.name) else {
            self.first.insert(node.name, data.to_vec());
            return Ok(true);
        };
        if first.len() != data.len() || first.iter().zip(data).any(|(f, d)| f.len() != d.len()) {
            self.error = Some(ProcessingError::IndomChanged);
            return Ok(false);
        }

        for (m, values) in data.iter().enumerate() {
            let metric = pretty_metric_name(desc[m].name.as_str());
            let labels = desc[m].instance_labels();
            for (i, v) in values.iter().enumerate() {
                let device = match labels.get(i) {
                    Some(label) => label.clone(),
                    None => i.to_string(),
                };
                self.data
                    .entry(device)
                    .or_default()
                    .entry(metric.clone())
                    .or_default()
                    .push(v - first[m][i]);
            }
        }
        Ok(true)
    }

    fn results(&self, _job: &Job) -> Value {
        if let Some(e) = self.error {
            return error_result(e);
        }
        if self.data.is_empty() {
            return error_result(ProcessingError::InsufficientData);
        }
        let mut output = Map::new();
        for (device, metrics) in &self.data {
            let mut m = Map::new();
            for (metric, deltas) in metrics {
                m.insert(metric.clone(), json!(describe(deltas)));
            }
            output.insert(device.replace('.', "-"), Value::Object(m));
        }
        Value::Object(output)
    }
}

#[cfg(test)]
fn interface_desc(labels: &[&str]) -> Vec<MetricDesc> {
    let mut in_bytes = MetricDesc::missing(Ustr::from("network.interface.in.bytes"));
    in_bytes.present = true;
    for (i, l) in labels.iter().enumerate() {
        in_bytes.indom.insert(i as i64, l.to_string());
    }
    let out_bytes = MetricDesc::missing(Ustr::from("network.interface.out.bytes"));
    vec![in_bytes, out_bytes]
}

#[test]
fn test_pretty_metric_name() {
    assert!(pretty_metric_name("network.interface.in.bytes") == "in-bytes");
    assert!(pretty_metric_name("disk.dev.read_bytes") == "read_bytes");
}

#[test]
fn test_device_delta() {
    let job = crate::summarize::fixture_job();
    let desc = interface_desc(&["eth0", "ib0.1"]);
    let mut net = DeviceDelta::network();
    assert!(net.results(&job) == error_result(ProcessingError::InsufficientData));

    for (index, scale) in [1.0, 3.0].iter().enumerate() {
        let node = NodeMeta {
            name: Ustr::from(["n1", "n2"][index]),
            index,
        };
        assert!(net.process(&node, 0.0, &[vec![100.0, 1000.0], vec![]], &desc).unwrap());
        assert!(net
            .process(&node, 60.0, &[vec![100.0 + 10.0 * scale, 1000.0], vec![]], &desc)
            .unwrap());
    }
    let r = net.results(&job);
    assert!(r["eth0"]["in-bytes"]["avg"] == json!(20.0));
    assert!(r["eth0"]["in-bytes"]["max"] == json!(30.0));
    assert!(r["ib0-1"]["in-bytes"] == json!({"avg": 0.0, "cnt": 2}));
    assert!(r["eth0"].get("out-bytes").is_none());

    // A node with no data yields nothing.
    let node = NodeMeta {
        name: Ustr::from("n3"),
        index: 2,
    };
    assert!(!net.process(&node, 0.0, &[vec![], vec![]], &desc).unwrap());

    // An interface that disappears poisons the result.
    net.process(&node, 0.0, &[vec![1.0, 2.0], vec![]], &desc).unwrap();
    assert!(!net.process(&node, 60.0, &[vec![1.0], vec![]], &desc).unwrap());
    assert!(net.results(&job) == error_result(ProcessingError::IndomChanged));
}
