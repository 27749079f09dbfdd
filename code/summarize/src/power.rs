// Node power draw and the energy it adds up to.  The first sample of a node starts its integrator;
// the power statistics are taken over the samples after that.

use crate::plugins::{error_result, metric_names, Analytic, Mode, NodeMeta};

use anyhow::Result;
use pcplog::{Job, MetricDesc};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use summutils::{describe, Integrator, ProcessingError, RollingStats};
use ustr::Ustr;

struct NodePower {
    power: RollingStats,
    energy: Integrator,
}

pub struct PowerUsage {
    data: BTreeMap<usize, NodePower>,
}

impl PowerUsage {
    pub fn new() -> PowerUsage {
        PowerUsage {
            data: BTreeMap::new(),
        }
    }
}

impl Analytic for PowerUsage {
    fn name(&self) -> &'static str {
        "power"
    }

    fn mode(&self) -> Mode {
        Mode::All
    }

    fn required_metrics(&self) -> Vec<Ustr> {
        metric_names(&["ipmi.dcmi.power"])
    }

    fn process(
        &mut self,
        node: &NodeMeta,
        timestamp: f64,
        data: &[Vec<f64>],
        _desc: &[MetricDesc],
    ) -> Result<bool> {
        let Some(watts) = data[0].first().copied() else {
            return Ok(true);
        };
        // Some management controllers report zero when they cannot measure power.
        if watts < f64::EPSILON {
            return Ok(false);
        }
        match self.data.get_mut(&node.index) {
            None => {
                self.data.insert(
                    node.index,
                    NodePower {
                        power: RollingStats::new(),
                        energy: Integrator::new(timestamp),
                    },
                );
            }
            Some(hdata) => {
                hdata.power.append(watts);
                hdata.energy.add(timestamp, watts)?;
            }
        }
        Ok(true)
    }

    fn results(&self, job: &Job) -> Value {
        let mut meanpower = vec![];
        let mut maxpower = vec![];
        let mut energy = vec![];
        let mut time_covered = 0.0;

        for hdata in self.data.values() {
            if hdata.power.count() > 0 {
                meanpower.push(hdata.power.mean());
                maxpower.push(hdata.power.max());
            }
            energy.push(hdata.energy.total());
            time_covered += hdata.energy.elapsed();
        }

        let total_energy = energy.iter().sum::<f64>();
        if total_energy < f64::EPSILON {
            return error_result(ProcessingError::RawCounterUnavailable);
        }
        if time_covered < 0.9 * job.node_count() as f64 * job.walltime() as f64 {
            return error_result(ProcessingError::InsufficientData);
        }
        if meanpower.is_empty() {
            return error_result(ProcessingError::InsufficientData);
        }

        let mut energy_stats = json!(describe(&energy));
        energy_stats["total"] = json!(total_energy);
        json!({
            "power": {
                "mean": describe(&meanpower),
                "max": describe(&maxpower),
            },
            "energy": energy_stats,
        })
    }
}

#[test]
fn test_power_usage() {
    // Ten minutes, two nodes.
    let job = crate::summarize::fixture_job();
    let desc = vec![MetricDesc::missing(Ustr::from("ipmi.dcmi.power"))];
    let mut power = PowerUsage::new();
    assert!(power.results(&job) == error_result(ProcessingError::RawCounterUnavailable));

    for index in 0..2 {
        let node = NodeMeta {
            name: Ustr::from(format!("n{}", index + 1).as_str()),
            index,
        };
        let watts = 100.0 * (index + 1) as f64;
        for t in 0..=10 {
            assert!(power
                .process(&node, 1590969600.0 + 60.0 * t as f64, &[vec![watts]], &desc)
                .unwrap());
        }
    }
    let r = power.results(&job);
    assert!(r["power"]["mean"]["avg"] == json!(150.0));
    assert!(r["power"]["max"]["max"] == json!(200.0));
    assert!(r["energy"]["total"] == json!(100.0 * 600.0 + 200.0 * 600.0));
    assert!(r["energy"]["cnt"] == json!(2));

    // Half the walltime is not enough.
    let mut short = PowerUsage::new();
    let node = NodeMeta {
        name: Ustr::from("n1"),
        index: 0,
    };
    for t in 0..=5 {
        short.process(&node, 60.0 * t as f64, &[vec![100.0]], &desc).unwrap();
    }
    assert!(short.results(&job) == error_result(ProcessingError::InsufficientData));

    // A zero reading ends the node.
    assert!(!short.process(&node, 400.0, &[vec![0.0]], &desc).unwrap());
}
