// User CPU time as a rate, per node, down-sampled to a bounded number of points.  For jobs on more
// than 64 nodes only the nodes that are the minimum, maximum or median at some point in time are
// kept in full, and the min/max/med series say which node that was.

use crate::plugins::{error_result, metric_names, Analytic, Mode, NodeMeta};
use crate::subsample::TimeseriesAccumulator;

use anyhow::Result;
use pcplog::{Job, MetricDesc};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use summutils::ProcessingError;
use ustr::Ustr;

const MAX_HOSTS_IN_FULL: usize = 64;

struct HostData {
    // Per-instance values at each kept point.
    devices: Vec<Vec<f64>>,
    names: Map<String, Value>,
}

pub struct CpuUserTimeseries {
    data: TimeseriesAccumulator,
    hostdata: BTreeMap<usize, HostData>,
}

impl CpuUserTimeseries {
    pub fn new(nhosts: usize, walltime: f64) -> CpuUserTimeseries {
        CpuUserTimeseries {
            data: TimeseriesAccumulator::new(nhosts, walltime),
            hostdata: BTreeMap::new(),
        }
    }
}

fn rates(values: &[(f64, f64)]) -> Vec<f64> {
    values
        .windows(2)
        .map(|w| (w[1].1 - w[0].1) / (w[1].0 - w[0].0))
        .collect::<Vec<f64>>()
}

// For each time point, [rate, host] of the host selected by `pick` from the hosts ordered by rate.

fn collate(rates: &[Vec<f64>], pick: impl Fn(usize) -> usize) -> (Vec<Value>, Vec<usize>) {
    let npoints = rates.first().map(|r| r.len()).unwrap_or(0);
    let mut series = vec![];
    let mut hosts = vec![];
    for t in 0..npoints {
        let mut order = (0..rates.len()).collect::<Vec<usize>>();
        order.sort_by(|a, b| rates[*a][t].total_cmp(&rates[*b][t]));
        let host = order[pick(order.len())];
        series.push(json!([rates[host][t], host]));
        hosts.push(host);
    }
    (series, hosts)
}

impl Analytic for CpuUserTimeseries {
    fn name(&self) -> &'static str {
        "cpuuser"
    }

    fn mode(&self) -> Mode {
        Mode::Timeseries
    }

    fn required_metrics(&self) -> Vec<Ustr> {
        metric_names(&["kernel.all.cpu.user"])
    }

    fn process(
        &mut self,
        node: &NodeMeta,
        timestamp: f64,
        data: &[Vec<f64>],
        desc: &[MetricDesc],
    ) -> Result<bool> {
        let cpudata = &data[0];
        if cpudata.is_empty() {
            return Ok(true);
        }
        let host = self.hostdata.entry(node.index).or_insert_with(|| HostData {
            devices: vec![],
            names: desc[0]
                .instance_labels()
                .into_iter()
                .enumerate()
                .map(|(i, l)| (i.to_string(), Value::String(l)))
                .collect::<Map<String, Value>>(),
        });
        let mean = cpudata.iter().sum::<f64>() / cpudata.len() as f64;
        if let Some(at) = self.data.add_data(node.index, timestamp, mean / 10.0) {
            host.devices.truncate(at);
            host.devices.push(cpudata.iter().map(|v| v / 10.0).collect::<Vec<f64>>());
        }
        Ok(true)
    }

    fn results(&self, _job: &Job) -> Value {
        let values = self.data.get();
        if values.is_empty() || values[0].len() < 3 {
            return error_result(ProcessingError::JobTooShort);
        }
        let all_rates = values.iter().map(|v| rates(v)).collect::<Vec<Vec<f64>>>();
        let times = values[0][1..].iter().map(|(t, _)| *t).collect::<Vec<f64>>();

        let mut retdata = json!({ "times": times, "hosts": {} });
        let includelist = if self.hostdata.len() > MAX_HOSTS_IN_FULL {
            let (min, mut include) = collate(&all_rates, |_| 0);
            let (max, maxhosts) = collate(&all_rates, |n| n - 1);
            let (med, medhosts) = collate(&all_rates, |n| n / 2);
            include.extend(maxhosts);
            include.extend(medhosts);
            retdata["min"] = json!(min);
            retdata["max"] = json!(max);
            retdata["med"] = json!(med);
            include.into_iter().collect::<BTreeSet<usize>>()
        } else {
            self.hostdata.keys().copied().collect::<BTreeSet<usize>>()
        };

        for hostidx in includelist {
            let Some(host) = self.hostdata.get(&hostidx) else {
                continue;
            };
            let points = values[hostidx];
            let mut dev = Map::new();
            for devid in 0..host.names.len() {
                let series = points
                    .iter()
                    .zip(&host.devices)
                    .map(|((t, _), d)| (*t, d.get(devid).copied().unwrap_or(0.0)))
                    .collect::<Vec<(f64, f64)>>();
                dev.insert(devid.to_string(), json!(rates(&series)));
            }
            retdata["hosts"][hostidx.to_string()] = json!({
                "all": all_rates[hostidx],
                "dev": dev,
                "names": host.names,
            });
        }
        retdata
    }
}

#[cfg(test)]
fn cpu_desc() -> Vec<MetricDesc> {
    let mut d = MetricDesc::missing(Ustr::from("kernel.all.cpu.user"));
    d.present = true;
    d.indom.insert(-1, "".to_string());
    vec![d]
}

#[test]
fn test_cpu_timeseries() {
    let job = crate::summarize::fixture_job();
    let mut cpu = CpuUserTimeseries::new(2, 600.0);
    let desc = cpu_desc();
    for index in 0..2 {
        let node = NodeMeta {
            name: Ustr::from(["n1", "n2"][index]),
            index,
        };
        // 600 ms of user time per second on n1, 1200 on n2.
        for k in 0..11 {
            let t = 60.0 * k as f64;
            let v = 600.0 * (index + 1) as f64 * t;
            assert!(cpu.process(&node, t, &[vec![v]], &desc).unwrap());
        }
    }
    let r = cpu.results(&job);
    assert!(r["times"].as_array().unwrap().len() == 10);
    assert!(r["times"][0] == json!(60.0));
    let n1 = &r["hosts"]["0"];
    assert!(n1["all"].as_array().unwrap().iter().all(|x| *x == json!(60.0)));
    assert!(n1["dev"]["0"][9] == json!(60.0));
    assert!(n1["names"] == json!({"0": ""}));
    assert!(r["hosts"]["1"]["all"][3] == json!(120.0));
    assert!(r.get("min").is_none());
}

#[test]
fn test_cpu_timeseries_too_short() {
    let job = crate::summarize::fixture_job();
    let mut cpu = CpuUserTimeseries::new(2, 600.0);
    let desc = cpu_desc();
    let node = NodeMeta {
        name: Ustr::from("n1"),
        index: 0,
    };
    for k in 0..11 {
        cpu.process(&node, k as f64, &[vec![k as f64]], &desc).unwrap();
    }
    // n2 never reported.
    assert!(cpu.results(&job) == error_result(ProcessingError::JobTooShort));
}

#[test]
fn test_collate_many_hosts() {
    let rates = (0..70)
        .map(|h| vec![h as f64, (70 - h) as f64])
        .collect::<Vec<Vec<f64>>>();
    let (min, hosts) = collate(&rates, |_| 0);
    assert!(hosts == vec![0, 69]);
    assert!(min[1] == json!([1.0, 69]));
    let (_, hosts) = collate(&rates, |n| n / 2);
    assert!(hosts == vec![35, 34]);
}
