/// MetricSource over a Prometheus-compatible time-series service.
///
/// Each requested metric is mapped to a PromQL expression by the resource configuration
/// (`prom_mapping`), with `{node}` and `{jobid}` replaced for the node being opened, and fetched
/// with range queries at a fixed step.  The service limits the number of points per series in one
/// response, so the node window is fetched in chunks of at most four hours and at most
/// MAX_POINTS_PER_QUERY steps, and the chunks are joined.  The series returned for a metric are its
/// instances, ordered by their label sets; a series that has no value at some time point (a missed
/// scrape, or a series that appears part way through the window) has NaN there.  A metric without
/// a mapping, or for which the service has no series, is reported as not present.
///
/// A mapping is either a PromQL string or an object `{ "query": <PromQL>, "unit": <unit> }`.
///
/// Wire contract:
///
///   GET /api/v1/query?query=<q>&time=<t>
///   GET /api/v1/query_range?query=<q>&start=<t0>&end=<t1>&step=<s>
///   GET /api/v1/label/<label>/values?match[]=<selector>&start=<t0>&end=<t1>
///
/// Transport failures are retried a few times; a response with a non-2xx status, or with a status
/// field other than "success", is a metric-service error.
///
use crate::metrics::{guess_kind, MetricDesc, MetricSource, MetricStream, NodeSpec, Sample};

use anyhow::{bail, Context, Result};
use itertools::Itertools;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::thread;
use std::time::Duration;
use summutils::{epoch_secs_f64, grab_string, grab_string_opt, grab_u64_opt, ClassifiedError, ProcessingError};
use tracing::{debug, warn};
use ustr::Ustr;

const DEFAULT_STEP_SECS: u64 = 30;
const DEFAULT_RETRIES: u32 = 3;
const CHUNK_SECS: u64 = 4 * 3600;
const MAX_POINTS_PER_QUERY: u64 = 10_000;

pub struct PromClient {
    agent: ureq::Agent,
    base_url: String,
    retries: u32,
}

/// A decoded query result: the label set of each series (instance), and one row of values per
/// time point with one column per series.  A series without a value at a time point has NaN.

#[derive(Clone, Debug, PartialEq)]
pub struct PromResult {
    pub labels: Vec<BTreeMap<String, String>>,
    pub points: Vec<(f64, Vec<f64>)>,
}

impl PromResult {
    // One column of (time bits -> value) per series.
    fn from_columns(labels: Vec<BTreeMap<String, String>>, columns: &[BTreeMap<u64, f64>]) -> PromResult {
        let times = columns
            .iter()
            .flat_map(|c| c.keys().map(|k| f64::from_bits(*k)))
            .sorted_by(|a, b| a.total_cmp(b))
            .dedup()
            .collect::<Vec<f64>>();
        let points = times
            .into_iter()
            .map(|t| {
                let row = columns
                    .iter()
                    .map(|col| col.get(&t.to_bits()).copied().unwrap_or(f64::NAN))
                    .collect::<Vec<f64>>();
                (t, row)
            })
            .collect::<Vec<(f64, Vec<f64>)>>();
        PromResult { labels, points }
    }
}

/// Split `[start, end]` into consecutive pieces of at most `chunk` seconds.  Adjacent pieces share
/// their boundary.

pub fn chunk_range(start: f64, end: f64, chunk: u64) -> Vec<(f64, f64)> {
    let chunk = chunk.max(1) as f64;
    let mut chunks = vec![];
    let mut t0 = start;
    loop {
        let t1 = (t0 + chunk).min(end);
        chunks.push((t0, t1));
        if t1 >= end {
            break;
        }
        t0 = t1;
    }
    chunks
}

fn service_error(detail: String) -> anyhow::Error {
    ClassifiedError::new(ProcessingError::MetricServiceError, detail).into()
}

impl PromClient {
    pub fn new(base_url: &str, timeout: Duration) -> PromClient {
        PromClient {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            base_url: base_url.trim_end_matches('/').to_string(),
            retries: DEFAULT_RETRIES,
        }
    }

    pub fn query(&self, query: &str, time: f64) -> Result<PromResult> {
        let data = self.get(&format!(
            "/api/v1/query?query={}&time={time}",
            urlencoding::encode(query)
        ))?;
        parse_response(&data)
    }

    pub fn query_range(&self, query: &str, start: f64, end: f64, step: u64) -> Result<PromResult> {
        let data = self.get(&format!(
            "/api/v1/query_range?query={}&start={start}&end={end}&step={step}",
            urlencoding::encode(query)
        ))?;
        parse_response(&data)
    }

    pub fn label_values(&self, label: &str, selector: Option<&str>, start: f64, end: f64) -> Result<Vec<String>> {
        let mut path = format!("/api/v1/label/{}/values?start={start}&end={end}", urlencoding::encode(label));
        if let Some(sel) = selector {
            path += &format!("&match[]={}", urlencoding::encode(sel));
        }
        match self.get(&path)? {
            Value::Array(vals) => Ok(vals
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect::<Vec<String>>()),
            _ => Err(service_error(format!("label values for {label} is not an array"))),
        }
    }

    // The `data` member of a successful response.

    fn get(&self, path: &str) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0;
        loop {
            debug!("GET {url}");
            match self.agent.get(&url).call() {
                Ok(resp) => {
                    let body = resp.into_string().context("Reading metric service response")?;
                    let v: Value = serde_json::from_str(&body)
                        .map_err(|e| service_error(format!("unparseable response from {url}: {e}")))?;
                    if v["status"] != "success" {
                        return Err(service_error(format!("{url}: {}", v["error"])));
                    }
                    return Ok(v["data"].clone());
                }
                Err(ureq::Error::Status(code, resp)) => {
                    let body = resp.into_string().unwrap_or_default();
                    return Err(service_error(format!("{url}: HTTP {code}: {body}")));
                }
                Err(ureq::Error::Transport(t)) => {
                    attempt += 1;
                    if attempt > self.retries {
                        return Err(service_error(format!("{url}: {t}")));
                    }
                    warn!("Retrying {url} after transport error: {t}");
                    thread::sleep(Duration::from_millis(100 * (1 << attempt)));
                }
            }
        }
    }
}

/// Normalize the `data` member of a query response.  A vector (or scalar) result is one time
/// point; a matrix result has one point per distinct timestamp, in increasing order, with NaN
/// where a series has no value.

pub fn parse_response(data: &Value) -> Result<PromResult> {
    let result_type = data["resultType"].as_str().unwrap_or("");
    let result = &data["result"];
    match result_type {
        "scalar" => {
            let (ts, v) = parse_point(result)?;
            Ok(PromResult {
                labels: vec![BTreeMap::new()],
                points: vec![(ts, vec![v])],
            })
        }
        "vector" => {
            let series = series_of(result)?;
            let mut labels = vec![];
            let mut values = vec![];
            let mut ts = None;
            for s in series {
                labels.push(labels_of(s));
                let (t, v) = parse_point(&s["value"])?;
                ts = ts.or(Some(t));
                values.push(v);
            }
            Ok(PromResult {
                labels,
                points: ts.map(|t| vec![(t, values)]).unwrap_or_default(),
            })
        }
        "matrix" => {
            let series = series_of(result)?;
            let mut labels = vec![];
            let mut columns: Vec<BTreeMap<u64, f64>> = vec![];
            for s in series {
                labels.push(labels_of(s));
                let Value::Array(points) = &s["values"] else {
                    bail!("Matrix series without values")
                };
                let mut col = BTreeMap::new();
                for p in points {
                    let (t, v) = parse_point(p)?;
                    col.insert(t.to_bits(), v);
                }
                columns.push(col);
            }
            Ok(PromResult::from_columns(labels, &columns))
        }
        other => bail!("Unsupported result type '{other}'"),
    }
}

fn series_of(result: &Value) -> Result<&Vec<Value>> {
    match result {
        Value::Array(series) => Ok(series),
        _ => bail!("Query result is not an array"),
    }
}

fn labels_of(series: &Value) -> BTreeMap<String, String> {
    match &series["metric"] {
        Value::Object(m) => m
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_str().unwrap_or("").to_string()))
            .collect::<BTreeMap<String, String>>(),
        _ => BTreeMap::new(),
    }
}

// [ <unix time>, "<value>" ]

fn parse_point(p: &Value) -> Result<(f64, f64)> {
    let (Some(t), Some(v)) = (p[0].as_f64(), p[1].as_str()) else {
        bail!("Malformed sample {p}")
    };
    match v.parse::<f64>() {
        Ok(v) => Ok((t, v)),
        Err(_) => bail!("Malformed sample value {v}"),
    }
}

// A short, stable name for a series: the instance-like label if there is one, else all labels.

fn instance_label(labels: &BTreeMap<String, String>) -> String {
    for key in ["device", "interface", "cpu", "gpu", "instance"] {
        if let Some(v) = labels.get(key) {
            return v.to_string();
        }
    }
    labels
        .iter()
        .filter(|(k, _)| k.as_str() != "__name__")
        .map(|(k, v)| format!("{k}={v}"))
        .join(",")
}

#[derive(Clone, Debug, PartialEq)]
pub struct PromMapping {
    pub query: String,
    pub unit: String,
}

impl PromMapping {
    pub fn new(query: &str) -> PromMapping {
        PromMapping {
            query: query.to_string(),
            unit: "".to_string(),
        }
    }
}

pub struct PromSource {
    client: PromClient,
    step: u64,
    mapping: HashMap<String, PromMapping>,
    normalization: HashMap<String, u32>,
}

impl PromSource {
    pub fn new(
        client: PromClient,
        step: u64,
        mapping: HashMap<String, PromMapping>,
        normalization: HashMap<String, u32>,
    ) -> PromSource {
        PromSource {
            client,
            step,
            mapping,
            normalization,
        }
    }

    /// `prom_url`, `prom_step` (seconds, default 30), `prom_timeout` (seconds, default 60) and
    /// `prom_mapping` (metric name -> PromQL, or -> { query, unit }) from the resource configuration.

    pub fn from_config(resconf: &Map<String, Value>, normalization: HashMap<String, u32>) -> Result<PromSource> {
        let url = grab_string(resconf, "prom_url")?;
        let step = grab_u64_opt(resconf, "prom_step")?.unwrap_or(DEFAULT_STEP_SECS);
        if step == 0 {
            bail!("prom_step must be positive");
        }
        let timeout = grab_u64_opt(resconf, "prom_timeout")?.unwrap_or(60);
        let mut mapping = HashMap::new();
        if let Some(m) = resconf.get("prom_mapping") {
            let Value::Object(fields) = m else {
                bail!("Field 'prom_mapping' must be an object")
            };
            for (metric, q) in fields {
                let m = match q {
                    Value::String(q) => PromMapping::new(q),
                    Value::Object(fields) => PromMapping {
                        query: grab_string(fields, "query")?,
                        unit: grab_string_opt(fields, "unit")?.unwrap_or_default(),
                    },
                    _ => bail!("Mapping for '{metric}' must be a string or an object"),
                };
                mapping.insert(metric.to_string(), m);
            }
        }
        Ok(PromSource::new(
            PromClient::new(&url, Duration::from_secs(timeout)),
            step,
            mapping,
            normalization,
        ))
    }

    // The whole of [start, end] for one query, fetched chunk by chunk.  Series are matched across
    // chunks by their label sets; a later chunk's value for a time point already seen replaces a
    // gap but not a value.

    fn fetch(&self, query: &str, start: f64, end: f64) -> Result<PromResult> {
        let chunk = CHUNK_SECS.min(self.step * MAX_POINTS_PER_QUERY);
        let mut labels: Vec<BTreeMap<String, String>> = vec![];
        let mut columns: Vec<BTreeMap<u64, f64>> = vec![];
        for (t0, t1) in chunk_range(start, end, chunk) {
            let res = self.client.query_range(query, t0, t1, self.step)?;
            for (k, l) in res.labels.iter().enumerate() {
                let col = match labels.iter().position(|x| x == l) {
                    Some(col) => col,
                    None => {
                        labels.push(l.clone());
                        columns.push(BTreeMap::new());
                        labels.len() - 1
                    }
                };
                for (t, row) in &res.points {
                    let v = row[k];
                    columns[col]
                        .entry(t.to_bits())
                        .and_modify(|old| {
                            if old.is_nan() {
                                *old = v
                            }
                        })
                        .or_insert(v);
                }
            }
        }
        Ok(PromResult::from_columns(labels, &columns))
    }
}

impl MetricSource for PromSource {
    fn open(&self, node: &NodeSpec, metrics: &[Ustr]) -> Result<Box<dyn MetricStream>> {
        let (start, end) = (epoch_secs_f64(node.begin), epoch_secs_f64(node.end));
        let mut descriptions = vec![];
        let mut per_metric: Vec<BTreeMap<u64, Vec<f64>>> = vec![];
        for m in metrics {
            let Some(mapping) = self.mapping.get(m.as_str()) else {
                descriptions.push(MetricDesc::missing(*m));
                per_metric.push(BTreeMap::new());
                continue;
            };
            let query = mapping
                .query
                .replace("{node}", node.name.as_str())
                .replace("{jobid}", &node.jobid);
            let res = self.fetch(&query, start, end)?;
            if res.labels.is_empty() || res.points.is_empty() {
                descriptions.push(MetricDesc::missing(*m));
                per_metric.push(BTreeMap::new());
                continue;
            }

            // Order instances by their label so that the order does not depend on the service.
            let order = (0..res.labels.len())
                .sorted_by_key(|k| instance_label(&res.labels[*k]))
                .collect::<Vec<usize>>();
            let indom = order
                .iter()
                .enumerate()
                .map(|(id, k)| (id as i64, instance_label(&res.labels[*k])))
                .collect::<BTreeMap<i64, String>>();
            descriptions.push(MetricDesc {
                name: *m,
                unit: mapping.unit.clone(),
                kind: guess_kind(m),
                fixup_bits: self.normalization.get(m.as_str()).copied(),
                indom,
                present: true,
            });
            per_metric.push(
                res.points
                    .into_iter()
                    .map(|(t, row)| (t.to_bits(), order.iter().map(|k| row[*k]).collect::<Vec<f64>>()))
                    .collect::<BTreeMap<u64, Vec<f64>>>(),
            );
        }

        let times = per_metric
            .iter()
            .flat_map(|pm| pm.keys().map(|k| f64::from_bits(*k)))
            .filter(|t| *t >= start && *t <= end)
            .sorted_by(|a, b| a.total_cmp(b))
            .dedup()
            .collect::<Vec<f64>>();
        let mut samples = times
            .into_iter()
            .map(|t| Sample {
                timestamp: t,
                values: per_metric
                    .iter()
                    .map(|pm| pm.get(&t.to_bits()).cloned().unwrap_or_default())
                    .collect::<Vec<Vec<f64>>>(),
            })
            .collect::<Vec<Sample>>();
        debug!("{}: {} samples from metric service", node.name, samples.len());
        samples.reverse();
        Ok(Box::new(PromStream {
            descriptions,
            samples,
        }))
    }
}

struct PromStream {
    descriptions: Vec<MetricDesc>,
    // Reversed, so that next() pops.
    samples: Vec<Sample>,
}

impl MetricStream for PromStream {
    fn descriptions(&self) -> &[MetricDesc] {
        &self.descriptions
    }

    fn next(&mut self) -> Result<Option<Sample>> {
        Ok(self.samples.pop())
    }

    fn close(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
fn matrix_json(series: usize, points: usize) -> Value {
    let result = (0..series)
        .map(|s| {
            let values = (0..points)
                .map(|p| serde_json::json!([1590969600 + 30 * p, format!("{}", s * 100 + p)]))
                .collect::<Vec<Value>>();
            serde_json::json!({ "metric": { "device": format!("sd{}", (b'c' - s as u8) as char) }, "values": values })
        })
        .collect::<Vec<Value>>();
    serde_json::json!({ "resultType": "matrix", "result": result })
}

// A one-shot HTTP server answering successive connections with the canned responses.  The
// request targets are collected in the returned list.

#[cfg(test)]
fn serve(responses: Vec<(u16, String)>) -> (String, std::sync::Arc<std::sync::Mutex<Vec<String>>>) {
    use std::io::{Read, Write};
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = format!("http://{}", listener.local_addr().unwrap());
    let requests = std::sync::Arc::new(std::sync::Mutex::new(vec![]));
    let seen = requests.clone();
    thread::spawn(move || {
        for (status, body) in responses {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).unwrap_or(0);
            let head = String::from_utf8_lossy(&buf[..n]).to_string();
            if let Some(target) = head.split_whitespace().nth(1) {
                seen.lock().unwrap().push(target.to_string());
            }
            let response = format!(
                "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });
    (addr, requests)
}

// The value of `key` in a request target's query string.

#[cfg(test)]
fn query_param(target: &str, key: &str) -> Option<f64> {
    target
        .split(['?', '&'])
        .find_map(|kv| kv.strip_prefix(&format!("{key}=")))
        .and_then(|v| v.parse::<f64>().ok())
}

#[test]
fn test_parse_matrix() {
    let res = parse_response(&matrix_json(3, 5)).unwrap();
    assert!(res.labels.len() == 3);
    assert!(res.points.len() == 5);
    for (k, (t, row)) in res.points.iter().enumerate() {
        assert!(*t == 1590969600.0 + 30.0 * k as f64);
        assert!(*row == vec![k as f64, 100.0 + k as f64, 200.0 + k as f64]);
    }
}

#[test]
fn test_parse_vector_and_gaps() {
    let data = serde_json::json!({
        "resultType": "vector",
        "result": [
            { "metric": { "cpu": "0" }, "value": [1590969600.5, "1.5"] },
            { "metric": { "cpu": "1" }, "value": [1590969600.5, "NaN"] }
        ]
    });
    let res = parse_response(&data).unwrap();
    assert!(res.points.len() == 1);
    assert!(res.points[0].0 == 1590969600.5);
    assert!(res.points[0].1[0] == 1.5 && res.points[0].1[1].is_nan());

    let empty = serde_json::json!({ "resultType": "vector", "result": [] });
    assert!(parse_response(&empty).unwrap().points.is_empty());

    // A missed scrape leaves a NaN in that series and keeps both series.
    let mut gappy = matrix_json(2, 5);
    gappy["result"][1]["values"].as_array_mut().unwrap().remove(2);
    let res = parse_response(&gappy).unwrap();
    assert!(res.labels.len() == 2);
    assert!(res.points.len() == 5);
    assert!(res.points[2].1[0] == 2.0 && res.points[2].1[1].is_nan());
    assert!(res.points[3].1 == vec![3.0, 103.0]);

    assert!(parse_response(&serde_json::json!({ "resultType": "string", "result": [0, "x"] })).is_err());
}

#[test]
fn test_prom_source() {
    let body = serde_json::json!({ "status": "success", "data": matrix_json(3, 5) }).to_string();
    let (url, requests) = serve(vec![(200, body)]);
    let mut mapping = HashMap::new();
    mapping.insert(
        "disk.dev.read_bytes".to_string(),
        PromMapping {
            query: "rate(node_disk_read_bytes_total{instance=\"{node}\"}[1m])".to_string(),
            unit: "byte / second".to_string(),
        },
    );
    let source = PromSource::new(PromClient::new(&url, Duration::from_secs(5)), 30, mapping, HashMap::new());
    let node = NodeSpec {
        name: Ustr::from("n1"),
        index: 0,
        jobid: "1001".to_string(),
        archive: None,
        begin: summutils::timestamp_from_ymdhms(2020, 6, 1, 0, 0, 0).unwrap(),
        end: summutils::timestamp_from_ymdhms(2020, 6, 1, 0, 10, 0).unwrap(),
    };
    let metrics = [Ustr::from("disk.dev.read_bytes"), Ustr::from("kernel.all.load")];
    let mut stream = source.open(&node, &metrics).unwrap();
    let descs = stream.descriptions().to_vec();
    assert!(descs[0].present && !descs[1].present);
    assert!(descs[0].unit == "byte / second");
    assert!(requests.lock().unwrap().len() == 1);
    // Series were delivered as sdc, sdb, sda and are reordered by label.
    assert!(descs[0].instance_labels() == vec!["sda".to_string(), "sdb".to_string(), "sdc".to_string()]);
    let mut n = 0;
    while let Some(s) = stream.next().unwrap() {
        assert!(s.values[0] == vec![200.0 + n as f64, 100.0 + n as f64, n as f64]);
        assert!(s.values[1].is_empty());
        n += 1;
    }
    assert!(n == 5);
}

#[test]
fn test_service_errors() {
    let (url, _) = serve(vec![
        (500, "{\"status\":\"error\",\"error\":\"boom\"}".to_string()),
        (200, "{\"status\":\"error\",\"error\":\"bad query\"}".to_string()),
        (200, "{\"status\":\"success\",\"data\":[\"n1\",\"n2\"]}".to_string()),
    ]);
    let client = PromClient::new(&url, Duration::from_secs(5));
    let err = client.query("up", 1590969600.0).unwrap_err();
    assert!(summutils::classify(&err) == ProcessingError::MetricServiceError);
    let err = client.query("up", 1590969600.0).unwrap_err();
    assert!(summutils::classify(&err) == ProcessingError::MetricServiceError);
    let hosts = client.label_values("instance", Some("up"), 1590969600.0, 1590970200.0).unwrap();
    assert!(hosts == vec!["n1".to_string(), "n2".to_string()]);
}

#[test]
fn test_chunk_range() {
    assert!(chunk_range(0.0, 100.0, 400) == vec![(0.0, 100.0)]);
    assert!(chunk_range(0.0, 1000.0, 400) == vec![(0.0, 400.0), (400.0, 800.0), (800.0, 1000.0)]);
    assert!(chunk_range(0.0, 800.0, 400) == vec![(0.0, 400.0), (400.0, 800.0)]);
    assert!(chunk_range(50.0, 50.0, 400) == vec![(50.0, 50.0)]);
}

#[test]
fn test_long_window_is_fetched_in_chunks() {
    use serde_json::json;
    // Four days, so 24 chunks of four hours.  Each chunk answers with two points at its start; the
    // third chunk also has a second device, which is missing everywhere else.
    let begin = 1590969600u64;
    let responses = (0..24u64)
        .map(|k| {
            let t0 = begin + k * CHUNK_SECS;
            let points = json!([[t0, format!("{k}")], [t0 + 30, format!("{k}.5")]]);
            let mut result = vec![json!({ "metric": { "device": "sda" }, "values": points })];
            if k == 2 {
                result.push(json!({ "metric": { "device": "sdb" }, "values": [[t0, "7"]] }));
            }
            let data = json!({ "resultType": "matrix", "result": result });
            (200, json!({ "status": "success", "data": data }).to_string())
        })
        .collect::<Vec<(u16, String)>>();
    let (url, requests) = serve(responses);
    let mut mapping = HashMap::new();
    mapping.insert("disk.dev.read_bytes".to_string(), PromMapping::new("disk_read{host=\"{node}\"}"));
    let source = PromSource::new(PromClient::new(&url, Duration::from_secs(5)), 30, mapping, HashMap::new());
    let node = NodeSpec {
        name: Ustr::from("n1"),
        index: 0,
        jobid: "1001".to_string(),
        archive: None,
        begin: summutils::timestamp_from_ymdhms(2020, 6, 1, 0, 0, 0).unwrap(),
        end: summutils::timestamp_from_ymdhms(2020, 6, 5, 0, 0, 0).unwrap(),
    };
    let mut stream = source.open(&node, &[Ustr::from("disk.dev.read_bytes")]).unwrap();

    let requests = requests.lock().unwrap().clone();
    assert!(requests.len() == 24);
    let mut expected_start = begin as f64;
    for r in &requests {
        let (start, end, step) = (
            query_param(r, "start").unwrap(),
            query_param(r, "end").unwrap(),
            query_param(r, "step").unwrap(),
        );
        assert!(start == expected_start);
        assert!((end - start) / step <= 11000.0);
        expected_start = end;
    }
    assert!(expected_start == (begin + 4 * 24 * 3600) as f64);

    assert!(stream.descriptions()[0].instance_labels() == vec!["sda".to_string(), "sdb".to_string()]);
    let mut n = 0;
    while let Some(s) = stream.next().unwrap() {
        let k = n / 2;
        let expected = if n % 2 == 0 { k as f64 } else { k as f64 + 0.5 };
        assert!(s.values[0][0] == expected);
        if n == 4 {
            assert!(s.values[0][1] == 7.0);
        } else {
            assert!(s.values[0][1].is_nan());
        }
        n += 1;
    }
    assert!(n == 48);
}

#[test]
fn test_from_config() {
    let conf = summutils::Config::new(Some(std::path::Path::new("../tests/config"))).unwrap();
    let resources = conf.resourceconfigs().unwrap();
    let (_, resconf) = resources.iter().find(|(name, _)| name == "promcluster").unwrap();
    let source = PromSource::from_config(resconf, HashMap::new()).unwrap();
    assert!(source.step == 30);
    assert!(source.mapping["kernel.all.load"].unit.is_empty());
    assert!(source.mapping["kernel.all.load"].query.starts_with("node_load1"));
    assert!(source.mapping["network.interface.in.bytes"].unit == "byte");

    let mut bad = resconf.clone();
    bad.insert("prom_mapping".to_string(), serde_json::json!({ "kernel.all.load": 1 }));
    assert!(PromSource::from_config(&bad, HashMap::new()).is_err());
}
