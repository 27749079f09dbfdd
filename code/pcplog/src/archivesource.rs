// MetricSource over a node's merged archive.

use crate::archive::{Archive, ArchiveRecord};
use crate::metrics::{guess_kind, MetricDesc, MetricSource, MetricStream, NodeSpec, Sample};

use anyhow::{bail, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use summutils::{epoch_secs_f64, ClassifiedError, ProcessingError};
use tracing::debug;
use ustr::Ustr;

pub struct ArchiveSource {
    normalization: HashMap<String, u32>,
}

impl ArchiveSource {
    pub fn new(normalization: HashMap<String, u32>) -> ArchiveSource {
        ArchiveSource { normalization }
    }
}

impl MetricSource for ArchiveSource {
    fn open(&self, node: &NodeSpec, metrics: &[Ustr]) -> Result<Box<dyn MetricStream>> {
        let Some(path) = &node.archive else {
            bail!("No merged archive for {}", node.name)
        };
        let archive = Archive::open(path)?;
        let (lo, hi) = (epoch_secs_f64(node.begin), epoch_secs_f64(node.end));
        let records = archive
            .records
            .iter()
            .filter(|r| r.timestamp >= lo && r.timestamp <= hi)
            .cloned()
            .collect::<Vec<ArchiveRecord>>();

        if let Some(r) = records.iter().find(|r| r.mark) {
            return Err(ClassifiedError::new(
                ProcessingError::CollectorRestarted,
                format!("{} at {}", node.name, r.timestamp),
            )
            .into());
        }

        let descriptions = metrics
            .iter()
            .map(|m| self.describe(*m, &archive.units, &records))
            .collect::<Result<Vec<MetricDesc>>>()?;

        let mut samples = vec![];
        for r in &records {
            let mut values = vec![];
            for desc in &descriptions {
                let mut by_instance = r
                    .values
                    .iter()
                    .filter(|v| v.metric == desc.name)
                    .map(|v| (v.instance, v.value))
                    .collect::<Vec<(i64, f64)>>();
                by_instance.sort_by_key(|(instance, _)| *instance);
                values.push(by_instance.into_iter().map(|(_, v)| v).collect::<Vec<f64>>());
            }
            samples.push(Sample {
                timestamp: r.timestamp,
                values,
            });
        }
        debug!("{}: {} samples from {}", node.name, samples.len(), path.display());
        samples.reverse();

        Ok(Box::new(ArchiveStream {
            descriptions,
            samples,
        }))
    }

    fn needs_archive(&self) -> bool {
        true
    }
}

impl ArchiveSource {
    // The instance domain is taken from the first record carrying the metric; every later record
    // that carries it must have exactly the same instances.

    fn describe(&self, name: Ustr, units: &BTreeMap<Ustr, String>, records: &[ArchiveRecord]) -> Result<MetricDesc> {
        let mut indom: Option<BTreeMap<i64, String>> = None;
        for r in records {
            let here = r
                .values
                .iter()
                .filter(|v| v.metric == name)
                .map(|v| (v.instance, v.label.to_string()))
                .collect::<BTreeMap<i64, String>>();
            if here.is_empty() {
                continue;
            }
            match &indom {
                None => indom = Some(here),
                Some(first) => {
                    let a = first.keys().collect::<BTreeSet<&i64>>();
                    let b = here.keys().collect::<BTreeSet<&i64>>();
                    if a != b {
                        return Err(ClassifiedError::new(
                            ProcessingError::IndomChanged,
                            format!("{name} at {}", r.timestamp),
                        )
                        .into());
                    }
                }
            }
        }
        Ok(match indom {
            None => MetricDesc::missing(name),
            Some(indom) => MetricDesc {
                name,
                unit: units.get(&name).cloned().unwrap_or_default(),
                kind: guess_kind(&name),
                fixup_bits: self.normalization.get(name.as_str()).copied(),
                indom,
                present: true,
            },
        })
    }
}

struct ArchiveStream {
    descriptions: Vec<MetricDesc>,
    // Reversed, so that next() pops.
    samples: Vec<Sample>,
}

impl MetricStream for ArchiveStream {
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
fn test_node(archive: &std::path::Path) -> NodeSpec {
    NodeSpec {
        name: Ustr::from("n1"),
        index: 0,
        jobid: "1001".to_string(),
        archive: Some(archive.to_path_buf()),
        begin: summutils::timestamp_from_ymdhms(2020, 6, 1, 0, 0, 0).unwrap(),
        end: summutils::timestamp_from_ymdhms(2020, 6, 1, 0, 10, 0).unwrap(),
    }
}

#[test]
fn test_archive_stream() {
    let mut norm = HashMap::new();
    norm.insert("network.interface.in.bytes".to_string(), 32);
    let source = ArchiveSource::new(norm);
    let node = test_node(std::path::Path::new("../tests/archives/n1/20200601.00.00"));
    let metrics = ["kernel.all.load", "network.interface.in.bytes", "no.such.metric"]
        .iter()
        .map(|m| Ustr::from(*m))
        .collect::<Vec<Ustr>>();
    let mut stream = source.open(&node, &metrics).unwrap();

    let descs = stream.descriptions();
    assert!(descs.len() == 3);
    assert!(descs[0].indom.len() == 1 && descs[0].fixup_bits.is_none());
    assert!(descs[1].fixup_bits == Some(32));
    assert!(descs[1].instance_labels() == vec!["eth0".to_string(), "ib0".to_string()]);
    assert!(descs[0].unit.is_empty() && descs[1].unit == "byte");
    assert!(!descs[2].present);

    let mut n = 0;
    let mut last = 0.0;
    while let Some(s) = stream.next().unwrap() {
        assert!(s.timestamp > last);
        assert!(s.values.len() == 3);
        assert!(s.values[1].len() == 2);
        assert!(s.values[2].is_empty());
        last = s.timestamp;
        n += 1;
    }
    assert!(n == 11);
    assert!(last == 1590970200.0);
    stream.close();
}

#[test]
fn test_collector_restart_and_indom_change() {
    let dir = tempfile::tempdir().unwrap();
    let restarted = dir.path().join("restarted");
    std::fs::write(
        &restarted,
        "1590969600,kernel.all.load,-1,,1\n1590969660,<mark>,-1,,0\n1590969720,kernel.all.load,-1,,1\n",
    )
    .unwrap();
    let source = ArchiveSource::new(HashMap::new());
    let load = [Ustr::from("kernel.all.load")];
    let err = source.open(&test_node(&restarted), &load).err().unwrap();
    assert!(summutils::classify(&err) == ProcessingError::CollectorRestarted);

    let changed = dir.path().join("changed");
    std::fs::write(
        &changed,
        "1590969600,disk.dev.read_bytes,0,sda,1\n1590969660,disk.dev.read_bytes,0,sda,2\n1590969660,disk.dev.read_bytes,1,sdb,2\n",
    )
    .unwrap();
    let disk = [Ustr::from("disk.dev.read_bytes")];
    let err = source.open(&test_node(&changed), &disk).err().unwrap();
    assert!(summutils::classify(&err) == ProcessingError::IndomChanged);

    // A mark outside the node window does not matter.
    let early = dir.path().join("early");
    std::fs::write(&early, "1590969500,<mark>,-1,,0\n1590969600,kernel.all.load,-1,,1\n").unwrap();
    assert!(source.open(&test_node(&early), &load).is_ok());
}
