/// Counter archives: one file per host and collection period, one sample value per line.
///
/// Each line is comma-separated, without a header:
///
///   epoch-seconds, metric-name, instance-id, instance-label, value
///
/// The instance id is -1 (and the label empty) for a metric without instances.  Lines starting
/// with '#' are comments, except metadata lines of the form
///
///   #unit, metric-name, unit
///
/// which give the unit of a metric.  Lines must be in non-decreasing time order, and lines with the
/// same time form one record.  A line whose metric name is `<mark>` is a mark record: the collector
/// was restarted at that time and there may be a gap or a change in the set of instances.
///
/// An archive's label is the time of its first and last records.  An empty archive is unusable.
///
use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use ustr::Ustr;

pub const MARK: &str = "<mark>";
pub const UNIT: &str = "#unit";

// How much of the end of an archive to read at first when looking for its last record.
const LABEL_TAIL_BYTES: u64 = 4096;

#[derive(Clone, Debug, PartialEq)]
pub struct ArchiveValue {
    pub metric: Ustr,
    pub instance: i64,
    pub label: Ustr,
    pub value: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArchiveRecord {
    pub timestamp: f64,
    pub mark: bool,
    pub values: Vec<ArchiveValue>,
}

#[derive(Debug)]
pub struct Archive {
    pub path: PathBuf,
    pub units: BTreeMap<Ustr, String>,
    pub records: Vec<ArchiveRecord>,
}

type Row = (f64, String, i64, String, f64);

impl Archive {
    pub fn open(path: &Path) -> Result<Archive> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .with_context(|| format!("Opening archive {}", path.display()))?;
        let mut units = BTreeMap::new();
        let mut records: Vec<ArchiveRecord> = vec![];
        for row in rdr.records() {
            let row = row.with_context(|| format!("Reading archive {}", path.display()))?;
            match row.get(0) {
                Some(UNIT) => {
                    if let (Some(metric), Some(unit)) = (row.get(1), row.get(2)) {
                        units.insert(Ustr::from(metric), unit.to_string());
                    }
                    continue;
                }
                Some(f) if f.starts_with('#') => continue,
                _ => {}
            }
            let (timestamp, metric, instance, label, value) = row
                .deserialize::<Row>(None)
                .with_context(|| format!("Reading archive {}", path.display()))?;
            if !timestamp.is_finite() {
                bail!("Bad timestamp in archive {}", path.display());
            }
            let starts_record = match records.last() {
                Some(last) if last.timestamp > timestamp => {
                    bail!("Records out of order in archive {} at {timestamp}", path.display())
                }
                Some(last) => last.timestamp != timestamp,
                None => true,
            };
            if starts_record {
                records.push(ArchiveRecord {
                    timestamp,
                    mark: false,
                    values: vec![],
                });
            }
            let n = records.len();
            let rec = &mut records[n - 1];
            if metric == MARK {
                rec.mark = true;
            } else {
                rec.values.push(ArchiveValue {
                    metric: Ustr::from(metric.as_str()),
                    instance,
                    label: Ustr::from(label.as_str()),
                    value,
                });
            }
        }
        if records.is_empty() {
            bail!("Archive {} is empty", path.display());
        }
        Ok(Archive {
            path: path.to_path_buf(),
            units,
            records,
        })
    }

    pub fn start(&self) -> f64 {
        self.records.first().map(|r| r.timestamp).unwrap_or(0.0)
    }

    pub fn end(&self) -> f64 {
        self.records.last().map(|r| r.timestamp).unwrap_or(0.0)
    }

    pub fn metrics(&self) -> BTreeSet<Ustr> {
        self.records
            .iter()
            .flat_map(|r| r.values.iter().map(|v| v.metric))
            .collect::<BTreeSet<Ustr>>()
    }

    /// Records with `begin <= timestamp <= end`.

    pub fn clip(&self, begin: f64, end: f64) -> Vec<ArchiveRecord> {
        self.records
            .iter()
            .filter(|r| r.timestamp >= begin && r.timestamp <= end)
            .cloned()
            .collect::<Vec<ArchiveRecord>>()
    }
}

/// Read the label of an archive, its first and last timestamps, from the first record line and the
/// last one.  Only the head of the file up to the first record and a block at its end are read, so
/// lines in between are not checked.

pub fn archive_label(path: &Path) -> Result<(f64, f64)> {
    let mut f = File::open(path).with_context(|| format!("Opening archive {}", path.display()))?;
    let len = f.metadata()?.len();

    let mut first = None;
    for line in BufReader::new(&mut f).lines() {
        if let Some(t) = line_time(&line?, path)? {
            first = Some(t);
            break;
        }
    }
    let Some(first) = first else {
        bail!("Archive {} is empty", path.display())
    };

    let mut tail = LABEL_TAIL_BYTES;
    loop {
        let from = len.saturating_sub(tail);
        f.seek(SeekFrom::Start(from))?;
        let mut buf = vec![];
        f.read_to_end(&mut buf)?;
        let text = String::from_utf8_lossy(&buf);
        // Unless we are at the start of the file the first line is probably partial.
        let skip = if from > 0 { 1 } else { 0 };
        for line in text.lines().skip(skip).collect::<Vec<&str>>().into_iter().rev() {
            if let Some(last) = line_time(line, path)? {
                if last < first {
                    bail!("Records out of order in archive {}", path.display());
                }
                return Ok((first, last));
            }
        }
        if from == 0 {
            bail!("Archive {} is empty", path.display());
        }
        tail *= 2;
    }
}

// The time of a record line, or None for a comment or a blank line.

fn line_time(line: &str, path: &Path) -> Result<Option<f64>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let field = line.split(',').next().unwrap_or("").trim();
    match field.parse::<f64>() {
        Ok(t) if t.is_finite() => Ok(Some(t)),
        _ => bail!("Bad timestamp in archive {}", path.display()),
    }
}

/// Merge record streams that are each in time order into one stream in time order.  Records with
/// equal timestamps are combined; when two streams carry the same metric and instance at the same
/// time the first stream's value is kept.

pub fn merge_records(streams: Vec<Vec<ArchiveRecord>>) -> Vec<ArchiveRecord> {
    let mut all = streams
        .into_iter()
        .enumerate()
        .flat_map(|(k, s)| s.into_iter().map(move |r| (k, r)))
        .collect::<Vec<(usize, ArchiveRecord)>>();
    // Stable, so stream order breaks ties.
    all.sort_by(|(ka, a), (kb, b)| a.timestamp.total_cmp(&b.timestamp).then(ka.cmp(kb)));

    let mut merged: Vec<ArchiveRecord> = vec![];
    for (_, rec) in all {
        match merged.last_mut() {
            Some(last) if last.timestamp == rec.timestamp => {
                last.mark = last.mark || rec.mark;
                for v in rec.values {
                    if !last
                        .values
                        .iter()
                        .any(|w| w.metric == v.metric && w.instance == v.instance)
                    {
                        last.values.push(v);
                    }
                }
            }
            _ => merged.push(rec),
        }
    }
    merged
}

pub fn write_archive(path: &Path, units: &BTreeMap<Ustr, String>, records: &[ArchiveRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Creating archive {}", path.display()))?;
    for (metric, unit) in units {
        wtr.write_record([UNIT, metric.as_str(), unit.as_str()])?;
    }
    for r in records {
        if r.mark {
            wtr.serialize((r.timestamp, MARK, -1i64, "", 0.0f64))?;
        }
        for v in &r.values {
            wtr.serialize((r.timestamp, v.metric.as_str(), v.instance, v.label.as_str(), v.value))?;
        }
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
pub fn test_record(timestamp: f64, values: &[(&str, i64, f64)]) -> ArchiveRecord {
    ArchiveRecord {
        timestamp,
        mark: false,
        values: values
            .iter()
            .map(|(metric, instance, value)| ArchiveValue {
                metric: Ustr::from(*metric),
                instance: *instance,
                label: if *instance < 0 {
                    Ustr::from("")
                } else {
                    Ustr::from(format!("i{instance}").as_str())
                },
                value: *value,
            })
            .collect::<Vec<ArchiveValue>>(),
    }
}

#[test]
fn test_read_archive() {
    let a = Archive::open(Path::new("../tests/archives/n1/20200601.00.00")).unwrap();
    assert!(a.start() == 1590969540.0);
    assert!(a.end() == 1590970260.0);
    assert!(a.records.len() == 13);
    assert!(a.records[0].values.len() == 7);
    let metrics = a.metrics();
    assert!(metrics.contains(&Ustr::from("kernel.all.load")));
    assert!(metrics.contains(&Ustr::from("network.interface.in.bytes")));
    assert!(a.clip(1590969600.0, 1590969720.0).len() == 3);
}

#[test]
fn test_bad_archives() {
    let dir = tempfile::tempdir().unwrap();
    let empty = dir.path().join("empty");
    fs::write(&empty, "# nothing here\n").unwrap();
    assert!(Archive::open(&empty).is_err());

    let unordered = dir.path().join("unordered");
    fs::write(&unordered, "100,m,-1,,1\n90,m,-1,,2\n").unwrap();
    assert!(Archive::open(&unordered).is_err());

    let garbage = dir.path().join("garbage");
    fs::write(&garbage, "not,an,archive\n").unwrap();
    assert!(Archive::open(&garbage).is_err());

    assert!(Archive::open(&dir.path().join("missing")).is_err());
}

#[test]
fn test_write_and_merge() {
    let dir = tempfile::tempdir().unwrap();
    let a = vec![
        test_record(10.0, &[("m", -1, 1.0)]),
        test_record(30.0, &[("m", -1, 3.0)]),
    ];
    let mut b = vec![
        test_record(20.0, &[("m", -1, 2.0)]),
        test_record(30.0, &[("m", -1, 99.0), ("n", 0, 5.0)]),
    ];
    b[0].mark = true;
    let merged = merge_records(vec![a, b]);
    assert!(merged.len() == 3);
    assert!(merged[1].mark);
    assert!(merged[2].values.len() == 2);
    assert!(merged[2].values[0].value == 3.0);

    let mut units = BTreeMap::new();
    units.insert(Ustr::from("m"), "byte".to_string());
    let path = dir.path().join("out").join("n1");
    write_archive(&path, &units, &merged).unwrap();
    let back = Archive::open(&path).unwrap();
    assert!(back.records == merged);
    assert!(back.units == units);
}

#[test]
fn test_archive_label() {
    let fixture = Path::new("../tests/archives/n1/20200601.00.00");
    let a = Archive::open(fixture).unwrap();
    assert!(archive_label(fixture).unwrap() == (a.start(), a.end()));

    // A long archive with trailing comments longer than the first block read from the end.
    let dir = tempfile::tempdir().unwrap();
    let long = dir.path().join("long");
    let mut text = "# header, with a comma\n#unit,m,byte\n".to_string();
    for k in 0..2000 {
        text += &format!("{},m,-1,,{k}\n", 1000 + k);
    }
    text += &format!("# {}\n\n", "x".repeat(LABEL_TAIL_BYTES as usize * 3));
    fs::write(&long, &text).unwrap();
    assert!(archive_label(&long).unwrap() == (1000.0, 2999.0));
    assert!(Archive::open(&long).unwrap().units[&Ustr::from("m")] == "byte");

    // A record line without a trailing newline.
    let short = dir.path().join("short");
    fs::write(&short, "10,m,-1,,1\n20,m,-1,,2").unwrap();
    assert!(archive_label(&short).unwrap() == (10.0, 20.0));

    let empty = dir.path().join("empty");
    fs::write(&empty, "# nothing here\n#unit,m,byte\n").unwrap();
    assert!(archive_label(&empty).is_err());
    let garbage = dir.path().join("garbage");
    fs::write(&garbage, "not,an,archive\n").unwrap();
    assert!(archive_label(&garbage).is_err());
    assert!(archive_label(&dir.path().join("missing")).is_err());
}
