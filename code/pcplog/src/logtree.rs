/// Locate the raw archives for a job in an archive tree.
///
/// The tree has one directory per host below the root, and the collector writes its archives into
/// the host's directory:
///
///   <log_dir>/<hostname>/<archive>
///
/// Marker archives are written when a job starts and ends and are named `job-<id>-begin...` and
/// `job-<id>-end...`.  Every other file is a periodic archive.
///
use crate::archive::archive_label;
use crate::job::{Job, CLIP_SLACK_SECS};

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use summutils::{epoch_secs_f64, Timestamp};
use tracing::debug;
use ustr::Ustr;

/// The archives in `<log_dir>/<node>` that may hold data for job `jobid` in `[from, to]`: the
/// job's own marker archives, and every periodic archive whose label overlaps the window widened
/// by the clip slack.  Markers belonging to other jobs are skipped.  Archives whose label cannot be
/// read are included so that the merge stage can report them.  Names are sorted.
///
/// A missing host directory yields an empty list; an unreadable one is an error.

pub fn find_archives(
    log_dir: &Path,
    node: &str,
    jobid: &str,
    from: Timestamp,
    to: Timestamp,
) -> Result<Vec<PathBuf>> {
    if !log_dir.is_dir() {
        bail!("Not a viable archive directory: {}", log_dir.display());
    }
    let host_dir = log_dir.join(node);
    if !host_dir.is_dir() {
        return Ok(vec![]);
    }

    let begin_marker = format!("job-{jobid}-begin");
    let end_marker = format!("job-{jobid}-end");
    let lo = epoch_secs_f64(from) - CLIP_SLACK_SECS as f64;
    let hi = epoch_secs_f64(to) + CLIP_SLACK_SECS as f64;

    let mut archives = vec![];
    for entry in host_dir.read_dir()? {
        // Bad directory entries are ignored; the read_dir iterator makes progress past them.
        let Ok(entry) = entry else { continue };
        let p = entry.path();
        if !p.is_file() {
            continue;
        }
        let Some(name) = p.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with("job-") {
            if name.starts_with(&begin_marker) || name.starts_with(&end_marker) {
                archives.push(p);
            }
            continue;
        }
        match archive_label(&p) {
            Ok((start, end)) => {
                if end >= lo && start <= hi {
                    archives.push(p);
                }
            }
            Err(e) => {
                debug!("Keeping unreadable archive {}: {e:#}", p.display());
                archives.push(p);
            }
        }
    }
    archives.sort();
    Ok(archives)
}

/// Populate the raw archives of every node in the job from the tree.  Returns the number of nodes
/// that have any.

pub fn attach_raw_archives(job: &mut Job, log_dir: &Path) -> Result<usize> {
    let mut found = 0;
    for node in job.node_names() {
        let archives = find_archives(log_dir, &node, job.local_job_id(), job.start_time(), job.end_time())?;
        if !archives.is_empty() {
            found += 1;
        }
        job.set_raw_archives(node, archives)?;
    }
    Ok(found)
}

// Convenience for hosts given as strings.

pub fn node_names(names: &[String]) -> Vec<Ustr> {
    names.iter().map(|n| Ustr::from(n.as_str())).collect::<Vec<Ustr>>()
}

#[test]
fn test_find_archives() {
    let log_dir = Path::new("../tests/archives");
    let from = summutils::timestamp_from_ymdhms(2020, 6, 1, 0, 0, 0).unwrap();
    let to = summutils::timestamp_from_ymdhms(2020, 6, 1, 0, 10, 0).unwrap();

    let n2 = find_archives(log_dir, "n2", "1001", from, to).unwrap();
    let names = n2
        .iter()
        .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
        .collect::<Vec<String>>();
    assert!(
        names
            == vec![
                "20200601.00.00".to_string(),
                "job-1001-begin-20200601.00.00.03".to_string(),
                "job-1001-end-20200601.00.09.58".to_string()
            ]
    );

    // Other jobs' markers are not included.
    let other = find_archives(log_dir, "n2", "1002", from, to).unwrap();
    assert!(other.len() == 1);

    assert!(find_archives(log_dir, "n99", "1001", from, to).unwrap().is_empty());
    assert!(find_archives(Path::new("../tests/nonexistent"), "n1", "1001", from, to).is_err());
}

#[test]
fn test_attach_raw_archives() {
    let mut job = crate::job::test_job("1001", &["n1", "n2", "n3"]);
    let found = attach_raw_archives(&mut job, Path::new("../tests/archives")).unwrap();
    assert!(found == 2);
    assert!(job.raw_archives().len() == 2);
    assert!(!job.has_enough_raw_archives());
}
