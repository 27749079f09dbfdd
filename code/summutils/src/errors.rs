// Classified processing failures.  The numeric codes are stored in summary documents and must never
// be renumbered; code 19 is intentionally unused.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProcessingError {
    RawCounterUnavailable = 1,
    JobTooShort = 2,
    InsufficientData = 3,
    InsufficientHostdata = 4,
    CpusetUnknown = 5,
    CollectorRestarted = 6,
    IndomChanged = 7,
    MergeError = 8,
    ParallelTooShort = 9,
    InvalidNodecount = 10,
    JobTooBig = 11,
    TimeTooShort = 12,
    TimeTooLong = 13,
    Unknown = 14,
    NoArchives = 15,
    SummarizationError = 16,
    RawArchivesMissing = 17,
    JobTooManyNodehours = 18,
    MetricServiceError = 20,
}

use ProcessingError::*;

impl ProcessingError {
    pub const ALL: [ProcessingError; 19] = [
        RawCounterUnavailable,
        JobTooShort,
        InsufficientData,
        InsufficientHostdata,
        CpusetUnknown,
        CollectorRestarted,
        IndomChanged,
        MergeError,
        ParallelTooShort,
        InvalidNodecount,
        JobTooBig,
        TimeTooShort,
        TimeTooLong,
        Unknown,
        NoArchives,
        SummarizationError,
        RawArchivesMissing,
        JobTooManyNodehours,
        MetricServiceError,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<ProcessingError> {
        ProcessingError::ALL.iter().copied().find(|e| e.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            RawCounterUnavailable => "raw-counter-unavailable",
            JobTooShort => "job-too-short",
            InsufficientData => "insufficient-data",
            InsufficientHostdata => "insufficient-hostdata",
            CpusetUnknown => "cpuset-unknown",
            CollectorRestarted => "collector-restarted-during-job",
            IndomChanged => "indom-changed-during-job",
            MergeError => "merge-error",
            ParallelTooShort => "parallel-too-short",
            InvalidNodecount => "invalid-nodecount",
            JobTooBig => "job-too-big",
            TimeTooShort => "time-too-short",
            TimeTooLong => "time-too-long",
            Unknown => "unknown",
            NoArchives => "no-archives",
            SummarizationError => "summarization-error",
            RawArchivesMissing => "raw-archives-missing",
            JobTooManyNodehours => "job-too-many-nodehours",
            MetricServiceError => "metric-service-error",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            RawCounterUnavailable => "Required raw metrics not available.",
            JobTooShort => "The job was too short.",
            InsufficientData => "There were too few datapoints.",
            InsufficientHostdata => "Not all of the hosts had raw metrics available",
            CpusetUnknown => "The cpuset that was assigned to the job is unavailable",
            CollectorRestarted => "The metric collector restarted during the job",
            IndomChanged => "The instance domains for required metrics changed during the job",
            MergeError => "Generic failure in the archive merge step",
            ParallelTooShort => "Parallel job ran for too short of a time",
            InvalidNodecount => "Fewer than 1 node reported for this job",
            JobTooBig => "Processing skipped due to large node count in job",
            TimeTooShort => "Job ran for too short of a time to provide enough performance data",
            TimeTooLong => "Job consumed an impossible amount of walltime",
            Unknown => "Job cannot be summarized for unknown reason",
            NoArchives => "None of the nodes in the job have archives",
            SummarizationError => {
                "There were enough archives to try summarization, but too few archives were successfully processed"
            }
            RawArchivesMissing => "Not enough raw archives to try the archive merge",
            JobTooManyNodehours => "Total job node hours exceeded threshold",
            MetricServiceError => "An error occurred with the metric service during summarization",
        }
    }

    /// Code -> human string for every defined error, for publishing alongside stored summaries.

    pub fn doc() -> BTreeMap<u32, &'static str> {
        ProcessingError::ALL
            .iter()
            .map(|e| (e.code(), e.description()))
            .collect()
    }
}

impl fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl Serialize for ProcessingError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.code())
    }
}

/// A failure that carries its classification through `anyhow::Error`.  Code that needs the kind
/// recovers it with `classify`.

#[derive(Debug, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct ClassifiedError {
    pub kind: ProcessingError,
    pub detail: String,
}

impl ClassifiedError {
    pub fn new(kind: ProcessingError, detail: impl Into<String>) -> ClassifiedError {
        ClassifiedError {
            kind,
            detail: detail.into(),
        }
    }
}

// Errors without a classification anywhere in their chain are Unknown.

pub fn classify(err: &anyhow::Error) -> ProcessingError {
    err.chain()
        .find_map(|e| e.downcast_ref::<ClassifiedError>())
        .map(|c| c.kind)
        .unwrap_or(Unknown)
}

#[test]
fn test_codes_are_stable() {
    assert!(RawCounterUnavailable.code() == 1);
    assert!(CollectorRestarted.code() == 6);
    assert!(MergeError.code() == 8);
    assert!(JobTooManyNodehours.code() == 18);
    assert!(MetricServiceError.code() == 20);
    assert!(ProcessingError::from_code(19).is_none());
    assert!(ProcessingError::from_code(0).is_none());
    for e in ProcessingError::ALL {
        assert!(ProcessingError::from_code(e.code()) == Some(e));
    }
    assert!(ProcessingError::doc().len() == 19);
}

#[test]
fn test_classify() {
    let e: anyhow::Error = ClassifiedError::new(IndomChanged, "cpu count changed").into();
    let e = e.context("node n1");
    assert!(classify(&e) == IndomChanged);
    assert!(classify(&anyhow::anyhow!("plain")) == Unknown);
    assert!(serde_json::to_string(&MetricServiceError).unwrap() == "20");
}
