// Per-node counter archives and the job they belong to: locate, clip and merge the archives, repair
// narrow counters, and present a node's data as a stream of samples from either a local archive or
// a remote time-series service.

mod archive;
mod archivesource;
mod job;
mod logtree;
mod merge;
mod metrics;
mod promsource;
mod rangechange;

// The archive file format.

pub use archive::archive_label;
pub use archive::merge_records;
pub use archive::write_archive;
pub use archive::Archive;
pub use archive::ArchiveRecord;
pub use archive::ArchiveValue;
pub use archive::MARK;

// The job model.

pub use job::Job;
pub use job::JobInfo;
pub use job::JobNode;
pub use job::CLIP_SLACK_SECS;

// Find the raw archives for a job's nodes.

pub use logtree::attach_raw_archives;
pub use logtree::find_archives;
pub use logtree::node_names;

// Clip and merge raw archives into one archive per node.

pub use merge::adjust_job_start_end;
pub use merge::extract_and_merge_logs;
pub use merge::job_output_dir;
pub use merge::MergeSettings;
pub use merge::MergeTool;
pub use merge::DEFAULT_FORCE_TIMEOUT_SECS;

// The view of a node's data that analytics consume, and its two implementations.

pub use archivesource::ArchiveSource;
pub use metrics::MetricDesc;
pub use metrics::MetricKind;
pub use metrics::MetricSource;
pub use metrics::MetricStream;
pub use metrics::NodeSpec;
pub use metrics::Sample;
pub use promsource::parse_response;
pub use promsource::PromClient;
pub use promsource::PromMapping;
pub use promsource::PromResult;
pub use promsource::PromSource;

// Widening of wrapping counters.

pub use rangechange::RangeChange;
