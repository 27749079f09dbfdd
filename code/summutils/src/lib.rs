// Utilities shared by pcplog and summarize.

mod command;
mod configs;
mod dates;
mod errors;
mod statistics;

// Run a program with a timeout, draining its output.

pub use command::run_with_timeout;

// The summarization configuration, and helpers for picking typed fields out of its json objects.

pub use configs::autodetect_confpath;
pub use configs::grab_bool_opt;
pub use configs::grab_f64_opt;
pub use configs::grab_string;
pub use configs::grab_string_opt;
pub use configs::grab_strings_opt;
pub use configs::grab_u64_opt;
pub use configs::str_to_native;
pub use configs::strip_comments;
pub use configs::Config;

// Types and utilities for manipulating timestamps.

pub use dates::Timestamp;

// "A long long time ago".

pub use dates::epoch;

// The time right now.

pub use dates::now;

// Parse a &str into a Timestamp.

pub use dates::parse_timestamp;

// Given year, month, day, hour, minute, second (all UTC), return a Timestamp.

pub use dates::timestamp_from_ymdhms;

// Conversions to and from seconds since the epoch.

pub use dates::epoch_secs;
pub use dates::epoch_secs_f64;
pub use dates::timestamp_from_epoch;
pub use dates::timestamp_from_epoch_f64;

// Textual forms: merge tool -S/-T arguments, and %r/%j/strftime directory templates.

pub use dates::expand_path_template;
pub use dates::merge_tool_time;

// Classified failures with stable numeric codes.

pub use errors::classify;
pub use errors::ClassifiedError;
pub use errors::ProcessingError;

// One-pass and batch statistics, and a time integrator.

pub use statistics::describe;
pub use statistics::Description;
pub use statistics::Integrator;
pub use statistics::RollingStats;
pub use statistics::RollingSummary;
