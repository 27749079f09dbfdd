/// `summarize_jobs` -- Turn per-node counter archives into one summary document per job.
///
/// Jobs are taken from an accounting file (see accounting.rs) for every enabled resource in the
/// configuration, or for the one given by --resource, by name or resource id.  Which jobs are
/// selected:
///
///  - with --local-job-id (which needs --resource): that job, whatever its state
///  - with --start and --end: jobs that ended in that range, by default all of them
///  - otherwise: jobs that have not been processed, that failed, or that were processed by an
///    older version
///
/// The --process-* flags narrow the selection by processing state.  Selecting every job without a
/// time range is refused.
///
/// Processing state is kept in a csv process log, by default `processed.csv` next to the accounting
/// file.  Logging goes to stderr, and RUST_LOG overrides -d and -q.
///
/// With --load, previously written summary files are stored in the document store instead.
mod accounting;
mod cputimeseries;
mod devicedelta;
mod loadavg;
mod output;
mod plugins;
mod power;
mod preprocs;
mod process;
mod subsample;
mod summarize;

use accounting::{Accounting, AccountingError, JobRecord, Selection};
use output::{Output, OutputEngine};
use process::{DataSource, Driver, Options};

use anyhow::{bail, Result};
use clap::Parser;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process as proc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use summutils::{grab_bool_opt, grab_string_opt, grab_u64_opt, parse_timestamp, Config, Timestamp};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration directory [default: $SUPREMM_CONFIG_DIR, then /etc/supremm]
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Job accounting records (json)
    #[arg(long, short)]
    accounting: Option<PathBuf>,

    /// Instead of summarizing, upsert the summary files (*.json) below this directory into the
    /// document store's outputdatabase.collection
    #[arg(long)]
    load: Option<PathBuf>,

    /// Log of processed jobs [default: processed.csv next to the accounting file]
    #[arg(long)]
    process_log: Option<PathBuf>,

    /// Process only jobs on this resource, by name or resource id
    #[arg(long, short)]
    resource: Option<String>,

    /// Process only the job with this local job id (needs --resource)
    #[arg(long, short = 'j')]
    local_job_id: Option<String>,

    /// Process jobs that ended at this time or later (needs --end)
    #[arg(long, short, value_parser = parse_time)]
    start: Option<Timestamp>,

    /// Process jobs that ended at this time or earlier (needs --start)
    #[arg(long, short, value_parser = parse_time)]
    end: Option<Timestamp>,

    /// Select jobs in every processing state
    #[arg(long, short = 'A')]
    process_all: bool,

    /// Select jobs that failed to process
    #[arg(long, short = 'B')]
    process_bad: bool,

    /// Select jobs processed by an older version
    #[arg(long, short = 'O')]
    process_old: bool,

    /// Select jobs that have not been processed
    #[arg(long, short = 'N')]
    process_notdone: bool,

    /// Select jobs processed by the current version
    #[arg(long, short = 'C')]
    process_current: bool,

    /// Number of worker threads
    #[arg(long, short, default_value_t = 1)]
    threads: usize,

    /// Skip jobs with more nodes than this (0 for no limit)
    #[arg(long, short = 'M', default_value_t = 0)]
    max_nodes: usize,

    /// Skip jobs whose node count times walltime exceeds this many seconds
    #[arg(long)]
    max_nodetime: Option<i64>,

    /// Skip jobs shorter than this many seconds
    #[arg(long)]
    min_duration: Option<i64>,

    /// Skip multi-node jobs shorter than this many seconds
    #[arg(long)]
    min_parallel_duration: Option<i64>,

    /// Skip jobs running this many seconds or longer
    #[arg(long, default_value_t = process::DEFAULT_MAX_DURATION_SECS)]
    max_duration: i64,

    /// Seconds after a job's end after which it is marked as processed even if its data are missing
    #[arg(long, short = 'T')]
    timeout: Option<i64>,

    /// Tag to add to the summarization section of every summary
    #[arg(long)]
    tag: Option<String>,

    /// Keep the job-level archives after processing
    #[arg(long)]
    keep: bool,

    /// Only extract the job-level archives (implies --keep)
    #[arg(long, short = 'E')]
    extract_only: bool,

    /// Put the job-level archives in this directory, which is emptied first (single job only)
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Summarize but store nothing in a document store and log nothing as processed
    #[arg(long, short = 'n')]
    dry_run: bool,

    /// Stop at the first node or job that fails
    #[arg(long)]
    fail_fast: bool,

    /// Log debug messages
    #[arg(long, short)]
    debug: bool,

    /// Log only errors
    #[arg(long, short)]
    quiet: bool,
}

fn parse_time(s: &str) -> Result<Timestamp, String> {
    parse_timestamp(s).map_err(|e| e.to_string())
}

enum Mode {
    Single(String),
    TimeRange(Timestamp, Timestamp, Selection),
    Unprocessed(Selection),
}

fn mode(cli: &Cli) -> Result<Mode> {
    let mut selection = Selection {
        notdone: cli.process_notdone,
        bad: cli.process_bad,
        old: cli.process_old,
        current: cli.process_current,
    };
    let none_selected = selection == Selection::default();
    if cli.process_all {
        selection = Selection::all();
    }

    if let Some(id) = &cli.local_job_id {
        if cli.resource.is_none() {
            bail!("--local-job-id requires --resource");
        }
        return Ok(Mode::Single(id.clone()));
    }
    match (cli.start, cli.end) {
        (Some(start), Some(end)) => {
            if none_selected {
                selection = Selection::all();
            }
            Ok(Mode::TimeRange(start, end, selection))
        }
        (None, None) => {
            if none_selected {
                selection = Selection::unprocessed();
            }
            if selection.is_all() {
                bail!("Cannot process all jobs without a time range");
            }
            Ok(Mode::Unprocessed(selection))
        }
        _ => bail!("--start and --end must be used together"),
    }
}

fn main() {
    match summarize_jobs() {
        Ok(()) => {}
        Err(msg) => {
            eprintln!("ERROR: {:#}", msg);
            proc::exit(1);
        }
    }
}

fn summarize_jobs() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let conf = Config::new(cli.config.as_deref())?;
    if let Some(dir) = &cli.load {
        return load(&conf, dir);
    }

    let mode = mode(&cli)?;
    if cli.threads == 0 {
        bail!("--threads must be at least 1");
    }
    let Some(records) = &cli.accounting else {
        bail!("--accounting is required")
    };
    let process_log = match &cli.process_log {
        Some(p) => p.clone(),
        None => records.parent().unwrap_or(Path::new(".")).join("processed.csv"),
    };
    let accounting = Accounting::load(records, &process_log)?;

    let defaults = Options::default();
    let options = Options {
        min_parallel_duration: cli.min_parallel_duration,
        min_duration: cli.min_duration,
        max_nodes: cli.max_nodes,
        max_nodetime: cli.max_nodetime,
        max_duration: cli.max_duration,
        force_timeout: cli.timeout.unwrap_or(defaults.force_timeout),
        tag: cli.tag.clone(),
        extract_only: cli.extract_only,
        dodelete: !(cli.keep || cli.extract_only),
        dry_run: cli.dry_run,
        fail_fast: cli.fail_fast,
    };
    let cancel = AtomicBool::new(false);

    for (name, mut resconf) in conf.resourceconfigs()? {
        let resource_id = grab_u64_opt(&resconf, "resource_id")?;
        if let Some(wanted) = &cli.resource {
            if *wanted != name && Some(wanted.as_str()) != resource_id.map(|id| id.to_string()).as_deref() {
                continue;
            }
        }
        info!("Processing resource {name}");

        if let (Some(dir), Mode::Single(_)) = (&cli.output, &mode) {
            resconf.insert(
                "job_output_dir".to_string(),
                Value::String(dir.to_string_lossy().to_string()),
            );
        }
        let mut options = options.clone();
        if grab_bool_opt(&resconf, "fail_fast")? == Some(true) {
            options.fail_fast = true;
        }

        let cluster = grab_string_opt(&resconf, "cluster")?.unwrap_or(name.clone());
        let jobs = match select_jobs(&accounting, &cluster, &mode) {
            Ok(jobs) => jobs,
            Err(e) if cli.resource.is_none() && e.downcast_ref::<AccountingError>().is_some() => {
                warn!("Skipping resource {name}: {e}");
                continue;
            }
            Err(e) => return Err(e),
        };
        debug!("{} jobs selected on {name}", jobs.len());

        let datasource = DataSource::from_config(&conf, &resconf)?;
        let engine = OutputEngine::from_config(&conf, &resconf, cli.dry_run)?;
        let output = Output::open(&engine, &resconf)?;
        let driver = Driver {
            resconf: &resconf,
            datasource: &datasource,
            output: &output,
            accounting: &accounting,
            options: &options,
            cancel: &cancel,
        };

        let succeeded = run_jobs(&driver, &jobs, cli.threads);
        info!("Resource {name}: {succeeded} of {} jobs succeeded", jobs.len());
        output.close()?;

        if cancel.load(Ordering::Relaxed) {
            bail!("Stopped after a failure on resource {name}");
        }
    }
    Ok(())
}

fn load(conf: &Config, dir: &Path) -> Result<()> {
    let collection = output::load_collection(conf)?;
    let Value::Object(outconf) = conf.getsection("outputdatabase")? else {
        bail!("The section 'outputdatabase' must be an object")
    };
    let OutputEngine::DocumentStore { uri, dbname } =
        OutputEngine::from_section(&outconf, &serde_json::Map::new(), false)?
    else {
        bail!("Loading summaries needs a document store")
    };
    let store = output::DirectoryStore::open(&uri, &dbname)?;
    let n = output::load_directory(&store, &collection, dir)?;
    info!("Loaded {n} summaries from {} into {collection}", dir.display());
    Ok(())
}

fn select_jobs(accounting: &Accounting, cluster: &str, mode: &Mode) -> Result<Vec<JobRecord>> {
    match mode {
        Mode::Single(id) => accounting.get_by_local_job_id(cluster, id),
        Mode::TimeRange(start, end, selection) => {
            accounting.get_by_time_range(cluster, *start, *end, *selection)
        }
        Mode::Unprocessed(selection) => accounting.get(cluster, *selection),
    }
}

// Worker k takes every job whose index is k modulo the number of workers.  Returns the number of
// jobs that succeeded.

fn run_jobs(driver: &Driver, jobs: &[JobRecord], threads: usize) -> usize {
    let threads = threads.min(jobs.len()).max(1);
    if threads == 1 {
        return run_worker(driver, jobs, 0, 1);
    }
    thread::scope(|s| {
        let workers = (0..threads)
            .map(|k| s.spawn(move || run_worker(driver, jobs, k, threads)))
            .collect::<Vec<_>>();
        workers
            .into_iter()
            .map(|w| match w.join() {
                Ok(n) => n,
                Err(_) => {
                    warn!("A worker thread panicked");
                    0
                }
            })
            .sum()
    })
}

fn run_worker(driver: &Driver, jobs: &[JobRecord], k: usize, n: usize) -> usize {
    let mut succeeded = 0;
    for job in jobs.iter().skip(k).step_by(n) {
        if driver.cancel.load(Ordering::Relaxed) {
            break;
        }
        if driver.process_job(job) {
            succeeded += 1;
        }
    }
    succeeded
}
