/// Where finished summaries go.
///
/// The engine is chosen by `outputdatabase.db_engine` in the configuration, or by the older `type`
/// key when `db_engine` is absent:
///
///  - "mongodb" or "docstore": a document store.  The summary's `_id` is `<acct.id>-<acct.end_time>`,
///    the job's metadata is merged into its `summarization` section, and it is upserted into the
///    collection `resource_<resource_id>`.  A `timeseries` section is moved out of the summary into
///    the collection `timeseries-resource_<resource_id>` under the same `_id`.
///  - "file": `json_format` is "fragment", "complete" or "both".  A fragment file (`frag_file`)
///    gets the resource id and the summary, then an `MDATA:` line with the metadata, for every job
///    as it finishes; it is not valid JSON as a whole.  A complete file (`comp_file`, with %r
///    replaced by the resource name) is written when the output is closed, as one JSON array of
///    summary, metadata, summary, metadata, ... in the order the jobs finished.
///  - "stdout": like a fragment file, on standard output.
///  - "discard": nothing is written.
///
/// The document store lives in a local directory, named by `uri` as a path or a `file://` URI.  A URI
/// naming a database server is refused when the output is opened, so nothing is written locally in
/// its place.  A document store is replaced by "discard" in a dry run.  An Output may be shared
/// between threads.
///
use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use summutils::{grab_string, grab_string_opt, grab_u64_opt, Config};
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq)]
pub enum OutputEngine {
    DocumentStore { uri: String, dbname: String },
    File { fragment: Option<PathBuf>, complete: Option<PathBuf> },
    Stdout,
    Discard,
}

impl OutputEngine {
    pub fn from_config(conf: &Config, resconf: &Map<String, Value>, dry_run: bool) -> Result<OutputEngine> {
        let Value::Object(outconf) = conf.getsection("outputdatabase")? else {
            bail!("The section 'outputdatabase' must be an object")
        };
        OutputEngine::from_section(&outconf, resconf, dry_run)
    }

    pub fn from_section(
        outconf: &Map<String, Value>,
        resconf: &Map<String, Value>,
        dry_run: bool,
    ) -> Result<OutputEngine> {
        let engine = match grab_string_opt(outconf, "db_engine")? {
            Some(e) => e,
            None => match grab_string_opt(outconf, "type")? {
                Some(e) => e,
                None => bail!("outputdatabase needs a 'db_engine'"),
            },
        };
        match engine.to_lowercase().as_str() {
            "mongodb" | "docstore" => {
                if dry_run {
                    return Ok(OutputEngine::Discard);
                }
                let dbname = match grab_string_opt(outconf, "dbname")? {
                    Some(d) => d,
                    None => grab_string_opt(outconf, "db")?.unwrap_or("supremm".to_string()),
                };
                Ok(OutputEngine::DocumentStore {
                    uri: grab_string(outconf, "uri")?,
                    dbname,
                })
            }
            "file" => {
                let (fragment, complete) = match grab_string(outconf, "json_format")?.as_str() {
                    "fragment" => (true, false),
                    "complete" => (false, true),
                    "both" => (true, true),
                    other => bail!("Not a valid json_format: {other}"),
                };
                let fragment = if fragment {
                    Some(PathBuf::from(grab_string(outconf, "frag_file")?))
                } else {
                    None
                };
                let complete = if complete {
                    let name = grab_string(resconf, "name")?;
                    Some(PathBuf::from(grab_string(outconf, "comp_file")?.replace("%r", &name)))
                } else {
                    None
                };
                Ok(OutputEngine::File { fragment, complete })
            }
            "stdout" => Ok(OutputEngine::Stdout),
            "discard" => Ok(OutputEngine::Discard),
            _ => bail!("Unsupported output mechanism {engine}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
    Unchanged,
}

/// A store of JSON documents keyed by `_id` within named collections.

pub trait DocumentStore: Send + Sync {
    fn upsert(&self, collection: &str, id: &str, doc: &Value) -> Result<Upsert>;

    /// Insert all the documents; fails without writing anything if any id is already present.

    fn insert_many(&self, collection: &str, docs: &[(String, Value)]) -> Result<()>;

    fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    fn count(&self, collection: &str) -> Result<usize>;
}

/// A document store in a directory tree: `<uri>/<dbname>/<collection>/<id>.json`.  Documents are
/// written to a temporary file and renamed into place.
///
/// `uri` is a path or a `file://` URL; any other scheme is an error.

pub struct DirectoryStore {
    root: PathBuf,
    serial: AtomicU64,
}

impl DirectoryStore {
    pub fn open(uri: &str, dbname: &str) -> Result<DirectoryStore> {
        let dir = match uri.split_once("://") {
            None => uri,
            Some(("file", path)) => path,
            Some((scheme, _)) => bail!("Document store '{uri}' is not reachable: no {scheme} client, use a directory"),
        };
        if dir.is_empty() || dbname.is_empty() || dbname.contains('/') {
            bail!("Unusable document store '{uri}' database '{dbname}'");
        }
        let root = Path::new(dir).join(dbname);
        fs::create_dir_all(&root).with_context(|| format!("Creating store {}", root.display()))?;
        Ok(DirectoryStore {
            root,
            serial: AtomicU64::new(0),
        })
    }

    fn document_path(&self, collection: &str, id: &str) -> Result<PathBuf> {
        for (what, name) in [("collection", collection), ("id", id)] {
            if name.is_empty() || name.starts_with('.') || name.contains('/') || name.contains('\\') {
                bail!("Unusable document {what} '{name}'");
            }
        }
        Ok(self.root.join(collection).join(format!("{id}.json")))
    }

    fn write(&self, path: &Path, doc: &Value) -> Result<()> {
        let Some(dir) = path.parent() else {
            bail!("No directory for {}", path.display())
        };
        fs::create_dir_all(dir)?;
        let tmp = dir.join(format!(
            ".{}.{}.tmp",
            std::process::id(),
            self.serial.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, serde_json::to_vec(doc)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl DocumentStore for DirectoryStore {
    fn upsert(&self, collection: &str, id: &str, doc: &Value) -> Result<Upsert> {
        let path = self.document_path(collection, id)?;
        let outcome = match self.get(collection, id)? {
            Some(existing) if existing == *doc => return Ok(Upsert::Unchanged),
            Some(_) => Upsert::Replaced,
            None => Upsert::Inserted,
        };
        self.write(&path, doc)?;
        Ok(outcome)
    }

    fn insert_many(&self, collection: &str, docs: &[(String, Value)]) -> Result<()> {
        for (id, _) in docs {
            if self.document_path(collection, id)?.exists() {
                bail!("Duplicate key {id} in {collection}");
            }
        }
        for (id, doc) in docs {
            self.write(&self.document_path(collection, id)?, doc)?;
        }
        Ok(())
    }

    fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let path = self.document_path(collection, id)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn count(&self, collection: &str) -> Result<usize> {
        let dir = self.root.join(collection);
        if !dir.is_dir() {
            return Ok(0);
        }
        let mut n = 0;
        for entry in fs::read_dir(&dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with('.') && name.ends_with(".json") {
                n += 1;
            }
        }
        Ok(n)
    }
}

enum Sink {
    Store {
        store: Box<dyn DocumentStore>,
        collection: String,
        timeseries: String,
    },
    File {
        fragment: Option<Mutex<BufWriter<File>>>,
        complete: Option<(PathBuf, Mutex<Vec<Value>>)>,
    },
    Stdout(Mutex<()>),
    Discard,
}

pub struct Output {
    resource_id: u64,
    sink: Sink,
}

impl Output {
    pub fn open(engine: &OutputEngine, resconf: &Map<String, Value>) -> Result<Output> {
        let Some(resource_id) = grab_u64_opt(resconf, "resource_id")? else {
            bail!("Resource needs a 'resource_id'")
        };
        let sink = match engine {
            OutputEngine::DocumentStore { uri, dbname } => {
                let store = DirectoryStore::open(uri, dbname)?;
                info!("Writing summaries to {uri}/{dbname}");
                Output::store_sink(Box::new(store), resource_id)
            }
            OutputEngine::File { fragment, complete } => {
                let fragment = match fragment {
                    Some(path) => {
                        let f = File::create(path)
                            .with_context(|| format!("Creating {}", path.display()))?;
                        Some(Mutex::new(BufWriter::new(f)))
                    }
                    None => None,
                };
                Sink::File {
                    fragment,
                    complete: complete.clone().map(|p| (p, Mutex::new(vec![]))),
                }
            }
            OutputEngine::Stdout => Sink::Stdout(Mutex::new(())),
            OutputEngine::Discard => Sink::Discard,
        };
        Ok(Output { resource_id, sink })
    }

    pub fn with_store(store: Box<dyn DocumentStore>, resource_id: u64) -> Output {
        Output {
            resource_id,
            sink: Output::store_sink(store, resource_id),
        }
    }

    fn store_sink(store: Box<dyn DocumentStore>, resource_id: u64) -> Sink {
        let collection = format!("resource_{resource_id}");
        Sink::Store {
            store,
            timeseries: format!("timeseries-{collection}"),
            collection,
        }
    }

    pub fn process(&self, summary: Value, mdata: Value) -> Result<()> {
        match &self.sink {
            Sink::Store {
                store,
                collection,
                timeseries,
            } => {
                let (id, summary, ts) = prepare_document(summary, mdata)?;
                if let Some(ts) = ts {
                    store.upsert(timeseries, &id, &ts)?;
                }
                let outcome = store.upsert(collection, &id, &summary)?;
                debug!("{id}: {outcome:?}");
            }
            Sink::File { fragment, complete } => {
                if let Some(f) = fragment {
                    let mut f = lock(f)?;
                    write_fragment(&mut *f, self.resource_id, &summary, &mdata)?;
                    f.flush()?;
                }
                if let Some((_, docs)) = complete {
                    let mut docs = lock(docs)?;
                    docs.push(summary);
                    docs.push(mdata);
                }
            }
            Sink::Stdout(guard) => {
                let _guard = lock(guard)?;
                let stdout = io::stdout();
                let mut out = stdout.lock();
                write_fragment(&mut out, self.resource_id, &summary, &mdata)?;
                out.flush()?;
            }
            Sink::Discard => {}
        }
        Ok(())
    }

    /// Process several jobs at once.  A document store gets one bulk insert, and falls back to
    /// upserting the documents one at a time if that fails.

    pub fn process_batch(&self, batch: Vec<(Value, Value)>) -> Result<()> {
        let Sink::Store {
            store,
            collection,
            timeseries,
        } = &self.sink
        else {
            for (summary, mdata) in batch {
                self.process(summary, mdata)?;
            }
            return Ok(());
        };

        let mut docs = vec![];
        let mut series = vec![];
        for (summary, mdata) in batch {
            let (id, summary, ts) = prepare_document(summary, mdata)?;
            if let Some(ts) = ts {
                series.push((id.clone(), ts));
            }
            docs.push((id, summary));
        }
        for (coll, items) in [(timeseries, &series), (collection, &docs)] {
            if let Err(e) = store.insert_many(coll, items) {
                warn!("Bulk insert into {coll} failed, inserting one by one: {e}");
                for (id, doc) in items {
                    store.upsert(coll, id, doc)?;
                }
            }
        }
        Ok(())
    }

    /// Finish the output.  A complete-format file is written here.

    pub fn close(self) -> Result<()> {
        if let Sink::File { fragment, complete } = self.sink {
            if let Some(f) = fragment {
                let mut f = f.into_inner().map_err(|_| anyhow::anyhow!("Fragment file lock poisoned"))?;
                f.flush()?;
            }
            if let Some((path, docs)) = complete {
                let docs = docs
                    .into_inner()
                    .map_err(|_| anyhow::anyhow!("Summary buffer lock poisoned"))?;
                let f = File::create(&path).with_context(|| format!("Creating {}", path.display()))?;
                let mut w = BufWriter::new(f);
                serde_json::to_writer_pretty(&mut w, &docs)?;
                w.flush()?;
                info!("Wrote {} summaries to {}", docs.len() / 2, path.display());
            }
        }
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    match m.lock() {
        Ok(g) => Ok(g),
        Err(_) => bail!("Output lock poisoned"),
    }
}

fn write_fragment(w: &mut dyn Write, resource_id: u64, summary: &Value, mdata: &Value) -> Result<()> {
    writeln!(w, "{} {}", resource_id, serde_json::to_string_pretty(summary)?)?;
    writeln!(w, "MDATA:  {}", serde_json::to_string_pretty(mdata)?)?;
    Ok(())
}

/// The collection that summary files are loaded into: `collection` in the `outputdatabase`
/// section.  There is no default.

pub fn load_collection(conf: &Config) -> Result<String> {
    let Value::Object(outconf) = conf.getsection("outputdatabase")? else {
        bail!("The section 'outputdatabase' must be an object")
    };
    grab_string(&outconf, "collection").context("Loading summaries needs outputdatabase.collection")
}

/// Upsert every `*.json` file below `dir` into `collection` under its `_id`.  Returns the number of
/// documents stored.

pub fn load_directory(store: &dyn DocumentStore, collection: &str, dir: &Path) -> Result<usize> {
    let pattern = dir.join("**").join("*.json");
    let mut paths = glob::glob(&pattern.to_string_lossy())?
        .filter_map(|p| p.ok())
        .collect::<Vec<PathBuf>>();
    paths.sort();
    for p in &paths {
        let doc: Value = serde_json::from_str(&fs::read_to_string(p)?)
            .with_context(|| format!("Parsing {}", p.display()))?;
        let id = match doc.get("_id") {
            Some(id @ (Value::String(_) | Value::Number(_))) => value_text(id),
            _ => bail!("{} has no _id", p.display()),
        };
        store.upsert(collection, &id, &doc)?;
    }
    Ok(paths.len())
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The document's `_id`, the document with `_id` set and the metadata merged into its
/// `summarization` section, and its `timeseries` section split off and given the same `_id`.

pub fn prepare_document(summary: Value, mdata: Value) -> Result<(String, Value, Option<Value>)> {
    let Value::Object(mut summary) = summary else {
        bail!("A summary must be an object")
    };
    let (Some(id), Some(end)) = (
        summary.get("acct").and_then(|a| a.get("id")),
        summary.get("acct").and_then(|a| a.get("end_time")),
    ) else {
        bail!("A summary needs acct.id and acct.end_time")
    };
    let id = format!("{}-{}", value_text(id), value_text(end));
    summary.insert("_id".to_string(), Value::String(id.clone()));

    if let Value::Object(extra) = mdata {
        match summary.get_mut("summarization") {
            Some(Value::Object(s)) => s.extend(extra),
            _ => {
                summary.insert("summarization".to_string(), Value::Object(extra));
            }
        }
    }

    let timeseries = match summary.remove("timeseries") {
        Some(Value::Object(mut ts)) => {
            ts.insert("_id".to_string(), Value::String(id.clone()));
            Some(Value::Object(ts))
        }
        Some(_) => bail!("The timeseries section must be an object"),
        None => None,
    };
    Ok((id, Value::Object(summary), timeseries))
}

#[cfg(test)]
fn summary_for(id: &str) -> Value {
    serde_json::json!({
        "acct": { "id": id, "end_time": 1590970200 },
        "summarization": { "complete": true },
        "load1": { "mean": { "avg": 1.0, "cnt": 1 } },
        "timeseries": { "version": 4, "hosts": { "0": "n1" } },
    })
}

#[cfg(test)]
fn resconf() -> Map<String, Value> {
    let mut m = Map::new();
    m.insert("name".to_string(), Value::from("ub-hpc"));
    m.insert("resource_id".to_string(), Value::from(1));
    m
}

#[test]
fn test_engine_from_config() {
    use serde_json::json;
    let conf = Config::new(Some(Path::new("../tests/config"))).unwrap();
    let engine = OutputEngine::from_config(&conf, &resconf(), false).unwrap();
    assert!(
        engine
            == OutputEngine::DocumentStore {
                uri: "/tmp/supremm-test/store".to_string(),
                dbname: "supremm".to_string()
            }
    );
    assert!(OutputEngine::from_config(&conf, &resconf(), true).unwrap() == OutputEngine::Discard);

    let section = |v: Value| v.as_object().unwrap().clone();
    let both = section(json!({
        "db_engine": "file", "type": "mongodb", "json_format": "both",
        "frag_file": "/tmp/frag.txt", "comp_file": "/tmp/%r.json"
    }));
    assert!(
        OutputEngine::from_section(&both, &resconf(), false).unwrap()
            == OutputEngine::File {
                fragment: Some(PathBuf::from("/tmp/frag.txt")),
                complete: Some(PathBuf::from("/tmp/ub-hpc.json"))
            }
    );
    let db = section(json!({ "db_engine": "docstore", "uri": "/x", "db": "other" }));
    assert!(
        OutputEngine::from_section(&db, &resconf(), false).unwrap()
            == OutputEngine::DocumentStore {
                uri: "/x".to_string(),
                dbname: "other".to_string()
            }
    );
    let stdout = section(json!({ "db_engine": "STDOUT" }));
    assert!(OutputEngine::from_section(&stdout, &resconf(), true).unwrap() == OutputEngine::Stdout);

    for bad in [
        json!({ "db_engine": "postgres" }),
        json!({ "db_engine": "file", "json_format": "half" }),
        json!({ "db_engine": "file", "json_format": "fragment" }),
        json!({ "uri": "/x" }),
    ] {
        assert!(OutputEngine::from_section(&section(bad), &resconf(), false).is_err());
    }
}

#[test]
fn test_complete_file_output() {
    use serde_json::json;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("all.json");
    let engine = OutputEngine::File {
        fragment: None,
        complete: Some(path.clone()),
    };
    let output = Output::open(&engine, &resconf()).unwrap();
    output.process(summary_for("1"), json!({ "mergetime": 1.5 })).unwrap();
    output.process(summary_for("2"), json!({ "mergetime": 2.5 })).unwrap();
    assert!(!path.exists());
    output.close().unwrap();

    let written: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    let items = written.as_array().unwrap();
    assert!(items.len() == 4);
    assert!(items[0]["acct"]["id"] == json!("1"));
    assert!(items[1] == json!({ "mergetime": 1.5 }));
    assert!(items[2]["acct"]["id"] == json!("2"));
    assert!(items[3] == json!({ "mergetime": 2.5 }));
    // File output keeps the timeseries in the summary.
    assert!(items[0]["timeseries"]["version"] == json!(4));
}

#[test]
fn test_fragment_file_output() {
    use serde_json::json;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frag.txt");
    let engine = OutputEngine::File {
        fragment: Some(path.clone()),
        complete: None,
    };
    let output = Output::open(&engine, &resconf()).unwrap();
    output.process(summary_for("7"), json!({ "tag": "x" })).unwrap();
    output.close().unwrap();
    let text = fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("1 {"));
    let mdata_line = text.lines().position(|l| l.starts_with("MDATA:  {")).unwrap();
    assert!(mdata_line > 1);
    assert!(text.contains("\"tag\": \"x\""));
}

#[test]
fn test_document_store_output() {
    use serde_json::json;
    let dir = tempfile::tempdir().unwrap();
    let uri = dir.path().to_string_lossy().to_string();
    let engine = OutputEngine::DocumentStore {
        uri: uri.clone(),
        dbname: "supremm".to_string(),
    };
    let output = Output::open(&engine, &resconf()).unwrap();
    output.process(summary_for("1001"), json!({ "mergetime": 3.0 })).unwrap();

    let store = DirectoryStore::open(&uri, "supremm").unwrap();
    let doc = store.get("resource_1", "1001-1590970200").unwrap().unwrap();
    assert!(doc["_id"] == json!("1001-1590970200"));
    assert!(doc["summarization"] == json!({ "complete": true, "mergetime": 3.0 }));
    assert!(doc.get("timeseries").is_none());
    let ts = store.get("timeseries-resource_1", "1001-1590970200").unwrap().unwrap();
    assert!(ts["_id"] == json!("1001-1590970200") && ts["version"] == json!(4));

    // The same summary again changes nothing; a newer one replaces it under the same key.
    let (id, again, _) = prepare_document(summary_for("1001"), json!({ "mergetime": 3.0 })).unwrap();
    assert!(store.upsert("resource_1", &id, &again).unwrap() == Upsert::Unchanged);
    output.process(summary_for("1001"), json!({ "mergetime": 4.0 })).unwrap();
    assert!(store.count("resource_1").unwrap() == 1);
    assert!(store.count("timeseries-resource_1").unwrap() == 1);
    output.close().unwrap();
}

#[test]
fn test_batch_falls_back_to_upsert() {
    use serde_json::json;
    let dir = tempfile::tempdir().unwrap();
    let uri = dir.path().to_string_lossy().to_string();
    let output = Output::with_store(Box::new(DirectoryStore::open(&uri, "db").unwrap()), 5);
    output
        .process_batch(vec![(summary_for("1"), json!({})), (summary_for("2"), json!({}))])
        .unwrap();
    // "2" conflicts, so the bulk insert fails and every record is upserted instead.
    output
        .process_batch(vec![(summary_for("2"), json!({ "n": 2 })), (summary_for("3"), json!({}))])
        .unwrap();
    let store = DirectoryStore::open(&uri, "db").unwrap();
    assert!(store.count("resource_5").unwrap() == 3);
    assert!(store.count("timeseries-resource_5").unwrap() == 3);
    let two = store.get("resource_5", "2-1590970200").unwrap().unwrap();
    assert!(two["summarization"]["n"] == json!(2));
    assert!(store.insert_many("resource_5", &[("3-1590970200".to_string(), json!({}))]).is_err());
    assert!(store.get("resource_5", "../x").is_err());
}

#[test]
fn test_prepare_document_needs_identity() {
    use serde_json::json;
    assert!(prepare_document(json!({ "acct": { "id": "1" } }), json!({})).is_err());
    assert!(prepare_document(json!([]), json!({})).is_err());
    let (id, doc, ts) = prepare_document(json!({ "acct": { "id": 12, "end_time": 99 } }), json!({ "a": 1 })).unwrap();
    assert!(id == "12-99");
    assert!(ts.is_none());
    assert!(doc["summarization"] == json!({ "a": 1 }));
}

#[test]
fn test_load_directory() {
    use serde_json::json;
    let input = tempfile::tempdir().unwrap();
    fs::create_dir_all(input.path().join("2020/06")).unwrap();
    fs::write(input.path().join("a.json"), r#"{"_id": "1-10", "x": 1}"#).unwrap();
    fs::write(input.path().join("2020/06/b.json"), r#"{"_id": 7, "x": 2}"#).unwrap();
    fs::write(input.path().join("notes.txt"), "not a summary").unwrap();

    let out = tempfile::tempdir().unwrap();
    let store = DirectoryStore::open(&out.path().to_string_lossy(), "supremm").unwrap();
    assert!(load_directory(&store, "jobs", input.path()).unwrap() == 2);
    assert!(store.get("jobs", "7").unwrap().unwrap()["x"] == json!(2));
    // Loading again replaces nothing.
    assert!(load_directory(&store, "jobs", input.path()).unwrap() == 2);
    assert!(store.count("jobs").unwrap() == 2);

    fs::write(input.path().join("c.json"), r#"{"x": 3}"#).unwrap();
    assert!(load_directory(&store, "jobs", input.path()).is_err());

    let conf = Config::new(Some(Path::new("../tests/config"))).unwrap();
    assert!(load_collection(&conf).is_err());
}

#[test]
fn test_store_uri() {
    let dir = tempfile::tempdir().unwrap();
    let cwd = std::env::current_dir().unwrap();
    let section = serde_json::json!({ "db_engine": "mongodb", "uri": "mongodb://dbhost:27017/", "dbname": "supremm" });
    let engine = OutputEngine::from_section(section.as_object().unwrap(), &resconf(), false).unwrap();
    assert!(Output::open(&engine, &resconf()).is_err());
    assert!(!cwd.join("mongodb:").exists());

    let url = format!("file://{}", dir.path().display());
    let store = DirectoryStore::open(&url, "supremm").unwrap();
    store.upsert("c", "1", &serde_json::json!({ "_id": "1" })).unwrap();
    assert!(dir.path().join("supremm/c/1.json").exists());

    assert!(DirectoryStore::open("", "supremm").is_err());
    assert!(DirectoryStore::open(&dir.path().to_string_lossy(), "../x").is_err());
}
