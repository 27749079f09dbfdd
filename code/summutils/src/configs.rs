/// Read the summarization configuration from a commented json file.
///
/// The file is `config.json` in the configuration directory.  It is ordinary json except that any
/// line whose first non-blank characters are `//` is a comment and is removed before parsing; no
/// other bytes are touched, so the sequence newline-blanks-`//` must not appear inside a string.
///
/// The directory is searched for in this order: an explicit path, $SUPREMM_CONFIG_DIR,
/// /etc/supremm, and finally etc/supremm next to the installed executable.
///
/// Sections used by the pipeline:
///
///   summary - object with `archive_out_dir` and `subdir_out_format`
///   outputdatabase - object describing the output sink, see summarize/src/output.rs
///   normalization - object mapping a metric name to `{ "range": bits }` for narrow counters
///   resources - object mapping a resource name to its settings; a resource with
///      `"enabled": false` is skipped
///   xdmodroot - string, optional, the XDMoD configuration directory
///
/// A section may instead be `{ "include": "xdmod://<section>" }`, in which case its contents are
/// taken from that section of the XDMoD portal settings: portal_settings.ini followed by
/// portal_settings.d/*.ini in name order, later files winning.  Those files are only read if some
/// section asks for them, and only once.
///
use anyhow::{bail, Context, Result};
use config::FileFormat;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

const CONFIG_FILE: &str = "config.json";

pub struct Config {
    confpath: PathBuf,
    document: Map<String, Value>,
    xdmod: OnceLock<Result<config::Config, String>>,
}

impl Config {
    pub fn new(confpath: Option<&Path>) -> Result<Config> {
        let confpath = match confpath {
            Some(p) => p.to_path_buf(),
            None => match autodetect_confpath() {
                Some(p) => p,
                None => bail!("No configuration directory found"),
            },
        };
        if !confpath.is_dir() {
            bail!("Missing configuration path {}", confpath.display());
        }
        let conffile = confpath.join(CONFIG_FILE);
        debug!("Using config file {}", conffile.display());
        let text = fs::read_to_string(&conffile)
            .with_context(|| format!("Reading {}", conffile.display()))?;
        Config::from_text(&text, &confpath)
            .with_context(|| format!("Syntax error in {}", conffile.display()))
    }

    pub fn from_text(text: &str, confpath: &Path) -> Result<Config> {
        let v = serde_json::from_str(&strip_comments(text)?)?;
        if let Value::Object(document) = v {
            Ok(Config {
                confpath: confpath.to_path_buf(),
                document,
                xdmod: OnceLock::new(),
            })
        } else {
            bail!("Expected an object value")
        }
    }

    pub fn confpath(&self) -> &Path {
        &self.confpath
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.document.contains_key(name)
    }

    /// The named section, with any xdmod:// include resolved.

    pub fn getsection(&self, name: &str) -> Result<Value> {
        let Some(section) = self.document.get(name) else {
            bail!("Missing configuration section '{name}'")
        };
        if let Value::Object(fields) = section {
            if let Some(include) = fields.get("include") {
                let Value::String(url) = include else {
                    bail!("Include in section '{name}' must be a string")
                };
                return self.process_include(name, url);
            }
        }
        Ok(section.clone())
    }

    fn process_include(&self, name: &str, url: &str) -> Result<Value> {
        let Some(xdmodsection) = url.strip_prefix("xdmod://") else {
            bail!("Unsupported include url {url} in section {name}")
        };
        let settings = match self.xdmod.get_or_init(|| self.parse_xdmod().map_err(|e| format!("{e:#}"))) {
            Ok(settings) => settings,
            Err(msg) => bail!("{msg}"),
        };
        let table = settings
            .get_table(xdmodsection)
            .map_err(|_| anyhow::anyhow!("Unable to locate include data for {url}"))?;
        let mut result = Map::new();
        for (k, v) in table {
            let s = v
                .into_string()
                .with_context(|| format!("Non-scalar value for '{k}' in {url}"))?;
            result.insert(k, str_to_native(&s));
        }
        Ok(Value::Object(result))
    }

    fn parse_xdmod(&self) -> Result<config::Config> {
        let Some(Value::String(root)) = self.document.get("xdmodroot") else {
            bail!("An xdmod:// include requires the 'xdmodroot' setting")
        };
        let root = Path::new(root);
        let mut files = vec![root.join("portal_settings.ini")];
        let pattern = root.join("portal_settings.d").join("*.ini");
        let mut extra = glob::glob(&pattern.to_string_lossy())?
            .filter_map(|p| p.ok())
            .collect::<Vec<PathBuf>>();
        extra.sort();
        files.extend(extra);

        let mut builder = config::Config::builder();
        let mut nread = 0;
        for f in &files {
            if f.is_file() {
                debug!("Reading XDMoD settings from {}", f.display());
                builder = builder.add_source(config::File::new(&f.to_string_lossy(), FileFormat::Ini));
                nread += 1;
            }
        }
        if nread == 0 {
            bail!(
                "Unable to read XDMoD configuration file.  Locations scanned: {}",
                files.iter().map(|f| f.display().to_string()).collect::<Vec<String>>().join(", ")
            );
        }
        Ok(builder.build()?)
    }

    /// Enabled resources in name order, each with its name injected as `name`.

    pub fn resourceconfigs(&self) -> Result<Vec<(String, Map<String, Value>)>> {
        let Some(Value::Object(resources)) = self.document.get("resources") else {
            bail!("The section 'resources' is required")
        };
        let mut result = vec![];
        for (resname, resdata) in resources {
            let Value::Object(fields) = resdata else {
                bail!("Resource '{resname}' must be an object")
            };
            if grab_bool_opt(fields, "enabled")? == Some(false) {
                continue;
            }
            let mut fields = fields.clone();
            fields.insert("name".to_string(), Value::String(resname.to_string()));
            result.push((resname.to_string(), fields));
        }
        Ok(result)
    }

    pub fn resourceconfig(&self, name: &str) -> Result<Map<String, Value>> {
        match self.resourceconfigs()?.into_iter().find(|(n, _)| n == name) {
            Some((_, fields)) => Ok(fields),
            None => bail!("No enabled resource named '{name}'"),
        }
    }

    /// Metric name -> register width in bits, for counters that wrap.

    pub fn normalization(&self) -> Result<HashMap<String, u32>> {
        let mut result = HashMap::new();
        if !self.has_section("normalization") {
            return Ok(result);
        }
        let Value::Object(metrics) = self.getsection("normalization")? else {
            bail!("The section 'normalization' must be an object")
        };
        for (metric, spec) in &metrics {
            let Value::Object(fields) = spec else {
                bail!("Normalization for '{metric}' must be an object")
            };
            match grab_u64_opt(fields, "range")? {
                Some(bits) if bits >= 1 && bits <= 64 => {
                    result.insert(metric.to_string(), bits as u32);
                }
                _ => bail!("Normalization for '{metric}' needs a 'range' between 1 and 64"),
            }
        }
        Ok(result)
    }
}

pub fn autodetect_confpath() -> Option<PathBuf> {
    let mut searchpaths = vec![];
    if let Ok(dir) = env::var("SUPREMM_CONFIG_DIR") {
        searchpaths.push(PathBuf::from(dir));
    }
    searchpaths.push(PathBuf::from("/etc/supremm"));
    if let Ok(exe) = env::current_exe() {
        if let Some(bindir) = exe.parent() {
            searchpaths.push(bindir.join("../etc/supremm"));
        }
    }
    searchpaths.into_iter().find(|p| p.join(CONFIG_FILE).exists())
}

/// Drop every line whose first non-blank characters are `//`.  All other bytes, line terminators
/// included, are kept exactly.

pub fn strip_comments(text: &str) -> Result<String> {
    let comment = Regex::new(r"^\s*//")?;
    Ok(text
        .split_inclusive('\n')
        .filter(|line| !comment.is_match(line))
        .collect::<String>())
}

/// INI values are untyped: strip surrounding double quotes, then take an integer if it parses.

pub fn str_to_native(value: &str) -> Value {
    let v = value.trim_matches('"');
    match v.parse::<i64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::String(v.to_string()),
    }
}

pub fn grab_string(fields: &Map<String, Value>, name: &str) -> Result<String> {
    if let Some(Value::String(s)) = fields.get(name) {
        Ok(s.to_string())
    } else {
        bail!("Field '{name}' must be present and have a string value");
    }
}

pub fn grab_string_opt(fields: &Map<String, Value>, name: &str) -> Result<Option<String>> {
    match fields.get(name) {
        Some(Value::String(s)) => Ok(Some(s.to_string())),
        Some(_) => bail!("Field '{name}' must have a string value"),
        None => Ok(None),
    }
}

pub fn grab_u64_opt(fields: &Map<String, Value>, name: &str) -> Result<Option<u64>> {
    match fields.get(name) {
        Some(Value::Number(n)) => match n.as_u64() {
            Some(n) => Ok(Some(n)),
            None => bail!("Field '{name}' must have unsigned integer value"),
        },
        Some(_) => bail!("Field '{name}' must have unsigned integer value"),
        None => Ok(None),
    }
}

pub fn grab_f64_opt(fields: &Map<String, Value>, name: &str) -> Result<Option<f64>> {
    match fields.get(name) {
        Some(Value::Number(n)) => match n.as_f64() {
            Some(n) => Ok(Some(n)),
            None => bail!("Field '{name}' must have a numeric value"),
        },
        Some(_) => bail!("Field '{name}' must have a numeric value"),
        None => Ok(None),
    }
}

pub fn grab_bool_opt(fields: &Map<String, Value>, name: &str) -> Result<Option<bool>> {
    match fields.get(name) {
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => bail!("Field '{name}' must have a boolean value"),
        None => Ok(None),
    }
}

pub fn grab_strings_opt(fields: &Map<String, Value>, name: &str) -> Result<Vec<String>> {
    let mut result = vec![];
    match fields.get(name) {
        Some(Value::Array(vals)) => {
            for v in vals {
                if let Value::String(s) = v {
                    result.push(s.to_string());
                } else {
                    bail!("Field '{name}' must have string values");
                }
            }
        }
        Some(_) => bail!("Field '{name}' must be an array of strings"),
        None => {}
    }
    Ok(result)
}

#[test]
fn test_strip_comments() {
    let text = "{\n  // a comment\n\t//another\n  \"url\": \"http://example.org\", // trailing\n  \"n\": 1\n}\n";
    assert!(serde_json::from_str::<Value>(text).is_err());
    let stripped = strip_comments(text).unwrap();
    assert!(stripped == "{\n  \"url\": \"http://example.org\", // trailing\n  \"n\": 1\n}\n");
}

#[test]
fn test_strip_comments_makes_parseable() {
    let text = "// header\n{\n    // \"skipped\": true,\n    \"kept\": \"a // b\"\n}";
    let v: Value = serde_json::from_str(&strip_comments(text).unwrap()).unwrap();
    assert!(v["kept"] == "a // b");
    assert!(v.get("skipped").is_none());
}

#[test]
fn test_str_to_native() {
    assert!(str_to_native("42") == Value::from(42));
    assert!(str_to_native("\"42\"") == Value::from(42));
    assert!(str_to_native("hello") == Value::from("hello"));
    assert!(str_to_native("\"hello\"") == Value::from("hello"));
    assert!(str_to_native("4.5") == Value::from("4.5"));
}

#[test]
fn test_config_file() {
    let conf = Config::new(Some(Path::new("../tests/config"))).unwrap();
    let summary = conf.getsection("summary").unwrap();
    assert!(summary["subdir_out_format"] == "%r/%j");

    let resources = conf.resourceconfigs().unwrap();
    assert!(resources.len() == 2);
    assert!(resources.iter().all(|(name, fields)| fields["name"] == name.as_str()));
    assert!(resources.iter().all(|(name, _)| name != "retired"));
    assert!(conf.resourceconfig("retired").is_err());

    let norm = conf.normalization().unwrap();
    assert!(norm.get("network.interface.in.bytes") == Some(&32));
    assert!(norm.get("kernel.all.load").is_none());
}

#[test]
fn test_xdmod_include() {
    let dir = tempfile::tempdir().unwrap();
    let xdmod = dir.path().join("xdmod");
    fs::create_dir_all(xdmod.join("portal_settings.d")).unwrap();
    fs::write(
        xdmod.join("portal_settings.ini"),
        "[datawarehouse]\nhost = \"localhost\"\nport = \"3306\"\nuser = base\n",
    )
    .unwrap();
    fs::write(xdmod.join("portal_settings.d/10-site.ini"), "[datawarehouse]\nuser = site\n").unwrap();
    fs::write(xdmod.join("portal_settings.d/20-local.ini"), "[datawarehouse]\nuser = local\n").unwrap();
    let text = format!(
        "{{\n// xdmod\n\"xdmodroot\": \"{}\",\n\"datawarehouse\": {{ \"include\": \"xdmod://datawarehouse\" }},\n\"other\": {{ \"include\": \"xdmod://missing\" }},\n\"bad\": {{ \"include\": \"file:///etc/passwd\" }}\n}}\n",
        xdmod.display()
    );
    let conf = Config::from_text(&text, dir.path()).unwrap();
    let dw = conf.getsection("datawarehouse").unwrap();
    assert!(dw["host"] == "localhost");
    assert!(dw["port"] == 3306);
    assert!(dw["user"] == "local");
    assert!(conf.getsection("other").is_err());
    assert!(conf.getsection("bad").is_err());
}

#[test]
fn test_xdmod_not_read_without_include() {
    let text = "{ \"xdmodroot\": \"/nonexistent\", \"summary\": { \"archive_out_dir\": \"/tmp\" } }";
    let conf = Config::from_text(text, Path::new(".")).unwrap();
    assert!(conf.getsection("summary").is_ok());
    assert!(conf.xdmod.get().is_none());
}
