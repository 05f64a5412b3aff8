//! Ordered INI-subset config parsing and process settings.
//!
//! Grounded on `rurouni/conf.py`'s `OrderedConfigParser`/`Settings`: sections
//! are read in file order (needed by the schema registry, where the first
//! matching pattern wins), values are `key = value` lines, and `#`/`;` start
//! a comment. Python's `ConfigParser` is a generic INI reader with many
//! features (interpolation, multi-line values) this system never uses; a
//! small ordered parser matches what `OrderedConfigParser` actually relies
//! on without pulling in a general config crate for a shape this narrow.

use std::fs;
use std::path::{Path, PathBuf};

use crate::rurouni::error::{Result, RurouniError};

/// One `[section]` block: its name and `key = value` pairs, in file order.
#[derive(Debug, Clone)]
pub struct IniSection {
    pub name: String,
    pub items: Vec<(String, String)>,
}

impl IniSection {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A parsed config file: an ordered list of sections.
#[derive(Debug, Clone, Default)]
pub struct IniDocument {
    pub sections: Vec<IniSection>,
}

/// Parse `path` as an ordered sequence of `[section]` blocks with
/// `key = value` lines. Fails if the file cannot be read (mirrors
/// `OrderedConfigParser.read`'s access check).
pub fn parse_ini(path: &Path) -> Result<IniDocument> {
    let text = fs::read_to_string(path).map_err(|e| {
        RurouniError::InvalidConfig(format!("cannot read config {}: {}", path.display(), e))
    })?;

    let mut sections = Vec::new();
    let mut current: Option<IniSection> = None;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            if let Some(section) = current.take() {
                sections.push(section);
            }
            current = Some(IniSection {
                name: line[1..line.len() - 1].to_string(),
                items: Vec::new(),
            });
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            RurouniError::InvalidConfig(format!("malformed config line: {:?}", raw_line))
        })?;
        let section = current.as_mut().ok_or_else(|| {
            RurouniError::InvalidConfig(format!(
                "config line outside any section: {:?}",
                raw_line
            ))
        })?;
        section
            .items
            .push((key.trim().to_lowercase(), value.trim().to_string()));
    }
    if let Some(section) = current.take() {
        sections.push(section);
    }

    Ok(IniDocument { sections })
}

/// Process-wide settings, mirroring `rurouni/conf.py`'s `defaults` dict and
/// `Settings.readFrom`. Unlike the Python original's mutable global
/// singleton, this is an explicitly constructed value threaded through the
/// writer/cache/receivers.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache_query_port: u16,
    pub cache_query_interface: String,
    pub line_receiver_port: u16,
    pub line_receiver_interface: String,
    pub pickle_receiver_port: u16,
    pub pickle_receiver_interface: String,
    pub default_wait_time: i64,
    pub rurouni_metric_interval: u32,
    pub rurouni_metric: String,
    pub log_updates: bool,
    pub conf_dir: PathBuf,
    pub local_data_dir: PathBuf,
    pub link_dir: PathBuf,
    pub instance: String,
    pub metrics_file: PathBuf,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            cache_query_port: 7002,
            cache_query_interface: "0.0.0.0".to_string(),
            line_receiver_port: 2003,
            line_receiver_interface: "0.0.0.0".to_string(),
            pickle_receiver_port: 2004,
            pickle_receiver_interface: "0.0.0.0".to_string(),
            default_wait_time: crate::kenshin::consts::DEFAULT_WAIT_TIME,
            rurouni_metric_interval: 60,
            rurouni_metric: "rurouni".to_string(),
            log_updates: true,
            conf_dir: PathBuf::new(),
            local_data_dir: PathBuf::new(),
            link_dir: PathBuf::new(),
            instance: "a".to_string(),
            metrics_file: PathBuf::new(),
        }
    }
}

impl Settings {
    /// Load the `[cache]` (and `[cache:<instance>.metrics]`, if present)
    /// sections of `path` over the defaults, the way
    /// `RurouniOptions.postOptions` does for a given `--instance`.
    pub fn load(path: &Path, instance: &str) -> Result<Settings> {
        let doc = parse_ini(path)?;
        let mut settings = Settings::default();
        settings.conf_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        settings.instance = instance.to_string();

        for section_name in ["cache", &format!("cache:{}.metrics", instance)] {
            if let Some(section) = doc.sections.iter().find(|s| s.name == section_name) {
                settings.apply(section)?;
            }
        }

        settings.metrics_file = settings.local_data_dir.join(&settings.instance);
        Ok(settings)
    }

    fn apply(&mut self, section: &IniSection) -> Result<()> {
        for (key, value) in &section.items {
            match key.as_str() {
                "cache_query_port" => self.cache_query_port = parse(key, value)?,
                "cache_query_interface" => self.cache_query_interface = value.clone(),
                "line_receiver_port" => self.line_receiver_port = parse(key, value)?,
                "line_receiver_interface" => self.line_receiver_interface = value.clone(),
                "pickle_receiver_port" => self.pickle_receiver_port = parse(key, value)?,
                "pickle_receiver_interface" => self.pickle_receiver_interface = value.clone(),
                "default_wait_time" => self.default_wait_time = parse(key, value)?,
                "rurouni_metric_interval" => self.rurouni_metric_interval = parse(key, value)?,
                "rurouni_metric" => self.rurouni_metric = value.clone(),
                "log_updates" => self.log_updates = parse_bool(key, value)?,
                "local_data_dir" => self.local_data_dir = PathBuf::from(value),
                "link_dir" => self.link_dir = PathBuf::from(value),
                // Unknown keys are tolerated, matching the Python loader's
                // best-effort numeric coercion for anything not in `defaults`.
                _ => {}
            }
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| RurouniError::InvalidConfig(format!("bad value for {}: {:?}", key, value)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(RurouniError::InvalidConfig(format!(
            "bad boolean value for {}: {:?}",
            key, value
        ))),
    }
}
