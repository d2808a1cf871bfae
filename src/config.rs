use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::fcntl::{Flock, FlockArg};
use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::error::{ClusrunError, Result};
use crate::host::HostAddress;

pub const ROLE_CLUSNODE: &str = "clusnode role";
pub const ROLE_HEADNODE: &str = "headnode role";

pub const HEARTBEAT_INTERVAL_SECOND: &str = "heartbeat interval in seconds";
pub const HEARTBEAT_TIMEOUT_SECOND: &str = "mark node lost after no heartbeat for seconds";
pub const MAX_JOB_COUNT: &str = "max job count";
pub const STORE_OUTPUT: &str = "store output";
pub const HEADNODES_TO_REPORT: &str = "headnodes to report";

const CONFIG_LOCK_TIMEOUT: Duration = Duration::from_secs(3);

/// Startup configuration of a node process.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Name this node reports in heartbeats and answers validation with.
    pub node_name: String,
    /// Canonical host address other nodes dial to reach this node.
    pub host: HostAddress,
    pub listen_addr: SocketAddr,
    /// Root directory for jobs, groups, output and command scratch files.
    pub data_dir: PathBuf,
    pub config_file: PathBuf,
    /// File locked while the config document is written.
    pub lock_file: PathBuf,
    /// Headnodes to report to. When empty, the ones saved in the config
    /// file are used, falling back to this node itself.
    pub headnodes: Vec<String>,
}

impl NodeConfig {
    pub fn new(node_name: &str, port: u16, data_dir: PathBuf) -> Result<Self> {
        let node_name = node_name.to_uppercase();
        let host = HostAddress::parse(&format!("{}:{}", node_name, port), &node_name)?;
        let listen_addr = SocketAddr::from(([0, 0, 0, 0], port));
        Ok(Self {
            config_file: data_dir.join("clusrun.config"),
            lock_file: data_dir.join("clusrun.lock"),
            node_name,
            host,
            listen_addr,
            data_dir,
            headnodes: Vec::new(),
        })
    }

    pub fn with_host(mut self, host: HostAddress) -> Self {
        self.host = host;
        self
    }

    pub fn with_headnode(mut self, headnode: &str) -> Self {
        self.headnodes.push(headnode.to_string());
        self
    }
}

/// Uppercased OS hostname.
pub fn local_node_name() -> Result<String> {
    let name = nix::unistd::gethostname()
        .map_err(|e| ClusrunError::Config(format!("Failed to get hostname: {}", e)))?;
    Ok(name.to_string_lossy().to_uppercase())
}

fn positive(value: i64) -> std::result::Result<(), &'static str> {
    if value > 0 {
        Ok(())
    } else {
        Err("Value should be positive")
    }
}

/// A runtime setting. Each kind carries its own validation.
#[derive(Debug, Clone)]
pub enum Setting {
    Bool(bool),
    Int {
        value: i64,
        validate: fn(i64) -> std::result::Result<(), &'static str>,
    },
    Str(String),
}

impl Setting {
    fn positive_int(value: i64) -> Self {
        Setting::Int {
            value,
            validate: positive,
        }
    }

    /// Parse `raw` as this setting's kind and validate it, returning the new setting.
    fn parse(&self, raw: &str) -> std::result::Result<Setting, String> {
        let raw = raw.trim();
        match self {
            Setting::Bool(_) => raw
                .parse::<bool>()
                .map(Setting::Bool)
                .map_err(|_| format!("Failed to parse {:?} as bool", raw)),
            Setting::Int { validate, .. } => {
                let value = raw
                    .parse::<i64>()
                    .map_err(|_| format!("Failed to parse {:?} as int", raw))?;
                validate(value)?;
                Ok(Setting::Int {
                    value,
                    validate: *validate,
                })
            }
            Setting::Str(_) => Ok(Setting::Str(raw.to_string())),
        }
    }

    fn from_json(&self, value: &Value) -> std::result::Result<Setting, String> {
        match value {
            Value::String(s) => self.parse(s),
            other => self.parse(&other.to_string()),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Setting::Bool(b) => Value::Bool(*b),
            Setting::Int { value, .. } => Value::from(*value),
            Setting::Str(s) => Value::String(s.clone()),
        }
    }
}

impl std::fmt::Display for Setting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Setting::Bool(b) => write!(f, "{}", b),
            Setting::Int { value, .. } => write!(f, "{}", value),
            Setting::Str(s) => write!(f, "{}", s),
        }
    }
}

/// Typed registry of runtime settings for both roles.
#[derive(Debug)]
pub struct Settings {
    clusnode: RwLock<BTreeMap<&'static str, Setting>>,
    headnode: RwLock<BTreeMap<&'static str, Setting>>,
}

impl Default for Settings {
    fn default() -> Self {
        let clusnode = BTreeMap::from([(HEARTBEAT_INTERVAL_SECOND, Setting::positive_int(1))]);
        let headnode = BTreeMap::from([
            (HEARTBEAT_TIMEOUT_SECOND, Setting::positive_int(5)),
            (MAX_JOB_COUNT, Setting::positive_int(100)),
            (STORE_OUTPUT, Setting::Bool(true)),
        ]);
        Self {
            clusnode: RwLock::new(clusnode),
            headnode: RwLock::new(headnode),
        }
    }
}

impl Settings {
    fn role(&self, role: &str) -> Result<&RwLock<BTreeMap<&'static str, Setting>>> {
        match role {
            ROLE_CLUSNODE => Ok(&self.clusnode),
            ROLE_HEADNODE => Ok(&self.headnode),
            other => Err(ClusrunError::Config(format!("Invalid config role: {}", other))),
        }
    }

    /// Set settings of a role from raw strings. Returns a result message per key.
    pub fn set(&self, role: &str, configs: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
        let mut settings = self.role(role)?.write();
        let mut results = BTreeMap::new();
        for (key, raw) in configs {
            let message = match settings.get_mut(key.as_str()) {
                None => "Invalid config name".to_string(),
                Some(setting) => match setting.parse(raw) {
                    Ok(parsed) => {
                        tracing::info!(role, key = %key, value = %parsed, "Config set");
                        *setting = parsed;
                        setting.to_string()
                    }
                    Err(e) => e,
                },
            };
            results.insert(key.clone(), message);
        }
        Ok(results)
    }

    pub fn get(&self, role: &str) -> Result<BTreeMap<String, String>> {
        let settings = self.role(role)?.read();
        Ok(settings
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect())
    }

    fn int(&self, role: &RwLock<BTreeMap<&'static str, Setting>>, key: &str) -> i64 {
        match role.read().get(key) {
            Some(Setting::Int { value, .. }) => *value,
            _ => 0,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.int(&self.clusnode, HEARTBEAT_INTERVAL_SECOND).max(1) as u64)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.int(&self.headnode, HEARTBEAT_TIMEOUT_SECOND).max(1) as u64)
    }

    pub fn max_job_count(&self) -> usize {
        self.int(&self.headnode, MAX_JOB_COUNT).max(1) as usize
    }

    pub fn store_output(&self) -> bool {
        matches!(self.headnode.read().get(STORE_OUTPUT), Some(Setting::Bool(true)))
    }

    fn load_role(&self, role: &str, doc: &Map<String, Value>) -> Result<()> {
        let mut settings = self.role(role)?.write();
        for (key, setting) in settings.iter_mut() {
            if let Some(value) = doc.get(*key) {
                match setting.from_json(value) {
                    Ok(parsed) => *setting = parsed,
                    Err(e) => tracing::warn!(role, key, error = %e, "Ignoring saved config"),
                }
            }
        }
        Ok(())
    }

    fn save_role(&self, role: &str, doc: &mut Map<String, Value>) -> Result<()> {
        for (key, setting) in self.role(role)?.read().iter() {
            doc.insert(key.to_string(), setting.to_json());
        }
        Ok(())
    }
}

/// Config document shared by every node process started from the same
/// executable, nested host -> role -> setting -> value.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
    lock_path: PathBuf,
    host: String,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>, lock_path: impl Into<PathBuf>, host: &HostAddress) -> Self {
        Self {
            path: path.into(),
            lock_path: lock_path.into(),
            host: host.to_string(),
        }
    }

    fn read(&self) -> Result<Map<String, Value>> {
        let content = std::fs::read(&self.path)?;
        match serde_json::from_slice(&content)? {
            Value::Object(map) => Ok(map),
            _ => Err(ClusrunError::Config(format!(
                "{} is not a JSON object",
                self.path.display()
            ))),
        }
    }

    /// Apply saved settings and return the saved headnodes of this host.
    pub fn load(&self, settings: &Settings) -> Vec<String> {
        let doc = match self.read() {
            Ok(doc) => doc,
            Err(e) => {
                tracing::info!(path = %self.path.display(), error = %e, "No config loaded");
                return Vec::new();
            }
        };
        let Some(Value::Object(node)) = doc.get(&self.host) else {
            tracing::info!(host = %self.host, "No config saved for this node");
            return Vec::new();
        };

        let mut headnodes = Vec::new();
        if let Some(Value::Object(clusnode)) = node.get(ROLE_CLUSNODE) {
            if let Some(Value::Array(saved)) = clusnode.get(HEADNODES_TO_REPORT) {
                headnodes = saved
                    .iter()
                    .filter_map(|h| h.as_str().map(str::to_string))
                    .collect();
            }
            if let Err(e) = settings.load_role(ROLE_CLUSNODE, clusnode) {
                tracing::warn!(error = %e, "Failed to load clusnode config");
            }
        }
        if let Some(Value::Object(headnode)) = node.get(ROLE_HEADNODE) {
            if let Err(e) = settings.load_role(ROLE_HEADNODE, headnode) {
                tracing::warn!(error = %e, "Failed to load headnode config");
            }
        }
        headnodes
    }

    /// Write the settings of this host, keeping other hosts' entries.
    ///
    /// The saved headnodes are replaced only when `headnodes` is given.
    pub fn save(&self, settings: &Settings, headnodes: Option<&[String]>) -> Result<()> {
        let _lock = self.lock()?;

        let mut doc = self.read().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Rebuilding config file");
            Map::new()
        });
        let node = object_entry(&mut doc, &self.host);

        let clusnode = object_entry(node, ROLE_CLUSNODE);
        settings.save_role(ROLE_CLUSNODE, clusnode)?;
        if let Some(headnodes) = headnodes {
            clusnode.insert(
                HEADNODES_TO_REPORT.to_string(),
                Value::from(headnodes.to_vec()),
            );
        }

        let headnode = object_entry(node, ROLE_HEADNODE);
        settings.save_role(ROLE_HEADNODE, headnode)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(&Value::Object(doc))?)?;
        tracing::debug!(path = %self.path.display(), "Config saved");
        Ok(())
    }

    /// Run [`ConfigFile::save`] on the blocking pool so waiting for the
    /// lock never stalls the async runtime.
    pub async fn save_in_background(
        &self,
        settings: Arc<Settings>,
        headnodes: Option<Vec<String>>,
    ) -> Result<()> {
        let file = self.clone();
        tokio::task::spawn_blocking(move || file.save(&settings, headnodes.as_deref()))
            .await
            .map_err(|e| ClusrunError::Internal(format!("Config save task failed: {}", e)))?
    }

    fn lock(&self) -> Result<Flock<File>> {
        let deadline = Instant::now() + CONFIG_LOCK_TIMEOUT;
        let mut file = open_lock_file(&self.lock_path)?;
        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => return Ok(lock),
                Err((returned, errno)) => {
                    if Instant::now() >= deadline {
                        return Err(ClusrunError::Config(format!(
                            "Failed to lock {} within {:?}: {}",
                            self.lock_path.display(),
                            CONFIG_LOCK_TIMEOUT,
                            errno
                        )));
                    }
                    file = returned;
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

fn object_entry<'a>(map: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
    let entry = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    match entry {
        Value::Object(inner) => inner,
        _ => unreachable!("entry was just replaced with an object"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_default() {
        let settings = Settings::default();
        assert_eq!(settings.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(settings.heartbeat_timeout(), Duration::from_secs(5));
        assert_eq!(settings.max_job_count(), 100);
        assert!(settings.store_output());
    }

    #[test]
    fn settings_set_validates_per_kind() {
        let settings = Settings::default();
        let configs = BTreeMap::from([
            (MAX_JOB_COUNT.to_string(), "20".to_string()),
            (HEARTBEAT_TIMEOUT_SECOND.to_string(), "-3".to_string()),
            (STORE_OUTPUT.to_string(), "maybe".to_string()),
            ("no such setting".to_string(), "1".to_string()),
        ]);

        let results = settings.set(ROLE_HEADNODE, &configs).unwrap();

        assert_eq!(results[MAX_JOB_COUNT], "20");
        assert_eq!(results[HEARTBEAT_TIMEOUT_SECOND], "Value should be positive");
        assert!(results[STORE_OUTPUT].contains("bool"));
        assert_eq!(results["no such setting"], "Invalid config name");
        assert_eq!(settings.max_job_count(), 20);
        assert_eq!(settings.heartbeat_timeout(), Duration::from_secs(5));
        assert!(settings.store_output());
    }

    #[test]
    fn settings_reject_unknown_role() {
        let settings = Settings::default();
        assert!(settings.get("worker role").is_err());
    }

    #[test]
    fn node_config_new() {
        let cfg = NodeConfig::new("node1", 6000, PathBuf::from("/tmp/x")).unwrap();
        assert_eq!(cfg.node_name, "NODE1");
        assert_eq!(cfg.host.to_string(), "NODE1:6000");
        assert_eq!(cfg.listen_addr.port(), 6000);
        assert!(cfg.headnodes.is_empty());
    }

    #[test]
    fn config_file_round_trips_settings_and_headnodes() {
        let dir = tempfile::tempdir().unwrap();
        let host = HostAddress::parse("node1", "node1").unwrap();
        let file = ConfigFile::new(dir.path().join("cfg"), dir.path().join("lock"), &host);

        let settings = Settings::default();
        settings
            .set(
                ROLE_CLUSNODE,
                &BTreeMap::from([(HEARTBEAT_INTERVAL_SECOND.to_string(), "3".to_string())]),
            )
            .unwrap();
        file.save(&settings, Some(&["HEAD1:50505".to_string()][..])).unwrap();

        let reloaded = Settings::default();
        let headnodes = file.load(&reloaded);
        assert_eq!(headnodes, vec!["HEAD1:50505".to_string()]);
        assert_eq!(reloaded.heartbeat_interval(), Duration::from_secs(3));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn background_save_waits_for_lock_without_blocking_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let host = HostAddress::parse("node1", "node1").unwrap();
        let file = ConfigFile::new(dir.path().join("cfg"), dir.path().join("lock"), &host);
        let held = Flock::lock(
            open_lock_file(&dir.path().join("lock")).unwrap(),
            FlockArg::LockExclusive,
        )
        .unwrap();

        let settings = Arc::new(Settings::default());
        let release = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(held);
        };
        let (saved, _) = tokio::join!(
            file.save_in_background(settings, Some(vec!["HEAD1:50505".to_string()])),
            release
        );

        saved.unwrap();
        assert_eq!(file.load(&Settings::default()), vec!["HEAD1:50505".to_string()]);
    }
}
