//! Configuration management for lutrainit.
//!
//! Two kinds of files live under the configuration base directory
//! (`/etc/lutrainit` by default): the main `lutra.conf` and one unit file per
//! service or target under `lutra.d/`. Both are INI. Unit parse failures are
//! logged and the offending file skipped. At boot, dangling references drop
//! the offending unit; on reload they reject the whole pass and leave the
//! previous table untouched. Dependency cycles always reject the pass.

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use regex::Regex;
use tracing::{error, info, warn};

use crate::{
    constants::{DEFAULT_LOG_FILE, UNIT_SUBDIR},
    deps,
    error::InitError,
    service::{LastAction, RunState, ServiceKind, ServiceRecord, ServiceTable},
};

/// Validates service, target and autologin names.
fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_\-.]+$").expect("static pattern is valid")
    })
}

/// Whether `name` is restricted to the characters unit names allow.
pub fn is_valid_name(name: &str) -> bool {
    name_pattern().is_match(name)
}

// ============================================================================
// INI scanning
// ============================================================================

/// A parsed INI document: section name (lowercased) to key/value map with
/// lowercased keys. Later duplicate keys win.
#[derive(Debug, Default)]
struct IniDocument {
    sections: HashMap<String, IniSection>,
}

#[derive(Debug, Default, Clone)]
struct IniSection {
    values: HashMap<String, String>,
}

impl IniDocument {
    /// Scans `content` line by line. Lines starting with `#` or `;` are
    /// comments; keys may be separated from values by `=` or `:`.
    fn parse(content: &str) -> Self {
        let mut sections: HashMap<String, IniSection> = HashMap::new();
        let mut current = String::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';')
            {
                continue;
            }

            if let Some(name) =
                line.strip_prefix('[').and_then(|l| l.strip_suffix(']'))
            {
                current = name.trim().to_ascii_lowercase();
                sections.entry(current.clone()).or_default();
                continue;
            }

            let Some(split) = line.find(['=', ':']) else {
                continue;
            };
            let key = line[..split].trim().to_ascii_lowercase();
            let value = line[split + 1..].trim().to_string();
            if key.is_empty() {
                continue;
            }
            sections
                .entry(current.clone())
                .or_default()
                .values
                .insert(key, value);
        }

        Self { sections }
    }

    fn section(&self, name: &str) -> Option<&IniSection> {
        self.sections.get(name)
    }
}

impl IniSection {
    fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn get_str(&self, key: &str, default: &str) -> String {
        self.get(key)
            .filter(|v| !v.is_empty())
            .unwrap_or(default)
            .to_string()
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key).map(str::to_ascii_lowercase).as_deref() {
            Some("true") | Some("yes") | Some("on") | Some("1") => true,
            Some("false") | Some("no") | Some("off") | Some("0") => false,
            _ => default,
        }
    }

    fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ============================================================================
// Main configuration
// ============================================================================

/// `[logging]` section of `lutra.conf`. Rotation parameters are carried for
/// the file sink; the sink currently appends only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Log file the daemon attaches once filesystems are mounted.
    pub filename: PathBuf,
    /// Whether the sink should rotate at all.
    pub rotate: bool,
    /// Rotate on day boundaries.
    pub rotate_daily: bool,
    /// Rotate when the file exceeds `1 << max_size_shift` bytes.
    pub max_size_shift: i64,
    /// Rotate when the file exceeds this many lines.
    pub max_lines: i64,
    /// Keep rotated files for this many days.
    pub max_days: i64,
    /// Sink buffer length.
    pub buffer_len: i64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filename: PathBuf::from(DEFAULT_LOG_FILE),
            rotate: true,
            rotate_daily: true,
            max_size_shift: 28,
            max_lines: 1_000_000,
            max_days: 7,
            buffer_len: 100,
        }
    }
}

/// The main daemon configuration, `lutra.conf`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MainConfig {
    /// Respawn gettys when they exit.
    pub persist: bool,
    /// Users to log in automatically, one tty each.
    pub autologins: Vec<String>,
    /// File-sink settings.
    pub log: LoggingConfig,
}

impl MainConfig {
    /// Parses `lutra.conf` from `content`. Missing sections and keys fall
    /// back to defaults.
    pub fn parse(content: &str) -> Self {
        let doc = IniDocument::parse(content);
        let empty = IniSection::default();

        let global = doc.section("global").unwrap_or(&empty);
        let persist = global.get_bool("persist", true);
        let autologins: Vec<String> = global
            .get_list("autologin")
            .into_iter()
            .filter(|user| {
                let ok = is_valid_name(user);
                if !ok {
                    warn!("ignoring invalid autologin user '{user}'");
                }
                ok
            })
            .collect();

        let logging = doc.section("logging").unwrap_or(&empty);
        let log = LoggingConfig {
            filename: PathBuf::from(
                logging.get_str("filename", DEFAULT_LOG_FILE),
            ),
            rotate: logging.get_bool("rotate", true),
            rotate_daily: logging.get_bool("rotate_daily", true),
            max_size_shift: logging.get_i64("max_size_shift", 28),
            max_lines: logging.get_i64("max_lines", 1_000_000),
            max_days: logging.get_i64("max_days", 7),
            buffer_len: logging.get_i64("buffer_len", 100),
        };

        Self {
            persist,
            autologins,
            log,
        }
    }

    /// Loads `lutra.conf` from `base_dir`.
    pub fn load(base_dir: &Path) -> Result<Self, InitError> {
        let path = base_dir.join("lutra.conf");
        let content = fs::read_to_string(&path).map_err(|e| InitError::Parse {
            file: path.display().to_string(),
            detail: e.to_string(),
        })?;
        Ok(Self::parse(&content))
    }
}

// ============================================================================
// Unit files
// ============================================================================

/// Path of the unit directory below the configuration base.
pub fn unit_dir(base_dir: &Path) -> PathBuf {
    base_dir.join(UNIT_SUBDIR)
}

/// Parses a single unit file body into a fresh record. `fname` is both the
/// service name and the file name.
pub fn parse_unit(content: &str, fname: &str) -> Result<ServiceRecord, InitError> {
    if !is_valid_name(fname) {
        return Err(InitError::Parse {
            file: fname.to_string(),
            detail: format!(
                "invalid service name '{fname}', only A-Za-z0-9_-. allowed"
            ),
        });
    }

    let is_target = fname.ends_with(".target");
    let doc = IniDocument::parse(content);

    let order = doc.section("order").ok_or_else(|| InitError::Parse {
        file: fname.to_string(),
        detail: "missing [order] section".to_string(),
    })?;
    let service = doc.section("service").ok_or_else(|| InitError::Parse {
        file: fname.to_string(),
        detail: "missing [service] section".to_string(),
    })?;

    let requires = order.get_list("requires");
    let before = order.get_list("before");
    let after = order.get_list("after");
    let wanted_by = if is_target {
        order.get_str("wantedby", "")
    } else {
        order.get_str("wantedby", "multi-user.target")
    };

    let description = service.get_str("description", "");
    let auto_start = service.get_bool("autostart", false);
    let pid_file = service.get("pidfile").filter(|v| !v.is_empty());
    let exec_pre_start = service.get_str("execprestart", "");
    let exec_start = service.get_str("execstart", "");
    let exec_post_start = service.get_str("execpoststart", "");
    let exec_pre_stop = service.get_str("execprestop", "");
    let exec_stop = service.get_str("execstop", "");
    let exec_post_stop = service.get_str("execpoststop", "");

    // Targets carry no executable body; services keep the historical
    // forking default.
    let default_type = if is_target { "virtual" } else { "forking" };
    let type_str = service.get_str("type", default_type).to_ascii_lowercase();
    let kind = match type_str.as_str() {
        "simple" => ServiceKind::Simple,
        "forking" => ServiceKind::Forking {
            pid_file: pid_file.map(PathBuf::from),
        },
        "oneshot" => ServiceKind::Oneshot,
        "virtual" => ServiceKind::Virtual,
        other => {
            return Err(InitError::Parse {
                file: fname.to_string(),
                detail: format!("invalid type: {other}"),
            });
        }
    };

    if !matches!(kind, ServiceKind::Virtual) && exec_start.is_empty() {
        return Err(InitError::Parse {
            file: fname.to_string(),
            detail: "missing ExecStart command".to_string(),
        });
    }
    if matches!(kind, ServiceKind::Forking { pid_file: None }) {
        warn!("service {fname} does not have a PIDFile, consider setting it");
    }

    Ok(ServiceRecord {
        name: fname.to_string(),
        kind,
        description,
        auto_start,
        exec_pre_start,
        exec_start,
        exec_post_start,
        exec_pre_stop,
        exec_stop,
        exec_post_stop,
        requires,
        after,
        before,
        wanted_by,
        state: RunState::NotStarted,
        last_action: LastAction::Unknown,
        last_action_at: chrono::Utc::now().timestamp(),
        last_message: String::new(),
        last_known_pid: 0,
        deleted: false,
    })
}

/// Parses every `.service`/`.target` file under `base_dir/lutra.d`. Files
/// that fail to parse are logged and skipped, matching boot's best-effort
/// policy; an unreadable directory is an error.
pub fn load_unit_dir(
    base_dir: &Path,
) -> Result<HashMap<String, ServiceRecord>, InitError> {
    let dir = unit_dir(base_dir);
    let mut units = HashMap::new();

    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let fname = entry.file_name();
        let Some(fname) = fname.to_str() else {
            continue;
        };
        if !fname.ends_with(".service") && !fname.ends_with(".target") {
            continue;
        }

        let content = match fs::read_to_string(entry.path()) {
            Ok(content) => content,
            Err(err) => {
                error!("failed to read unit '{fname}': {err}");
                continue;
            }
        };
        match parse_unit(&content, fname) {
            Ok(record) => {
                units.insert(record.name.clone(), record);
            }
            Err(err) => error!("{err}"),
        }
    }

    Ok(units)
}

/// Checks that every `WantedBy`/`Requires`/`After`/`Before` entry of the
/// staged units resolves to a known name.
fn validate_references(
    units: &HashMap<String, ServiceRecord>,
    known: &HashSet<String>,
) -> Result<(), InitError> {
    for record in units.values() {
        for (what, referenced) in record.references() {
            if !known.contains(referenced) {
                return Err(InitError::Validation {
                    what,
                    service: record.name.clone(),
                    missing: referenced.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Boot-time validation is best-effort: units with dangling references are
/// dropped (loudly) instead of failing the whole load. Dropping one unit can
/// orphan another, so iterate to a fixed point.
fn drop_invalid_units(units: &mut HashMap<String, ServiceRecord>) {
    loop {
        let known: HashSet<String> = units.keys().cloned().collect();
        let bad: Vec<String> = units
            .values()
            .filter_map(|record| {
                record
                    .references()
                    .find(|(_, referenced)| !known.contains(*referenced))
                    .map(|(what, referenced)| {
                        error!(
                            "skipping service '{}': inexistant {what}: {referenced}",
                            record.name
                        );
                        record.name.clone()
                    })
            })
            .collect();
        if bad.is_empty() {
            return;
        }
        for name in bad {
            units.remove(&name);
        }
    }
}

/// Outcome of a successful configuration load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSummary {
    /// Units parsed from disk this pass.
    pub loaded: usize,
    /// Records left tombstoned because their file disappeared.
    pub disappeared: usize,
}

/// Loads (or reloads) the unit set from `base_dir` into `table`.
///
/// The staged units are reference-validated and cycle-checked before the
/// live table is touched, so a rejected load leaves the previous
/// configuration in force. Boot (`reloading == false`) is best-effort and
/// drops invalid units instead of rejecting. On reload, records whose
/// files reappear keep
/// their runtime state and only the definition fields are refreshed;
/// records whose files disappeared stay in the table tombstoned.
pub fn load_services(
    table: &ServiceTable,
    base_dir: &Path,
    reloading: bool,
) -> Result<LoadSummary, InitError> {
    let mut staged = load_unit_dir(base_dir)?;

    if reloading {
        let mut known: HashSet<String> = staged.keys().cloned().collect();
        known.extend(table.names()?);
        validate_references(&staged, &known)?;
    } else {
        drop_invalid_units(&mut staged);
    }
    let order = deps::sort(&staged)?;

    // Validation passed; apply to the live table.
    let loaded = staged.len();
    if reloading {
        table.mark_all_deleted()?;
        for record in staged.into_values() {
            if table.get(&record.name)?.is_some() {
                table.update_definition(&record)?;
            } else {
                table.insert(record)?;
            }
        }
    } else {
        for record in staged.into_values() {
            table.insert(record)?;
        }
    }
    table.set_orders(order.targets_order, order.services_order)?;

    let mut disappeared = 0;
    for name in table.names()? {
        if table.get(&name)?.map(|r| r.deleted).unwrap_or(false) {
            disappeared += 1;
        }
    }
    if disappeared > 0 {
        info!("{disappeared} service file(s) disappeared since the last load");
    }

    Ok(LoadSummary {
        loaded,
        disappeared,
    })
}
