//! Build configuration: a small INI dialect.
//!
//! ```text
//! # comment
//! [rescue]
//! base_layer = "debian-12"
//! repo_url = git@git.lan:ops/provision.git   # trailing comment
//! repo_checkout = stable
//! ```
//!
//! Every `[section]` declares a build, numbered from 1 in file order. Keys are
//! limited to the parameters in [`Param`]; a build that leaves one out inherits
//! the built-in default, and a default of [`REQUIRED`] must be set by every
//! build.

mod validate;

pub use validate::{is_name, validator_for, Validator, VALIDATORS};

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Sequence number of a build. `0` is the defaults slot.
pub type BuildId = u32;

/// Parameter-table slot holding the defaults.
pub const DEFAULTS_ID: BuildId = 0;

/// Default value meaning "every build must set this".
pub const REQUIRED: &str = "REQUIRED";

/// Clone location used when `repo_clone_into` is set to an empty value.
pub const DEFAULT_CLONE_INTO: &str = "root/provision";

/// The closed set of build parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Param {
    BaseLayer,
    RepoUrl,
    RepoCheckout,
    RepoCloneInto,
    RepoDepth,
    RunFromRepo,
}

impl Param {
    pub const ALL: [Param; 6] = [
        Param::BaseLayer,
        Param::RepoUrl,
        Param::RepoCheckout,
        Param::RepoCloneInto,
        Param::RepoDepth,
        Param::RunFromRepo,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Param::BaseLayer => "base_layer",
            Param::RepoUrl => "repo_url",
            Param::RepoCheckout => "repo_checkout",
            Param::RepoCloneInto => "repo_clone_into",
            Param::RepoDepth => "repo_depth",
            Param::RunFromRepo => "run_from_repo",
        }
    }

    pub fn from_key(key: &str) -> Option<Param> {
        Param::ALL.into_iter().find(|p| p.as_str() == key)
    }

    /// Built-in default stored under [`DEFAULTS_ID`].
    pub fn default_value(self) -> &'static str {
        match self {
            Param::BaseLayer => REQUIRED,
            Param::RepoUrl => "",
            Param::RepoCheckout => "master",
            Param::RepoCloneInto => DEFAULT_CLONE_INTO,
            Param::RepoDepth => "1",
            Param::RunFromRepo => "run.sh",
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while reading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{}:{line_no}: {reason}\n    {line}", path.display())]
    Syntax {
        path: PathBuf,
        line_no: usize,
        line: String,
        reason: String,
    },

    #[error("{}: build '{build}' does not set required parameter '{param}'", path.display())]
    MissingRequired {
        path: PathBuf,
        build: String,
        param: Param,
    },
}

/// `(build, parameter) -> value`, defaults included under [`DEFAULTS_ID`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterTable {
    values: BTreeMap<(BuildId, Param), String>,
}

impl ParameterTable {
    fn with_defaults() -> Self {
        let values = Param::ALL
            .into_iter()
            .map(|p| ((DEFAULTS_ID, p), p.default_value().to_string()))
            .collect();
        Self { values }
    }

    pub fn get(&self, build: BuildId, param: Param) -> Option<&str> {
        self.values.get(&(build, param)).map(String::as_str)
    }

    fn is_set(&self, build: BuildId, param: Param) -> bool {
        self.values.contains_key(&(build, param))
    }

    fn set(&mut self, build: BuildId, param: Param, value: String) {
        self.values.insert((build, param), value);
    }

    /// Concrete parameters for one build.
    pub fn resolve(&self, build: BuildId) -> Option<BuildParams> {
        let value = |p: Param| self.get(build, p).map(str::to_string);
        Some(BuildParams {
            base_layer: value(Param::BaseLayer)?,
            repo_url: value(Param::RepoUrl)?,
            repo_checkout: value(Param::RepoCheckout)?,
            repo_clone_into: value(Param::RepoCloneInto)?,
            repo_depth: self.get(build, Param::RepoDepth)?.parse().ok()?,
            run_from_repo: value(Param::RunFromRepo)?,
        })
    }
}

/// Resolved parameters of one build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildParams {
    pub base_layer: String,
    pub repo_url: String,
    pub repo_checkout: String,
    pub repo_clone_into: String,
    pub repo_depth: u32,
    pub run_from_repo: String,
}

impl BuildParams {
    pub fn uses_repo(&self) -> bool {
        !self.repo_url.is_empty()
    }

    /// Clone location relative to the chroot root.
    pub fn clone_into(&self) -> &str {
        let trimmed = self.repo_clone_into.trim_matches('/');
        if trimmed.is_empty() {
            DEFAULT_CLONE_INTO
        } else {
            trimmed
        }
    }

    /// Repo-relative provisioning script, if one is configured.
    pub fn run_script(&self) -> Option<&str> {
        let trimmed = self.run_from_repo.trim_start_matches('/');
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

/// Build names in declaration order. Ids start at 1.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildRegistry {
    names: Vec<String>,
}

impl BuildRegistry {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn id_of(&self, name: &str) -> Option<BuildId> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|idx| idx as BuildId + 1)
    }

    pub fn name_of(&self, id: BuildId) -> Option<&str> {
        let idx = usize::try_from(id).ok()?.checked_sub(1)?;
        self.names.get(idx).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (BuildId, &str)> {
        self.names
            .iter()
            .enumerate()
            .map(|(idx, name)| (idx as BuildId + 1, name.as_str()))
    }

    fn push(&mut self, name: &str) -> BuildId {
        self.names.push(name.to_string());
        self.names.len() as BuildId
    }
}

/// A parsed configuration file.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub path: PathBuf,
    pub params: ParameterTable,
    pub registry: BuildRegistry,
}

impl BuildConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let (params, registry) = parse(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            params,
            registry,
        })
    }

    pub fn build_params(&self, id: BuildId) -> Option<BuildParams> {
        self.params.resolve(id)
    }
}

/// Read and validate a configuration file.
pub fn parse(path: &Path) -> Result<(ParameterTable, BuildRegistry), ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_str(path, &contents)
}

/// Parse configuration text; `path` is only used in error messages.
pub fn parse_str(
    path: &Path,
    contents: &str,
) -> Result<(ParameterTable, BuildRegistry), ConfigError> {
    let mut table = ParameterTable::with_defaults();
    let mut registry = BuildRegistry::default();
    let mut current = DEFAULTS_ID;

    for (idx, raw) in contents.lines().enumerate() {
        let syntax = |reason: String| ConfigError::Syntax {
            path: path.to_path_buf(),
            line_no: idx + 1,
            line: raw.to_string(),
            reason,
        };

        match parse_line(raw).map_err(syntax)? {
            Line::Blank => {}
            Line::Section(name) => {
                if !is_name(name) {
                    return Err(syntax(format!(
                        "invalid build name '{name}': use letters, digits, '_', '.' or '-'"
                    )));
                }
                if registry.id_of(name).is_some() {
                    return Err(syntax(format!("build '{name}' is defined twice")));
                }
                current = registry.push(name);
            }
            Line::Assign { key, value } => {
                if current == DEFAULTS_ID {
                    return Err(syntax(format!(
                        "parameter '{key}' appears before any [build] section"
                    )));
                }
                let param = Param::from_key(key)
                    .ok_or_else(|| syntax(format!("unknown parameter '{key}'")))?;
                if table.is_set(current, param) {
                    let build = registry.name_of(current).unwrap_or_default().to_string();
                    return Err(syntax(format!(
                        "parameter '{param}' is already set for build '{build}'"
                    )));
                }
                validator_for(param)(value)
                    .map_err(|rule| syntax(format!("invalid value for '{param}': {rule}")))?;
                table.set(current, param, value.to_string());
            }
        }
    }

    for (id, build) in registry.iter() {
        for param in Param::ALL {
            if !table.is_set(id, param) {
                let default = table.get(DEFAULTS_ID, param).unwrap_or_default().to_string();
                table.set(id, param, default);
            }
            if param.default_value() == REQUIRED && table.get(id, param) == Some(REQUIRED) {
                return Err(ConfigError::MissingRequired {
                    path: path.to_path_buf(),
                    build: build.to_string(),
                    param,
                });
            }
        }
    }

    Ok((table, registry))
}

#[derive(Debug, PartialEq, Eq)]
enum Line<'a> {
    Blank,
    Section(&'a str),
    Assign { key: &'a str, value: &'a str },
}

fn parse_line(raw: &str) -> Result<Line<'_>, String> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(Line::Blank);
    }

    if let Some(inner) = line.strip_prefix('[') {
        let name = inner
            .strip_suffix(']')
            .ok_or_else(|| "section header must end with ']'".to_string())?;
        return Ok(Line::Section(name));
    }

    let Some((key, rest)) = line.split_once('=') else {
        return Err("expected '[build]' or 'key = value'".to_string());
    };
    let key = key.trim_end();
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!("invalid parameter name '{key}'"));
    }

    let rest = rest.trim_start();
    let (value, tail) = if let Some(quoted) = rest.strip_prefix('"') {
        let end = quoted
            .find('"')
            .ok_or_else(|| "unterminated quoted value".to_string())?;
        (&quoted[..end], &quoted[end + 1..])
    } else {
        let end = rest
            .find(|c: char| c.is_whitespace() || c == '#')
            .unwrap_or(rest.len());
        (&rest[..end], &rest[end..])
    };

    let tail = tail.trim_start();
    if !tail.is_empty() && !tail.starts_with('#') {
        return Err(format!("unexpected text after value: '{tail}'"));
    }

    Ok(Line::Assign { key, value })
}
