//! TOML rule files and the reloadable rule store.
//!
//! ```toml
//! [[rules]]
//! match = ["astro/card/*", "/story/astro-card--*"]
//! use = [
//!   { kind = "mock-module", specifier = "~/lib/api", replacement = "./mocks/api.ts" },
//!   { kind = "mock-http", method = "GET", url = "https://api.test/*", json = { ok = true } },
//! ]
//! ```

use std::{
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    application::mock_server::MockHandlerSpec,
    domain::error::ConfigurationError,
    util::lock::{rw_read, rw_write},
};

use super::{MockHttp, MockModule, Rule, RuleSet};

const LOCK_OWNER: &str = "application::rules::loader";

#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<RuleSpec>,
}

#[derive(Debug, Deserialize)]
struct RuleSpec {
    #[serde(rename = "match")]
    matches: Value,
    #[serde(rename = "use", default)]
    uses: Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
enum EffectSpec {
    MockModule {
        specifier: String,
        replacement: String,
    },
    MockHttp(MockHandlerSpec),
}

/// Resolve a configured rules path to an existing file.
///
/// An existing path is used as is. A path without an extension also tries
/// `<path>.toml` and `<path>/index.toml`.
pub fn resolve_rules_path(path: &Path) -> Result<PathBuf, ConfigurationError> {
    let raw = path.to_string_lossy();
    if raw.trim().is_empty() {
        return Err(ConfigurationError::invalid(
            "rules.config_file",
            "cannot be empty",
        ));
    }

    let resolved = std::path::absolute(path)
        .map_err(|err| ConfigurationError::invalid("rules.config_file", err.to_string()))?;
    if resolved.is_file() {
        return Ok(resolved);
    }

    if resolved.extension().is_none() {
        let mut with_extension = resolved.clone().into_os_string();
        with_extension.push(".toml");
        let candidates = [PathBuf::from(with_extension), resolved.join("index.toml")];
        if let Some(found) = candidates.into_iter().find(|candidate| candidate.is_file()) {
            return Ok(found);
        }
    }

    Err(ConfigurationError::MissingFile { path: resolved })
}

/// Parse rule file contents. `config_path` anchors relative mock paths.
pub fn parse_rules(source: &str, config_path: Option<&Path>) -> Result<RuleSet, ConfigurationError> {
    let parse_error = |message: String| ConfigurationError::Parse {
        path: config_path.map(Path::to_path_buf).unwrap_or_default(),
        message,
    };
    let file: RulesFile = toml::from_str(source).map_err(|err| parse_error(err.to_string()))?;

    let rules = file
        .rules
        .into_iter()
        .enumerate()
        .map(|(index, spec)| build_rule(index, spec))
        .collect::<Result<Vec<_>, _>>()?;

    let rule_set = RuleSet::new(rules);
    Ok(match config_path {
        Some(path) => rule_set.with_config_path(path),
        None => rule_set,
    })
}

/// Read and parse a rules file. The path is resolved first.
pub async fn load_rules_file(path: &Path) -> Result<RuleSet, ConfigurationError> {
    let path = resolve_rules_path(path)?;
    let source = tokio::fs::read_to_string(&path)
        .await
        .map_err(|source| ConfigurationError::Read {
            path: path.clone(),
            source,
        })?;
    parse_rules(&source, Some(&path))
}

fn build_rule(index: usize, spec: RuleSpec) -> Result<Rule, ConfigurationError> {
    let option = format!("rules[{index}]");
    let patterns = match spec.matches {
        Value::String(pattern) => vec![pattern],
        Value::Array(entries) => entries
            .into_iter()
            .enumerate()
            .map(|(position, entry)| match entry {
                Value::String(pattern) => Ok(pattern),
                _ => Err(ConfigurationError::invalid(
                    format!("{option}.match[{position}]"),
                    "must be a string",
                )),
            })
            .collect::<Result<Vec<_>, _>>()?,
        _ => {
            return Err(ConfigurationError::invalid(
                format!("{option}.match"),
                "must be a string or an array of strings",
            ));
        }
    };

    let effects = match spec.uses {
        Value::Null => Vec::new(),
        Value::Array(entries) => entries,
        table @ Value::Object(_) => vec![table],
        _ => {
            return Err(ConfigurationError::invalid(
                format!("{option}.use"),
                "must be a table or an array of tables",
            ));
        }
    };

    let mut rule = Rule::new(patterns);
    for (position, effect) in effects.into_iter().enumerate() {
        let effect_option = format!("{option}.use[{position}]");
        let effect: EffectSpec = serde_json::from_value(effect)
            .map_err(|err| ConfigurationError::invalid(&effect_option, err.to_string()))?;
        rule = match effect {
            EffectSpec::MockModule {
                specifier,
                replacement,
            } => rule.with_effect(MockModule {
                specifier,
                replacement,
            }),
            EffectSpec::MockHttp(handler) => {
                rule.with_effect(MockHttp(handler.into_handler(&effect_option)?))
            }
        };
    }

    rule.validate(index)?;
    Ok(rule)
}

/// Holds the current rule set and swaps it on [`RulesStore::invalidate`].
pub struct RulesStore {
    source: Option<PathBuf>,
    current: RwLock<Arc<RuleSet>>,
}

impl RulesStore {
    /// A store over a fixed, in-memory rule set.
    pub fn fixed(rules: RuleSet) -> Self {
        Self {
            source: None,
            current: RwLock::new(Arc::new(rules)),
        }
    }

    /// Load rules from `path`. Missing or malformed files are errors.
    pub async fn open(path: &Path) -> Result<Self, ConfigurationError> {
        let source = resolve_rules_path(path)?;
        let rules = load_rules_file(&source).await?;
        info!(
            target = "storyrender::rules",
            path = %source.display(),
            rules = rules.len(),
            "story rules loaded"
        );
        Ok(Self {
            source: Some(source),
            current: RwLock::new(Arc::new(rules)),
        })
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn current(&self) -> Arc<RuleSet> {
        Arc::clone(&rw_read(&self.current, LOCK_OWNER, "current"))
    }

    /// Re-read the source file. On failure the previous rules stay active.
    pub async fn invalidate(&self) -> Result<Arc<RuleSet>, ConfigurationError> {
        let Some(source) = self.source.as_deref() else {
            return Ok(self.current());
        };

        match load_rules_file(source).await {
            Ok(rules) => {
                let rules = Arc::new(rules);
                *rw_write(&self.current, LOCK_OWNER, "invalidate") = Arc::clone(&rules);
                info!(
                    target = "storyrender::rules",
                    path = %source.display(),
                    rules = rules.len(),
                    "story rules reloaded"
                );
                Ok(rules)
            }
            Err(err) => {
                warn!(
                    target = "storyrender::rules",
                    path = %source.display(),
                    error = %err,
                    "story rules reload failed; keeping previous rules"
                );
                Err(err)
            }
        }
    }
}
