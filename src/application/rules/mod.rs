//! Story rules: which mock handlers and module substitutions apply to a render.
//!
//! A [`RuleSet`] is an ordered list of [`Rule`]s. A rule matches when any of
//! its patterns matches any key derived from the story identity; its effects
//! then run in order against a [`RuleContext`] that only accumulates.

mod loader;

use std::{
    fmt,
    path::{Component, Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::{
    application::{mock_server::MockHandler, module_mocks::ModuleMocks},
    domain::{error::ConfigurationError, pattern, story::StoryIdentity},
};

pub use loader::{RulesStore, load_rules_file, parse_rules, resolve_rules_path};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoryMode {
    #[default]
    Development,
    Production,
}

impl StoryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            StoryMode::Development => "development",
            StoryMode::Production => "production",
        }
    }
}

impl fmt::Display for StoryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoryMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(StoryMode::Development),
            "production" | "prod" => Ok(StoryMode::Production),
            other => Err(format!("unknown mode `{other}`")),
        }
    }
}

/// Accumulated overrides for one render.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSelection {
    pub module_mocks: ModuleMocks,
    pub mock_handlers: Vec<MockHandler>,
    /// Indices of the rules that matched, in evaluation order.
    pub matched_rules: Vec<usize>,
}

impl RuleSelection {
    pub fn is_empty(&self) -> bool {
        self.module_mocks.is_empty() && self.mock_handlers.is_empty()
    }
}

/// Capabilities handed to rule effects. Accumulation only.
pub struct RuleContext<'a> {
    mode: StoryMode,
    story: &'a StoryIdentity,
    config_path: Option<&'a Path>,
    selection: &'a mut RuleSelection,
}

impl<'a> RuleContext<'a> {
    pub fn mode(&self) -> StoryMode {
        self.mode
    }

    pub fn story(&self) -> &StoryIdentity {
        self.story
    }

    /// Substitute `specifier` with `replacement` for this render. Later calls
    /// for the same specifier win.
    pub fn mock(&mut self, specifier: &str, replacement: &str) -> Result<(), ConfigurationError> {
        let specifier = specifier.trim();
        if specifier.is_empty() {
            return Err(ConfigurationError::invalid(
                "mock.specifier",
                "cannot be empty",
            ));
        }
        let replacement = resolve_replacement(replacement, self.config_path)?;
        self.selection
            .module_mocks
            .insert(specifier.to_string(), replacement);
        Ok(())
    }

    /// Append mock network handlers for this render.
    pub fn use_handlers(&mut self, handlers: impl IntoIterator<Item = MockHandler>) {
        self.selection.mock_handlers.extend(handlers);
    }
}

/// One behaviour injected by a matching rule.
#[async_trait]
pub trait RuleEffect: Send + Sync {
    async fn apply(&self, ctx: &mut RuleContext<'_>) -> Result<(), ConfigurationError>;

    /// Short label for diagnostics.
    fn describe(&self) -> String {
        "custom effect".to_string()
    }
}

/// Adapts a synchronous closure into a [`RuleEffect`].
pub struct FnEffect<F>(F);

impl<F> FnEffect<F>
where
    F: Fn(&mut RuleContext<'_>) -> Result<(), ConfigurationError> + Send + Sync,
{
    pub fn new(effect: F) -> Self {
        Self(effect)
    }
}

#[async_trait]
impl<F> RuleEffect for FnEffect<F>
where
    F: Fn(&mut RuleContext<'_>) -> Result<(), ConfigurationError> + Send + Sync,
{
    async fn apply(&self, ctx: &mut RuleContext<'_>) -> Result<(), ConfigurationError> {
        (self.0)(ctx)
    }

    fn describe(&self) -> String {
        "closure".to_string()
    }
}

/// `mock-module` effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockModule {
    pub specifier: String,
    pub replacement: String,
}

#[async_trait]
impl RuleEffect for MockModule {
    async fn apply(&self, ctx: &mut RuleContext<'_>) -> Result<(), ConfigurationError> {
        ctx.mock(&self.specifier, &self.replacement)
    }

    fn describe(&self) -> String {
        format!("mock-module {} -> {}", self.specifier, self.replacement)
    }
}

/// `mock-http` effect.
#[derive(Debug, Clone, PartialEq)]
pub struct MockHttp(pub MockHandler);

#[async_trait]
impl RuleEffect for MockHttp {
    async fn apply(&self, ctx: &mut RuleContext<'_>) -> Result<(), ConfigurationError> {
        ctx.use_handlers([self.0.clone()]);
        Ok(())
    }

    fn describe(&self) -> String {
        let method = self.0.method().map(|method| method.as_str()).unwrap_or("*");
        format!("mock-http {method} {}", self.0.url())
    }
}

#[derive(Clone)]
pub struct Rule {
    matches: Vec<String>,
    uses: Vec<Arc<dyn RuleEffect>>,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("matches", &self.matches)
            .field(
                "uses",
                &self.uses.iter().map(|effect| effect.describe()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Rule {
    pub fn new<I, S>(matches: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            matches: matches.into_iter().map(Into::into).collect(),
            uses: Vec::new(),
        }
    }

    pub fn with_effect(mut self, effect: impl RuleEffect + 'static) -> Self {
        self.uses.push(Arc::new(effect));
        self
    }

    pub fn with_fn<F>(self, effect: F) -> Self
    where
        F: Fn(&mut RuleContext<'_>) -> Result<(), ConfigurationError> + Send + Sync + 'static,
    {
        self.with_effect(FnEffect::new(effect))
    }

    pub fn patterns(&self) -> &[String] {
        &self.matches
    }

    pub fn effects(&self) -> &[Arc<dyn RuleEffect>] {
        &self.uses
    }

    /// Reject empty pattern lists and blank patterns.
    pub fn validate(&self, index: usize) -> Result<(), ConfigurationError> {
        let option = format!("rules[{index}].match");
        if self.matches.is_empty() {
            return Err(ConfigurationError::invalid(
                option,
                "must contain at least one pattern",
            ));
        }
        for (position, pattern) in self.matches.iter().enumerate() {
            if pattern.trim().is_empty() {
                return Err(ConfigurationError::invalid(
                    format!("{option}[{position}]"),
                    "cannot be empty",
                ));
            }
        }
        Ok(())
    }

    pub fn matches(&self, story: &StoryIdentity) -> bool {
        self.matches.iter().any(|pattern| {
            let pattern = pattern.trim();
            story
                .keys()
                .iter()
                .any(|key| pattern::matches(pattern, key))
        })
    }
}

/// Ordered rules plus the file they came from, if any.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
    config_path: Option<PathBuf>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules,
            config_path: None,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Record the file relative mock replacements resolve against.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Run every matching rule's effects for `story` and return what they asked for.
///
/// Any error aborts the whole selection; nothing partial is returned.
pub async fn select_story_rules(
    rule_set: &RuleSet,
    story: &StoryIdentity,
    mode: StoryMode,
) -> Result<RuleSelection, ConfigurationError> {
    let mut selection = RuleSelection::default();

    for (index, rule) in rule_set.rules.iter().enumerate() {
        rule.validate(index)?;
        if !rule.matches(story) {
            continue;
        }

        selection.matched_rules.push(index);
        for effect in &rule.uses {
            let mut ctx = RuleContext {
                mode,
                story,
                config_path: rule_set.config_path(),
                selection: &mut selection,
            };
            effect.apply(&mut ctx).await?;
        }
    }

    debug!(
        target = "storyrender::rules",
        story_id = story.id(),
        matched = ?selection.matched_rules,
        module_mocks = selection.module_mocks.len(),
        mock_handlers = selection.mock_handlers.len(),
        "story rules selected"
    );

    Ok(selection)
}

/// Absolute paths pass verbatim, `.`-leading paths resolve against the rule
/// file's directory, anything else is a bare module specifier.
fn resolve_replacement(
    replacement: &str,
    config_path: Option<&Path>,
) -> Result<String, ConfigurationError> {
    let replacement = replacement.trim();
    if replacement.is_empty() {
        return Err(ConfigurationError::invalid(
            "mock.replacement",
            "cannot be empty",
        ));
    }

    if Path::new(replacement).is_absolute() {
        return Ok(to_posix(replacement));
    }

    if replacement.starts_with('.') {
        let Some(config_path) = config_path else {
            return Err(ConfigurationError::invalid(
                "mock.replacement",
                format!(
                    "`{replacement}` is relative, but the rules config path is unavailable"
                ),
            ));
        };
        let base = config_path.parent().unwrap_or_else(|| Path::new(""));
        let joined = std::path::absolute(base.join(replacement)).map_err(|err| {
            ConfigurationError::invalid("mock.replacement", err.to_string())
        })?;
        return Ok(to_posix(&normalize_lexically(&joined).to_string_lossy()));
    }

    Ok(replacement.to_string())
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

fn to_posix(path: &str) -> String {
    path.replace('\\', "/")
}
