//! HTML sanitization of render input, filtered by dot-path patterns.
//!
//! Options arrive as a raw JSON tree (from settings or a caller) and are
//! resolved once into a [`SanitizationPolicy`]. Resolution is where malformed
//! values are rejected; [`sanitize_payload`] itself never fails.

use std::collections::{BTreeMap, HashMap, HashSet};

use ammonia::Builder as AmmoniaBuilder;
use serde_json::{Map, Value};
use storyrender_wire::PropMap;

use crate::domain::{error::ConfigurationError, pattern::PathPattern};

const OPTION_ROOT: &str = "sanitization";

const DEFAULT_TAGS: &[&str] = &[
    "a",
    "abbr",
    "b",
    "blockquote",
    "br",
    "caption",
    "cite",
    "code",
    "col",
    "colgroup",
    "dd",
    "details",
    "dfn",
    "div",
    "dl",
    "dt",
    "em",
    "figcaption",
    "figure",
    "h1",
    "h2",
    "h3",
    "h4",
    "h5",
    "h6",
    "hr",
    "i",
    "img",
    "kbd",
    "li",
    "mark",
    "ol",
    "p",
    "pre",
    "q",
    "rp",
    "rt",
    "ruby",
    "s",
    "samp",
    "small",
    "span",
    "strong",
    "sub",
    "summary",
    "sup",
    "table",
    "tbody",
    "td",
    "tfoot",
    "th",
    "thead",
    "time",
    "tr",
    "u",
    "ul",
    "var",
    "wbr",
];

const DEFAULT_GENERIC_ATTRIBUTES: &[&str] = &[
    "aria-describedby",
    "aria-hidden",
    "aria-label",
    "aria-labelledby",
    "class",
    "id",
    "lang",
    "role",
    "title",
];

const DEFAULT_TAG_ATTRIBUTES: &[(&str, &[&str])] = &[
    ("a", &["href", "name", "target", "rel"]),
    (
        "img",
        &[
            "src", "srcset", "alt", "title", "width", "height", "loading", "decoding",
        ],
    ),
    ("td", &["colspan", "rowspan"]),
    ("th", &["colspan", "rowspan", "scope"]),
    ("time", &["datetime"]),
];

const DEFAULT_URL_SCHEMES: &[&str] = &["http", "https", "mailto", "tel", "data"];

/// Tags whose content is dropped together with the tag unless explicitly allowed.
const CLEAN_CONTENT_TAGS: &[&str] = &["script", "style"];

/// Resolved sanitization settings. Immutable once built.
#[derive(Debug, Clone)]
pub struct SanitizationPolicy {
    pub enabled: bool,
    pub arg_patterns: Vec<PathPattern>,
    pub slot_patterns: Vec<PathPattern>,
    pub html: HtmlPolicy,
}

impl SanitizationPolicy {
    /// Policy used when no options were supplied at all.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            arg_patterns: Vec::new(),
            slot_patterns: Vec::new(),
            html: HtmlPolicy::default(),
        }
    }

    /// Resolve raw options. `None` and JSON `null` both mean "not configured".
    ///
    /// When options are present `enabled` defaults to `true`, `slots` to
    /// `["**"]` and `args` to no patterns.
    pub fn resolve(options: Option<&Value>) -> Result<Self, ConfigurationError> {
        let options = match options {
            None | Some(Value::Null) => return Ok(Self::disabled()),
            Some(Value::Object(options)) => options,
            Some(_) => {
                return Err(ConfigurationError::invalid(
                    OPTION_ROOT,
                    "must be a table of sanitization options",
                ));
            }
        };

        let enabled = match options.get("enabled") {
            None | Some(Value::Null) => true,
            Some(Value::Bool(enabled)) => *enabled,
            Some(_) => {
                return Err(ConfigurationError::invalid(
                    option_name("enabled"),
                    "must be a boolean",
                ));
            }
        };

        let arg_patterns = match options.get("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(value) => pattern_list(value, &option_name("args"))?,
        };
        let slot_patterns = match options.get("slots") {
            None | Some(Value::Null) => vec![PathPattern::parse("**")],
            Some(value) => pattern_list(value, &option_name("slots"))?,
        };

        let html = match options.get("html").or_else(|| options.get("sanitizeHtml")) {
            None | Some(Value::Null) => HtmlPolicy::default(),
            Some(value) => HtmlPolicy::from_options(value)?,
        };

        Ok(Self {
            enabled,
            arg_patterns,
            slot_patterns,
            html,
        })
    }
}

impl Default for SanitizationPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

fn option_name(key: &str) -> String {
    format!("{OPTION_ROOT}.{key}")
}

fn pattern_list(value: &Value, option: &str) -> Result<Vec<PathPattern>, ConfigurationError> {
    let strings = string_list(value, option)?;
    Ok(strings.iter().map(|pattern| PathPattern::parse(pattern)).collect())
}

/// Trimmed, non-empty, de-duplicated strings in first-seen order.
fn string_list(value: &Value, option: &str) -> Result<Vec<String>, ConfigurationError> {
    let Value::Array(entries) = value else {
        return Err(ConfigurationError::invalid(
            option,
            "must be an array of strings",
        ));
    };

    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let Value::String(entry) = entry else {
            return Err(ConfigurationError::invalid(
                format!("{option}[{index}]"),
                "must be a string",
            ));
        };
        let normalized = entry.trim();
        if normalized.is_empty() {
            return Err(ConfigurationError::invalid(
                format!("{option}[{index}]"),
                "cannot be an empty string",
            ));
        }
        if seen.insert(normalized.to_string()) {
            unique.push(normalized.to_string());
        }
    }
    Ok(unique)
}

/// Allow-lists handed to the HTML sanitizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtmlPolicy {
    tags: HashSet<String>,
    generic_attributes: HashSet<String>,
    tag_attributes: HashMap<String, HashSet<String>>,
    url_schemes: HashSet<String>,
    strip_comments: bool,
}

impl Default for HtmlPolicy {
    fn default() -> Self {
        Self {
            tags: owned_set(DEFAULT_TAGS),
            generic_attributes: owned_set(DEFAULT_GENERIC_ATTRIBUTES),
            tag_attributes: DEFAULT_TAG_ATTRIBUTES
                .iter()
                .map(|(tag, attributes)| (tag.to_string(), owned_set(attributes)))
                .collect(),
            url_schemes: owned_set(DEFAULT_URL_SCHEMES),
            strip_comments: true,
        }
    }
}

fn owned_set(values: &[&str]) -> HashSet<String> {
    values.iter().map(|value| value.to_string()).collect()
}

impl HtmlPolicy {
    /// Merge user options over the defaults. Lists replace the default list;
    /// `tag_attributes` replaces entries tag by tag.
    pub fn from_options(value: &Value) -> Result<Self, ConfigurationError> {
        let option = option_name("html");
        let Value::Object(options) = value else {
            return Err(ConfigurationError::invalid(option, "must be a table"));
        };

        let mut policy = Self::default();
        if let Some(tags) = non_null(options, "tags") {
            policy.tags = string_list(tags, &format!("{option}.tags"))?
                .into_iter()
                .collect();
        }
        if let Some(attributes) = non_null(options, "generic_attributes") {
            policy.generic_attributes =
                string_list(attributes, &format!("{option}.generic_attributes"))?
                    .into_iter()
                    .collect();
        }
        if let Some(per_tag) = non_null(options, "tag_attributes") {
            let key = format!("{option}.tag_attributes");
            let Value::Object(per_tag) = per_tag else {
                return Err(ConfigurationError::invalid(
                    key,
                    "must be a table of tag name to attribute list",
                ));
            };
            for (tag, attributes) in per_tag {
                let attributes = string_list(attributes, &format!("{key}.{tag}"))?;
                policy
                    .tag_attributes
                    .insert(tag.clone(), attributes.into_iter().collect());
            }
        }
        if let Some(schemes) = non_null(options, "url_schemes") {
            policy.url_schemes = string_list(schemes, &format!("{option}.url_schemes"))?
                .into_iter()
                .collect();
        }
        match non_null(options, "strip_comments") {
            None => {}
            Some(Value::Bool(strip)) => policy.strip_comments = *strip,
            Some(_) => {
                return Err(ConfigurationError::invalid(
                    format!("{option}.strip_comments"),
                    "must be a boolean",
                ));
            }
        }

        Ok(policy)
    }

    pub fn allows_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Build an ammonia cleaner borrowing this policy's allow-lists.
    pub fn builder(&self) -> AmmoniaBuilder<'_> {
        let mut builder = AmmoniaBuilder::default();
        builder
            .tags(self.tags.iter().map(String::as_str).collect())
            .generic_attributes(self.generic_attributes.iter().map(String::as_str).collect())
            .tag_attributes(
                self.tag_attributes
                    .iter()
                    .map(|(tag, attributes)| {
                        (
                            tag.as_str(),
                            attributes.iter().map(String::as_str).collect(),
                        )
                    })
                    .collect(),
            )
            .url_schemes(self.url_schemes.iter().map(String::as_str).collect())
            .strip_comments(self.strip_comments)
            // `rel` is an allowed attribute on links, so ammonia must not manage it.
            .link_rel(None)
            .clean_content_tags(
                CLEAN_CONTENT_TAGS
                    .iter()
                    .copied()
                    .filter(|tag| !self.tags.contains(*tag))
                    .collect(),
            );
        builder
    }

    pub fn clean(&self, html: &str) -> String {
        self.builder().clean(html).to_string()
    }
}

fn non_null<'a>(options: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    options.get(key).filter(|value| !value.is_null())
}

/// Render input subject to sanitization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderPayload {
    pub args: PropMap,
    pub slots: PropMap,
}

impl RenderPayload {
    pub fn new(args: PropMap, slots: PropMap) -> Self {
        Self { args, slots }
    }
}

/// Sanitize every string leaf whose dot path matches the policy's patterns.
///
/// Returns the payload untouched when the policy is disabled. Otherwise the
/// output has exactly the keys and array lengths of the input.
pub fn sanitize_payload(payload: RenderPayload, policy: &SanitizationPolicy) -> RenderPayload {
    if !policy.enabled {
        return payload;
    }

    let cleaner = policy.html.builder();
    RenderPayload {
        args: sanitize_tree(payload.args, &policy.arg_patterns, &cleaner),
        slots: sanitize_tree(payload.slots, &policy.slot_patterns, &cleaner),
    }
}

fn sanitize_tree(tree: PropMap, patterns: &[PathPattern], cleaner: &AmmoniaBuilder<'_>) -> PropMap {
    if patterns.is_empty() {
        return tree;
    }

    let mut path = Vec::new();
    sanitize_object(tree, &mut path, patterns, cleaner)
}

fn sanitize_object(
    object: Map<String, Value>,
    path: &mut Vec<String>,
    patterns: &[PathPattern],
    cleaner: &AmmoniaBuilder<'_>,
) -> Map<String, Value> {
    object
        .into_iter()
        .map(|(key, value)| {
            // Keys holding dots split into several segments, as in the joined dot path.
            let depth = path.len();
            path.extend(key.split('.').map(str::to_string));
            let value = sanitize_value(value, path, patterns, cleaner);
            path.truncate(depth);
            (key, value)
        })
        .collect()
}

fn sanitize_value(
    value: Value,
    path: &mut Vec<String>,
    patterns: &[PathPattern],
    cleaner: &AmmoniaBuilder<'_>,
) -> Value {
    match value {
        Value::String(text) => {
            if patterns.iter().any(|pattern| pattern.matches(path)) {
                Value::String(cleaner.clean(&text).to_string())
            } else {
                Value::String(text)
            }
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(index, item)| {
                    path.push(index.to_string());
                    let item = sanitize_value(item, path, patterns, cleaner);
                    path.pop();
                    item
                })
                .collect(),
        ),
        Value::Object(object) => Value::Object(sanitize_object(object, path, patterns, cleaner)),
        other => other,
    }
}

/// Summary of a resolved policy for diagnostics output.
pub fn describe(policy: &SanitizationPolicy) -> BTreeMap<&'static str, String> {
    let join = |patterns: &[PathPattern]| {
        patterns
            .iter()
            .map(PathPattern::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    };
    BTreeMap::from([
        ("enabled", policy.enabled.to_string()),
        ("args", join(&policy.arg_patterns)),
        ("slots", join(&policy.slot_patterns)),
    ])
}
