//! Story identity and the key set rules are matched against.

use storyrender_wire::StoryInput;

const STORY_PREFIX: &str = "/story/";

/// Normalised story metadata plus the derived keys used by rule matching.
///
/// Keys always include the empty string. With an id `astro-card--default`
/// they also include the raw id, the id with `--` turned into `/`, and both
/// of those behind `/story/`. When title and name are present the slugified
/// `title/name` path (and its `/story/` form) is added as well.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryIdentity {
    id: String,
    title: Option<String>,
    name: Option<String>,
    keys: Vec<String>,
}

impl StoryIdentity {
    pub fn new(id: &str, title: Option<&str>, name: Option<&str>) -> Self {
        let id = normalize_story_id(id);
        let title = title.and_then(normalize_optional);
        let name = name.and_then(normalize_optional);
        let keys = derive_keys(&id, title.as_deref(), name.as_deref());

        Self {
            id,
            title,
            name,
            keys,
        }
    }

    /// Identity for a render call without story metadata.
    pub fn anonymous() -> Self {
        Self::new("", None, None)
    }

    pub fn from_input(story: Option<&StoryInput>) -> Self {
        match story {
            Some(story) => Self::new(&story.id, story.title.as_deref(), story.name.as_deref()),
            None => Self::anonymous(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

fn normalize_story_id(id: &str) -> String {
    let trimmed = id.trim();
    trimmed
        .strip_prefix(STORY_PREFIX)
        .unwrap_or(trimmed)
        .to_string()
}

fn normalize_optional(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn derive_keys(id: &str, title: Option<&str>, name: Option<&str>) -> Vec<String> {
    let mut keys = KeySet::default();
    keys.insert(String::new());

    if !id.is_empty() {
        keys.insert_with_prefix(id.to_string());
        keys.insert_with_prefix(id.replace("--", "/"));
    }

    let title_path = title
        .map(|title| {
            title
                .split('/')
                .map(slugify)
                .filter(|segment| !segment.is_empty())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default();
    let name_path = name.map(slugify).unwrap_or_default();

    if !title_path.is_empty() && !name_path.is_empty() {
        keys.insert_with_prefix(format!("{title_path}/{name_path}"));
    }

    keys.into_vec()
}

/// Lowercases and turns every run outside `[a-z0-9]` into one `-`, with no
/// leading or trailing `-`. Non-ASCII letters are dropped, not transliterated.
fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;
    for ch in input.trim().to_lowercase().chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Insertion-ordered set; key counts are tiny so a linear scan is fine.
#[derive(Default)]
struct KeySet(Vec<String>);

impl KeySet {
    fn insert(&mut self, key: String) {
        if !self.0.contains(&key) {
            self.0.push(key);
        }
    }

    fn insert_with_prefix(&mut self, key: String) {
        if key.is_empty() {
            return;
        }
        let prefixed = format!("{STORY_PREFIX}{key}");
        self.insert(key);
        self.insert(prefixed);
    }

    fn into_vec(self) -> Vec<String> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_key(identity: &StoryIdentity, key: &str) -> bool {
        identity.keys().iter().any(|candidate| candidate == key)
    }

    #[test]
    fn anonymous_identity_only_has_empty_key() {
        let identity = StoryIdentity::anonymous();
        assert_eq!(identity.keys(), [""]);
    }

    #[test]
    fn id_derived_keys_cover_raw_and_path_forms() {
        let identity = StoryIdentity::new("x--y", None, None);

        assert_eq!(
            identity.keys(),
            ["", "x--y", "/story/x--y", "x/y", "/story/x/y"]
        );
    }

    #[test]
    fn title_and_name_compose_slugified_path() {
        let identity = StoryIdentity::new(
            "astro-card--from-public-api",
            Some("Astro/Card"),
            Some("From Public Api"),
        );

        assert!(has_key(&identity, "astro-card--from-public-api"));
        assert!(has_key(&identity, "astro/card/from-public-api"));
        assert!(has_key(&identity, "/story/astro/card/from-public-api"));
    }

    #[test]
    fn title_without_name_adds_no_composed_key() {
        let identity = StoryIdentity::new("card--default", Some("Astro/Card"), Some("   "));

        assert_eq!(identity.name(), None);
        assert!(!has_key(&identity, "astro/card"));
    }

    #[test]
    fn story_prefix_is_stripped_from_ids() {
        let identity = StoryIdentity::new("  /story/card--default ", None, None);

        assert_eq!(identity.id(), "card--default");
        assert!(has_key(&identity, "/story/card/default"));
        assert!(!has_key(&identity, "/story//story/card--default"));
    }

    #[test]
    fn empty_title_segments_are_dropped() {
        let identity = StoryIdentity::new("id", Some("/Design System//Buttons/"), Some("Primary!"));

        assert!(has_key(&identity, "design-system/buttons/primary"));
    }

    #[test]
    fn non_ascii_letters_are_dropped_not_transliterated() {
        let identity = StoryIdentity::new("id", Some("Café/Über"), Some("Grüße"));

        assert_eq!(
            identity.keys(),
            ["", "id", "/story/id", "caf/ber/gr-e", "/story/caf/ber/gr-e"]
        );
        assert_eq!(slugify("  --Hello,  World!-- "), "hello-world");
        assert_eq!(slugify("Ünïcödé"), "n-c-d");
    }

    #[test]
    fn identical_forms_are_not_duplicated() {
        let identity = StoryIdentity::new("card", None, None);

        assert_eq!(identity.keys(), ["", "card", "/story/card"]);
    }

    #[test]
    fn from_input_reads_wire_story() {
        let input = StoryInput::new("x--y").with_title("X").with_name("Y");
        let identity = StoryIdentity::from_input(Some(&input));

        assert_eq!(identity.title(), Some("X"));
        assert!(has_key(&identity, "x/y"));
    }
}
