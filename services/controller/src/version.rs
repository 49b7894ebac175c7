//! Version tags: classification and ordering.
//!
//! Only tags carrying the `@` marker are deployable. `@preview/<name>` tags
//! are previews; every other marked tag is a standard release.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

/// Marker every deployable tag starts with.
pub const TAG_MARKER: &str = "@";

/// Marker for preview tags.
pub const PREVIEW_MARKER: &str = "@preview/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionKind {
    Standard,
    Preview,
}

/// One deployable version of the application.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    /// Raw tag as stored in the version source.
    pub tag: String,
    /// Tag without markers, as shown in listings.
    pub name: String,
    pub kind: VersionKind,
}

impl Version {
    /// Classify a raw tag. Unmarked tags, empty names and the `.`/`..` path
    /// components yield `None`.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let tag = tag.trim();
        let (name, kind) = if let Some(name) = tag.strip_prefix(PREVIEW_MARKER) {
            (name, VersionKind::Preview)
        } else if let Some(name) = tag.strip_prefix(TAG_MARKER) {
            (name, VersionKind::Standard)
        } else {
            return None;
        };

        if matches!(name, "" | "." | "..") {
            return None;
        }

        Some(Self {
            tag: tag.to_string(),
            name: name.to_string(),
            kind,
        })
    }

    /// Identity of the version in the pool and in reconciliation plans.
    ///
    /// A standard tag and a preview tag may share a `name`; their keys always
    /// differ (`hotfix` vs `preview/hotfix`).
    pub fn key(&self) -> &str {
        self.tag.strip_prefix(TAG_MARKER).unwrap_or(&self.tag)
    }

    pub fn is_preview(&self) -> bool {
        self.kind == VersionKind::Preview
    }

    /// Directory name for this version's checkout.
    pub fn dir_name(&self) -> String {
        let prefix = match self.kind {
            VersionKind::Standard => "",
            VersionKind::Preview => "preview-",
        };
        format!("{prefix}{}", self.name.replace(['/', '\\'], "_"))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Partition raw tags into (standard, preview). Duplicates collapse and the
/// result is in first-seen order.
pub fn classify<I, S>(tags: I) -> (Vec<Version>, Vec<Version>)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = BTreeSet::new();
    let mut standard = Vec::new();
    let mut preview = Vec::new();

    for tag in tags {
        let Some(version) = Version::from_tag(tag.as_ref()) else {
            continue;
        };
        if !seen.insert(version.tag.clone()) {
            continue;
        }
        match version.kind {
            VersionKind::Standard => standard.push(version),
            VersionKind::Preview => preview.push(version),
        }
    }

    (standard, preview)
}

/// Highest standard version under [`compare_names`].
pub fn latest(standard: &[Version]) -> Option<&Version> {
    standard
        .iter()
        .filter(|v| v.kind == VersionKind::Standard)
        .max_by(|a, b| compare_names(&a.name, &b.name))
}

/// Parsed `[v]MAJOR(.N)*[-PRE][+BUILD]`.
#[derive(Debug, PartialEq, Eq)]
struct ParsedName<'a> {
    numbers: Vec<u64>,
    pre: Option<&'a str>,
}

fn parse_name(name: &str) -> Option<ParsedName<'_>> {
    let body = name.strip_prefix(['v', 'V']).unwrap_or(name);
    let body = body.split_once('+').map_or(body, |(core, _build)| core);
    let (core, pre) = match body.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (body, None),
    };

    let numbers = core
        .split('.')
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;

    Some(ParsedName { numbers, pre })
}

fn compare_numbers(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            let x = a.get(i).copied().unwrap_or(0);
            let y = b.get(i).copied().unwrap_or(0);
            x.cmp(&y)
        })
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

fn compare_pre(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => x.cmp(y),
    }
}

/// Total order over version names.
///
/// Semantic-looking names compare numerically, a release outranks its
/// pre-releases, and any parseable name outranks an unparseable one. The raw
/// name breaks every remaining tie.
pub fn compare_names(a: &str, b: &str) -> Ordering {
    let by_version = match (parse_name(a), parse_name(b)) {
        (Some(x), Some(y)) => {
            compare_numbers(&x.numbers, &y.numbers).then_with(|| compare_pre(x.pre, y.pre))
        }
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    };
    by_version.then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn test_from_tag() {
        let v = Version::from_tag("@v1.2.0").unwrap();
        assert_eq!(v.name, "v1.2.0");
        assert_eq!(v.tag, "@v1.2.0");
        assert_eq!(v.kind, VersionKind::Standard);

        let p = Version::from_tag("@preview/feat-x").unwrap();
        assert_eq!(p.name, "feat-x");
        assert!(p.is_preview());

        assert!(Version::from_tag("v1.0.0").is_none());
        assert!(Version::from_tag("@").is_none());
        assert!(Version::from_tag("@preview/").is_none());
        assert!(Version::from_tag("").is_none());
    }

    #[rstest]
    #[case("@.")]
    #[case("@..")]
    #[case("@preview/.")]
    #[case("@preview/..")]
    fn test_from_tag_rejects_dot_names(#[case] tag: &str) {
        assert!(Version::from_tag(tag).is_none());
    }

    #[test]
    fn test_key_separates_kinds() {
        let s = Version::from_tag("@hotfix").unwrap();
        let p = Version::from_tag("@preview/hotfix").unwrap();
        assert_eq!(s.name, p.name);
        assert_eq!(s.key(), "hotfix");
        assert_eq!(p.key(), "preview/hotfix");
        assert_ne!(s.dir_name(), p.dir_name());
    }

    #[test]
    fn test_classify_scenario() {
        let (standard, preview) = classify(["@v1.0.0", "@v1.1.0", "@preview/feat-x"]);
        let names: Vec<_> = standard.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["v1.0.0", "v1.1.0"]);
        assert_eq!(preview.len(), 1);
        assert_eq!(preview[0].name, "feat-x");
        assert_eq!(latest(&standard).unwrap().name, "v1.1.0");
    }

    #[rstest]
    #[case("v1.10.0", "v1.9.0", Ordering::Greater)]
    #[case("v2", "v1.99.99", Ordering::Greater)]
    #[case("v1.0", "v1.0.0", Ordering::Less)]
    #[case("v1.0.0", "v1.0.0-rc.1", Ordering::Greater)]
    #[case("v1.0.0-alpha", "v1.0.0-beta", Ordering::Less)]
    #[case("v1.0.0", "release-candidate", Ordering::Greater)]
    #[case("alpha", "beta", Ordering::Less)]
    #[case("1.2.3", "v1.2.3", Ordering::Less)]
    fn test_compare_names(#[case] a: &str, #[case] b: &str, #[case] expected: Ordering) {
        assert_eq!(compare_names(a, b), expected);
        assert_eq!(compare_names(b, a), expected.reverse());
    }

    #[test]
    fn test_latest_ignores_input_order() {
        let (standard, _) = classify(["@v1.10.0", "@v1.2.0", "@v1.9.1"]);
        assert_eq!(latest(&standard).unwrap().name, "v1.10.0");
        assert!(latest(&[]).is_none());
    }

    #[test]
    fn test_dir_name_is_flat() {
        let p = Version::from_tag("@preview/feat/login").unwrap();
        assert_eq!(p.dir_name(), "preview-feat_login");
        let s = Version::from_tag("@v1.0.0").unwrap();
        assert_eq!(s.dir_name(), "v1.0.0");
    }

    fn tag_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z0-9.]{0,6}",
            "@v[0-9]{1,2}\\.[0-9]{1,2}\\.[0-9]{1,2}",
            "@[a-z]{1,5}",
            "@preview/[a-z-]{0,6}",
        ]
    }

    proptest! {
        #[test]
        fn prop_classify_partitions_marked_tags(tags in prop::collection::vec(tag_strategy(), 0..20)) {
            let (standard, preview) = classify(&tags);

            let expected: BTreeSet<String> = tags
                .iter()
                .filter_map(|t| Version::from_tag(t))
                .map(|v| v.tag)
                .collect();
            let got: Vec<String> = standard.iter().chain(&preview).map(|v| v.tag.clone()).collect();
            let got_set: BTreeSet<String> = got.iter().cloned().collect();

            prop_assert_eq!(got.len(), got_set.len());
            prop_assert_eq!(got_set, expected);
            prop_assert!(standard.iter().all(|v| !v.tag.starts_with(PREVIEW_MARKER)));
            prop_assert!(preview.iter().all(|v| v.tag.starts_with(PREVIEW_MARKER)));
        }

        #[test]
        fn prop_latest_is_order_independent(tags in prop::collection::vec(tag_strategy(), 0..20)) {
            let (standard, _) = classify(&tags);
            let mut reversed = standard.clone();
            reversed.reverse();

            let a = latest(&standard).map(|v| v.name.clone());
            let b = latest(&reversed).map(|v| v.name.clone());
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_compare_is_antisymmetric(a in "[v0-9.a-z-]{0,8}", b in "[v0-9.a-z-]{0,8}") {
            prop_assert_eq!(compare_names(&a, &b), compare_names(&b, &a).reverse());
        }
    }
}
