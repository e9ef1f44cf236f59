//! Path and filter primitives: token substitution, ASCII test, rsync-partial
//! detection, include/exclude/ignore glob classification, range condensation.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;

static RSYNC_PARTIAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\..+\.[A-Za-z0-9_]{6}$").unwrap());

/// Substitution context for `{cruiseID}`-style tokens.
#[derive(Debug, Clone, Default)]
pub struct TokenContext {
    pub cruise_id: String,
    pub lowering_id: Option<String>,
    pub lowering_data_base_dir: String,
}

impl TokenContext {
    pub fn new(cruise_id: &str, lowering_id: Option<&str>, lowering_data_base_dir: &str) -> Self {
        Self {
            cruise_id: cruise_id.to_string(),
            lowering_id: lowering_id.map(str::to_string),
            lowering_data_base_dir: lowering_data_base_dir.to_string(),
        }
    }
}

/// Date tokens expand to glob character classes, never literal digits.
fn expand_date_tokens(template: &str) -> String {
    template
        .replace("{YYYY}", "20[0-9][0-9]")
        .replace("{YY}", "[0-9][0-9]")
        .replace("{mm}", "[0-1][0-9]")
        .replace("{DD}", "[0-3][0-9]")
        .replace("{HH}", "[0-2][0-9]")
        .replace("{MM}", "[0-5][0-9]")
        .replace("{SS}", "[0-5][0-9]")
}

/// Replace `{cruiseID}`, `{loweringDataBaseDir}`, `{loweringID}` and the
/// date tokens in a template, and strip the trailing `/` (unless the
/// template is the single character `/`).
///
/// An unset lowering id leaves `{loweringID}` in place; callers treat a
/// template that still contains the token as a signal to skip, not an error.
pub fn keyword_replace(template: &str, ctx: &TokenContext) -> String {
    if template == "/" {
        return template.to_string();
    }

    let replaced = template
        .replace("{cruiseID}", &ctx.cruise_id)
        .replace("{loweringDataBaseDir}", &ctx.lowering_data_base_dir)
        .replace(
            "{loweringID}",
            ctx.lowering_id.as_deref().unwrap_or("{loweringID}"),
        );

    expand_date_tokens(&replaced).trim_end_matches('/').to_string()
}

/// True when the template still carries an unresolved `{loweringID}`.
pub fn has_unresolved_lowering(template: &str) -> bool {
    template.contains("{loweringID}")
}

/// Expand id and date tokens for a filter pattern; no trailing-slash
/// handling, because filters are globs rather than directories.
pub fn expand_filter_tokens(template: &str, ctx: &TokenContext) -> String {
    let replaced = template.replace("{cruiseID}", &ctx.cruise_id).replace(
        "{loweringID}",
        ctx.lowering_id.as_deref().unwrap_or("{loweringID}"),
    );
    expand_date_tokens(&replaced)
}

/// Whether every code unit of `s` fits in U+0000..U+007F.
pub fn is_ascii(s: &str) -> bool {
    s.is_ascii()
}

/// Whether `name` looks like an rsync partial file (`.name.XXXXXX`).
pub fn is_rsync_partial(name: &str) -> bool {
    RSYNC_PARTIAL_RE.is_match(name)
}

/// Outcome of running a path through a [`FilterSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    /// Matched an include glob and no exclude glob.
    Include,
    /// Everything else that is not dropped.
    Exclude,
    /// Matched an ignore glob; the path produces no record at all.
    Drop,
}

/// Compiled include/exclude/ignore glob sets.
///
/// Globs follow `fnmatch` semantics: `*` crosses directory separators and a
/// pattern must match the whole path.
#[derive(Debug)]
pub struct FilterSet {
    include: GlobSet,
    exclude: GlobSet,
    ignore: GlobSet,
}

fn compile(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).with_context(|| format!("bad glob pattern: {pattern}"))?;
        builder.add(glob);
    }
    builder.build().context("failed to build glob set")
}

/// Split a comma-separated filter string into patterns; an empty string means
/// no patterns.
pub fn split_patterns(raw: &str) -> Vec<String> {
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split(',').map(str::to_string).collect()
}

impl FilterSet {
    pub fn new(include: &[String], exclude: &[String], ignore: &[String]) -> Result<Self> {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
            ignore: compile(ignore)?,
        })
    }

    /// Build from the record's comma-separated filter strings, expanding
    /// tokens against `ctx` first.
    pub fn from_transfer_filters(
        include: &str,
        exclude: &str,
        ignore: &str,
        ctx: &TokenContext,
    ) -> Result<Self> {
        let expand = |raw: &str| split_patterns(&expand_filter_tokens(raw, ctx));
        Self::new(&expand(include), &expand(exclude), &expand(ignore))
    }

    pub fn classify(&self, path: &str) -> FilterOutcome {
        if self.ignore.is_match(path) {
            return FilterOutcome::Drop;
        }
        if self.include.is_match(path) && !self.exclude.is_match(path) {
            return FilterOutcome::Include;
        }
        FilterOutcome::Exclude
    }
}

/// Condense a set of integers into sorted `"n"` / `"a-b"` range strings.
pub fn condense_to_ranges(integers: &[i64]) -> Vec<String> {
    let mut sorted: Vec<i64> = integers.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(first) = iter.next() else {
        return ranges;
    };

    let mut start = first;
    let mut prev = first;

    let mut flush = |start: i64, prev: i64, ranges: &mut Vec<String>| {
        if start == prev {
            ranges.push(start.to_string());
        } else {
            ranges.push(format!("{start}-{prev}"));
        }
    };

    for num in iter {
        if num == prev + 1 {
            prev = num;
        } else {
            flush(start, prev, &mut ranges);
            start = num;
            prev = num;
        }
    }
    flush(start, prev, &mut ranges);

    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ctx() -> TokenContext {
        TokenContext::new("FK250801", Some("S0412"), "Lowerings")
    }

    #[test]
    fn keyword_replace_expands_all_tokens() {
        let out = keyword_replace("raw/{cruiseID}/{loweringID}/nav", &ctx());
        assert_eq!(out, "raw/FK250801/S0412/nav");
    }

    #[test]
    fn keyword_replace_leaves_unresolved_lowering() {
        let no_lowering = TokenContext::new("FK250801", None, "Lowerings");
        let out = keyword_replace("raw/{cruiseID}/{loweringID}/nav", &no_lowering);
        assert!(has_unresolved_lowering(&out));
    }

    #[test]
    fn keyword_replace_strips_trailing_slash_but_keeps_root() {
        assert_eq!(keyword_replace("data/", &ctx()), "data");
        assert_eq!(keyword_replace("/", &ctx()), "/");
    }

    #[test]
    fn keyword_replace_leaves_no_tokens_when_ids_bound() {
        let out = keyword_replace(
            "{cruiseID}/{loweringDataBaseDir}/{loweringID}/{YYYY}{YY}{mm}{DD}{HH}{MM}{SS}",
            &ctx(),
        );
        assert!(!out.contains('{'));
        assert!(!out.contains('}'));
    }

    #[test]
    fn date_tokens_become_character_classes() {
        let out = expand_filter_tokens("*_{YYYY}{mm}{DD}.raw", &ctx());
        assert_eq!(out, "*_20[0-9][0-9][0-1][0-9][0-3][0-9].raw");
    }

    #[test]
    fn ascii_test() {
        assert!(is_ascii("plain/path_01.txt"));
        assert!(!is_ascii("donn\u{e9}es.csv"));
    }

    #[test]
    fn rsync_partial_detection() {
        assert!(is_rsync_partial(".gyro.log.Xy4_9a"));
        assert!(!is_rsync_partial("gyro.log"));
        assert!(!is_rsync_partial(".hidden"));
        assert!(!is_rsync_partial(".short.a1"));
    }

    #[test]
    fn filter_precedence() {
        let set = FilterSet::new(
            &["*.txt".into(), "*.log".into()],
            &["tmp/*".into()],
            &["*.bak".into()],
        )
        .unwrap();

        assert_eq!(set.classify("a/b.txt"), FilterOutcome::Include);
        assert_eq!(set.classify("tmp/c.txt"), FilterOutcome::Exclude);
        assert_eq!(set.classify("d.bak"), FilterOutcome::Drop);
        assert_eq!(set.classify("e.md"), FilterOutcome::Exclude);
    }

    #[test]
    fn empty_include_list_excludes_everything() {
        let set = FilterSet::new(&[], &[], &[]).unwrap();
        assert_eq!(set.classify("anything"), FilterOutcome::Exclude);
    }

    #[test]
    fn date_class_filter_matches_timestamped_names() {
        let set = FilterSet::from_transfer_filters("*_{YYYY}{mm}{DD}*", "", "", &ctx()).unwrap();
        assert_eq!(set.classify("gps/pos_20250801T0000.raw"), FilterOutcome::Include);
        assert_eq!(set.classify("gps/pos_19990101T0000.raw"), FilterOutcome::Exclude);
    }

    #[test]
    fn condense_ranges_scenario() {
        let out = condense_to_ranges(&[1, 2, 3, 5, 7, 8, 9]);
        assert_eq!(out, vec!["1-3", "5", "7-9"]);
    }

    #[test]
    fn condense_ranges_empty_and_singleton() {
        assert!(condense_to_ranges(&[]).is_empty());
        assert_eq!(condense_to_ranges(&[4]), vec!["4"]);
    }

    proptest! {
        #[test]
        fn condensed_ranges_expand_back(mut input in proptest::collection::vec(0i64..400, 0..40)) {
            input.sort_unstable();
            input.dedup();

            let mut expanded = Vec::new();
            for range in condense_to_ranges(&input) {
                match range.split_once('-') {
                    Some((a, b)) => {
                        let (a, b): (i64, i64) = (a.parse().unwrap(), b.parse().unwrap());
                        prop_assert!(a < b);
                        expanded.extend(a..=b);
                    }
                    None => expanded.push(range.parse().unwrap()),
                }
            }
            prop_assert_eq!(expanded, input);
        }
    }
}
