// Supplementary R libraries a submission needs
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

/// (library, calls that imply it, literal markers that imply it)
///
/// Calls only count as whole names: `apply_filter(` or `stats::filter(` do not
/// pull in dplyr, which would mask the base functions of the same name.
const TRIGGERS: &[(&str, &[&str], &[&str])] = &[
    (
        "dplyr",
        &["mutate", "filter", "summarise", "summarize", "group_by", "arrange", "select"],
        &["%>%"],
    ),
    ("ggplot2", &["ggplot", r"geom_\w+"], &[]),
    ("tidyr", &["pivot_longer", "pivot_wider"], &[]),
    ("stringr", &["str_detect", "str_replace"], &[]),
];

static MATCHERS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    TRIGGERS
        .iter()
        .map(|(library, calls, markers)| {
            (*library, Regex::new(&trigger_pattern(library, calls, markers)).expect("valid trigger pattern"))
        })
        .collect()
});

fn trigger_pattern(library: &str, calls: &[&str], markers: &[&str]) -> String {
    let library = regex::escape(library);
    let mut alternatives = vec![
        // Explicit namespace use or attach
        format!(r"\b{}::", library),
        format!(r#"\b(?:library|require|requireNamespace)\(\s*["']?{}\b"#, library),
        // Bare call, not part of a longer name and not qualified by another namespace
        format!(r"(?:^|[^\w.:])(?:{})\s*\(", calls.join("|")),
    ];
    alternatives.extend(markers.iter().map(|marker| regex::escape(marker)));
    format!("(?m){}", alternatives.join("|"))
}

/// Libraries implied by the code, plus the always-loaded base set
pub fn infer_required_libraries(code: &str, base: &[String]) -> BTreeSet<String> {
    let mut libraries: BTreeSet<String> = base.iter().cloned().collect();
    for (library, matcher) in MATCHERS.iter() {
        if matcher.is_match(code) {
            libraries.insert(library.to_string());
        }
    }
    libraries
}
