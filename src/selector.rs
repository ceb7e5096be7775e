//! Repository selectors: an exact alias, an explicit list, or a glob
//! pattern such as `team-*-global`, expanded against the registry into a
//! deduplicated, ordered list of query targets.

use globset::Glob;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::{FleetError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RepoSelector {
    /// Exact alias, or a glob when it contains `*`, `?`, `[` or `{`.
    One(String),
    List(Vec<String>),
}

impl RepoSelector {
    /// CLI form: comma-separated aliases become a list.
    pub fn parse(s: &str) -> Self {
        if s.contains(',') {
            RepoSelector::List(
                s.split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(str::to_string)
                    .collect(),
            )
        } else {
            RepoSelector::One(s.trim().to_string())
        }
    }

    pub fn is_pattern(&self) -> bool {
        matches!(self, RepoSelector::One(s) if is_glob(s))
    }
}

fn is_glob(s: &str) -> bool {
    s.contains(['*', '?', '[', '{'])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetKind {
    Golden,
    Workspace { owner: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub alias: String,
    #[serde(flatten)]
    pub kind: TargetKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// In resolution order: list order for explicit aliases, alias order
    /// for patterns.
    pub targets: Vec<Target>,
    /// Aliases of an explicit list that matched nothing.
    pub unknown: Vec<String>,
}

/// Expand `selector` over the known golden aliases and, when an owner is
/// given, that owner's workspace aliases. A workspace shadows a golden
/// repository of the same alias.
pub fn resolve(
    selector: &RepoSelector,
    golden: &[String],
    workspaces: Option<(&str, &[String])>,
) -> Result<Resolution> {
    let mut candidates: BTreeMap<&str, TargetKind> = golden
        .iter()
        .map(|a| (a.as_str(), TargetKind::Golden))
        .collect();
    if let Some((owner, aliases)) = workspaces {
        for alias in aliases {
            candidates.insert(
                alias.as_str(),
                TargetKind::Workspace {
                    owner: owner.to_string(),
                },
            );
        }
    }
    let lookup = |alias: &str| -> Option<Target> {
        candidates.get(alias).map(|kind| Target {
            alias: alias.to_string(),
            kind: kind.clone(),
        })
    };

    match selector {
        RepoSelector::One(s) if s.trim().is_empty() => {
            Err(FleetError::validation("repository selector must not be empty"))
        }
        RepoSelector::One(pattern) if is_glob(pattern) => {
            let matcher = Glob::new(pattern)?.compile_matcher();
            let targets: Vec<Target> = candidates
                .keys()
                .copied()
                .filter(|alias| matcher.is_match(alias))
                .filter_map(&lookup)
                .collect();
            if targets.is_empty() {
                return Err(FleetError::not_found(format!(
                    "no repositories match '{}'",
                    pattern
                )));
            }
            Ok(Resolution {
                targets,
                unknown: Vec::new(),
            })
        }
        RepoSelector::One(alias) => {
            let target = lookup(alias.as_str())
                .ok_or_else(|| FleetError::not_found(format!("repository '{}'", alias)))?;
            Ok(Resolution {
                targets: vec![target],
                unknown: Vec::new(),
            })
        }
        RepoSelector::List(aliases) => {
            if aliases.is_empty() {
                return Err(FleetError::validation("repository list must not be empty"));
            }
            let mut seen = HashSet::new();
            let mut resolution = Resolution::default();
            for alias in aliases {
                if !seen.insert(alias.as_str()) {
                    continue;
                }
                match lookup(alias.as_str()) {
                    Some(target) => resolution.targets.push(target),
                    None => resolution.unknown.push(alias.clone()),
                }
            }
            Ok(resolution)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn golden() -> Vec<String> {
        ["team-a-global", "team-b-global", "team-b-local", "docs"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn aliases(r: &Resolution) -> Vec<&str> {
        r.targets.iter().map(|t| t.alias.as_str()).collect()
    }

    #[test]
    fn pattern_expands_in_alias_order() {
        let r = resolve(&RepoSelector::One("team-*-global".into()), &golden(), None).unwrap();
        assert_eq!(aliases(&r), vec!["team-a-global", "team-b-global"]);
    }

    #[test]
    fn pattern_matching_nothing_is_not_found() {
        let err = resolve(&RepoSelector::One("nope-*".into()), &golden(), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn unknown_single_alias_is_not_found() {
        let err = resolve(&RepoSelector::One("missing".into()), &golden(), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn list_keeps_order_dedups_and_reports_unknown() {
        let selector = RepoSelector::List(vec![
            "docs".into(),
            "ghost".into(),
            "team-a-global".into(),
            "docs".into(),
        ]);
        let r = resolve(&selector, &golden(), None).unwrap();
        assert_eq!(aliases(&r), vec!["docs", "team-a-global"]);
        assert_eq!(r.unknown, vec!["ghost"]);
    }

    #[test]
    fn workspace_shadows_golden_alias() {
        let ws = vec!["docs".to_string(), "scratch".to_string()];
        let r = resolve(
            &RepoSelector::One("docs".into()),
            &golden(),
            Some(("alice", ws.as_slice())),
        )
        .unwrap();
        assert_eq!(
            r.targets[0].kind,
            TargetKind::Workspace {
                owner: "alice".into()
            }
        );
    }

    #[test]
    fn cli_form_splits_commas() {
        assert_eq!(
            RepoSelector::parse("a, b,,c"),
            RepoSelector::List(vec!["a".into(), "b".into(), "c".into()])
        );
        assert!(RepoSelector::parse("team-*").is_pattern());
    }
}
