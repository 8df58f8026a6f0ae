//! Which builds a `build` invocation asked for.

use std::collections::BTreeSet;
use thiserror::Error;

use crate::config::{BuildId, BuildRegistry};

/// Token selecting every configured build.
pub const ALL: &str = "all";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("unknown build '{name}'; configured builds: {known}")]
    UnknownBuild { name: String, known: String },

    #[error("unknown option '{0}'; only -f is supported")]
    UnknownOption(String),

    #[error("no builds selected")]
    Empty,
}

/// Selected build ids, processed in ascending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub ids: BTreeSet<BuildId>,
    /// Rebuild even when the target image already exists.
    pub force: bool,
}

/// Parse `build` arguments: names, `all`, and `-f` in any position.
pub fn parse_selection<S: AsRef<str>>(
    args: &[S],
    registry: &BuildRegistry,
) -> Result<Selection, SelectionError> {
    let mut ids = BTreeSet::new();
    let mut force = false;

    for arg in args {
        match arg.as_ref() {
            "-f" | "--force" => force = true,
            ALL => ids.extend(registry.iter().map(|(id, _)| id)),
            option if option.starts_with('-') => {
                return Err(SelectionError::UnknownOption(option.to_string()))
            }
            name => {
                let id = registry
                    .id_of(name)
                    .ok_or_else(|| SelectionError::UnknownBuild {
                        name: name.to_string(),
                        known: registry
                            .iter()
                            .map(|(_, n)| n)
                            .collect::<Vec<_>>()
                            .join(", "),
                    })?;
                ids.insert(id);
            }
        }
    }

    if ids.is_empty() {
        return Err(SelectionError::Empty);
    }
    Ok(Selection { ids, force })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_str;
    use std::path::Path;

    fn registry() -> BuildRegistry {
        let text = "[alpha]\nbase_layer = a\n[beta]\nbase_layer = b\n[gamma]\nbase_layer = c\n";
        parse_str(Path::new("builds.ini"), text).unwrap().1
    }

    #[test]
    fn all_expands_to_every_build() {
        let sel = parse_selection(&["all"], &registry()).unwrap();
        assert_eq!(sel.ids.into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(!sel.force);
    }

    #[test]
    fn force_flag_anywhere() {
        let sel = parse_selection(&["gamma", "-f", "alpha"], &registry()).unwrap();
        assert!(sel.force);
        assert_eq!(sel.ids.into_iter().collect::<Vec<_>>(), vec![1, 3]);

        let sel = parse_selection(&["beta", "-f"], &registry()).unwrap();
        assert!(sel.force);
    }

    #[test]
    fn duplicates_collapse() {
        let sel = parse_selection(&["beta", "all", "beta"], &registry()).unwrap();
        assert_eq!(sel.ids.len(), 3);
    }

    #[test]
    fn unknown_build_is_fatal() {
        let err = parse_selection(&["alpha", "badname"], &registry()).unwrap_err();
        assert!(matches!(&err, SelectionError::UnknownBuild { name, .. } if name == "badname"));
        assert!(err.to_string().contains("unknown build 'badname'"));
    }

    #[test]
    fn nothing_selected() {
        assert_eq!(
            parse_selection(&["-f"], &registry()).unwrap_err(),
            SelectionError::Empty
        );
        let none: [&str; 0] = [];
        assert_eq!(
            parse_selection(&none, &registry()).unwrap_err(),
            SelectionError::Empty
        );
        assert!(matches!(
            parse_selection(&["-x", "alpha"], &registry()).unwrap_err(),
            SelectionError::UnknownOption(_)
        ));
    }
}
