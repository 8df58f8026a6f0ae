//! End-of-run status report.

use colored::Colorize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::config::{BuildId, BuildRegistry};
use crate::selection::Selection;

/// What happened to one selected build.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Outcome {
    #[default]
    NotProcessed,
    Built(PathBuf),
    Skipped(String),
    Aborted,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::NotProcessed => write!(f, "not processed"),
            Outcome::Built(path) => write!(f, "built ({})", path.display()),
            Outcome::Skipped(reason) => write!(f, "skipped ({reason})"),
            Outcome::Aborted => write!(f, "aborted"),
        }
    }
}

/// One slot per selected build, in build id order.
#[derive(Debug, Clone)]
pub struct StatusReport {
    entries: BTreeMap<BuildId, (String, Outcome)>,
}

impl StatusReport {
    pub fn new(selection: &Selection, registry: &BuildRegistry) -> Self {
        let entries = selection
            .ids
            .iter()
            .map(|&id| {
                let name = registry.name_of(id).unwrap_or("?").to_string();
                (id, (name, Outcome::NotProcessed))
            })
            .collect();
        Self { entries }
    }

    /// Record an outcome. Ids that were not selected are ignored.
    pub fn set(&mut self, id: BuildId, outcome: Outcome) {
        if let Some((_, slot)) = self.entries.get_mut(&id) {
            *slot = outcome;
        }
    }

    pub fn outcome(&self, id: BuildId) -> Option<&Outcome> {
        self.entries.get(&id).map(|(_, outcome)| outcome)
    }

    pub fn built_count(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Built(_)))
    }

    pub fn skipped_count(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Skipped(_)))
    }

    fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.entries.values().filter(|(_, o)| pred(o)).count()
    }

    pub fn render(&self) -> String {
        let width = self
            .entries
            .values()
            .map(|(name, _)| name.len())
            .max()
            .unwrap_or(0);

        let mut out = String::new();
        for (name, outcome) in self.entries.values() {
            let status = outcome.to_string();
            let status = match outcome {
                Outcome::Built(_) => status.green(),
                Outcome::Skipped(_) => status.yellow(),
                Outcome::Aborted => status.red().bold(),
                Outcome::NotProcessed => status.dimmed(),
            };
            out.push_str(&format!("  {:<width$}  {status}\n", name.bold()));
        }
        out.push_str(&format!(
            "{} built, {} skipped.\n",
            self.built_count(),
            self.skipped_count()
        ));
        out
    }

    pub fn print(&self) {
        println!();
        println!("{}", "Build summary:".bold());
        print!("{}", self.render());
    }
}
