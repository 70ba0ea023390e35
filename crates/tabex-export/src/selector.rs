//! Table selection by include/exclude patterns

use regex::Regex;

use crate::error::{ExportError, Result};

/// Include and exclude lists applied to discovered table names
///
/// Patterns match whole names, case-insensitively; `*` matches any run of
/// characters and `?` a single one. An empty include list selects every
/// table. Exclusions win over inclusions.
#[derive(Debug, Clone, Default)]
pub struct TableSelector {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

#[derive(Debug, Clone)]
struct Pattern {
    raw: String,
    regex: Regex,
}

impl Pattern {
    fn new(raw: &str) -> Result<Self> {
        let body = regex::escape(raw.trim())
            .replace(r"\*", ".*")
            .replace(r"\?", ".");
        let regex = Regex::new(&format!("(?i)^{}$", body))
            .map_err(|e| ExportError::Config(format!("invalid table pattern '{}': {}", raw, e)))?;
        Ok(Self {
            raw: raw.trim().to_string(),
            regex,
        })
    }

    fn is_glob(&self) -> bool {
        self.raw.contains('*') || self.raw.contains('?')
    }
}

impl TableSelector {
    pub fn new<I, E, S, T>(include: I, exclude: E) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        E: IntoIterator<Item = T>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        let compile = |raw: &str| (!raw.trim().is_empty()).then(|| Pattern::new(raw));
        Ok(Self {
            include: include
                .into_iter()
                .filter_map(|p| compile(p.as_ref()))
                .collect::<Result<_>>()?,
            exclude: exclude
                .into_iter()
                .filter_map(|p| compile(p.as_ref()))
                .collect::<Result<_>>()?,
        })
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, table: &str) -> bool {
        let included =
            self.include.is_empty() || self.include.iter().any(|p| p.regex.is_match(table));
        included && !self.exclude.iter().any(|p| p.regex.is_match(table))
    }

    /// Selected tables, in the order they were discovered
    ///
    /// A literal include naming no discovered table is a configuration
    /// error; glob includes may match nothing.
    pub fn select(&self, available: &[String]) -> Result<Vec<String>> {
        let missing: Vec<&str> = self
            .include
            .iter()
            .filter(|p| !p.is_glob() && !available.iter().any(|t| p.regex.is_match(t)))
            .map(|p| p.raw.as_str())
            .collect();

        if !missing.is_empty() {
            return Err(ExportError::Config(format!(
                "tables not found in source: {}",
                missing.join(", ")
            )));
        }

        Ok(available
            .iter()
            .filter(|t| self.matches(t))
            .cloned()
            .collect())
    }
}
