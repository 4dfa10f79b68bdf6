//! Column names an entity already has before any source table is extracted.

use std::collections::HashSet;

/// Column names accepted for one entity up front (the target's columns).
///
/// A source table whose every column is already accepted adds nothing and is
/// skipped. Overlap between source tables is not decided here: every
/// contributing table is saved whole, and the merge keeps the first table in
/// name order for each column, whatever order the fetches finished in.
#[derive(Debug, Default, Clone)]
pub struct AcceptedColumns {
    names: HashSet<String>,
}

impl AcceptedColumns {
    pub fn new() -> Self {
        Self::default()
    }

    /// A set pre-populated with `names`.
    pub fn seeded<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// The names in `columns` not yet accepted, in input order, each once.
    pub fn new_columns(&self, columns: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        columns
            .iter()
            .filter(|c| !self.names.contains(*c) && seen.insert(c.as_str()))
            .cloned()
            .collect()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.names.contains(column)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_new_columns_excludes_seeded() {
        let accepted = AcceptedColumns::seeded(["label"]);
        assert_eq!(
            accepted.new_columns(&names(&["reg_close", "label"])),
            names(&["reg_close"])
        );
        assert!(accepted.new_columns(&names(&["label"])).is_empty());
        assert!(accepted.contains("label"));
        assert_eq!(accepted.len(), 1);
    }

    #[test]
    fn test_lookups_do_not_accept() {
        let accepted = AcceptedColumns::new();
        assert_eq!(accepted.new_columns(&names(&["a", "b"])), names(&["a", "b"]));
        assert_eq!(accepted.new_columns(&names(&["b"])), names(&["b"]));
        assert!(accepted.is_empty());
    }

    #[test]
    fn test_duplicates_within_one_table() {
        let accepted = AcceptedColumns::new();
        assert_eq!(accepted.new_columns(&names(&["a", "a"])), names(&["a"]));
    }
}
