//! Glob patterns over table names.

use regex::Regex;

/// A compiled table-name glob: `*` matches any run of characters, `?`
/// exactly one. Everything else is literal.
#[derive(Debug, Clone)]
pub struct TablePattern {
    glob: String,
    regex: Regex,
}

impl TablePattern {
    pub fn new(glob: &str) -> Self {
        let mut source = String::with_capacity(glob.len() + 8);
        source.push('^');
        let mut literal = String::new();
        for c in glob.chars() {
            match c {
                '*' | '?' => {
                    source.push_str(&regex::escape(&literal));
                    literal.clear();
                    source.push_str(if c == '*' { ".*" } else { "." });
                }
                _ => literal.push(c),
            }
        }
        source.push_str(&regex::escape(&literal));
        source.push('$');

        // Escaped literals and the two wildcards always form a valid regex.
        let regex = Regex::new(&source).expect("escaped glob compiles");
        Self {
            glob: glob.to_string(),
            regex,
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }
}
