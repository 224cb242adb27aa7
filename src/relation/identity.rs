//! Single and composite column references.
//!
//! Relation keys are written against logical column names. `Identity` keeps the common
//! single-column case cheap while still supporting composite keys, and gives the
//! relation compiler a uniform way to walk column pairs in declaration order.

/// One or more logical column names, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Single column identifier
    Unary(String),
    /// Two column identifiers (composite key)
    Binary(String, String),
    /// Three or more column identifiers (composite key)
    Many(Vec<String>),
}

impl Identity {
    /// Number of columns
    pub fn arity(&self) -> usize {
        match self {
            Self::Unary(_) => 1,
            Self::Binary(_, _) => 2,
            Self::Many(cols) => cols.len(),
        }
    }

    /// Iterate over the column names in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &str> + Clone + '_ {
        let (head, tail): (&[String], &[String]) = match self {
            Self::Unary(a) => (std::slice::from_ref(a), &[]),
            Self::Binary(a, b) => (std::slice::from_ref(a), std::slice::from_ref(b)),
            Self::Many(cols) => (cols.as_slice(), &[]),
        };
        head.iter().chain(tail.iter()).map(String::as_str)
    }

    pub fn contains(&self, col: &str) -> bool {
        self.iter().any(|c| c == col)
    }

    /// Pair columns of `self` with columns of `other` by position.
    pub fn zip<'a>(&'a self, other: &'a Identity) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.iter().zip(other.iter())
    }
}

impl From<&str> for Identity {
    fn from(col: &str) -> Self {
        Identity::Unary(col.to_string())
    }
}

impl From<String> for Identity {
    fn from(col: String) -> Self {
        Identity::Unary(col)
    }
}

impl From<Vec<String>> for Identity {
    fn from(mut cols: Vec<String>) -> Self {
        match cols.len() {
            1 => Identity::Unary(cols.remove(0)),
            2 => {
                let b = cols.remove(1);
                Identity::Binary(cols.remove(0), b)
            }
            _ => Identity::Many(cols),
        }
    }
}

impl<const N: usize> From<[&str; N]> for Identity {
    fn from(cols: [&str; N]) -> Self {
        cols.iter().map(|c| c.to_string()).collect::<Vec<_>>().into()
    }
}
