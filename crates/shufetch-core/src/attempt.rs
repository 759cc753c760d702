//! Identity of one producer attempt within a fetch batch.

use std::fmt;
use std::hash::{Hash, Hasher};

/// Identifies one execution of an upstream producer task. The serving daemon
/// routes by `path_component`; the consumer tracks attempts by the
/// `(input_index, attempt_number)` pair, which is what equality and hashing
/// are defined over.
#[derive(Debug, Clone)]
pub struct InputAttemptId {
    input_index: u32,
    attempt_number: u32,
    path_component: String,
}

impl InputAttemptId {
    pub fn new(input_index: u32, attempt_number: u32, path_component: impl Into<String>) -> Self {
        Self {
            input_index,
            attempt_number,
            path_component: path_component.into(),
        }
    }

    /// Position of this input within the consuming task, unique per task.
    pub fn input_index(&self) -> u32 {
        self.input_index
    }

    /// Distinguishes re-executions of the same input.
    pub fn attempt_number(&self) -> u32 {
        self.attempt_number
    }

    /// Routing token the response header echoes back on the wire.
    pub fn path_component(&self) -> &str {
        &self.path_component
    }
}

impl PartialEq for InputAttemptId {
    fn eq(&self, other: &Self) -> bool {
        self.input_index == other.input_index && self.attempt_number == other.attempt_number
    }
}

impl Eq for InputAttemptId {}

impl Hash for InputAttemptId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.input_index.hash(state);
        self.attempt_number.hash(state);
    }
}

impl fmt::Display for InputAttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempt {}.{} [{}]",
            self.input_index, self.attempt_number, self.path_component
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn equality_ignores_path_component() {
        let a = InputAttemptId::new(3, 0, "attempt_3_0");
        let b = InputAttemptId::new(3, 0, "some_other_route");
        assert_eq!(a, b);
    }

    #[test]
    fn reexecutions_are_distinct() {
        let first = InputAttemptId::new(3, 0, "attempt_3_0");
        let rerun = InputAttemptId::new(3, 1, "attempt_3_1");
        assert_ne!(first, rerun);
    }

    #[test]
    fn hashing_matches_equality() {
        let mut set = HashSet::new();
        set.insert(InputAttemptId::new(7, 2, "route_a"));
        assert!(set.contains(&InputAttemptId::new(7, 2, "route_b")));
        assert!(!set.contains(&InputAttemptId::new(7, 3, "route_a")));
    }

    #[test]
    fn display_includes_route() {
        let id = InputAttemptId::new(1, 0, "m_1_0");
        assert_eq!(id.to_string(), "attempt 1.0 [m_1_0]");
    }
}
