//! Optimistic concurrency for store-level compare-and-swap.

use crate::error::{DomainError, DomainResult};

/// A record whose writes are guarded by a monotonically increasing version.
///
/// Stores bump the version on every successful update; writers pass the version
/// they read as an [`ExpectedVersion`] so that a lost update becomes a conflict.
pub trait Versioned {
    fn version(&self) -> u64;
}

/// Expectation a writer holds about the stored version.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip the check (migrations, administrative repair).
    Any,
    /// Require the stored record to be at exactly this version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn of(record: &impl Versioned) -> Self {
        Self::Exact(record.version())
    }

    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "stale write (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Row(u64);

    impl Versioned for Row {
        fn version(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn exact_version_rejects_stale_writers() {
        let expected = ExpectedVersion::of(&Row(3));
        assert!(expected.check(3).is_ok());
        assert!(matches!(expected.check(4), Err(DomainError::Conflict(_))));
    }

    #[test]
    fn any_always_matches() {
        assert!(ExpectedVersion::Any.matches(0));
        assert!(ExpectedVersion::Any.matches(u64::MAX));
    }
}
