//! Structural self-checks for the runtime's bookkeeping.
//!
//! `Master` checks that its gid index and block slots agree and that no block
//! is externalized without a storage to bring it back; `RegularLink` checks that
//! each neighbor carries a direction, bounds and wrap entry. Checks run in
//! debug builds and in release builds with `check-invariants`. A violation
//! panics in debug builds or with `strict-invariants`, and is logged
//! otherwise.

use crate::block_error::BlockError;

/// A structure that can check its own bookkeeping.
pub trait DebugInvariants {
    /// Name used when a violation is reported.
    const WHAT: &'static str;

    /// Return the first violation found.
    fn validate_invariants(&self) -> Result<(), BlockError>;

    /// Check and report through [`debug_invariants!`](crate::debug_invariants)
    /// when checks are compiled in.
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), Self::WHAT);
    }
}

/// Run a fallible check where `$what` names the call site. Compiles to
/// nothing unless checks are enabled.
#[macro_export]
macro_rules! debug_invariants {
    ($expr:expr, $what:expr) => {
        #[cfg(any(debug_assertions, feature = "strict-invariants", feature = "check-invariants"))]
        if let Err(e) = $expr {
            $crate::debug_invariants::report($what, &e);
        }
    };
}

#[doc(hidden)]
pub fn report(what: &str, err: &BlockError) {
    if cfg!(any(debug_assertions, feature = "strict-invariants")) {
        panic!("[invariants] {what}: {err}");
    }
    log::error!("[invariants] {what}: {err}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::gid::Gid;

    struct Orphan(Option<Gid>);

    impl DebugInvariants for Orphan {
        const WHAT: &'static str = "Orphan";

        fn validate_invariants(&self) -> Result<(), BlockError> {
            match self.0 {
                Some(gid) => Err(BlockError::UnknownBlock(gid)),
                None => Ok(()),
            }
        }
    }

    #[test]
    fn passing_check_is_silent() {
        Orphan(None).debug_assert_invariants();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "[invariants] Orphan: block 3")]
    fn violation_panics_in_debug_builds() {
        Orphan(Some(Gid::new(3))).debug_assert_invariants();
    }
}
