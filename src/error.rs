use std::error::Error as StdError;

/// Errors reported by the fallible entry points.
///
/// The plain constructors and operations treat the same conditions as
/// programmer errors and panic instead; see the `try_`-prefixed variants on
/// the collection types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// An accessor that does not tolerate missing keys found none.
    #[error("key not present in the map")]
    KeyAbsent,

    /// A resize target exceeded the maximum table capacity (2^30 slots).
    #[error("resize target of {0} slots exceeds the maximum table capacity")]
    CapacityExceeded(usize),

    /// A user-supplied factory or update closure failed. The operation was
    /// abandoned before any CAS was issued, so the map is unchanged.
    #[error("user predicate failed")]
    PredicateFault(#[source] Box<dyn StdError + Send + Sync>),
}

#[cfg(test)]
mod test {
    use super::Error;

    #[test]
    fn test_display_strings() {
        assert_eq!(
            Error::CapacityExceeded(1 << 31).to_string(),
            "resize target of 2147483648 slots exceeds the maximum table capacity"
        );
        assert_eq!(Error::KeyAbsent.to_string(), "key not present in the map");
    }
}
