//! Error types for shared Eddy types.

/// Errors raised while building identifiers or parsing type-level configuration.
#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    /// A block id component does not fit in its bit field.
    #[error("{field} {value} does not fit in the block id layout (max {max})")]
    LayoutOverflow {
        /// Which component overflowed.
        field: &'static str,
        /// The offending value.
        value: u64,
        /// Largest value the layout can encode.
        max: u64,
    },

    /// The layout bit widths do not add up to 63.
    #[error("block id layout must use 63 bits, got {0}")]
    InvalidLayout(u32),

    /// A storage tier list could not be parsed.
    #[error("invalid storage tier list {input:?}: {reason}")]
    InvalidTierList {
        /// The raw configuration string.
        input: String,
        /// What was wrong with it.
        reason: String,
    },
}
