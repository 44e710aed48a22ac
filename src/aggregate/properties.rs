//! Static properties of an aggregate function type

/// Facts about an aggregate function that are independent of argument types
/// and parameters. Consumed by the planner; no behavior of its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateProperties {
    /// When the function is wrapped with a null-handling combinator, should
    /// it return a non-nullable default value instead of NULL when no values
    /// were aggregated (example: count).
    pub returns_default_when_only_null: bool,

    /// Result varies depending on the data order (example: collecting values
    /// into an array). Also known as "non-commutative".
    pub is_order_dependent: bool,

    /// True for functions that only make sense over a window frame and need
    /// window-specific driving (example: rank).
    pub is_window_function: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_all_false() {
        let props = AggregateProperties::default();
        assert!(!props.returns_default_when_only_null);
        assert!(!props.is_order_dependent);
        assert!(!props.is_window_function);
    }
}
