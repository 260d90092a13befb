use proptest::prelude::*;
use std::ops::Bound;

pub(super) type U16Pairs = Vec<(u16, u16)>;

pub(super) fn small_int_pairs() -> impl Strategy<Value = U16Pairs> {
    prop::collection::vec((0u16..1024u16, 0u16..1024u16), 0..512)
}

// spread across orders so both deep and shallow trees get exercised
pub(super) fn orders() -> impl Strategy<Value = usize> {
    3usize..12
}

pub(super) fn range_bounds_1k(
) -> impl Strategy<Value = (Bound<u16>, Bound<u16>)> {
    (1u16..1023).prop_flat_map(|n| {
        (
            prop_oneof![
                Just(Bound::Unbounded),
                (0u16..=n).prop_map(Bound::Excluded),
                (0u16..=n).prop_map(Bound::Included),
            ],
            prop_oneof![
                Just(Bound::Unbounded),
                (n..1024).prop_map(Bound::Excluded),
                (n..1024).prop_map(Bound::Included),
            ],
        )
    })
}
