use bptree::BPlusTreeMap;
use proptest::prelude::*;
use std::collections::BTreeMap as StdMap;
use std::ops::Bound;

mod common;
use common::*;

fn in_range(k: u16, lo: Bound<u16>, hi: Bound<u16>) -> bool {
    let lo_ok = match lo {
        Bound::Unbounded => true,
        Bound::Included(a) => k >= a,
        Bound::Excluded(a) => k > a,
    };
    let hi_ok = match hi {
        Bound::Unbounded => true,
        Bound::Included(b) => k <= b,
        Bound::Excluded(b) => k < b,
    };
    lo_ok && hi_ok
}

// any insertion order comes back sorted by key
fn check_entries_sorted(order: usize, v: U16Pairs) {
    let mut m = BPlusTreeMap::new(order);
    let mut model = StdMap::new();
    for (k, v) in v {
        m.insert(k, v);
        model.insert(k, v);
    }

    assert_eq!(m.len(), model.len());
    assert!(m.iter().eq(model.iter()));

    let keys: Vec<u16> = m.keys().copied().collect();
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
}

fn check_range_equiv(order: usize, v: U16Pairs, r: (Bound<u16>, Bound<u16>)) {
    let mut m = BPlusTreeMap::new(order);
    let mut model = StdMap::new();
    for (k, v) in v {
        m.insert(k, v);
        model.insert(k, v);
    }

    let got: Vec<(u16, u16)> = m.range(r).map(|(k, v)| (*k, *v)).collect();
    let expect: Vec<(u16, u16)> = model
        .iter()
        .filter(|(k, _)| in_range(**k, r.0, r.1))
        .map(|(k, v)| (*k, *v))
        .collect();
    assert_eq!(got, expect);
}

fn check_multimap(order: usize, v: U16Pairs) {
    let mut m = BPlusTreeMap::new(order);
    let mut model: StdMap<u16, Vec<u16>> = StdMap::new();
    for (k, v) in v {
        m.append(k, v);
        model.entry(k).or_default().push(v);
    }

    assert_eq!(m.len(), model.values().map(Vec::len).sum::<usize>());
    for (k, vs) in &model {
        assert_eq!(m.get(k), vs.first());
        assert_eq!(m.get_all(k), Some(vs.iter().collect()));
    }

    let flat: Vec<(u16, u16)> = model
        .iter()
        .flat_map(|(k, vs)| vs.iter().map(move |v| (*k, *v)))
        .collect();
    assert!(m.iter().map(|(k, v)| (*k, *v)).eq(flat));
}

fn check_into_iter(order: usize, v: U16Pairs) {
    let mut m = BPlusTreeMap::new(order);
    for (k, v) in v {
        m.append(k, v);
    }

    let borrowed: Vec<(u16, u16)> = m.iter().map(|(k, v)| (*k, *v)).collect();
    let owned: Vec<(u16, u16)> = m.into_iter().collect();
    assert_eq!(owned, borrowed);
}

fn check_removals(order: usize, v: U16Pairs) {
    let mut m = BPlusTreeMap::new(order);
    let mut model = StdMap::new();
    for (k, v) in v {
        if k < 512 {
            let old = m.insert(k, v);
            assert_eq!(old, model.insert(k, v).map(|v| vec![v]));
        } else {
            let k = k - 512;
            assert_eq!(m.remove(&k), model.remove(&k));
        }
        assert_eq!(m.len(), model.len());
    }
    assert!(m.iter().eq(model.iter()));
}

proptest! {
    #[test]
    fn test_entries_sorted(order in orders(), v in small_int_pairs()) {
        check_entries_sorted(order, v);
    }

    #[test]
    fn test_range(
        order in orders(),
        v in small_int_pairs(),
        r in range_bounds_1k(),
    ) {
        check_range_equiv(order, v, r);
    }

    #[test]
    fn test_multimap(order in orders(), v in small_int_pairs()) {
        check_multimap(order, v);
    }

    #[test]
    fn test_into_iter(order in orders(), v in small_int_pairs()) {
        check_into_iter(order, v);
    }

    #[test]
    fn test_removals(order in orders(), v in small_int_pairs()) {
        check_removals(order, v);
    }
}

fn xorshift(s: &mut u32) -> u32 {
    *s ^= *s << 13;
    *s ^= *s >> 17;
    *s ^= *s << 5;
    *s
}

fn shuffled(n: u32, seed: u32) -> Vec<u32> {
    let mut keys: Vec<u32> = (0..n).collect();
    let mut s = seed;
    for i in (1..keys.len()).rev() {
        let j = (xorshift(&mut s) as usize) % (i + 1);
        keys.swap(i, j);
    }
    keys
}

#[test]
fn first_last_track_extremes() {
    let mut m = BPlusTreeMap::new(4);
    assert_eq!(m.first_key_value(), None);
    assert_eq!(m.last_key_value(), None);

    let (mut min, mut max) = (u32::MAX, 0);
    for k in shuffled(1000, 0x9e3779b9) {
        m.insert(k, k * 2);
        min = min.min(k);
        max = max.max(k);
        assert_eq!(m.first_key_value(), Some((&min, &(min * 2))));
        assert_eq!(m.last_key_value(), Some((&max, &(max * 2))));
    }
}

#[test]
fn range_on_sparse_keys() {
    // odd keys 5, 7, .., 63; probes hit present keys, absent keys, and both
    // sides of the stored span
    let keys: Vec<u16> = (0..30).map(|i| 5 + 2 * i).collect();
    let mut m = BPlusTreeMap::new(3);
    let mut s = 0xdecafbad_u32;
    let mut order = keys.clone();
    for i in (1..order.len()).rev() {
        let j = (xorshift(&mut s) as usize) % (i + 1);
        order.swap(i, j);
    }
    for &k in &order {
        m.insert(k, k * 10);
    }

    let probes = [
        None,
        Some(0),
        Some(5),
        Some(6),
        Some(33),
        Some(63),
        Some(64),
        Some(100),
    ];
    for from in probes {
        for to in probes {
            let got: Vec<u16> = match (from, to) {
                (None, None) => m.range::<u16, _>(..),
                (Some(a), None) => m.range(a..),
                (None, Some(b)) => m.range(..b),
                (Some(a), Some(b)) => m.range(a..b),
            }
            .map(|(k, _)| *k)
            .collect();

            let expect: Vec<u16> = keys
                .iter()
                .copied()
                .filter(|&k| from.map_or(true, |a| k >= a))
                .filter(|&k| to.map_or(true, |b| k < b))
                .collect();
            assert_eq!(got, expect, "range {from:?}..{to:?}");
        }
    }
}
