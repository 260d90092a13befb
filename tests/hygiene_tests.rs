//! Checks that no value storage outlives its logical lifetime: every removal
//! path, plus `clear` and drop, must give up its references.

use bptree::BPlusTreeMap;
use std::rc::Rc;

type Probe = Rc<[u8; 64]>;

fn probe() -> Probe {
    Rc::new([0u8; 64])
}

#[test]
fn removal_releases_values() {
    let p = probe();
    let mut m = BPlusTreeMap::new(3);
    for round in 0..10 {
        for k in 0..1000u32 {
            m.append(k, Rc::clone(&p));
        }
        assert_eq!(Rc::strong_count(&p), 1001);
        for k in 0..1000u32 {
            assert!(m.remove(&k).is_some());
        }
        assert!(m.is_empty());
        assert_eq!(
            Rc::strong_count(&p),
            1,
            "values retained after removal (round {round})"
        );
    }
}

#[test]
fn remove_all_releases_buckets() {
    let p = probe();
    let mut m = BPlusTreeMap::new(3);
    for k in 0..200u32 {
        for _ in 0..3 {
            m.append(k % 50, Rc::clone(&p));
        }
    }
    for k in 0..50u32 {
        assert!(m.remove_all(&k).is_some());
    }
    assert!(m.is_empty());
    assert_eq!(Rc::strong_count(&p), 1);
}

#[test]
fn clear_releases_values() {
    let p = probe();
    let mut m = BPlusTreeMap::new(3);
    for k in 0..500u32 {
        m.append(k / 2, Rc::clone(&p));
    }
    m.clear();
    assert_eq!(Rc::strong_count(&p), 1);
}

#[test]
fn drop_releases_values() {
    let p = probe();
    let mut m = BPlusTreeMap::new(3);
    for k in 0..500u32 {
        m.append(k, Rc::clone(&p));
    }
    drop(m);
    assert_eq!(Rc::strong_count(&p), 1);
}

#[test]
fn replace_releases_bucket() {
    let p = probe();
    let mut m = BPlusTreeMap::new(3);
    for _ in 0..4 {
        m.append(7u32, Rc::clone(&p));
    }
    assert_eq!(Rc::strong_count(&p), 5);

    let displaced = m.insert(7, Rc::clone(&p));
    assert_eq!(displaced.map(|vs| vs.len()), Some(4));
    // the displaced bucket was returned by value and dropped just above
    assert_eq!(Rc::strong_count(&p), 2);
}
