use std::borrow::Borrow;
use std::cmp::Ordering::*;
use std::iter::FusedIterator;
use std::mem;
use std::ops::{Bound, RangeBounds};

/// Smallest permitted order; [`BPlusTreeMap::new`] clamps to this.
pub const MIN_ORDER: usize = 3;

/// Order used by [`Default`] and [`FromIterator`].
pub const DEFAULT_ORDER: usize = 8;

/// Handle into the node arena.  Nodes never move, so a `NodeId` stays valid
/// until the node is released back to the free list.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct NodeId(usize);

/// A leaf slot holds either a single value or a bucket of values for the
/// same key, in insertion order.  A bucket never holds fewer than two
/// entries while stored; removals that would leave one collapse it back to
/// `One`.
#[derive(Clone, Debug)]
enum Slot<V> {
    One(V),
    Many(Vec<V>),
}

impl<V> Slot<V> {
    fn len(&self) -> usize {
        match self {
            Slot::One(_) => 1,
            Slot::Many(vs) => vs.len(),
        }
    }

    fn first(&self) -> &V {
        match self {
            Slot::One(v) => v,
            Slot::Many(vs) => &vs[0],
        }
    }

    fn first_mut(&mut self) -> &mut V {
        match self {
            Slot::One(v) => v,
            Slot::Many(vs) => &mut vs[0],
        }
    }

    fn last(&self) -> &V {
        match self {
            Slot::One(v) => v,
            Slot::Many(vs) => vs.last().expect("bucket is never empty"),
        }
    }

    fn push(&mut self, value: V) {
        match self {
            Slot::Many(vs) => vs.push(value),
            Slot::One(_) => {
                let old = mem::replace(self, Slot::Many(Vec::with_capacity(2)));
                let Slot::One(first) = old else { unreachable!() };
                let Slot::Many(vs) = self else { unreachable!() };
                vs.push(first);
                vs.push(value);
            }
        }
    }

    fn into_vec(self) -> Vec<V> {
        match self {
            Slot::One(v) => vec![v],
            Slot::Many(vs) => vs,
        }
    }
}

#[derive(Clone, Debug)]
enum Kind<V> {
    Branch(Vec<NodeId>),
    Leaf(Vec<Slot<V>>),
}

/// One tree node.  A branch carries `keys.len() + 1` children; a leaf
/// carries one slot per key.  `left`/`right` are non-owning handles forming
/// a doubly-linked chain on every level.
#[derive(Clone, Debug)]
struct Node<K, V> {
    keys: Vec<K>,
    kind: Kind<V>,
    left: Option<NodeId>,
    right: Option<NodeId>,
}

impl<K, V> Node<K, V> {
    fn leaf() -> Self {
        Node {
            keys: Vec::new(),
            kind: Kind::Leaf(Vec::new()),
            left: None,
            right: None,
        }
    }

    fn is_leaf(&self) -> bool {
        matches!(self.kind, Kind::Leaf(_))
    }

    fn kids(&self) -> &[NodeId] {
        match &self.kind {
            Kind::Branch(kids) => kids,
            Kind::Leaf(_) => unreachable!("leaf has no children"),
        }
    }

    // occupancy in the sense of the min/max bounds: children for a branch,
    // stored slots for a leaf
    fn count(&self) -> usize {
        match &self.kind {
            Kind::Branch(kids) => kids.len(),
            Kind::Leaf(slots) => slots.len(),
        }
    }
}

// index of the child whose subtree may contain `key`; keys equal to a
// separator sort to the right of it
fn child_index<K, Q>(keys: &[K], key: &Q) -> usize
where
    K: Borrow<Q>,
    Q: Ord + ?Sized,
{
    let mut i = 0;
    while i < keys.len() && keys[i].borrow() <= key {
        i += 1;
    }
    i
}

enum Take {
    Last,
    At(usize),
    All,
}

enum Taken<V> {
    Single(V),
    Whole(Vec<V>),
}

/// An ordered map from keys to one *or more* values, backed by a B+ tree.
///
/// All values live in the leaves; branches hold only separator keys.  The
/// leaves (and every other level) form a doubly-linked sibling chain, which
/// is what [`range`](Self::range) and [`iter`](Self::iter) walk.  A key that
/// is [`append`](Self::append)ed to repeatedly keeps all of its values in
/// insertion order.
///
/// The fan-out is chosen at construction time and clamped to [`MIN_ORDER`].
/// Nodes are kept in an arena owned by the map and referenced by handles, so
/// sibling links never constitute ownership.
///
/// # Examples
///
/// ```
/// use bptree::BPlusTreeMap;
///
/// let mut index = BPlusTreeMap::new(8);
/// index.insert(1, "one");
/// index.insert(2, "two");
/// index.append(2, "deux");
///
/// assert_eq!(index.get(&1), Some(&"one"));
/// assert_eq!(index.get_all(&2), Some(vec![&"two", &"deux"]));
/// assert_eq!(index.len(), 3);
/// ```
#[derive(Clone)]
pub struct BPlusTreeMap<K, V> {
    nodes: Vec<Node<K, V>>,
    free: Vec<NodeId>,
    root: NodeId,
    order: usize,
    bmin: usize,
    len: usize,
}

impl<K, V> BPlusTreeMap<K, V> {
    /// Creates an empty map with the given order (maximum fan-out of a
    /// branch, equal to the maximum key-count of a leaf).  Orders below
    /// [`MIN_ORDER`] are clamped.
    pub fn new(order: usize) -> Self {
        let order = order.max(MIN_ORDER);
        BPlusTreeMap {
            nodes: vec![Node::leaf()],
            free: Vec::new(),
            root: NodeId(0),
            order,
            bmin: (order + 1) / 2,
            len: 0,
        }
    }

    /// Returns the order the map was created with (after clamping).
    pub fn order(&self) -> usize {
        self.order
    }

    /// Returns the number of stored values.  A key with a bucket of `n`
    /// values contributes `n`.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drops every entry and node, resetting to an empty root leaf.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.nodes.push(Node::leaf());
        self.root = NodeId(0);
        self.len = 0;
    }

    fn node(&self, id: NodeId) -> &Node<K, V> {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node<K, V> {
        &mut self.nodes[id.0]
    }

    fn alloc(&mut self, node: Node<K, V>) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id.0] = node;
                id
            }
            None => {
                self.nodes.push(node);
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    // The old payload is dropped here, not when the slot is reused.
    fn release(&mut self, id: NodeId) {
        self.nodes[id.0] = Node::leaf();
        self.free.push(id);
    }

    // **********
    //   Lookup
    // **********

    // leaf and in-leaf index of `key`, if present
    fn find_slot<Q>(&self, key: &Q) -> Option<(NodeId, usize)>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut id = self.root;
        loop {
            match &self.node(id).kind {
                Kind::Branch(kids) => {
                    id = kids[child_index(&self.node(id).keys, key)];
                }
                Kind::Leaf(_) => break,
            }
        }
        for (i, k) in self.node(id).keys.iter().enumerate() {
            match key.cmp(k.borrow()) {
                Less => return None,
                Equal => return Some((id, i)),
                Greater => (),
            }
        }
        None
    }

    /// Returns a reference to the value for `key`.  If the key holds a
    /// bucket, this is its first (oldest) value.
    ///
    /// # Examples
    /// ```
    /// use bptree::BPlusTreeMap;
    ///
    /// let mut m = BPlusTreeMap::new(4);
    /// m.insert(0, 'a');
    /// assert_eq!(m.get(&0), Some(&'a'));
    /// assert_eq!(m.get(&1), None);
    /// ```
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let (leaf, i) = self.find_slot(key)?;
        match &self.node(leaf).kind {
            Kind::Leaf(slots) => Some(slots[i].first()),
            Kind::Branch(_) => unreachable!("found a value in a branch"),
        }
    }

    /// Returns a mutable reference to the value for `key` (the first bucket
    /// entry, if the key holds a bucket).
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let (leaf, i) = self.find_slot(key)?;
        match &mut self.node_mut(leaf).kind {
            Kind::Leaf(slots) => Some(slots[i].first_mut()),
            Kind::Branch(_) => unreachable!("found a value in a branch"),
        }
    }

    /// Returns every value stored for `key`, oldest first, or `None` if the
    /// key is absent.
    ///
    /// # Examples
    /// ```
    /// use bptree::BPlusTreeMap;
    ///
    /// let mut m = BPlusTreeMap::new(4);
    /// m.append("k", 1);
    /// m.append("k", 2);
    /// assert_eq!(m.get_all("k"), Some(vec![&1, &2]));
    /// assert_eq!(m.get_all("missing"), None);
    /// ```
    pub fn get_all<Q>(&self, key: &Q) -> Option<Vec<&V>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let (leaf, i) = self.find_slot(key)?;
        match &self.node(leaf).kind {
            Kind::Leaf(slots) => Some(match &slots[i] {
                Slot::One(v) => vec![v],
                Slot::Many(vs) => vs.iter().collect(),
            }),
            Kind::Branch(_) => unreachable!("found a value in a branch"),
        }
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.find_slot(key).is_some()
    }

    /// Returns the entry with the least key, or `None` on an empty map.
    /// For a bucket this yields its first (oldest) value.
    pub fn first_key_value(&self) -> Option<(&K, &V)> {
        if self.len == 0 {
            return None;
        }
        let mut id = self.root;
        loop {
            match &self.node(id).kind {
                Kind::Branch(kids) => id = kids[0],
                Kind::Leaf(slots) => {
                    return Some((&self.node(id).keys[0], slots[0].first()));
                }
            }
        }
    }

    /// Returns the entry with the greatest key, or `None` on an empty map.
    /// For a bucket this yields its last (newest) value.
    pub fn last_key_value(&self) -> Option<(&K, &V)> {
        if self.len == 0 {
            return None;
        }
        let mut id = self.root;
        loop {
            match &self.node(id).kind {
                Kind::Branch(kids) => {
                    id = *kids.last().expect("branch with no children");
                }
                Kind::Leaf(slots) => {
                    let keys = &self.node(id).keys;
                    let last = slots.last().expect("non-root leaf is never empty");
                    return Some((keys.last().unwrap(), last.last()));
                }
            }
        }
    }

    // *************
    //   Insertion
    // *************

    /// Places `(key, value)`, replacing whatever the key held before.  The
    /// displaced values (the whole bucket, if one had accumulated) are
    /// returned oldest-first.
    ///
    /// # Examples
    /// ```
    /// use bptree::BPlusTreeMap;
    ///
    /// let mut m = BPlusTreeMap::new(4);
    /// assert_eq!(m.insert(0, 1), None);
    /// assert_eq!(m.insert(0, 2), Some(vec![1]));
    /// assert_eq!(m.len(), 1);
    /// ```
    pub fn insert(&mut self, key: K, value: V) -> Option<Vec<V>>
    where
        K: Ord + Clone,
    {
        self.insert_impl(key, value, true).map(Slot::into_vec)
    }

    /// Places `(key, value)`, keeping whatever the key held before: a
    /// repeated key accumulates its values in insertion order.
    pub fn append(&mut self, key: K, value: V)
    where
        K: Ord + Clone,
    {
        let displaced = self.insert_impl(key, value, false);
        debug_assert!(displaced.is_none());
    }

    fn insert_impl(&mut self, key: K, value: V, replace: bool) -> Option<Slot<V>>
    where
        K: Ord + Clone,
    {
        let root = self.root;
        let (displaced, split) = self.insert_at(root, key, value, replace);
        if let Some((sep, right)) = split {
            let new_root = self.alloc(Node {
                keys: vec![sep],
                kind: Kind::Branch(vec![root, right]),
                left: None,
                right: None,
            });
            self.root = new_root;
        }
        match &displaced {
            Some(slot) => self.len = self.len + 1 - slot.len(),
            None => self.len += 1,
        }
        displaced
    }

    fn insert_at(
        &mut self,
        id: NodeId,
        key: K,
        value: V,
        replace: bool,
    ) -> (Option<Slot<V>>, Option<(K, NodeId)>)
    where
        K: Ord + Clone,
    {
        if self.node(id).is_leaf() {
            return self.insert_into_leaf(id, key, value, replace);
        }
        let i = child_index(&self.node(id).keys, &key);
        let child = self.node(id).kids()[i];
        let (displaced, split) = self.insert_at(child, key, value, replace);
        match split {
            Some((sep, new_child)) => {
                (displaced, self.insert_into_branch(id, sep, new_child))
            }
            None => (displaced, None),
        }
    }

    fn insert_into_leaf(
        &mut self,
        id: NodeId,
        key: K,
        value: V,
        replace: bool,
    ) -> (Option<Slot<V>>, Option<(K, NodeId)>)
    where
        K: Ord + Clone,
    {
        let order = self.order;
        let bmin = self.bmin;
        let n = self.node_mut(id);
        let Kind::Leaf(slots) = &mut n.kind else {
            unreachable!("insert_into_leaf on a branch")
        };

        let mut pos = n.keys.len();
        for (i, k) in n.keys.iter().enumerate() {
            match key.cmp(k) {
                Greater => (),
                Equal => {
                    // the slot is updated in place; the node cannot split
                    return if replace {
                        let old = mem::replace(&mut slots[i], Slot::One(value));
                        (Some(old), None)
                    } else {
                        slots[i].push(value);
                        (None, None)
                    };
                }
                Less => {
                    pos = i;
                    break;
                }
            }
        }

        n.keys.insert(pos, key);
        slots.insert(pos, Slot::One(value));
        if n.keys.len() <= order {
            return (None, None);
        }

        // overfull: keep bmin entries, move the rest to a new right sibling;
        // the separator is a copy of the sibling's first key
        let right_keys = n.keys.split_off(bmin);
        let right_slots = slots.split_off(bmin);
        let old_right = n.right;
        let sep = right_keys[0].clone();
        let rid = self.alloc(Node {
            keys: right_keys,
            kind: Kind::Leaf(right_slots),
            left: Some(id),
            right: old_right,
        });
        self.node_mut(id).right = Some(rid);
        if let Some(next) = old_right {
            self.node_mut(next).left = Some(rid);
        }
        (None, Some((sep, rid)))
    }

    // inserts a separator and the child to its right, splitting on overflow;
    // unlike a leaf split, the promoted key leaves both halves
    fn insert_into_branch(
        &mut self,
        id: NodeId,
        sep: K,
        child: NodeId,
    ) -> Option<(K, NodeId)>
    where
        K: Ord + Clone,
    {
        let order = self.order;
        let bmin = self.bmin;
        let n = self.node_mut(id);
        let Kind::Branch(kids) = &mut n.kind else {
            unreachable!("insert_into_branch on a leaf")
        };

        let mut pos = n.keys.len();
        for (i, k) in n.keys.iter().enumerate() {
            if sep < *k {
                pos = i;
                break;
            }
        }
        n.keys.insert(pos, sep);
        kids.insert(pos + 1, child);
        if kids.len() <= order {
            return None;
        }

        let right_keys = n.keys.split_off(bmin);
        let promoted = n.keys.pop().expect("split point inside the node");
        let right_kids = kids.split_off(bmin);
        let old_right = n.right;
        let rid = self.alloc(Node {
            keys: right_keys,
            kind: Kind::Branch(right_kids),
            left: Some(id),
            right: old_right,
        });
        self.node_mut(id).right = Some(rid);
        if let Some(next) = old_right {
            self.node_mut(next).left = Some(rid);
        }
        Some((promoted, rid))
    }

    // ************
    //   Deletion
    // ************

    /// Removes one value for `key`: the newest bucket entry, or the sole
    /// value (dropping the key).
    ///
    /// # Examples
    /// ```
    /// use bptree::BPlusTreeMap;
    ///
    /// let mut m = BPlusTreeMap::new(4);
    /// m.insert(0, 'a');
    /// assert_eq!(m.remove(&0), Some('a'));
    /// assert_eq!(m.remove(&0), None);
    /// ```
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q> + Clone,
        Q: Ord + ?Sized,
    {
        match self.remove_impl(key, Take::Last)? {
            Taken::Single(v) => Some(v),
            Taken::Whole(_) => unreachable!("remove takes a single value"),
        }
    }

    /// Removes the bucket entry at `idx` (0-based, in insertion order).  On
    /// a key holding a single value only `idx == 0` succeeds.  Out-of-range
    /// indices and absent keys return `None`.
    pub fn remove_at<Q>(&mut self, key: &Q, idx: usize) -> Option<V>
    where
        K: Borrow<Q> + Clone,
        Q: Ord + ?Sized,
    {
        match self.remove_impl(key, Take::At(idx))? {
            Taken::Single(v) => Some(v),
            Taken::Whole(_) => unreachable!("remove_at takes a single value"),
        }
    }

    /// Removes `key` with everything it holds, returning the values oldest
    /// first.
    pub fn remove_all<Q>(&mut self, key: &Q) -> Option<Vec<V>>
    where
        K: Borrow<Q> + Clone,
        Q: Ord + ?Sized,
    {
        match self.remove_impl(key, Take::All)? {
            Taken::Whole(vs) => Some(vs),
            Taken::Single(_) => unreachable!("remove_all takes the whole slot"),
        }
    }

    fn remove_impl<Q>(&mut self, key: &Q, take: Take) -> Option<Taken<V>>
    where
        K: Borrow<Q> + Clone,
        Q: Ord + ?Sized,
    {
        let root = self.root;
        let taken = self.remove_at_node(root, key, take)?;

        // a branch root left with a single child hands the root over to it
        if let Kind::Branch(kids) = &self.node(root).kind {
            if kids.len() == 1 {
                let child = kids[0];
                self.release(root);
                self.root = child;
            }
        }

        self.len -= match &taken {
            Taken::Single(_) => 1,
            Taken::Whole(vs) => vs.len(),
        };
        Some(taken)
    }

    fn remove_at_node<Q>(&mut self, id: NodeId, key: &Q, take: Take) -> Option<Taken<V>>
    where
        K: Borrow<Q> + Clone,
        Q: Ord + ?Sized,
    {
        if self.node(id).is_leaf() {
            return self.remove_from_leaf(id, key, take);
        }
        let i = child_index(&self.node(id).keys, key);
        let child = self.node(id).kids()[i];
        let taken = self.remove_at_node(child, key, take)?;
        if self.node(child).count() < self.bmin {
            self.rebalance(id, i);
        }
        Some(taken)
    }

    fn remove_from_leaf<Q>(&mut self, id: NodeId, key: &Q, take: Take) -> Option<Taken<V>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let n = self.node_mut(id);
        let Kind::Leaf(slots) = &mut n.kind else {
            unreachable!("remove_from_leaf on a branch")
        };

        let mut found = None;
        for (i, k) in n.keys.iter().enumerate() {
            match key.cmp(k.borrow()) {
                Less => return None,
                Equal => {
                    found = Some(i);
                    break;
                }
                Greater => (),
            }
        }
        let i = found?;

        match take {
            Take::All => {
                n.keys.remove(i);
                Some(Taken::Whole(slots.remove(i).into_vec()))
            }
            Take::Last => match &mut slots[i] {
                Slot::Many(vs) => {
                    let v = vs.pop().expect("bucket is never empty");
                    if vs.len() == 1 {
                        let only = vs.pop().unwrap();
                        slots[i] = Slot::One(only);
                    }
                    Some(Taken::Single(v))
                }
                Slot::One(_) => {
                    n.keys.remove(i);
                    let Slot::One(v) = slots.remove(i) else { unreachable!() };
                    Some(Taken::Single(v))
                }
            },
            Take::At(idx) => match &mut slots[i] {
                Slot::One(_) if idx == 0 => {
                    n.keys.remove(i);
                    let Slot::One(v) = slots.remove(i) else { unreachable!() };
                    Some(Taken::Single(v))
                }
                Slot::One(_) => None,
                Slot::Many(vs) => {
                    if idx >= vs.len() {
                        return None;
                    }
                    let v = vs.remove(idx);
                    if vs.len() == 1 {
                        let only = vs.pop().unwrap();
                        slots[i] = Slot::One(only);
                    }
                    Some(Taken::Single(v))
                }
            },
        }
    }

    // child `i` of `id` dropped below bmin: borrow from a rich neighbor
    // (left first), else merge with the smaller one, ties pairing leftward
    fn rebalance(&mut self, id: NodeId, i: usize)
    where
        K: Clone,
    {
        let bmin = self.bmin;
        let (left, right) = {
            let kids = self.node(id).kids();
            let left = if i > 0 { Some(kids[i - 1]) } else { None };
            let right = if i + 1 < kids.len() { Some(kids[i + 1]) } else { None };
            (left, right)
        };

        if let Some(l) = left {
            if self.node(l).count() > bmin {
                return self.borrow_from_left(id, i);
            }
        }
        if let Some(r) = right {
            if self.node(r).count() > bmin {
                return self.borrow_from_right(id, i);
            }
        }

        match (left, right) {
            (None, None) => unreachable!("rebalance with no siblings"),
            (Some(_), None) => self.merge_children(id, i - 1),
            (None, Some(_)) => self.merge_children(id, i),
            (Some(l), Some(r)) => {
                if self.node(l).count() <= self.node(r).count() {
                    self.merge_children(id, i - 1)
                } else {
                    self.merge_children(id, i)
                }
            }
        }
    }

    fn borrow_from_left(&mut self, parent: NodeId, i: usize)
    where
        K: Clone,
    {
        let (lid, cid) = {
            let kids = self.node(parent).kids();
            (kids[i - 1], kids[i])
        };
        if self.node(cid).is_leaf() {
            // the donor's last entry becomes the receiver's first; the
            // separator tracks the receiver's new first key
            let (k, slot) = {
                let ln = self.node_mut(lid);
                let Kind::Leaf(slots) = &mut ln.kind else { unreachable!() };
                (ln.keys.pop().unwrap(), slots.pop().unwrap())
            };
            let sep = k.clone();
            {
                let cn = self.node_mut(cid);
                let Kind::Leaf(slots) = &mut cn.kind else { unreachable!() };
                cn.keys.insert(0, k);
                slots.insert(0, slot);
            }
            self.node_mut(parent).keys[i - 1] = sep;
        } else {
            // the separator descends into the receiver; the donor's last
            // key ascends to replace it
            let (k, kid) = {
                let ln = self.node_mut(lid);
                let Kind::Branch(kids) = &mut ln.kind else { unreachable!() };
                (ln.keys.pop().unwrap(), kids.pop().unwrap())
            };
            let down = mem::replace(&mut self.node_mut(parent).keys[i - 1], k);
            let cn = self.node_mut(cid);
            let Kind::Branch(kids) = &mut cn.kind else { unreachable!() };
            cn.keys.insert(0, down);
            kids.insert(0, kid);
        }
    }

    fn borrow_from_right(&mut self, parent: NodeId, i: usize)
    where
        K: Clone,
    {
        let (cid, rid) = {
            let kids = self.node(parent).kids();
            (kids[i], kids[i + 1])
        };
        if self.node(cid).is_leaf() {
            let (k, slot) = {
                let rn = self.node_mut(rid);
                let Kind::Leaf(slots) = &mut rn.kind else { unreachable!() };
                (rn.keys.remove(0), slots.remove(0))
            };
            {
                let cn = self.node_mut(cid);
                let Kind::Leaf(slots) = &mut cn.kind else { unreachable!() };
                cn.keys.push(k);
                slots.push(slot);
            }
            let sep = self.node(rid).keys[0].clone();
            self.node_mut(parent).keys[i] = sep;
        } else {
            let (k, kid) = {
                let rn = self.node_mut(rid);
                let Kind::Branch(kids) = &mut rn.kind else { unreachable!() };
                (rn.keys.remove(0), kids.remove(0))
            };
            let down = mem::replace(&mut self.node_mut(parent).keys[i], k);
            let cn = self.node_mut(cid);
            let Kind::Branch(kids) = &mut cn.kind else { unreachable!() };
            cn.keys.push(down);
            kids.push(kid);
        }
    }

    // merges kids[li + 1] into kids[li], removing the separator between
    // them; the right node is released and the sibling chain re-stitched
    fn merge_children(&mut self, parent: NodeId, li: usize) {
        let (sep, lid, rid) = {
            let pn = self.node_mut(parent);
            let Kind::Branch(kids) = &mut pn.kind else {
                unreachable!("merge under a leaf")
            };
            let sep = pn.keys.remove(li);
            let rid = kids.remove(li + 1);
            (sep, kids[li], rid)
        };

        let (rkeys, rkind, rright) = {
            let rn = self.node_mut(rid);
            (
                mem::take(&mut rn.keys),
                mem::replace(&mut rn.kind, Kind::Leaf(Vec::new())),
                rn.right,
            )
        };

        {
            let ln = self.node_mut(lid);
            ln.right = rright;
            match (&mut ln.kind, rkind) {
                (Kind::Leaf(lslots), Kind::Leaf(rslots)) => {
                    // leaf separators are copies, so `sep` is simply dropped
                    ln.keys.extend(rkeys);
                    lslots.extend(rslots);
                }
                (Kind::Branch(lkids), Kind::Branch(rkids)) => {
                    ln.keys.push(sep);
                    ln.keys.extend(rkeys);
                    lkids.extend(rkids);
                }
                _ => unreachable!("merging nodes from different levels"),
            }
        }

        if let Some(next) = rright {
            self.node_mut(next).left = Some(lid);
        }
        self.release(rid);
    }

    // *************
    //   Iterators
    // *************

    /// Iterates over every `(key, value)` pair in ascending key order,
    /// yielding bucket entries oldest-first under their shared key.
    pub fn iter(&self) -> Iter<'_, K, V> {
        let mut id = self.root;
        while let Kind::Branch(kids) = &self.node(id).kind {
            id = kids[0];
        }
        Iter {
            inner: Range {
                map: self,
                node: Some(id),
                slot: 0,
                entry: 0,
                end: None,
            },
            remaining: self.len,
        }
    }

    pub fn keys(&self) -> impl ExactSizeIterator<Item = &K> + FusedIterator {
        self.iter().map(|e| e.0)
    }

    pub fn values(&self) -> impl ExactSizeIterator<Item = &V> + FusedIterator {
        self.iter().map(|e| e.1)
    }

    /// Iterates over the pairs whose keys fall in `range`, in ascending key
    /// order.  An inverted or empty range yields nothing (it does not
    /// panic).
    ///
    /// # Examples
    /// ```
    /// use bptree::BPlusTreeMap;
    ///
    /// let mut m = BPlusTreeMap::new(4);
    /// for k in [1, 3, 5, 7] {
    ///     m.insert(k, k * 10);
    /// }
    /// let hits: Vec<i32> = m.range(2..6).map(|(k, _)| *k).collect();
    /// assert_eq!(hits, [3, 5]);
    /// assert_eq!(m.range(6..2).count(), 0);
    /// ```
    pub fn range<Q, R>(&self, range: R) -> Range<'_, K, V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
        R: RangeBounds<Q>,
    {
        let empty = Range {
            map: self,
            node: None,
            slot: 0,
            entry: 0,
            end: None,
        };
        if range_is_empty(range.start_bound(), range.end_bound()) {
            return empty;
        }
        let start = self.lower_edge(range.start_bound());
        let Some((node, slot)) = start else { return empty };
        Range {
            map: self,
            node: Some(node),
            slot,
            entry: 0,
            end: self.upper_edge(range.end_bound()),
        }
    }

    // position of the first slot inside the lower bound, if any
    fn lower_edge<Q>(&self, bound: Bound<&Q>) -> Option<(NodeId, usize)>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut id = self.root;
        loop {
            match &self.node(id).kind {
                Kind::Branch(kids) => {
                    id = match bound {
                        Bound::Unbounded => kids[0],
                        Bound::Included(q) | Bound::Excluded(q) => {
                            kids[child_index(&self.node(id).keys, q)]
                        }
                    };
                }
                Kind::Leaf(_) => break,
            }
        }
        for (i, k) in self.node(id).keys.iter().enumerate() {
            let inside = match bound {
                Bound::Unbounded => true,
                Bound::Included(q) => k.borrow() >= q,
                Bound::Excluded(q) => k.borrow() > q,
            };
            if inside {
                return Some((id, i));
            }
        }
        // every key here is below the bound; the next leaf starts above it
        self.node(id).right.map(|r| (r, 0))
    }

    // position of the first slot beyond the upper bound; None iterates to
    // the end of the leaf chain
    fn upper_edge<Q>(&self, bound: Bound<&Q>) -> Option<(NodeId, usize)>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let q = match bound {
            Bound::Unbounded => return None,
            Bound::Included(q) | Bound::Excluded(q) => q,
        };
        let mut id = self.root;
        loop {
            match &self.node(id).kind {
                Kind::Branch(kids) => {
                    id = kids[child_index(&self.node(id).keys, q)];
                }
                Kind::Leaf(_) => break,
            }
        }
        for (i, k) in self.node(id).keys.iter().enumerate() {
            let beyond = match bound {
                Bound::Included(_) => k.borrow() > q,
                Bound::Excluded(_) => k.borrow() >= q,
                Bound::Unbounded => unreachable!(),
            };
            if beyond {
                return Some((id, i));
            }
        }
        self.node(id).right.map(|r| (r, 0))
    }
}

fn range_is_empty<Q: Ord + ?Sized>(start: Bound<&Q>, end: Bound<&Q>) -> bool {
    match (start, end) {
        (Bound::Included(a), Bound::Included(b)) => a > b,
        (
            Bound::Included(a) | Bound::Excluded(a),
            Bound::Included(b) | Bound::Excluded(b),
        ) => a >= b,
        _ => false,
    }
}

/// Cursor over a key range.  Walks the leaf level through the `right`
/// sibling links, expanding buckets in insertion order.
#[derive(Debug)]
pub struct Range<'a, K, V> {
    map: &'a BPlusTreeMap<K, V>,
    node: Option<NodeId>,
    slot: usize,
    entry: usize,
    end: Option<(NodeId, usize)>,
}

impl<'a, K, V> Iterator for Range<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = self.node?;
            if self.end == Some((id, self.slot)) {
                self.node = None;
                return None;
            }
            let n = self.map.node(id);
            let Kind::Leaf(slots) = &n.kind else {
                unreachable!("range cursor on a branch")
            };
            if self.slot >= n.keys.len() {
                self.node = n.right;
                self.slot = 0;
                continue;
            }
            let key = &n.keys[self.slot];
            match &slots[self.slot] {
                Slot::One(v) => {
                    self.slot += 1;
                    return Some((key, v));
                }
                Slot::Many(vs) => {
                    let v = &vs[self.entry];
                    self.entry += 1;
                    if self.entry == vs.len() {
                        self.entry = 0;
                        self.slot += 1;
                    }
                    return Some((key, v));
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.node {
            Some(_) => (0, Some(self.map.len)),
            None => (0, Some(0)),
        }
    }
}

impl<'a, K, V> FusedIterator for Range<'a, K, V> {}

/// Iterator over all entries, in ascending key order.
#[derive(Debug)]
pub struct Iter<'a, K, V> {
    inner: Range<'a, K, V>,
    remaining: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next()?;
        self.remaining -= 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, K, V> ExactSizeIterator for Iter<'a, K, V> {
    fn len(&self) -> usize {
        self.remaining
    }
}

impl<'a, K, V> FusedIterator for Iter<'a, K, V> {}

/// Owning iterator.  Bucket entries each carry a clone of their key.
#[derive(Debug)]
pub struct IntoIter<K, V> {
    map: BPlusTreeMap<K, V>,
    node: Option<NodeId>,
    keys: std::vec::IntoIter<K>,
    slots: std::vec::IntoIter<Slot<V>>,
    bucket: Option<(K, std::vec::IntoIter<V>)>,
    remaining: usize,
}

impl<K: Clone, V> Iterator for IntoIter<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            if let Some((k, vs)) = &mut self.bucket {
                if let Some(v) = vs.next() {
                    self.remaining -= 1;
                    return Some((k.clone(), v));
                }
                self.bucket = None;
            }
            match (self.keys.next(), self.slots.next()) {
                (Some(k), Some(Slot::One(v))) => {
                    self.remaining -= 1;
                    return Some((k, v));
                }
                (Some(k), Some(Slot::Many(vs))) => {
                    self.bucket = Some((k, vs.into_iter()));
                }
                _ => {
                    // this leaf is drained; strip the next one
                    let id = self.node?;
                    let n = self.map.node_mut(id);
                    let keys = mem::take(&mut n.keys);
                    let kind = mem::replace(&mut n.kind, Kind::Leaf(Vec::new()));
                    let Kind::Leaf(slots) = kind else {
                        unreachable!("leaf chain reached a branch")
                    };
                    self.node = n.right;
                    self.keys = keys.into_iter();
                    self.slots = slots.into_iter();
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K: Clone, V> ExactSizeIterator for IntoIter<K, V> {
    fn len(&self) -> usize {
        self.remaining
    }
}

impl<K: Clone, V> FusedIterator for IntoIter<K, V> {}

impl<K: Clone, V> IntoIterator for BPlusTreeMap<K, V> {
    type Item = (K, V);
    type IntoIter = IntoIter<K, V>;

    fn into_iter(self) -> IntoIter<K, V> {
        let mut id = self.root;
        while let Kind::Branch(kids) = &self.nodes[id.0].kind {
            id = kids[0];
        }
        let remaining = self.len;
        IntoIter {
            map: self,
            node: Some(id),
            keys: Vec::new().into_iter(),
            slots: Vec::new().into_iter(),
            bucket: None,
            remaining,
        }
    }
}

impl<'a, K, V> IntoIterator for &'a BPlusTreeMap<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Iter<'a, K, V> {
        self.iter()
    }
}

// ******************
//   Std-trait glue
// ******************

// we implement our own default to avoid Default constraints on K and V
impl<K, V> Default for BPlusTreeMap<K, V> {
    fn default() -> Self {
        Self::new(DEFAULT_ORDER)
    }
}

impl<K, V> std::fmt::Debug for BPlusTreeMap<K, V>
where
    K: std::fmt::Debug,
    V: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

// repeated keys accumulate, so extending is append, not replace
impl<K: Ord + Clone, V> Extend<(K, V)> for BPlusTreeMap<K, V> {
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (k, v) in iter {
            self.append(k, v);
        }
    }
}

impl<K: Ord + Clone, V> FromIterator<(K, V)> for BPlusTreeMap<K, V> {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut map = BPlusTreeMap::default();
        map.extend(iter);
        map
    }
}

impl<K: Ord + Clone, V, const N: usize> From<[(K, V); N]> for BPlusTreeMap<K, V> {
    fn from(vs: [(K, V); N]) -> Self {
        BPlusTreeMap::from_iter(vs)
    }
}

impl<K: PartialEq, V: PartialEq> PartialEq for BPlusTreeMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self.iter().zip(other.iter()).all(|(x, y)| x == y)
    }
}

impl<K: Eq, V: Eq> Eq for BPlusTreeMap<K, V> {}

#[cfg(feature = "serde")]
impl<K, V> serde::Serialize for BPlusTreeMap<K, V>
where
    K: serde::Serialize,
    V: serde::Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeSeq;
        let mut seq = serializer.serialize_seq(Some(self.len()))?;
        for entry in self.iter() {
            seq.serialize_element(&entry)?;
        }
        seq.end()
    }
}

#[cfg(feature = "serde")]
impl<'de, K, V> serde::Deserialize<'de> for BPlusTreeMap<K, V>
where
    K: serde::Deserialize<'de> + Ord + Clone,
    V: serde::Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct EntriesVisitor<K, V>(std::marker::PhantomData<(K, V)>);

        impl<'de, K, V> serde::de::Visitor<'de> for EntriesVisitor<K, V>
        where
            K: serde::Deserialize<'de> + Ord + Clone,
            V: serde::Deserialize<'de>,
        {
            type Value = BPlusTreeMap<K, V>;

            fn expecting(
                &self,
                f: &mut std::fmt::Formatter<'_>,
            ) -> std::fmt::Result {
                f.write_str("a sequence of key-value pairs")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut map = BPlusTreeMap::default();
                while let Some((k, v)) = seq.next_element()? {
                    map.append(k, v);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_seq(EntriesVisitor(std::marker::PhantomData))
    }
}

// **************
//   Validation
// **************

#[cfg(test)]
impl<K: Ord + std::fmt::Debug, V> BPlusTreeMap<K, V> {
    /// Asserts every structural invariant: uniform leaf depth, in-node key
    /// order, separator bounds, occupancy bounds, sibling-chain integrity
    /// on every level, and size accounting.
    pub(crate) fn chk(&self) {
        let mut levels: Vec<Vec<NodeId>> = Vec::new();
        let depth = self.chk_node(self.root, 0, None, None, &mut levels);

        for level in &levels {
            for (i, &id) in level.iter().enumerate() {
                let n = self.node(id);
                if i == 0 {
                    assert_eq!(n.left, None, "first node has a left sibling");
                } else {
                    assert_eq!(n.left, Some(level[i - 1]), "left link broken");
                }
                if i + 1 == level.len() {
                    assert_eq!(n.right, None, "last node has a right sibling");
                } else {
                    assert_eq!(n.right, Some(level[i + 1]), "right link broken");
                }
            }
        }

        let values: usize = levels[depth]
            .iter()
            .map(|&id| match &self.node(id).kind {
                Kind::Leaf(slots) => slots.iter().map(Slot::len).sum::<usize>(),
                Kind::Branch(_) => unreachable!("branch on the leaf level"),
            })
            .sum();
        assert_eq!(values, self.len, "size accounting broken");
    }

    fn chk_node(
        &self,
        id: NodeId,
        depth: usize,
        min: Option<&K>,
        max: Option<&K>,
        levels: &mut Vec<Vec<NodeId>>,
    ) -> usize {
        if levels.len() == depth {
            levels.push(Vec::new());
        }
        levels[depth].push(id);

        let n = self.node(id);
        for w in n.keys.windows(2) {
            assert!(w[0] < w[1], "key order violation");
        }
        for k in &n.keys {
            if let Some(lo) = min {
                assert!(lo <= k, "key below its subtree bound");
            }
            if let Some(hi) = max {
                assert!(k < hi, "key at or above its subtree bound");
            }
        }

        match &n.kind {
            Kind::Leaf(slots) => {
                assert_eq!(n.keys.len(), slots.len(), "keys and slots disagree");
                assert!(n.keys.len() <= self.order, "leaf over maximum occupancy");
                if id != self.root {
                    assert!(
                        slots.len() >= self.bmin,
                        "leaf under minimum occupancy"
                    );
                }
                for slot in slots {
                    if let Slot::Many(vs) = slot {
                        assert!(vs.len() >= 2, "bucket with fewer than two entries");
                    }
                }
                depth
            }
            Kind::Branch(kids) => {
                assert_eq!(
                    n.keys.len() + 1,
                    kids.len(),
                    "separator and child counts disagree"
                );
                assert!(kids.len() <= self.order, "branch over maximum occupancy");
                if id != self.root {
                    assert!(kids.len() >= self.bmin, "branch under minimum occupancy");
                } else {
                    assert!(kids.len() >= 2, "root branch with a single child");
                }
                let mut ht = None;
                for (i, &kid) in kids.iter().enumerate() {
                    let lo = if i == 0 { min } else { Some(&n.keys[i - 1]) };
                    let hi = if i + 1 == kids.len() {
                        max
                    } else {
                        Some(&n.keys[i])
                    };
                    let d = self.chk_node(kid, depth + 1, lo, hi, levels);
                    match ht {
                        None => ht = Some(d),
                        Some(h) => assert_eq!(h, d, "uneven leaf depth"),
                    }
                }
                ht.expect("branch with no children")
            }
        }
    }
}
