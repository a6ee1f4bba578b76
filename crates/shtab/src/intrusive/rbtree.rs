//! Intrusive red-black tree over arena offsets.
//!
//! Used by tables (entries ordered by key) and by the page pool (free runs
//! ordered by length). Nodes are embedded in the objects they order and
//! identified by arena offset; offset 0 is the nil leaf and is always
//! black. Comparators are supplied per call, so nothing address- or
//! process-dependent is stored in the segment.
//!
//! Iteration uses parent links (`left_most` + `next`), so an in-order walk
//! needs no stack and no heap.

use std::cmp::Ordering;

use shtab_util::status::{Result, Status};

use crate::mem::Arena;

const RED: u64 = 0;
const BLACK: u64 = 1;

/// A tree link embedded in a shared object. Zeroed = detached.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RbNode {
    pub parent: u64,
    pub left: u64,
    pub right: u64,
    pub color: u64,
}

/// Tree anchor embedded in the owning structure.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RbRoot {
    pub root: u64,
}

impl RbRoot {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root == 0
    }
}

/// A borrowed view of one tree: the arena plus the offset of its
/// [`RbRoot`]. All operations assume the caller holds the lock that
/// serialises the tree.
#[derive(Clone, Copy)]
pub struct Tree<'a> {
    arena: &'a Arena,
    root_off: u64,
}

impl<'a> Tree<'a> {
    /// # Safety
    ///
    /// `root_off` must address an `RbRoot` inside the arena whose nodes
    /// are all valid `RbNode` offsets.
    pub unsafe fn new(arena: &'a Arena, root_off: u64) -> Self {
        Self { arena, root_off }
    }

    #[inline]
    unsafe fn node(&self, off: u64) -> *mut RbNode {
        debug_assert_ne!(off, 0);
        self.arena.ptr_at::<RbNode>(off)
    }

    #[inline]
    unsafe fn root(&self) -> u64 {
        (*self.arena.ptr_at::<RbRoot>(self.root_off)).root
    }

    #[inline]
    unsafe fn set_root(&self, off: u64) {
        (*self.arena.ptr_at::<RbRoot>(self.root_off)).root = off;
    }

    #[inline]
    unsafe fn color(&self, off: u64) -> u64 {
        if off == 0 {
            BLACK
        } else {
            (*self.node(off)).color
        }
    }

    #[inline]
    unsafe fn set_color(&self, off: u64, color: u64) {
        if off != 0 {
            (*self.node(off)).color = color;
        }
    }

    #[inline]
    unsafe fn parent(&self, off: u64) -> u64 {
        (*self.node(off)).parent
    }

    #[inline]
    unsafe fn left(&self, off: u64) -> u64 {
        (*self.node(off)).left
    }

    #[inline]
    unsafe fn right(&self, off: u64) -> u64 {
        (*self.node(off)).right
    }

    pub unsafe fn is_empty(&self) -> bool {
        self.root() == 0
    }

    unsafe fn rotate_left(&self, x: u64) {
        let y = self.right(x);
        let yl = self.left(y);

        (*self.node(x)).right = yl;
        if yl != 0 {
            (*self.node(yl)).parent = x;
        }

        let xp = self.parent(x);
        (*self.node(y)).parent = xp;
        if xp == 0 {
            self.set_root(y);
        } else if self.left(xp) == x {
            (*self.node(xp)).left = y;
        } else {
            (*self.node(xp)).right = y;
        }

        (*self.node(y)).left = x;
        (*self.node(x)).parent = y;
    }

    unsafe fn rotate_right(&self, x: u64) {
        let y = self.left(x);
        let yr = self.right(y);

        (*self.node(x)).left = yr;
        if yr != 0 {
            (*self.node(yr)).parent = x;
        }

        let xp = self.parent(x);
        (*self.node(y)).parent = xp;
        if xp == 0 {
            self.set_root(y);
        } else if self.right(xp) == x {
            (*self.node(xp)).right = y;
        } else {
            (*self.node(xp)).left = y;
        }

        (*self.node(y)).right = x;
        (*self.node(x)).parent = y;
    }

    /// Insert `node_off`, ordered by `cmp(new, existing)`. Duplicates are
    /// rejected with `Existed` and the tree is left unchanged.
    ///
    /// # Safety
    ///
    /// `node_off` must be a detached `RbNode`; the caller holds the tree
    /// lock.
    pub unsafe fn insert(
        &self,
        node_off: u64,
        cmp: &mut dyn FnMut(u64, u64) -> Ordering,
    ) -> Result<()> {
        let mut parent = 0u64;
        let mut link = self.root();
        let mut went_left = false;

        while link != 0 {
            parent = link;
            match cmp(node_off, link) {
                Ordering::Less => {
                    link = self.left(link);
                    went_left = true;
                }
                Ordering::Greater => {
                    link = self.right(link);
                    went_left = false;
                }
                Ordering::Equal => return Err(Status::Existed),
            }
        }

        let n = self.node(node_off);
        (*n).parent = parent;
        (*n).left = 0;
        (*n).right = 0;
        (*n).color = RED;

        if parent == 0 {
            self.set_root(node_off);
        } else if went_left {
            (*self.node(parent)).left = node_off;
        } else {
            (*self.node(parent)).right = node_off;
        }

        self.insert_fixup(node_off);
        Ok(())
    }

    unsafe fn insert_fixup(&self, mut z: u64) {
        while self.color(self.parent_or_zero(z)) == RED {
            let p = self.parent(z);
            let g = self.parent(p);
            if self.left(g) == p {
                let u = self.right(g);
                if self.color(u) == RED {
                    self.set_color(p, BLACK);
                    self.set_color(u, BLACK);
                    self.set_color(g, RED);
                    z = g;
                } else {
                    if self.right(p) == z {
                        z = p;
                        self.rotate_left(z);
                    }
                    let p = self.parent(z);
                    let g = self.parent(p);
                    self.set_color(p, BLACK);
                    self.set_color(g, RED);
                    self.rotate_right(g);
                }
            } else {
                let u = self.left(g);
                if self.color(u) == RED {
                    self.set_color(p, BLACK);
                    self.set_color(u, BLACK);
                    self.set_color(g, RED);
                    z = g;
                } else {
                    if self.left(p) == z {
                        z = p;
                        self.rotate_right(z);
                    }
                    let p = self.parent(z);
                    let g = self.parent(p);
                    self.set_color(p, BLACK);
                    self.set_color(g, RED);
                    self.rotate_left(g);
                }
            }
        }
        let root = self.root();
        self.set_color(root, BLACK);
    }

    #[inline]
    unsafe fn parent_or_zero(&self, off: u64) -> u64 {
        if off == 0 {
            0
        } else {
            self.parent(off)
        }
    }

    /// Exact-match search; `probe(existing)` orders the probe against an
    /// existing node.
    ///
    /// # Safety
    ///
    /// Caller holds the tree lock.
    pub unsafe fn search_eq(&self, probe: &mut dyn FnMut(u64) -> Ordering) -> Option<u64> {
        let mut cur = self.root();
        while cur != 0 {
            match probe(cur) {
                Ordering::Less => cur = self.left(cur),
                Ordering::Greater => cur = self.right(cur),
                Ordering::Equal => return Some(cur),
            }
        }
        None
    }

    /// Greatest node `<=` the probe.
    ///
    /// # Safety
    ///
    /// Caller holds the tree lock.
    pub unsafe fn search_le(&self, probe: &mut dyn FnMut(u64) -> Ordering) -> Option<u64> {
        let mut cur = self.root();
        let mut best = None;
        while cur != 0 {
            match probe(cur) {
                Ordering::Less => cur = self.left(cur),
                Ordering::Equal => return Some(cur),
                Ordering::Greater => {
                    best = Some(cur);
                    cur = self.right(cur);
                }
            }
        }
        best
    }

    /// Smallest node `>=` the probe.
    ///
    /// # Safety
    ///
    /// Caller holds the tree lock.
    pub unsafe fn search_ge(&self, probe: &mut dyn FnMut(u64) -> Ordering) -> Option<u64> {
        let mut cur = self.root();
        let mut best = None;
        while cur != 0 {
            match probe(cur) {
                Ordering::Greater => cur = self.right(cur),
                Ordering::Equal => return Some(cur),
                Ordering::Less => {
                    best = Some(cur);
                    cur = self.left(cur);
                }
            }
        }
        best
    }

    /// Smallest node, or `None` when the tree is empty.
    ///
    /// # Safety
    ///
    /// Caller holds the tree lock.
    pub unsafe fn left_most(&self) -> Option<u64> {
        let mut cur = self.root();
        if cur == 0 {
            return None;
        }
        while self.left(cur) != 0 {
            cur = self.left(cur);
        }
        Some(cur)
    }

    /// Largest node, or `None` when the tree is empty.
    ///
    /// # Safety
    ///
    /// Caller holds the tree lock.
    pub unsafe fn right_most(&self) -> Option<u64> {
        let mut cur = self.root();
        if cur == 0 {
            return None;
        }
        while self.right(cur) != 0 {
            cur = self.right(cur);
        }
        Some(cur)
    }

    /// In-order successor of `node_off`.
    ///
    /// # Safety
    ///
    /// `node_off` must be a member of this tree; caller holds the lock.
    pub unsafe fn next(&self, node_off: u64) -> Option<u64> {
        let mut cur = node_off;
        if self.right(cur) != 0 {
            cur = self.right(cur);
            while self.left(cur) != 0 {
                cur = self.left(cur);
            }
            return Some(cur);
        }
        let mut p = self.parent(cur);
        while p != 0 && self.right(p) == cur {
            cur = p;
            p = self.parent(cur);
        }
        (p != 0).then_some(p)
    }

    unsafe fn transplant(&self, u: u64, v: u64) {
        let up = self.parent(u);
        if up == 0 {
            self.set_root(v);
        } else if self.left(up) == u {
            (*self.node(up)).left = v;
        } else {
            (*self.node(up)).right = v;
        }
        if v != 0 {
            (*self.node(v)).parent = up;
        }
    }

    /// Remove `z` from the tree and zero its node.
    ///
    /// # Safety
    ///
    /// `z` must be a member of this tree; caller holds the lock.
    pub unsafe fn delete(&self, z: u64) {
        let mut y = z;
        let mut y_color = self.color(y);
        let x: u64;
        let mut x_parent: u64;

        if self.left(z) == 0 {
            x = self.right(z);
            x_parent = self.parent(z);
            self.transplant(z, x);
        } else if self.right(z) == 0 {
            x = self.left(z);
            x_parent = self.parent(z);
            self.transplant(z, x);
        } else {
            // y = minimum of right subtree takes z's place
            y = self.right(z);
            while self.left(y) != 0 {
                y = self.left(y);
            }
            y_color = self.color(y);
            x = self.right(y);
            if self.parent(y) == z {
                x_parent = y;
            } else {
                x_parent = self.parent(y);
                self.transplant(y, x);
                (*self.node(y)).right = self.right(z);
                (*self.node(self.right(y))).parent = y;
            }
            self.transplant(z, y);
            (*self.node(y)).left = self.left(z);
            (*self.node(self.left(y))).parent = y;
            self.set_color(y, self.color(z));
        }

        if y_color == BLACK {
            self.delete_fixup(x, x_parent);
        }

        let zn = self.node(z);
        (*zn).parent = 0;
        (*zn).left = 0;
        (*zn).right = 0;
        (*zn).color = 0;
    }

    unsafe fn delete_fixup(&self, mut x: u64, mut x_parent: u64) {
        while x != self.root() && self.color(x) == BLACK {
            if x_parent == 0 {
                break;
            }
            if self.left(x_parent) == x {
                let mut w = self.right(x_parent);
                if self.color(w) == RED {
                    self.set_color(w, BLACK);
                    self.set_color(x_parent, RED);
                    self.rotate_left(x_parent);
                    w = self.right(x_parent);
                }
                if self.color(self.left_or_zero(w)) == BLACK
                    && self.color(self.right_or_zero(w)) == BLACK
                {
                    self.set_color(w, RED);
                    x = x_parent;
                    x_parent = self.parent_or_zero(x);
                } else {
                    if self.color(self.right_or_zero(w)) == BLACK {
                        self.set_color(self.left_or_zero(w), BLACK);
                        self.set_color(w, RED);
                        self.rotate_right(w);
                        w = self.right(x_parent);
                    }
                    self.set_color(w, self.color(x_parent));
                    self.set_color(x_parent, BLACK);
                    self.set_color(self.right_or_zero(w), BLACK);
                    self.rotate_left(x_parent);
                    x = self.root();
                    x_parent = 0;
                }
            } else {
                let mut w = self.left(x_parent);
                if self.color(w) == RED {
                    self.set_color(w, BLACK);
                    self.set_color(x_parent, RED);
                    self.rotate_right(x_parent);
                    w = self.left(x_parent);
                }
                if self.color(self.left_or_zero(w)) == BLACK
                    && self.color(self.right_or_zero(w)) == BLACK
                {
                    self.set_color(w, RED);
                    x = x_parent;
                    x_parent = self.parent_or_zero(x);
                } else {
                    if self.color(self.left_or_zero(w)) == BLACK {
                        self.set_color(self.right_or_zero(w), BLACK);
                        self.set_color(w, RED);
                        self.rotate_left(w);
                        w = self.left(x_parent);
                    }
                    self.set_color(w, self.color(x_parent));
                    self.set_color(x_parent, BLACK);
                    self.set_color(self.left_or_zero(w), BLACK);
                    self.rotate_right(x_parent);
                    x = self.root();
                    x_parent = 0;
                }
            }
        }
        self.set_color(x, BLACK);
    }

    #[inline]
    unsafe fn left_or_zero(&self, off: u64) -> u64 {
        if off == 0 {
            0
        } else {
            self.left(off)
        }
    }

    #[inline]
    unsafe fn right_or_zero(&self, off: u64) -> u64 {
        if off == 0 {
            0
        } else {
            self.right(off)
        }
    }

    /// Splice `new` into the exact position of `old` (same key ordering
    /// required) and zero `old`. Used by upsert to swap an entry without
    /// rebalancing.
    ///
    /// # Safety
    ///
    /// `old` must be a member, `new` a detached node that orders
    /// identically; caller holds the lock.
    pub unsafe fn replace(&self, old: u64, new: u64) {
        let o = *self.node(old);
        let n = self.node(new);
        (*n).parent = o.parent;
        (*n).left = o.left;
        (*n).right = o.right;
        (*n).color = o.color;

        if o.parent == 0 {
            self.set_root(new);
        } else if self.left(o.parent) == old {
            (*self.node(o.parent)).left = new;
        } else {
            (*self.node(o.parent)).right = new;
        }
        if o.left != 0 {
            (*self.node(o.left)).parent = new;
        }
        if o.right != 0 {
            (*self.node(o.right)).parent = new;
        }

        let on = self.node(old);
        (*on).parent = 0;
        (*on).left = 0;
        (*on).right = 0;
        (*on).color = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test nodes: an RbNode followed by a u64 key.
    const NODE_SIZE: u64 = 40;
    const ROOT_OFF: u64 = 8;
    const FIRST_NODE: u64 = 48;

    struct Fixture {
        _buf: Vec<u8>,
        arena: Arena,
    }

    fn fixture(n: usize) -> Fixture {
        let mut buf = vec![0u8; FIRST_NODE as usize + n * NODE_SIZE as usize];
        let arena = unsafe { Arena::new(buf.as_mut_ptr(), buf.len()) };
        Fixture { _buf: buf, arena }
    }

    fn off(i: usize) -> u64 {
        FIRST_NODE + i as u64 * NODE_SIZE
    }

    unsafe fn set_key(arena: &Arena, node: u64, key: u64) {
        *arena.at_mut::<u64>(node + 32) = key;
    }

    unsafe fn key(arena: &Arena, node: u64) -> u64 {
        *arena.at::<u64>(node + 32)
    }

    unsafe fn insert_key(arena: &Arena, node: u64, k: u64) -> Result<()> {
        set_key(arena, node, k);
        let tree = Tree::new(arena, ROOT_OFF);
        tree.insert(node, &mut |a, b| key(arena, a).cmp(&key(arena, b)))
    }

    unsafe fn collect_inorder(arena: &Arena) -> Vec<u64> {
        let tree = Tree::new(arena, ROOT_OFF);
        let mut out = Vec::new();
        let mut cur = tree.left_most();
        while let Some(n) = cur {
            out.push(key(arena, n));
            cur = tree.next(n);
        }
        out
    }

    // Red-black invariants: no red node has a red child, and every root-leaf
    // path carries the same number of black nodes.
    unsafe fn check_invariants(arena: &Arena) {
        let tree = Tree::new(arena, ROOT_OFF);
        let root = (*arena.ptr_at::<RbRoot>(ROOT_OFF)).root;
        assert_eq!(tree.color(root), BLACK, "root must be black");
        black_height(arena, &tree, root);
    }

    unsafe fn black_height(arena: &Arena, tree: &Tree, n: u64) -> usize {
        if n == 0 {
            return 1;
        }
        let l = tree.left(n);
        let r = tree.right(n);
        if tree.color(n) == RED {
            assert_eq!(tree.color(l), BLACK, "red-red violation");
            assert_eq!(tree.color(r), BLACK, "red-red violation");
        }
        let lh = black_height(arena, tree, l);
        let rh = black_height(arena, tree, r);
        assert_eq!(lh, rh, "black height mismatch");
        lh + if tree.color(n) == BLACK { 1 } else { 0 }
    }

    // Deterministic shuffle source.
    fn lcg(seed: &mut u64) -> u64 {
        *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        *seed >> 33
    }

    #[test]
    fn insert_orders_and_balances() {
        let f = fixture(128);
        let mut seed = 7u64;
        unsafe {
            for i in 0..128 {
                let k = lcg(&mut seed) % 10_000;
                match insert_key(&f.arena, off(i), k) {
                    Ok(()) | Err(Status::Existed) => {}
                    Err(e) => panic!("unexpected: {e}"),
                }
            }
            let keys = collect_inorder(&f.arena);
            let mut sorted = keys.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(keys, sorted);
            check_invariants(&f.arena);
        }
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let f = fixture(4);
        unsafe {
            insert_key(&f.arena, off(0), 42).unwrap();
            assert_eq!(insert_key(&f.arena, off(1), 42), Err(Status::Existed));
            assert_eq!(collect_inorder(&f.arena), vec![42]);
        }
    }

    #[test]
    fn search_sides() {
        let f = fixture(8);
        unsafe {
            for (i, k) in [10u64, 20, 30, 40].iter().enumerate() {
                insert_key(&f.arena, off(i), *k).unwrap();
            }
            let tree = Tree::new(&f.arena, ROOT_OFF);
            let a = &f.arena;

            let eq = tree.search_eq(&mut |n| 30u64.cmp(&key(a, n)));
            assert_eq!(eq.map(|n| key(a, n)), Some(30));
            assert!(tree.search_eq(&mut |n| 25u64.cmp(&key(a, n))).is_none());

            let le = tree.search_le(&mut |n| 25u64.cmp(&key(a, n)));
            assert_eq!(le.map(|n| key(a, n)), Some(20));
            let ge = tree.search_ge(&mut |n| 25u64.cmp(&key(a, n)));
            assert_eq!(ge.map(|n| key(a, n)), Some(30));

            assert!(tree.search_le(&mut |n| 5u64.cmp(&key(a, n))).is_none());
            assert!(tree.search_ge(&mut |n| 45u64.cmp(&key(a, n))).is_none());
        }
    }

    #[test]
    fn delete_keeps_order_and_invariants() {
        let f = fixture(64);
        let mut seed = 99u64;
        let mut keys = Vec::new();
        unsafe {
            for i in 0..64 {
                let k = lcg(&mut seed) % 1_000_000;
                if insert_key(&f.arena, off(i), k).is_ok() {
                    keys.push((off(i), k));
                }
            }

            // delete every other node
            let tree = Tree::new(&f.arena, ROOT_OFF);
            let mut remaining = Vec::new();
            for (i, (node, k)) in keys.iter().enumerate() {
                if i % 2 == 0 {
                    tree.delete(*node);
                } else {
                    remaining.push(*k);
                }
            }
            remaining.sort_unstable();
            assert_eq!(collect_inorder(&f.arena), remaining);
            check_invariants(&f.arena);
        }
    }

    #[test]
    fn delete_everything_empties_tree() {
        let f = fixture(32);
        unsafe {
            for i in 0..32 {
                insert_key(&f.arena, off(i), i as u64).unwrap();
            }
            let tree = Tree::new(&f.arena, ROOT_OFF);
            for i in 0..32 {
                tree.delete(off(i));
                check_invariants(&f.arena);
            }
            assert!(tree.is_empty());
        }
    }

    #[test]
    fn replace_swaps_in_place() {
        let f = fixture(8);
        unsafe {
            for (i, k) in [10u64, 20, 30].iter().enumerate() {
                insert_key(&f.arena, off(i), *k).unwrap();
            }
            // New node with the same key takes the old one's position.
            set_key(&f.arena, off(5), 20);
            let tree = Tree::new(&f.arena, ROOT_OFF);
            tree.replace(off(1), off(5));

            assert_eq!(collect_inorder(&f.arena), vec![10, 20, 30]);
            check_invariants(&f.arena);
            let old = *f.arena.at::<RbNode>(off(1));
            assert_eq!((old.parent, old.left, old.right), (0, 0, 0));
        }
    }
}
