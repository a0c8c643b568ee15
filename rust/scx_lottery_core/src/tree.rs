//! Ticket-weighted selection tree.
//!
//! A red-black tree keyed by the tickets a task held at insertion time. Each
//! node caches the ticket sum of its left and right subtrees, which turns
//! "find the task owning point X of `[0, total)`" into a single root-to-leaf
//! walk.
//!
//! The key only decides the shape of the tree. The draw ignores it and
//! descends purely on the cached weights:
//!
//! ```text
//!                 B(3) lw=1 rw=5
//!                /              \
//!         A(1) lw=0 rw=0    C(5) lw=0 rw=0
//!
//!   points:   A = [0, 1)   B = [1, 4)   C = [4, 9)
//! ```
//!
//! Nodes live in an arena and refer to each other through [`NodeId`]
//! handles. Every structural change (leaf attach, rotation, unlink) re-derives
//! the cached weights of the nodes whose subtrees changed, so the weights are
//! exact after every public operation.

use std::collections::HashMap;

use anyhow::bail;
use anyhow::Result;

use crate::queue::TicketQueue;
use crate::types::NodeId;
use crate::types::Pid;
use crate::types::Tickets;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

#[derive(Debug, Clone)]
struct Node {
    pid: Pid,
    tickets: Tickets,
    /// Ticket sum of the left subtree.
    left_weight: Tickets,
    /// Ticket sum of the right subtree.
    right_weight: Tickets,
    color: Color,
    parent: Option<NodeId>,
    left: Option<NodeId>,
    right: Option<NodeId>,
}

impl Node {
    fn weight(&self) -> Tickets {
        self.left_weight + self.tickets + self.right_weight
    }
}

/// Augmented red-black tree of runnable tasks.
#[derive(Debug, Default)]
pub struct TicketTree {
    nodes: Vec<Node>,
    free: Vec<NodeId>,
    root: Option<NodeId>,
    index: HashMap<Pid, NodeId>,
}

impl TicketTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.idx()]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.idx()]
    }

    fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    fn left(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).left
    }

    fn right(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).right
    }

    fn color(&self, id: NodeId) -> Color {
        self.node(id).color
    }

    fn set_color(&mut self, id: NodeId, color: Color) {
        self.node_mut(id).color = color;
    }

    /// Missing children count as black.
    fn is_red(&self, id: Option<NodeId>) -> bool {
        id.is_some_and(|id| self.color(id) == Color::Red)
    }

    fn weight_of(&self, id: Option<NodeId>) -> Tickets {
        id.map_or(0, |id| self.node(id).weight())
    }

    /// Node handle of a queued task.
    pub fn node_of(&self, pid: Pid) -> Option<NodeId> {
        self.index.get(&pid).copied()
    }

    /// Task and tickets stored in a live node.
    pub fn entry(&self, id: NodeId) -> Option<(Pid, Tickets)> {
        let node = self.nodes.get(id.idx())?;
        match self.index.get(&node.pid) {
            Some(&live) if live == id => Some((node.pid, node.tickets)),
            _ => None,
        }
    }

    /// Ticket sum of the whole tree, read from the root aggregate.
    pub fn root_weight(&self) -> Tickets {
        self.weight_of(self.root)
    }

    /// Number of nodes on the longest root-to-leaf path.
    pub fn height(&self) -> usize {
        self.height_of(self.root)
    }

    fn height_of(&self, id: Option<NodeId>) -> usize {
        match id {
            None => 0,
            Some(id) => 1 + self.height_of(self.left(id)).max(self.height_of(self.right(id))),
        }
    }

    /// Queued tasks in key order.
    pub fn iter(&self) -> Iter<'_> {
        let mut iter = Iter {
            tree: self,
            stack: Vec::new(),
        };
        iter.push_left(self.root);
        iter
    }

    /// Recompute the cached weights of `id` from its children.
    fn update_weights(&mut self, id: NodeId) {
        let (left, right) = (self.left(id), self.right(id));
        let left_weight = self.weight_of(left);
        let right_weight = self.weight_of(right);
        let node = self.node_mut(id);
        node.left_weight = left_weight;
        node.right_weight = right_weight;
    }

    /// Recompute cached weights from `at` up to the root.
    fn propagate(&mut self, mut at: Option<NodeId>) {
        while let Some(id) = at {
            self.update_weights(id);
            at = self.parent(id);
        }
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id.idx()] = node;
                id
            }
            None => {
                self.nodes.push(node);
                NodeId((self.nodes.len() - 1) as u32)
            }
        }
    }

    fn release(&mut self, id: NodeId) {
        let node = self.node_mut(id);
        node.parent = None;
        node.left = None;
        node.right = None;
        node.left_weight = 0;
        node.right_weight = 0;
        self.free.push(id);
    }

    /// Point `parent`'s link to `old` at `new` instead (or the root link if
    /// `old` has no parent).
    fn replace_child(&mut self, parent: Option<NodeId>, old: NodeId, new: Option<NodeId>) {
        match parent {
            None => self.root = new,
            Some(p) => {
                if self.left(p) == Some(old) {
                    self.node_mut(p).left = new;
                } else {
                    self.node_mut(p).right = new;
                }
            }
        }
    }

    fn transplant(&mut self, old: NodeId, new: Option<NodeId>) {
        let parent = self.parent(old);
        self.replace_child(parent, old, new);
        if let Some(new) = new {
            self.node_mut(new).parent = parent;
        }
    }

    //        x                y
    //       / \              / \
    //      a   y     =>     x   c
    //         / \          / \
    //        b   c        a   b
    //
    // The pair's total is unchanged, so only x and y need new weights, x
    // first since it's now y's child.
    fn rotate_left(&mut self, x: NodeId) {
        let Some(y) = self.right(x) else {
            return;
        };
        let b = self.left(y);
        self.node_mut(x).right = b;
        if let Some(b) = b {
            self.node_mut(b).parent = Some(x);
        }
        let parent = self.parent(x);
        self.node_mut(y).parent = parent;
        self.replace_child(parent, x, Some(y));
        self.node_mut(y).left = Some(x);
        self.node_mut(x).parent = Some(y);

        self.update_weights(x);
        self.update_weights(y);
    }

    fn rotate_right(&mut self, x: NodeId) {
        let Some(y) = self.left(x) else {
            return;
        };
        let b = self.right(y);
        self.node_mut(x).left = b;
        if let Some(b) = b {
            self.node_mut(b).parent = Some(x);
        }
        let parent = self.parent(x);
        self.node_mut(y).parent = parent;
        self.replace_child(parent, x, Some(y));
        self.node_mut(y).right = Some(x);
        self.node_mut(x).parent = Some(y);

        self.update_weights(x);
        self.update_weights(y);
    }

    fn minimum(&self, mut id: NodeId) -> NodeId {
        while let Some(left) = self.left(id) {
            id = left;
        }
        id
    }

    /// Attach a new leaf for `pid` and rebalance. The caller guarantees
    /// `pid` isn't in the tree yet.
    fn insert_node(&mut self, pid: Pid, tickets: Tickets) -> NodeId {
        let mut parent = None;
        let mut link = self.root;
        let mut go_left = false;

        // Every node passed on the way down gains the new tickets on the
        // side we descend into.
        while let Some(cur) = link {
            parent = Some(cur);
            let node = self.node_mut(cur);
            if node.tickets >= tickets {
                node.left_weight += tickets;
                go_left = true;
                link = node.left;
            } else {
                node.right_weight += tickets;
                go_left = false;
                link = node.right;
            }
        }

        let id = self.alloc(Node {
            pid,
            tickets,
            left_weight: 0,
            right_weight: 0,
            color: Color::Red,
            parent,
            left: None,
            right: None,
        });

        match parent {
            None => self.root = Some(id),
            Some(p) if go_left => self.node_mut(p).left = Some(id),
            Some(p) => self.node_mut(p).right = Some(id),
        }

        self.insert_fixup(id);
        id
    }

    fn insert_fixup(&mut self, mut z: NodeId) {
        while let Some(p) = self.parent(z) {
            if !self.is_red(Some(p)) {
                break;
            }
            // A red node is never the root, so p has a parent.
            let Some(g) = self.parent(p) else {
                break;
            };

            if self.left(g) == Some(p) {
                let uncle = self.right(g);
                if let Some(u) = uncle.filter(|&u| self.color(u) == Color::Red) {
                    self.set_color(p, Color::Black);
                    self.set_color(u, Color::Black);
                    self.set_color(g, Color::Red);
                    z = g;
                } else {
                    if self.right(p) == Some(z) {
                        z = p;
                        self.rotate_left(z);
                    }
                    let Some(p) = self.parent(z) else {
                        break;
                    };
                    self.set_color(p, Color::Black);
                    self.set_color(g, Color::Red);
                    self.rotate_right(g);
                }
            } else {
                let uncle = self.left(g);
                if let Some(u) = uncle.filter(|&u| self.color(u) == Color::Red) {
                    self.set_color(p, Color::Black);
                    self.set_color(u, Color::Black);
                    self.set_color(g, Color::Red);
                    z = g;
                } else {
                    if self.left(p) == Some(z) {
                        z = p;
                        self.rotate_right(z);
                    }
                    let Some(p) = self.parent(z) else {
                        break;
                    };
                    self.set_color(p, Color::Black);
                    self.set_color(g, Color::Red);
                    self.rotate_left(g);
                }
            }
        }

        if let Some(root) = self.root {
            self.set_color(root, Color::Black);
        }
    }

    /// Unlink `z` and rebalance.
    fn remove_node(&mut self, z: NodeId) {
        let (z_left, z_right) = (self.left(z), self.right(z));
        let mut removed_color = self.color(z);
        let x;
        let x_parent;

        match (z_left, z_right) {
            (None, _) => {
                x = z_right;
                x_parent = self.parent(z);
                self.transplant(z, z_right);
            }
            (Some(_), None) => {
                x = z_left;
                x_parent = self.parent(z);
                self.transplant(z, z_left);
            }
            (Some(zl), Some(zr)) => {
                // Splice in z's in-order successor.
                let y = self.minimum(zr);
                removed_color = self.color(y);
                x = self.right(y);
                if self.parent(y) == Some(z) {
                    x_parent = Some(y);
                } else {
                    x_parent = self.parent(y);
                    self.transplant(y, x);
                    self.node_mut(y).right = Some(zr);
                    self.node_mut(zr).parent = Some(y);
                }
                self.transplant(z, Some(y));
                self.node_mut(y).left = Some(zl);
                self.node_mut(zl).parent = Some(y);
                let color = self.color(z);
                self.set_color(y, color);
            }
        }

        // Every node whose subtree changed is on the path from x_parent to
        // the root. Fix the weights before the fix-up rotations, which rely
        // on the children's weights being exact.
        self.propagate(x_parent);

        if removed_color == Color::Black {
            self.delete_fixup(x, x_parent);
        }

        self.release(z);
    }

    fn delete_fixup(&mut self, mut x: Option<NodeId>, mut parent: Option<NodeId>) {
        while x != self.root && !self.is_red(x) {
            let Some(p) = parent else {
                break;
            };

            if x == self.left(p) {
                let Some(mut w) = self.right(p) else {
                    break;
                };
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(p, Color::Red);
                    self.rotate_left(p);
                    let Some(sibling) = self.right(p) else {
                        break;
                    };
                    w = sibling;
                }
                if !self.is_red(self.left(w)) && !self.is_red(self.right(w)) {
                    self.set_color(w, Color::Red);
                    x = Some(p);
                    parent = self.parent(p);
                } else {
                    if !self.is_red(self.right(w)) {
                        if let Some(wl) = self.left(w) {
                            self.set_color(wl, Color::Black);
                        }
                        self.set_color(w, Color::Red);
                        self.rotate_right(w);
                        let Some(sibling) = self.right(p) else {
                            break;
                        };
                        w = sibling;
                    }
                    let color = self.color(p);
                    self.set_color(w, color);
                    self.set_color(p, Color::Black);
                    if let Some(wr) = self.right(w) {
                        self.set_color(wr, Color::Black);
                    }
                    self.rotate_left(p);
                    x = self.root;
                    parent = None;
                }
            } else {
                let Some(mut w) = self.left(p) else {
                    break;
                };
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(p, Color::Red);
                    self.rotate_right(p);
                    let Some(sibling) = self.left(p) else {
                        break;
                    };
                    w = sibling;
                }
                if !self.is_red(self.left(w)) && !self.is_red(self.right(w)) {
                    self.set_color(w, Color::Red);
                    x = Some(p);
                    parent = self.parent(p);
                } else {
                    if !self.is_red(self.left(w)) {
                        if let Some(wr) = self.right(w) {
                            self.set_color(wr, Color::Black);
                        }
                        self.set_color(w, Color::Red);
                        self.rotate_left(w);
                        let Some(sibling) = self.left(p) else {
                            break;
                        };
                        w = sibling;
                    }
                    let color = self.color(p);
                    self.set_color(w, color);
                    self.set_color(p, Color::Black);
                    if let Some(wl) = self.left(w) {
                        self.set_color(wl, Color::Black);
                    }
                    self.rotate_right(p);
                    x = self.root;
                    parent = None;
                }
            }
        }

        if let Some(x) = x {
            self.set_color(x, Color::Black);
        }
    }

    /// Node owning `point`, walking down on the cached weights.
    pub fn draw_node(&self, mut point: u64) -> Option<NodeId> {
        let mut cur = self.root;
        while let Some(id) = cur {
            let node = self.node(id);
            if point < node.left_weight {
                cur = node.left;
            } else if point - node.left_weight < node.tickets {
                return Some(id);
            } else {
                point -= node.left_weight + node.tickets;
                cur = node.right;
            }
        }
        None
    }

    /// Verify every structural invariant: parent links, red-black coloring,
    /// equal black height, key order, cached weights and the pid index.
    pub fn check(&self) -> Result<()> {
        if let Some(root) = self.root {
            if self.parent(root).is_some() {
                bail!("root {:?} has a parent", root);
            }
            if self.color(root) == Color::Red {
                bail!("root {:?} is red", root);
            }
        }

        let (count, _, _) = self.check_subtree(self.root, None)?;
        if count != self.index.len() {
            bail!(
                "tree holds {} nodes but the index has {} entries",
                count,
                self.index.len()
            );
        }
        for (pid, &id) in self.index.iter() {
            if self.node(id).pid != *pid {
                bail!("index maps pid {} to node of pid {}", pid, self.node(id).pid);
            }
        }

        let mut prev = 0;
        for (pid, tickets) in self.iter() {
            if tickets < prev {
                bail!("pid {} with {} tickets out of key order", pid, tickets);
            }
            prev = tickets;
        }
        Ok(())
    }

    /// Returns (node count, ticket sum, black height) of the subtree.
    fn check_subtree(
        &self,
        at: Option<NodeId>,
        parent: Option<NodeId>,
    ) -> Result<(usize, Tickets, usize)> {
        let Some(id) = at else {
            return Ok((0, 0, 1));
        };
        let node = self.node(id);

        if node.parent != parent {
            bail!("node {:?} parent {:?} != {:?}", id, node.parent, parent);
        }
        if node.tickets == 0 {
            bail!("node {:?} (pid {}) holds no tickets", id, node.pid);
        }
        if node.color == Color::Red && (self.is_red(node.left) || self.is_red(node.right)) {
            bail!("red node {:?} has a red child", id);
        }

        let (lcount, lweight, lbh) = self.check_subtree(node.left, Some(id))?;
        let (rcount, rweight, rbh) = self.check_subtree(node.right, Some(id))?;

        if lweight != node.left_weight {
            bail!(
                "node {:?} left_weight {} != subtree sum {}",
                id,
                node.left_weight,
                lweight
            );
        }
        if rweight != node.right_weight {
            bail!(
                "node {:?} right_weight {} != subtree sum {}",
                id,
                node.right_weight,
                rweight
            );
        }
        if lbh != rbh {
            bail!("node {:?} black height {} != {}", id, lbh, rbh);
        }

        let black = usize::from(node.color == Color::Black);
        Ok((
            lcount + rcount + 1,
            lweight + node.tickets + rweight,
            lbh + black,
        ))
    }
}

impl TicketQueue for TicketTree {
    const NAME: &'static str = "tree";

    fn insert(&mut self, pid: Pid, tickets: Tickets) -> bool {
        if tickets == 0 || self.index.contains_key(&pid) {
            return false;
        }
        // Every cached weight is bounded by the root's, so this is the only
        // sum that can overflow.
        if self.root_weight().checked_add(tickets).is_none() {
            return false;
        }
        let id = self.insert_node(pid, tickets);
        self.index.insert(pid, id);
        true
    }

    fn remove(&mut self, pid: Pid) -> Option<Tickets> {
        let id = self.index.remove(&pid)?;
        let tickets = self.node(id).tickets;
        self.remove_node(id);
        Some(tickets)
    }

    fn draw(&self, point: u64) -> Option<Pid> {
        self.draw_node(point).map(|id| self.node(id).pid)
    }

    fn total_tickets(&self) -> Tickets {
        self.root_weight()
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn tickets(&self, pid: Pid) -> Option<Tickets> {
        self.index.get(&pid).map(|&id| self.node(id).tickets)
    }

    fn entries(&self) -> Vec<(Pid, Tickets)> {
        self.iter().collect()
    }
}

/// In-order iterator over `(pid, tickets)`.
pub struct Iter<'a> {
    tree: &'a TicketTree,
    stack: Vec<NodeId>,
}

impl Iter<'_> {
    fn push_left(&mut self, mut at: Option<NodeId>) {
        while let Some(id) = at {
            self.stack.push(id);
            at = self.tree.left(id);
        }
    }
}

impl Iterator for Iter<'_> {
    type Item = (Pid, Tickets);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        self.push_left(self.tree.right(id));
        let node = self.tree.node(id);
        Some((node.pid, node.tickets))
    }
}
