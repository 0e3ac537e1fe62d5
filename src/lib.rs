//! # rowtree
//!
//! A hierarchical row index for virtualized list and tree views.
//!
//! Maintains a partially-loaded tree of rows and answers, without ever
//! materializing the whole dataset:
//!
//! - pixel offset -> node, flat index -> node
//! - node -> pixel offset, node -> flat index
//! - node -> parent / children / siblings
//!
//! Cost of a lookup is proportional to tree depth and the number of
//! *waypoints* (expanded or custom-height children) per level, not to the
//! total row count.
//!
//! ## Example
//!
//! ```rust
//! use rowtree::RowTree;
//!
//! let mut tree: RowTree<&str> = RowTree::new();
//! let root = tree.root();
//! tree.set_child_count(root, 3);
//! tree.supply_children(root, 0, ["a", "b", "c"]);
//!
//! // Rows are 20px by default: "a" covers [0, 20), "b" covers [20, 40).
//! let b = tree.find_by_offset(25).unwrap();
//! assert_eq!(tree.content(b), Some(&"b"));
//! assert_eq!(tree.flat_index_of(b), Some(1));
//! ```

#![forbid(unsafe_code)]

use smallvec::SmallVec;
use std::fmt;

// =============================================================================
// Configuration
// =============================================================================

/// Row height used for nodes without a custom height, unless the tree was
/// built with [`RowTree::with_row_height`].
pub const DEFAULT_ROW_HEIGHT: u64 = 20;

/// Inline capacity of per-parent waypoint sets. Most parents have only a
/// handful of expanded or custom-height children at any one time.
const WAYPOINT_INLINE: usize = 8;

type WaypointSet = SmallVec<[NodeId; WAYPOINT_INLINE]>;
type Waypoints = SmallVec<[(usize, NodeId); WAYPOINT_INLINE]>;

// =============================================================================
// Handles
// =============================================================================

/// Handle to a node: a 32-bit arena slot index packed with a 32-bit
/// generation.
///
/// The generation is bumped every time a slot is freed, so a handle held
/// across a disposal is detected (access panics) instead of silently
/// aliasing whatever node reuses the slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

impl NodeId {
    #[inline]
    fn new(index: u32, generation: u32) -> Self {
        Self(u64::from(generation) << 32 | u64::from(index))
    }

    #[inline]
    fn index(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    #[inline]
    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}v{})", self.index(), self.generation())
    }
}

// =============================================================================
// Change notices
// =============================================================================

/// Tagged change notice bubbled from a mutated node up through its
/// ancestors. Only structural changes invalidate the visible-count memos;
/// `Content` and `Height` bubble vacuously because absolute offsets are
/// never cached.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Change {
    Add,
    Remove,
    Expanded,
    Collapsed,
    Content,
    Height,
}

impl Change {
    #[inline]
    fn is_structural(self) -> bool {
        matches!(
            self,
            Change::Add | Change::Remove | Change::Expanded | Change::Collapsed
        )
    }
}

// =============================================================================
// Node storage
// =============================================================================

struct NodeData<V> {
    parent: Option<NodeId>,
    /// Depth in the tree. The synthetic root is -1 and is never rendered.
    level: i32,
    /// Sparse child slots: `None` = unallocated. A materialized child with
    /// no content is a placeholder.
    children: Vec<Option<NodeId>>,
    /// Bumped whenever child positions may have shifted; validates the
    /// children's memoized sibling indices.
    children_gen: u64,
    /// Children whose subtree is expanded, keyed by identity. Projected to
    /// positions on demand.
    expanded_waypoints: WaypointSet,
    /// Children with a custom height, keyed by identity.
    height_waypoints: WaypointSet,
    content: Option<V>,
    height: Option<u64>,
    expanded: bool,
    /// Memoized position within `parent.children`, valid while
    /// `slot_cache_gen` matches the parent's `children_gen`.
    slot_cache: usize,
    slot_cache_gen: u64,
    /// Memoized count of visible descendants.
    visible_memo: Option<u64>,
}

impl<V> NodeData<V> {
    fn new(parent: Option<NodeId>, level: i32, expanded: bool) -> Self {
        Self {
            parent,
            level,
            children: Vec::new(),
            children_gen: 1,
            expanded_waypoints: SmallVec::new(),
            height_waypoints: SmallVec::new(),
            content: None,
            height: None,
            expanded,
            slot_cache: 0,
            slot_cache_gen: 0,
            visible_memo: None,
        }
    }
}

impl<V: Clone> Clone for NodeData<V> {
    fn clone(&self) -> Self {
        Self {
            parent: self.parent,
            level: self.level,
            children: self.children.clone(),
            children_gen: self.children_gen,
            expanded_waypoints: self.expanded_waypoints.clone(),
            height_waypoints: self.height_waypoints.clone(),
            content: self.content.clone(),
            height: self.height,
            expanded: self.expanded,
            slot_cache: self.slot_cache,
            slot_cache_gen: self.slot_cache_gen,
            visible_memo: self.visible_memo,
        }
    }
}

struct Slot<V> {
    generation: u32,
    data: Option<NodeData<V>>,
}

impl<V: Clone> Clone for Slot<V> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            data: self.data.clone(),
        }
    }
}

/// Node arena: slot vector plus free list. Handles carry a generation so
/// that freed slots can be reused without stale handles going undetected.
struct Arena<V> {
    slots: Vec<Slot<V>>,
    free: Vec<u32>,
}

impl<V> Arena<V> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn alloc(&mut self, data: NodeData<V>) -> NodeId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                debug_assert!(slot.data.is_none());
                slot.data = Some(data);
                NodeId::new(index, slot.generation)
            }
            None => {
                let index = self.slots.len();
                assert!(index <= u32::MAX as usize, "node arena exhausted");
                self.slots.push(Slot {
                    generation: 0,
                    data: Some(data),
                });
                NodeId::new(index as u32, 0)
            }
        }
    }

    fn free(&mut self, id: NodeId) {
        let slot = &mut self.slots[id.index()];
        debug_assert_eq!(slot.generation, id.generation());
        debug_assert!(slot.data.is_some());
        slot.data = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index() as u32);
    }

    #[inline]
    fn get(&self, id: NodeId) -> &NodeData<V> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.data.as_ref())
            .unwrap_or_else(|| panic!("accessed disposed node {:?}", id))
    }

    #[inline]
    fn get_mut(&mut self, id: NodeId) -> &mut NodeData<V> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.data.as_mut())
            .unwrap_or_else(|| panic!("accessed disposed node {:?}", id))
    }

    #[inline]
    fn is_alive(&self, id: NodeId) -> bool {
        self.slots
            .get(id.index())
            .is_some_and(|slot| slot.generation == id.generation() && slot.data.is_some())
    }

    #[inline]
    fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

impl<V: Clone> Clone for Arena<V> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            free: self.free.clone(),
        }
    }
}

// =============================================================================
// RowTree
// =============================================================================

/// Hierarchical row index over a partially-loaded tree.
///
/// Features:
/// - Arena-based node storage with generation-checked handles
/// - Sparse, lazily materialized child slots (placeholder promotion keeps
///   node identity stable)
/// - Offset / flat-index resolution that skips plain runs arithmetically
///   and descends only at waypoints
/// - Memoized visible-descendant counts invalidated by an explicit
///   walk-up-and-clear pass on structural mutation
///
/// Reads take `&mut self`: sibling-index and visible-count memoization
/// writes through the arena. The structure is single-threaded and
/// synchronous; wrap it in one exclusive lock if it must be shared.
pub struct RowTree<V> {
    arena: Arena<V>,
    root: NodeId,
    row_height: u64,
}

impl<V> RowTree<V> {
    /// Build an empty tree using [`DEFAULT_ROW_HEIGHT`].
    pub fn new() -> Self {
        Self::with_row_height(DEFAULT_ROW_HEIGHT)
    }

    /// Build an empty tree with the given default row height.
    pub fn with_row_height(row_height: u64) -> Self {
        assert!(row_height > 0, "default row height must be positive");
        let mut arena = Arena::new();
        // The root is a synthetic container: level -1, always expanded,
        // never itself rendered.
        let root = arena.alloc(NodeData::new(None, -1, true));
        Self {
            arena,
            root,
            row_height,
        }
    }

    /// The synthetic root. It owns the top-level rows but is not a row
    /// itself: it has no offset, no flat index, and no height.
    #[inline]
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Default row height for nodes without a custom height.
    #[inline]
    pub fn row_height(&self) -> u64 {
        self.row_height
    }

    /// Number of currently allocated nodes, the root included.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.arena.live()
    }

    /// Whether `id` refers to a live (not disposed) node.
    #[inline]
    pub fn is_alive(&self, id: NodeId) -> bool {
        self.arena.is_alive(id)
    }

    // =========================================================================
    // Node accessors
    // =========================================================================

    #[inline]
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.arena.get(id).parent
    }

    /// Depth in the tree; -1 for the root, 0 for top-level rows.
    #[inline]
    pub fn level(&self, id: NodeId) -> i32 {
        self.arena.get(id).level
    }

    /// Declared child count (allocated or not).
    #[inline]
    pub fn child_count(&self, id: NodeId) -> usize {
        self.arena.get(id).children.len()
    }

    #[inline]
    pub fn is_expanded(&self, id: NodeId) -> bool {
        self.arena.get(id).expanded
    }

    /// A placeholder occupies its position but has no real content yet.
    #[inline]
    pub fn is_placeholder(&self, id: NodeId) -> bool {
        id != self.root && self.arena.get(id).content.is_none()
    }

    #[inline]
    pub fn content(&self, id: NodeId) -> Option<&V> {
        self.arena.get(id).content.as_ref()
    }

    #[inline]
    pub fn content_mut(&mut self, id: NodeId) -> Option<&mut V> {
        self.arena.get_mut(id).content.as_mut()
    }

    /// Rendered height of the node's own row: the custom override if set,
    /// the tree default otherwise. The root occupies no pixels.
    #[inline]
    pub fn height(&self, id: NodeId) -> u64 {
        if id == self.root {
            return 0;
        }
        self.arena.get(id).height.unwrap_or(self.row_height)
    }

    /// A node is displayable iff every ancestor up to (but excluding) the
    /// root is expanded. The root itself is not displayable.
    pub fn is_displayable(&self, id: NodeId) -> bool {
        if id == self.root {
            return false;
        }
        let mut cur = self.arena.get(id).parent;
        while let Some(parent) = cur {
            if parent == self.root {
                return true;
            }
            let data = self.arena.get(parent);
            if !data.expanded {
                return false;
            }
            cur = data.parent;
        }
        panic!("node {:?} is not attached to the root", id)
    }

    /// Child at slot `index` without materializing it: `None` for
    /// out-of-range and unallocated slots alike.
    #[inline]
    pub fn allocated_child(&self, id: NodeId, index: usize) -> Option<NodeId> {
        self.arena.get(id).children.get(index).copied().flatten()
    }

    /// Child at slot `index`, materializing a placeholder if the slot is
    /// unallocated. Out-of-range indices return `None` without
    /// materializing anything. Idempotent: the same slot always yields the
    /// same node identity.
    pub fn child(&mut self, id: NodeId, index: usize) -> Option<NodeId> {
        let data = self.arena.get(id);
        match data.children.get(index) {
            None => None,
            Some(Some(existing)) => Some(*existing),
            Some(None) => {
                let level = data.level + 1;
                let child = self.arena.alloc(NodeData::new(Some(id), level, false));
                self.arena.get_mut(id).children[index] = Some(child);
                Some(child)
            }
        }
    }

    /// Memoized position of `id` among its parent's children. The memo is
    /// validated against the parent's child generation, which is bumped by
    /// every mutation that can shift positions.
    pub fn index_in_parent(&mut self, id: NodeId) -> usize {
        let parent = self
            .arena
            .get(id)
            .parent
            .unwrap_or_else(|| panic!("the root has no position among siblings"));
        let parent_gen = self.arena.get(parent).children_gen;

        let data = self.arena.get(id);
        if data.slot_cache_gen == parent_gen {
            return data.slot_cache;
        }

        let position = self
            .arena
            .get(parent)
            .children
            .iter()
            .position(|slot| *slot == Some(id))
            .unwrap_or_else(|| panic!("node {:?} missing from its parent's children", id));

        let data = self.arena.get_mut(id);
        data.slot_cache = position;
        data.slot_cache_gen = parent_gen;
        position
    }

    // =========================================================================
    // Structural mutation
    // =========================================================================

    /// Declare how many children `id` has (a server-declared total, with or
    /// without any data yet). Growing appends unallocated slots; shrinking
    /// disposes every allocated child at slot >= `count` together with its
    /// subtree. Equal counts are a no-op.
    pub fn set_child_count(&mut self, id: NodeId, count: usize) {
        let old = self.arena.get(id).children.len();
        if count == old {
            return;
        }

        if count > old {
            let data = self.arena.get_mut(id);
            data.children.resize(count, None);
            data.children_gen += 1;
            self.bubble(id, Change::Add);
            return;
        }

        let evicted = {
            let data = self.arena.get_mut(id);
            let evicted: Vec<NodeId> = data.children.drain(count..).flatten().collect();
            data.children_gen += 1;
            data.expanded_waypoints
                .retain(|child| !evicted.contains(child));
            data.height_waypoints
                .retain(|child| !evicted.contains(child));
            evicted
        };
        for child in evicted {
            self.dispose_subtree(child);
        }
        self.bubble(id, Change::Remove);
    }

    /// Splice the child at `index` out of `parent`, disposing its subtree
    /// if it was allocated. Later siblings shift down one slot. Panics on
    /// an out-of-range index.
    pub fn remove_child(&mut self, parent: NodeId, index: usize) {
        let len = self.arena.get(parent).children.len();
        assert!(
            index < len,
            "remove_child index {index} out of range (child count {len})"
        );

        let removed = {
            let data = self.arena.get_mut(parent);
            let removed = data.children.remove(index);
            data.children_gen += 1;
            if let Some(node) = removed {
                data.expanded_waypoints.retain(|child| *child != node);
                data.height_waypoints.retain(|child| *child != node);
            }
            removed
        };
        if let Some(node) = removed {
            self.dispose_subtree(node);
        }
        self.bubble(parent, Change::Remove);
    }

    /// Assign real content to `id`, promoting a placeholder in place. The
    /// node identity is preserved, so handles and cached positions held by
    /// the rendering layer stay valid. Panics on the root.
    pub fn set_content(&mut self, id: NodeId, content: V) {
        assert!(id != self.root, "the synthetic root carries no content");
        self.arena.get_mut(id).content = Some(content);
        self.bubble(id, Change::Content);
    }

    /// Populate a run of children starting at slot `start` with real
    /// content, materializing slots as needed. Items past the declared
    /// child count are dropped.
    pub fn supply_children<I>(&mut self, parent: NodeId, start: usize, items: I)
    where
        I: IntoIterator<Item = V>,
    {
        let mut index = start;
        for item in items {
            let Some(child) = self.child(parent, index) else {
                break;
            };
            self.arena.get_mut(child).content = Some(item);
            index += 1;
        }
        self.bubble(parent, Change::Content);
    }

    /// Toggle expansion. Maintains the parent's expanded waypoint set and
    /// invalidates visible counts up the ancestor chain. Same-value calls
    /// are unobservable no-ops. Panics on the root, which is conceptually
    /// always expanded.
    pub fn set_expanded(&mut self, id: NodeId, expanded: bool) {
        assert!(
            id != self.root,
            "cannot toggle expansion of the synthetic root"
        );
        let data = self.arena.get(id);
        if data.expanded == expanded {
            return;
        }
        let parent = data
            .parent
            .unwrap_or_else(|| panic!("non-root node {:?} has no parent", id));

        self.arena.get_mut(id).expanded = expanded;
        let parent_data = self.arena.get_mut(parent);
        if expanded {
            debug_assert!(!parent_data.expanded_waypoints.contains(&id));
            parent_data.expanded_waypoints.push(id);
        } else {
            parent_data.expanded_waypoints.retain(|child| *child != id);
        }

        let change = if expanded {
            Change::Expanded
        } else {
            Change::Collapsed
        };
        self.bubble(id, change);
    }

    /// Set or clear the custom height. Maintains the parent's height
    /// waypoint set. Offsets are never cached, so no count invalidation
    /// happens; subsequent offset queries pick the new height up lazily.
    /// Panics on the root, which carries no visual height.
    pub fn set_height(&mut self, id: NodeId, height: Option<u64>) {
        assert!(id != self.root, "cannot set a height on the synthetic root");
        if let Some(h) = height {
            assert!(h > 0, "custom row height must be positive");
        }
        let data = self.arena.get(id);
        if data.height == height {
            return;
        }
        let parent = data
            .parent
            .unwrap_or_else(|| panic!("non-root node {:?} has no parent", id));
        let had_custom = data.height.is_some();

        self.arena.get_mut(id).height = height;
        let parent_data = self.arena.get_mut(parent);
        match (had_custom, height.is_some()) {
            (false, true) => parent_data.height_waypoints.push(id),
            (true, false) => parent_data.height_waypoints.retain(|child| *child != id),
            _ => {}
        }

        self.bubble(id, Change::Height);
    }

    /// Free `id` and every allocated descendant. Waypoint membership in the
    /// disposing parent must already have been removed by the caller.
    fn dispose_subtree(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(node) = stack.pop() {
            let data = self.arena.get(node);
            stack.extend(data.children.iter().copied().flatten());
            self.arena.free(node);
        }
    }

    /// Post-mutation invalidation pass: walk from `origin` up to the root,
    /// clearing the visible-count memo at each step. Non-structural changes
    /// bubble vacuously.
    fn bubble(&mut self, origin: NodeId, change: Change) {
        if !change.is_structural() {
            return;
        }
        let mut cur = Some(origin);
        while let Some(id) = cur {
            let data = self.arena.get_mut(id);
            data.visible_memo = None;
            cur = data.parent;
        }
    }

    // =========================================================================
    // Waypoint projection
    // =========================================================================

    /// Project both waypoint sets of `parent` to (position, node) pairs,
    /// deduplicated and sorted ascending by position. Rebuilt per query;
    /// the sets are expected to stay small.
    fn waypoints(&mut self, parent: NodeId) -> Waypoints {
        let ids: WaypointSet = {
            let data = self.arena.get(parent);
            let mut ids = data.expanded_waypoints.clone();
            for &node in &data.height_waypoints {
                if !ids.contains(&node) {
                    ids.push(node);
                }
            }
            ids
        };

        let mut out = Waypoints::new();
        for node in ids {
            out.push((self.index_in_parent(node), node));
        }
        out.sort_unstable_by_key(|&(position, _)| position);
        out
    }

    /// Like [`Self::waypoints`], but only expanded children: the only ones
    /// that occupy more than one flat position.
    fn flat_waypoints(&mut self, parent: NodeId) -> Waypoints {
        let ids = self.arena.get(parent).expanded_waypoints.clone();
        let mut out = Waypoints::new();
        for node in ids {
            out.push((self.index_in_parent(node), node));
        }
        out.sort_unstable_by_key(|&(position, _)| position);
        out
    }

    // =========================================================================
    // Position index: derived totals
    // =========================================================================

    /// Memoized count of all currently-visible descendants of `id`: its
    /// child slots plus, recursively, the visible descendants of expanded
    /// children. 0 for a collapsed node.
    pub fn visible_count(&mut self, id: NodeId) -> u64 {
        let data = self.arena.get(id);
        if !data.expanded {
            return 0;
        }
        if let Some(memo) = data.visible_memo {
            return memo;
        }

        let mut total = data.children.len() as u64;
        let expanded = data.expanded_waypoints.clone();
        for child in expanded {
            total += self.visible_count(child);
        }
        self.arena.get_mut(id).visible_memo = Some(total);
        total
    }

    /// Total number of visible rows in the tree.
    #[inline]
    pub fn visible_len(&mut self) -> u64 {
        let root = self.root;
        self.visible_count(root)
    }

    /// Total pixel height of all visible rows. Derived by walking
    /// waypoints; never cached, so height changes are picked up lazily.
    pub fn content_height(&mut self) -> u64 {
        let root = self.root;
        self.children_height(root)
    }

    /// Total rendered height of `parent`'s visible children band, the
    /// parent's own row excluded. Plain runs contribute
    /// `count * row_height` in O(1); only waypoints are walked.
    fn children_height(&mut self, parent: NodeId) -> u64 {
        let len = self.arena.get(parent).children.len() as u64;
        let waypoints = self.waypoints(parent);

        let mut total = (len - waypoints.len() as u64) * self.row_height;
        for (_, node) in waypoints {
            total += self.height(node);
            if self.arena.get(node).expanded {
                total += self.children_height(node);
            }
        }
        total
    }

    // =========================================================================
    // Position index: offset <-> node
    // =========================================================================

    /// Node whose row band contains `offset`, materializing a placeholder
    /// if the hit lands on an unallocated slot. Bands are half-open
    /// `[top, top + height)`: a boundary offset belongs to the next row.
    /// Offsets at or beyond the end of the content return `None`.
    pub fn find_by_offset(&mut self, offset: u64) -> Option<NodeId> {
        let root = self.root;
        self.offset_lookup(root, offset)
    }

    fn offset_lookup(&mut self, parent: NodeId, target: u64) -> Option<NodeId> {
        let len = self.arena.get(parent).children.len();
        if len == 0 {
            return None;
        }
        let h = self.row_height;

        // `cursor` is the next child position to account for; `top` the
        // offset at which that position starts.
        let mut cursor = 0usize;
        let mut top = 0u64;

        for (position, node) in self.waypoints(parent) {
            let plain = (position - cursor) as u64 * h;
            if target < top + plain {
                let index = cursor + ((target - top) / h) as usize;
                return self.child(parent, index);
            }
            top += plain;

            let own = self.height(node);
            if target < top + own {
                return Some(node);
            }
            top += own;

            if self.arena.get(node).expanded {
                let subtree = self.children_height(node);
                if target < top + subtree {
                    return self.offset_lookup(node, target - top);
                }
                top += subtree;
            }
            cursor = position + 1;
        }

        let plain = (len - cursor) as u64 * h;
        if target < top + plain {
            let index = cursor + ((target - top) / h) as usize;
            return self.child(parent, index);
        }
        None
    }

    /// Pixel offset of the top of `id`'s row band. `None` if the node is
    /// not displayable (some ancestor is collapsed, or `id` is the root).
    ///
    /// O(depth x waypoints-per-level): each ancestor level contributes its
    /// local offset, computed from waypoints positioned before the node.
    pub fn offset_of(&mut self, id: NodeId) -> Option<u64> {
        if id == self.root || !self.is_displayable(id) {
            return None;
        }
        let root = self.root;
        let mut total = 0u64;
        let mut cur = id;
        loop {
            let parent = self
                .arena
                .get(cur)
                .parent
                .unwrap_or_else(|| panic!("non-root node {:?} has no parent", cur));
            total += self.local_offset(parent, cur);
            if parent == root {
                break;
            }
            // The parent's children band starts below its own row.
            total += self.height(parent);
            cur = parent;
        }
        Some(total)
    }

    /// Offset of `node` within its parent's children band.
    fn local_offset(&mut self, parent: NodeId, node: NodeId) -> u64 {
        let position = self.index_in_parent(node);
        let mut plain = position as u64;
        let mut extra = 0u64;
        for (waypoint_pos, waypoint) in self.waypoints(parent) {
            if waypoint_pos >= position {
                break;
            }
            plain -= 1;
            extra += self.height(waypoint);
            if self.arena.get(waypoint).expanded {
                extra += self.children_height(waypoint);
            }
        }
        plain * self.row_height + extra
    }

    // =========================================================================
    // Position index: flat index <-> node
    // =========================================================================

    /// Node at flat position `index` among all visible rows (depth-first,
    /// expand-aware order), materializing a placeholder on a hit against an
    /// unallocated slot. Indices at or beyond the visible count return
    /// `None`.
    ///
    /// Panics if an index inside the visible range fails to resolve: that
    /// is an internal consistency bug, never a caller error.
    pub fn find_by_flat_index(&mut self, index: u64) -> Option<NodeId> {
        let root = self.root;
        if index >= self.visible_count(root) {
            return None;
        }
        match self.flat_lookup(root, index) {
            Some(node) => Some(node),
            None => panic!("flat index {index} is inside the visible range but resolved to no node"),
        }
    }

    fn flat_lookup(&mut self, parent: NodeId, target: u64) -> Option<NodeId> {
        let len = self.arena.get(parent).children.len();
        if len == 0 {
            return None;
        }

        let mut cursor = 0usize;
        let mut flat = 0u64;

        for (position, node) in self.flat_waypoints(parent) {
            let plain = (position - cursor) as u64;
            if target < flat + plain {
                let index = cursor + (target - flat) as usize;
                return self.child(parent, index);
            }
            flat += plain;

            if target == flat {
                return Some(node);
            }
            flat += 1;

            let subtree = self.visible_count(node);
            if target < flat + subtree {
                return self.flat_lookup(node, target - flat);
            }
            flat += subtree;
            cursor = position + 1;
        }

        let plain = (len - cursor) as u64;
        if target < flat + plain {
            let index = cursor + (target - flat) as usize;
            return self.child(parent, index);
        }
        None
    }

    /// Flat position of `id` among all visible rows. `None` if the node is
    /// not displayable (some ancestor is collapsed, or `id` is the root).
    pub fn flat_index_of(&mut self, id: NodeId) -> Option<u64> {
        if id == self.root || !self.is_displayable(id) {
            return None;
        }
        let root = self.root;
        let mut total = 0u64;
        let mut cur = id;
        loop {
            let parent = self
                .arena
                .get(cur)
                .parent
                .unwrap_or_else(|| panic!("non-root node {:?} has no parent", cur));
            total += self.local_flat(parent, cur);
            if parent == root {
                break;
            }
            // The parent's own row precedes its children.
            total += 1;
            cur = parent;
        }
        Some(total)
    }

    /// Flat position of `node` within its parent's children band.
    fn local_flat(&mut self, parent: NodeId, node: NodeId) -> u64 {
        let position = self.index_in_parent(node);
        let mut flat = position as u64;
        for (waypoint_pos, waypoint) in self.flat_waypoints(parent) {
            if waypoint_pos >= position {
                break;
            }
            flat += self.visible_count(waypoint);
        }
        flat
    }

    /// The visible row immediately after `id` in flat order, if any.
    pub fn next_visible(&mut self, id: NodeId) -> Option<NodeId> {
        let index = self.flat_index_of(id)?;
        self.find_by_flat_index(index + 1)
    }

    /// Iterate over all visible rows in flat order, materializing
    /// placeholders as it goes.
    pub fn visible_rows(&mut self) -> VisibleRows<'_, V> {
        let root = self.root;
        VisibleRows {
            tree: self,
            stack: vec![(root, 0)],
        }
    }
}

impl<V> Default for RowTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> Clone for RowTree<V> {
    fn clone(&self) -> Self {
        Self {
            arena: self.arena.clone(),
            root: self.root,
            row_height: self.row_height,
        }
    }
}

impl<V> fmt::Debug for RowTree<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowTree")
            .field("row_height", &self.row_height)
            .field("nodes", &self.arena.live())
            .finish()
    }
}

// =============================================================================
// Iteration
// =============================================================================

/// Depth-first iterator over visible rows. Holds the tree exclusively
/// because stepping into unallocated slots materializes placeholders.
pub struct VisibleRows<'a, V> {
    tree: &'a mut RowTree<V>,
    /// (parent, next child position) frames; the root frame is never popped
    /// until its children are exhausted.
    stack: Vec<(NodeId, usize)>,
}

impl<V> Iterator for VisibleRows<'_, V> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let &(parent, index) = self.stack.last()?;
            if index >= self.tree.child_count(parent) {
                self.stack.pop();
                continue;
            }
            self.stack.last_mut().expect("frame checked above").1 += 1;

            let node = self
                .tree
                .child(parent, index)
                .expect("slot index checked against child count");
            if self.tree.is_expanded(node) && self.tree.child_count(node) > 0 {
                self.stack.push((node, 0));
            }
            return Some(node);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================


#[cfg(test)]
mod proptests;
