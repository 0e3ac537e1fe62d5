use super::*;

use proptest::prelude::*;
use std::collections::BTreeMap;

const ROW_HEIGHT: u64 = 16;

/// Naive oracle: a nested map mirroring declared counts, expansion, and
/// height overrides. Children are stored sparsely, like the index's slots.
#[derive(Clone, Debug, Default)]
struct ModelNode {
    count: usize,
    expanded: bool,
    height: Option<u64>,
    children: BTreeMap<usize, ModelNode>,
}

/// Enumerate visible rows as (path, height) in depth-first order.
fn flatten(node: &ModelNode, path: &mut Vec<usize>, out: &mut Vec<(Vec<usize>, u64)>) {
    for slot in 0..node.count {
        let child = node.children.get(&slot);
        let height = child.and_then(|c| c.height).unwrap_or(ROW_HEIGHT);
        path.push(slot);
        out.push((path.clone(), height));
        if let Some(child) = child {
            if child.expanded {
                flatten(child, path, out);
            }
        }
        path.pop();
    }
}

fn model_rows(model: &ModelNode) -> Vec<(Vec<usize>, u64)> {
    let mut rows = Vec::new();
    flatten(model, &mut Vec::new(), &mut rows);
    rows
}

/// Resolve a slot path, materializing model entries along the way exactly
/// like `RowTree::child` materializes placeholders. `None` when some step
/// is out of range of the declared count.
fn model_resolve<'a>(root: &'a mut ModelNode, path: &[usize]) -> Option<&'a mut ModelNode> {
    let mut cur = root;
    for &slot in path {
        if slot >= cur.count {
            return None;
        }
        cur = cur.children.entry(slot).or_default();
    }
    Some(cur)
}

fn tree_resolve(tree: &mut RowTree<u32>, path: &[usize]) -> Option<NodeId> {
    let mut cur = tree.root();
    for &slot in path {
        cur = tree.child(cur, slot)?;
    }
    Some(cur)
}

fn path_of(tree: &mut RowTree<u32>, mut id: NodeId) -> Vec<usize> {
    let mut path = Vec::new();
    while tree.parent(id).is_some() {
        path.push(tree.index_in_parent(id));
        id = tree.parent(id).expect("parent checked above");
    }
    path.reverse();
    path
}

#[derive(Clone, Debug)]
enum Op {
    SetCount(Vec<usize>, usize),
    Expand(Vec<usize>),
    Collapse(Vec<usize>),
    SetHeight(Vec<usize>, Option<u64>),
    Supply(Vec<usize>, u32),
}

fn path_strategy() -> impl Strategy<Value = Vec<usize>> + Clone {
    prop::collection::vec(0usize..5, 0..=3)
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    let path = path_strategy();
    let op = prop_oneof![
        30 => (path.clone(), 0usize..=6).prop_map(|(p, n)| Op::SetCount(p, n)),
        25 => path.clone().prop_map(Op::Expand),
        15 => path.clone().prop_map(Op::Collapse),
        20 => (path.clone(), prop::option::of(1u64..=40)).prop_map(|(p, h)| Op::SetHeight(p, h)),
        10 => (path.clone(), any::<u32>()).prop_map(|(p, v)| Op::Supply(p, v)),
    ];
    prop::collection::vec(op, 0..=80)
}

fn apply(tree: &mut RowTree<u32>, model: &mut ModelNode, op: &Op) {
    match op {
        Op::SetCount(path, count) => {
            if let Some(node) = model_resolve(model, path) {
                node.count = *count;
                node.children.retain(|&slot, _| slot < *count);
                let id = tree_resolve(tree, path).expect("model resolved, tree must too");
                tree.set_child_count(id, *count);
            }
        }
        Op::Expand(path) | Op::Collapse(path) => {
            // The root is always expanded and rejects toggling.
            if path.is_empty() {
                return;
            }
            let expanded = matches!(op, Op::Expand(_));
            if let Some(node) = model_resolve(model, path) {
                node.expanded = expanded;
                let id = tree_resolve(tree, path).expect("model resolved, tree must too");
                tree.set_expanded(id, expanded);
            }
        }
        Op::SetHeight(path, height) => {
            if path.is_empty() {
                return;
            }
            if let Some(node) = model_resolve(model, path) {
                node.height = *height;
                let id = tree_resolve(tree, path).expect("model resolved, tree must too");
                tree.set_height(id, *height);
            }
        }
        Op::Supply(path, value) => {
            if path.is_empty() {
                return;
            }
            if model_resolve(model, path).is_some() {
                let id = tree_resolve(tree, path).expect("model resolved, tree must too");
                tree.set_content(id, *value);
                assert_eq!(tree.content(id), Some(value));
            }
        }
    }
}

/// Full equivalence check: enumerate the oracle's visible rows and verify
/// every mapping in both directions, including band boundaries.
fn check_against_model(
    tree: &mut RowTree<u32>,
    model: &ModelNode,
) -> Result<(), TestCaseError> {
    let rows = model_rows(model);
    let total_height: u64 = rows.iter().map(|(_, height)| height).sum();
    let root = tree.root();

    prop_assert_eq!(tree.visible_count(root), rows.len() as u64);
    prop_assert_eq!(tree.content_height(), total_height);

    let mut top = 0u64;
    for (index, (path, height)) in rows.iter().enumerate() {
        let index = index as u64;
        let node = match tree.find_by_flat_index(index) {
            Some(node) => node,
            None => return Err(TestCaseError::fail(format!("no node at flat index {index}"))),
        };

        prop_assert_eq!(&path_of(tree, node), path);
        prop_assert_eq!(tree.height(node), *height);
        prop_assert_eq!(tree.flat_index_of(node), Some(index));
        prop_assert_eq!(tree.offset_of(node), Some(top));
        prop_assert_eq!(tree.find_by_offset(top), Some(node));
        prop_assert_eq!(tree.find_by_offset(top + height - 1), Some(node));
        top += height;
    }

    prop_assert_eq!(tree.find_by_offset(total_height), None);
    prop_assert_eq!(tree.find_by_flat_index(rows.len() as u64), None);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 50_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_equivalence(ops in ops_strategy()) {
        let mut tree: RowTree<u32> = RowTree::with_row_height(ROW_HEIGHT);
        let mut model = ModelNode {
            expanded: true,
            ..ModelNode::default()
        };

        for op in &ops {
            apply(&mut tree, &mut model, op);
            let root = tree.root();
            prop_assert_eq!(tree.visible_count(root), model_rows(&model).len() as u64);
        }

        check_against_model(&mut tree, &model)?;
    }

    #[test]
    fn prop_offset_probes(ops in ops_strategy(), probes in prop::collection::vec(0u64..4096, 0..32)) {
        let mut tree: RowTree<u32> = RowTree::with_row_height(ROW_HEIGHT);
        let mut model = ModelNode {
            expanded: true,
            ..ModelNode::default()
        };
        for op in &ops {
            apply(&mut tree, &mut model, op);
        }

        // Which row covers each probed offset, per the oracle.
        let rows = model_rows(&model);
        for probe in probes {
            let mut expected = None;
            let mut top = 0u64;
            for (path, height) in &rows {
                if probe < top + height {
                    expected = Some(path.clone());
                    break;
                }
                top += height;
            }

            let got = tree.find_by_offset(probe).map(|node| path_of(&mut tree, node));
            prop_assert_eq!(got, expected);
        }
    }
}

fn for_each_permutation<T: Clone>(items: &[T], mut f: impl FnMut(Vec<T>)) {
    fn rec<T: Clone>(items: &[T], used: &mut [bool], out: &mut Vec<T>, f: &mut impl FnMut(Vec<T>)) {
        if out.len() == items.len() {
            f(out.clone());
            return;
        }
        for i in 0..items.len() {
            if used[i] {
                continue;
            }
            used[i] = true;
            out.push(items[i].clone());
            rec(items, used, out, f);
            out.pop();
            used[i] = false;
        }
    }

    let mut used = vec![false; items.len()];
    let mut out = Vec::with_capacity(items.len());
    rec(items, &mut used, &mut out, &mut f);
}

#[test]
fn exhaustive_toggle_orders_small_tree() {
    // Two levels of three children each; toggle expansion in every order
    // and require the index to agree with the oracle after every step.
    let toggles: Vec<Op> = vec![
        Op::Expand(vec![0]),
        Op::Expand(vec![1]),
        Op::Expand(vec![1, 1]),
        Op::Collapse(vec![1]),
        Op::SetHeight(vec![2], Some(40)),
        Op::Expand(vec![2]),
    ];

    for_each_permutation(&toggles, |perm| {
        let mut tree: RowTree<u32> = RowTree::with_row_height(ROW_HEIGHT);
        let mut model = ModelNode {
            expanded: true,
            ..ModelNode::default()
        };
        apply(&mut tree, &mut model, &Op::SetCount(vec![], 3));
        for top in 0..3 {
            apply(&mut tree, &mut model, &Op::SetCount(vec![top], 3));
        }
        apply(&mut tree, &mut model, &Op::SetCount(vec![1, 1], 2));

        for op in &perm {
            apply(&mut tree, &mut model, op);
            check_against_model(&mut tree, &model).expect("index diverged from oracle");
        }
    });
}

#[test]
fn exhaustive_shrink_orders() {
    // Shrink the root in every order of (3, 1, 0) interleavings after
    // expanding the middle child; disposal must never leave stale
    // waypoints behind.
    let counts: Vec<usize> = vec![3, 1, 0];

    for_each_permutation(&counts, |perm| {
        let mut tree: RowTree<u32> = RowTree::with_row_height(ROW_HEIGHT);
        let mut model = ModelNode {
            expanded: true,
            ..ModelNode::default()
        };
        apply(&mut tree, &mut model, &Op::SetCount(vec![], 4));
        apply(&mut tree, &mut model, &Op::SetCount(vec![1], 3));
        apply(&mut tree, &mut model, &Op::Expand(vec![1]));
        apply(&mut tree, &mut model, &Op::SetHeight(vec![2], Some(9)));

        for &count in &perm {
            apply(&mut tree, &mut model, &Op::SetCount(vec![], count));
            check_against_model(&mut tree, &model).expect("index diverged from oracle");
        }
        check_against_model(&mut tree, &model).expect("index diverged from oracle");
    });
}
