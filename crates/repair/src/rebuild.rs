//! Balanced page-tree rebuild
//!
//! Leaves are collected in document order with their inheritable attributes
//! pushed down, then regrouped bottom-up into nodes of at most
//! `branching_factor` kids. The new root replaces the catalog's `/Pages` and
//! the old intermediate nodes are dropped.

use crate::{RepairConfig, RepairError};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId};
use quire_watchdog::CancellationToken;
use std::collections::HashSet;
use std::rc::Rc;
use tracing::{debug, warn};

const INHERITABLE: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];
const CHECK_EVERY: usize = 1024;
const MAX_INSPECT_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildReport {
    pub leaf_count: usize,
    /// Intermediate nodes in the new tree, root included
    pub node_count: usize,
    /// Levels of intermediate nodes
    pub depth: usize,
    pub removed_nodes: usize,
}

/// Structural summary of a page tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeShape {
    pub leaf_count: usize,
    pub node_count: usize,
    pub max_fan_out: usize,
    pub depth: usize,
    /// Every node's `/Count` equals its descendant leaf count
    pub counts_consistent: bool,
    /// Every child's `/Parent` points at the node listing it
    pub parents_consistent: bool,
}

type Inherited = Rc<Vec<(&'static [u8], Object)>>;

/// Rebuild the document's page tree in place
pub fn rebuild_page_tree(
    document: &mut Document,
    branching_factor: usize,
    token: &CancellationToken,
) -> Result<RebuildReport, RepairError> {
    if branching_factor < 2 {
        return Err(RepairError::InvalidConfig(format!(
            "branching_factor must be at least 2, got {branching_factor}"
        )));
    }

    let (catalog_id, root_id) = page_tree_root(document)?;
    let (leaves, interior) = collect_leaves(document, root_id, token)?;
    if leaves.is_empty() {
        return Err(RepairError::InvalidStructure(
            "page tree has no pages".to_owned(),
        ));
    }

    let (new_root, node_count, depth) = build_levels(document, &leaves, branching_factor, token)?;
    document
        .get_object_mut(catalog_id)?
        .as_dict_mut()?
        .set("Pages", new_root);

    for id in &interior {
        document.objects.remove(id);
    }

    let report = RebuildReport {
        leaf_count: leaves.len(),
        node_count,
        depth,
        removed_nodes: interior.len(),
    };
    debug!(
        leaves = report.leaf_count,
        nodes = report.node_count,
        depth = report.depth,
        removed = report.removed_nodes,
        "rebuilt page tree"
    );
    Ok(report)
}

/// Parse, rebuild and re-serialise a document
pub fn repair_bytes(
    bytes: &[u8],
    config: &RepairConfig,
    token: &CancellationToken,
) -> Result<(Vec<u8>, RebuildReport), RepairError> {
    config.validate()?;
    let mut document = Document::load_mem(bytes)?;
    token.check()?;

    let report = rebuild_page_tree(&mut document, config.branching_factor, token)?;
    token.check()?;

    let mut output = Vec::new();
    output
        .try_reserve(bytes.len())
        .map_err(|_| RepairError::OutOfMemory {
            items: report.leaf_count,
        })?;
    document.save_to(&mut output)?;
    Ok((output, report))
}

/// Walk the page tree and summarise its shape
pub fn inspect_tree(document: &Document) -> Result<TreeShape, RepairError> {
    let (_, root_id) = page_tree_root(document)?;
    let mut shape = TreeShape {
        counts_consistent: true,
        parents_consistent: true,
        ..TreeShape::default()
    };
    let mut visited = HashSet::new();
    inspect_node(document, root_id, None, 1, &mut shape, &mut visited)?;
    Ok(shape)
}

fn page_tree_root(document: &Document) -> Result<(ObjectId, ObjectId), RepairError> {
    let catalog_id = document.trailer.get(b"Root")?.as_reference()?;
    let root_id = document
        .get_dictionary(catalog_id)?
        .get(b"Pages")?
        .as_reference()?;
    Ok((catalog_id, root_id))
}

fn is_node(dict: &Dictionary) -> bool {
    dict.has(b"Kids")
        || dict
            .get(b"Type")
            .and_then(Object::as_name)
            .is_ok_and(|name| name == b"Pages")
}

fn kids_of(document: &Document, dict: &Dictionary) -> Vec<ObjectId> {
    let kids = match dict.get(b"Kids") {
        Ok(Object::Reference(id)) => document.get_object(*id).ok(),
        Ok(other) => Some(other),
        Err(_) => None,
    };
    kids.and_then(|kids| kids.as_array().ok())
        .map(|kids| kids.iter().filter_map(|kid| kid.as_reference().ok()).collect())
        .unwrap_or_default()
}

fn grow<T>(items: &mut Vec<T>) -> Result<(), RepairError> {
    if items.len() == items.capacity() {
        items
            .try_reserve(items.len().max(64))
            .map_err(|_| RepairError::OutOfMemory { items: items.len() })?;
    }
    Ok(())
}

/// Leaves in document order plus every intermediate node visited
fn collect_leaves(
    document: &mut Document,
    root_id: ObjectId,
    token: &CancellationToken,
) -> Result<(Vec<ObjectId>, Vec<ObjectId>), RepairError> {
    let mut leaves = Vec::new();
    let mut interior = Vec::new();
    let mut visited = HashSet::new();
    let mut stack: Vec<(ObjectId, Inherited)> = vec![(root_id, Rc::new(Vec::new()))];

    while let Some((id, inherited)) = stack.pop() {
        if visited.len() % CHECK_EVERY == 0 {
            token.check()?;
        }
        if !visited.insert(id) {
            warn!(object = id.0, "page tree references a node twice, skipping");
            continue;
        }

        let node = match document.get_dictionary(id) {
            Ok(dict) if is_node(dict) => {
                let mut attrs = (*inherited).clone();
                for key in INHERITABLE {
                    if let Ok(value) = dict.get(key) {
                        attrs.retain(|(existing, _)| *existing != key);
                        attrs.push((key, value.clone()));
                    }
                }
                Some((kids_of(document, dict), Rc::new(attrs)))
            }
            Ok(_) => None,
            Err(err) => {
                warn!(object = id.0, %err, "dangling page-tree reference, skipping");
                continue;
            }
        };

        match node {
            Some((kids, attrs)) => {
                grow(&mut interior)?;
                interior.push(id);
                stack
                    .try_reserve(kids.len())
                    .map_err(|_| RepairError::OutOfMemory { items: kids.len() })?;
                // Reversed so the first kid is popped first
                stack.extend(kids.into_iter().rev().map(|kid| (kid, Rc::clone(&attrs))));
            }
            None => {
                let dict = document.get_object_mut(id)?.as_dict_mut()?;
                for (key, value) in inherited.iter() {
                    if !dict.has(key) {
                        dict.set(key.to_vec(), value.clone());
                    }
                }
                grow(&mut leaves)?;
                leaves.push(id);
            }
        }
    }

    Ok((leaves, interior))
}

/// Group `leaves` bottom-up; returns (root, node count, depth)
fn build_levels(
    document: &mut Document,
    leaves: &[ObjectId],
    branching_factor: usize,
    token: &CancellationToken,
) -> Result<(ObjectId, usize, usize), RepairError> {
    let mut level: Vec<(ObjectId, i64)> = Vec::new();
    level
        .try_reserve_exact(leaves.len())
        .map_err(|_| RepairError::OutOfMemory {
            items: leaves.len(),
        })?;
    level.extend(leaves.iter().map(|&id| (id, 1)));

    let mut node_count = 0;
    let mut depth = 0;
    loop {
        token.check()?;
        let groups = level.len().div_ceil(branching_factor);
        let mut next = Vec::new();
        next.try_reserve_exact(groups)
            .map_err(|_| RepairError::OutOfMemory { items: groups })?;

        for group in level.chunks(branching_factor) {
            let count: i64 = group.iter().map(|&(_, count)| count).sum();
            let kids: Vec<Object> = group.iter().map(|&(id, _)| Object::Reference(id)).collect();
            let node_id = document.add_object(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => Object::Integer(count),
            });
            for &(child, _) in group {
                document
                    .get_object_mut(child)?
                    .as_dict_mut()?
                    .set("Parent", node_id);
            }
            next.push((node_id, count));
        }

        node_count += next.len();
        depth += 1;
        match next.as_slice() {
            [(root, _)] => return Ok((*root, node_count, depth)),
            _ => level = next,
        }
    }
}

fn inspect_node(
    document: &Document,
    id: ObjectId,
    parent: Option<ObjectId>,
    depth: usize,
    shape: &mut TreeShape,
    visited: &mut HashSet<ObjectId>,
) -> Result<u64, RepairError> {
    if depth > MAX_INSPECT_DEPTH {
        return Err(RepairError::InvalidStructure(format!(
            "page tree deeper than {MAX_INSPECT_DEPTH} levels"
        )));
    }
    if !visited.insert(id) {
        return Err(RepairError::InvalidStructure(format!(
            "page-tree node {} {} reached twice",
            id.0, id.1
        )));
    }

    let dict = document.get_dictionary(id)?;
    if let Some(parent) = parent {
        let declared = dict.get(b"Parent").and_then(Object::as_reference).ok();
        shape.parents_consistent &= declared == Some(parent);
    }

    if !is_node(dict) {
        shape.leaf_count += 1;
        return Ok(1);
    }

    let kids = kids_of(document, dict);
    shape.node_count += 1;
    shape.depth = shape.depth.max(depth);
    shape.max_fan_out = shape.max_fan_out.max(kids.len());

    let mut leaves = 0;
    for kid in kids {
        leaves += inspect_node(document, kid, Some(id), depth + 1, shape, visited)?;
    }
    let declared = dict.get(b"Count").and_then(Object::as_i64).ok();
    shape.counts_consistent &= declared == i64::try_from(leaves).ok();
    Ok(leaves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::PdfFixture;
    use crate::{scan, ScanVerdict};
    use proptest::prelude::*;

    fn page_order(document: &Document) -> Vec<ObjectId> {
        document.get_pages().into_values().collect()
    }

    #[test]
    fn test_ten_thousand_flat_pages() {
        let bytes = PdfFixture::flat(10_000).build().unwrap();
        let token = CancellationToken::new();
        let config = RepairConfig::default();

        let report = scan(&bytes[..], Some(bytes.len() as u64), &config, &token).unwrap();
        assert!(matches!(report.verdict, ScanVerdict::Oversized(_)));

        let (repaired, rebuild) = repair_bytes(&bytes, &config, &token).unwrap();
        assert_eq!(rebuild.leaf_count, 10_000);

        let document = Document::load_mem(&repaired).unwrap();
        let shape = inspect_tree(&document).unwrap();
        assert_eq!(shape.leaf_count, 10_000);
        assert!(shape.max_fan_out <= config.branching_factor);
        assert!(shape.counts_consistent);
        assert!(shape.parents_consistent);
        assert_eq!(document.get_pages().len(), 10_000);
    }

    #[test]
    fn test_flat_fixture_shape() {
        let shape = inspect_tree(&PdfFixture::flat(40).document()).unwrap();
        assert_eq!(shape.leaf_count, 40);
        assert_eq!(shape.node_count, 1);
        assert_eq!(shape.max_fan_out, 40);
        assert_eq!(shape.depth, 1);
        assert!(shape.counts_consistent);
    }

    #[test]
    fn test_inherited_attributes_move_to_leaves() {
        let mut document = PdfFixture::flat(5).with_page_size(300.0, 400.0).document();
        rebuild_page_tree(&mut document, 2, &CancellationToken::new()).unwrap();

        for page_id in page_order(&document) {
            let page = document.get_dictionary(page_id).unwrap();
            let media_box = page.get(b"MediaBox").unwrap().as_array().unwrap();
            assert_eq!(media_box[2].as_float().unwrap(), 300.0);
            assert!(page.has(b"Resources"));
        }
    }

    #[test]
    fn test_old_root_is_removed() {
        let mut document = PdfFixture::flat(8).document();
        let (_, old_root) = page_tree_root(&document).unwrap();

        let report = rebuild_page_tree(&mut document, 4, &CancellationToken::new()).unwrap();

        assert_eq!(report.removed_nodes, 1);
        assert_eq!(report.node_count, 3);
        assert_eq!(report.depth, 2);
        assert!(!document.objects.contains_key(&old_root));
    }

    #[test]
    fn test_single_page_gets_a_root() {
        let mut document = PdfFixture::flat(1).document();
        let report = rebuild_page_tree(&mut document, 32, &CancellationToken::new()).unwrap();

        assert_eq!(report.node_count, 1);
        assert_eq!(inspect_tree(&document).unwrap().leaf_count, 1);
    }

    #[test]
    fn test_empty_tree_is_rejected() {
        let mut document = PdfFixture::flat(0).document();
        let err = rebuild_page_tree(&mut document, 32, &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, RepairError::InvalidStructure(_)));
    }

    #[test]
    fn test_cancelled_rebuild() {
        let mut document = PdfFixture::flat(100).document();
        let token = CancellationToken::new();
        token.cancel();

        let err = rebuild_page_tree(&mut document, 8, &token).unwrap_err();
        assert!(err.is_cancelled());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn rebuilt_tree_is_balanced(pages in 1usize..400, branching in 2usize..12) {
            let mut document = PdfFixture::flat(pages).document();
            let before = page_order(&document);

            let report = rebuild_page_tree(&mut document, branching, &CancellationToken::new()).unwrap();
            let shape = inspect_tree(&document).unwrap();

            prop_assert_eq!(report.leaf_count, pages);
            prop_assert_eq!(shape.leaf_count, pages);
            prop_assert!(shape.max_fan_out <= branching);
            prop_assert!(shape.counts_consistent);
            prop_assert!(shape.parents_consistent);
            prop_assert_eq!(page_order(&document), before);
        }
    }
}
