//! Document outline (bookmarks) extraction

use lopdf::{Dictionary, Document, Object, ObjectId};
use std::collections::{HashMap, HashSet};

const MAX_DEPTH: usize = 32;
const MAX_ITEMS: usize = 10_000;

/// One outline entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutlineItem {
    pub title: String,
    /// Target page, if the destination resolves to one
    pub page_index: Option<u32>,
    pub children: Vec<OutlineItem>,
}

/// Walk `/Outlines` from the catalog; broken links end the walk instead of failing it
pub(crate) fn extract_outline(document: &Document, pages: &[ObjectId]) -> Vec<OutlineItem> {
    let page_index: HashMap<ObjectId, u32> = pages
        .iter()
        .enumerate()
        .map(|(index, &id)| (id, index as u32))
        .collect();

    let first = catalog(document)
        .and_then(|catalog| dict_at(document, catalog.get(b"Outlines").ok()?))
        .and_then(|outlines| outlines.get(b"First").ok()?.as_reference().ok());

    let mut walker = Walker {
        document,
        page_index,
        visited: HashSet::new(),
    };
    first.map_or_else(Vec::new, |first| walker.siblings(first, 0))
}

struct Walker<'a> {
    document: &'a Document,
    page_index: HashMap<ObjectId, u32>,
    visited: HashSet<ObjectId>,
}

impl Walker<'_> {
    fn siblings(&mut self, first: ObjectId, depth: usize) -> Vec<OutlineItem> {
        let mut items = Vec::new();
        if depth >= MAX_DEPTH {
            return items;
        }

        let mut cursor = Some(first);
        while let Some(id) = cursor {
            if self.visited.len() >= MAX_ITEMS || !self.visited.insert(id) {
                break;
            }
            let Ok(dict) = self.document.get_dictionary(id) else {
                break;
            };

            let children = match dict.get(b"First").and_then(Object::as_reference) {
                Ok(child) => self.siblings(child, depth + 1),
                Err(_) => Vec::new(),
            };

            items.push(OutlineItem {
                title: dict
                    .get(b"Title")
                    .ok()
                    .and_then(|title| title.as_str().ok())
                    .map(decode_text)
                    .unwrap_or_default(),
                page_index: self.destination(dict),
                children,
            });

            cursor = dict.get(b"Next").and_then(Object::as_reference).ok();
        }

        items
    }

    fn destination(&self, item: &Dictionary) -> Option<u32> {
        let dest = match item.get(b"Dest") {
            Ok(dest) => dest,
            Err(_) => {
                let action = dict_at(self.document, item.get(b"A").ok()?)?;
                if action.get(b"S").ok()?.as_name().ok()? != b"GoTo" {
                    return None;
                }
                action.get(b"D").ok()?
            }
        };

        let dest = match dest {
            Object::Reference(id) => self.document.get_object(*id).ok()?,
            other => other,
        };
        let page = dest.as_array().ok()?.first()?.as_reference().ok()?;
        self.page_index.get(&page).copied()
    }
}

fn catalog(document: &Document) -> Option<&Dictionary> {
    let root = document.trailer.get(b"Root").ok()?.as_reference().ok()?;
    document.get_dictionary(root).ok()
}

fn dict_at<'a>(document: &'a Document, object: &'a Object) -> Option<&'a Dictionary> {
    match object {
        Object::Reference(id) => document.get_dictionary(*id).ok(),
        Object::Dictionary(dict) => Some(dict),
        _ => None,
    }
}

/// PDF text strings are UTF-16BE with a BOM or a Latin-1 superset
fn decode_text(bytes: &[u8]) -> String {
    match bytes {
        [0xfe, 0xff, rest @ ..] => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        [0xef, 0xbb, 0xbf, rest @ ..] => String::from_utf8_lossy(rest).into_owned(),
        _ => bytes.iter().map(|&b| b as char).collect(),
    }
}
