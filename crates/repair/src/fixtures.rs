//! Synthetic documents for tests
//!
//! Every page hangs directly off the root `/Pages` node, which carries the
//! shared `/MediaBox` and `/Resources`. All intact pages share one content
//! stream so large fixtures stay small.

use crate::RepairError;
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream, StringFormat};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct PdfFixture {
    pages: usize,
    page_size: (f32, f32),
    broken_content: BTreeSet<usize>,
    outline: bool,
}

impl PdfFixture {
    /// `pages` leaves under a single root node
    pub fn flat(pages: usize) -> Self {
        Self {
            pages,
            page_size: (612.0, 792.0),
            broken_content: BTreeSet::new(),
            outline: false,
        }
    }

    pub fn with_page_size(mut self, width_pt: f32, height_pt: f32) -> Self {
        self.page_size = (width_pt, height_pt);
        self
    }

    /// Point the page's `/Contents` at an object that does not exist
    pub fn with_broken_content(mut self, page_index: usize) -> Self {
        self.broken_content.insert(page_index);
        self
    }

    /// One top-level outline entry per page, titled `Page N`
    pub fn with_outline(mut self) -> Self {
        self.outline = true;
        self
    }

    pub fn document(&self) -> Document {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();

        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });
        let content_id = doc.add_object(Stream::new(
            Dictionary::new(),
            b"BT /F1 24 Tf 72 720 Td (quire) Tj ET".to_vec(),
        ));
        let missing_id = doc.new_object_id();

        let page_ids: Vec<ObjectId> = (0..self.pages)
            .map(|index| {
                let contents = if self.broken_content.contains(&index) {
                    missing_id
                } else {
                    content_id
                };
                doc.add_object(dictionary! {
                    "Type" => "Page",
                    "Parent" => pages_id,
                    "Contents" => contents,
                })
            })
            .collect();

        let (width, height) = self.page_size;
        let pages = dictionary! {
            "Type" => "Pages",
            "Kids" => page_ids.iter().map(|&id| Object::Reference(id)).collect::<Vec<_>>(),
            "Count" => Object::Integer(self.pages as i64),
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Real(width),
                Object::Real(height),
            ],
            "Resources" => resources_id,
        };
        doc.objects.insert(pages_id, Object::Dictionary(pages));

        let mut catalog = dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        };
        if self.outline && !page_ids.is_empty() {
            catalog.set("Outlines", add_outline(&mut doc, &page_ids));
        }
        let catalog_id = doc.add_object(catalog);
        doc.trailer.set("Root", catalog_id);
        doc
    }

    pub fn build(&self) -> Result<Vec<u8>, RepairError> {
        let mut bytes = Vec::new();
        self.document().save_to(&mut bytes)?;
        Ok(bytes)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), RepairError> {
        fs::write(path, self.build()?)?;
        Ok(())
    }
}

fn add_outline(doc: &mut Document, page_ids: &[ObjectId]) -> ObjectId {
    let outlines_id = doc.new_object_id();
    let item_ids: Vec<ObjectId> = page_ids.iter().map(|_| doc.new_object_id()).collect();

    for (index, (&item_id, &page_id)) in item_ids.iter().zip(page_ids).enumerate() {
        let mut item = dictionary! {
            "Title" => Object::String(format!("Page {}", index + 1).into_bytes(), StringFormat::Literal),
            "Parent" => outlines_id,
            "Dest" => vec![Object::Reference(page_id), Object::Name(b"Fit".to_vec())],
        };
        if let Some(&prev) = index.checked_sub(1).and_then(|prev| item_ids.get(prev)) {
            item.set("Prev", prev);
        }
        if let Some(&next) = item_ids.get(index + 1) {
            item.set("Next", next);
        }
        doc.objects.insert(item_id, Object::Dictionary(item));
    }

    let mut outlines = dictionary! {
        "Type" => "Outlines",
        "Count" => Object::Integer(item_ids.len() as i64),
    };
    if let (Some(&first), Some(&last)) = (item_ids.first(), item_ids.last()) {
        outlines.set("First", first);
        outlines.set("Last", last);
    }
    doc.objects.insert(outlines_id, Object::Dictionary(outlines));
    outlines_id
}
