use serde::{Deserialize, Serialize};

use crate::kind::{ProductKind, Visibility};

/// One attribute slot of a record, e.g. `Color = Red | Blue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSlot {
    pub name: String,
    pub values: Vec<String>,
    pub visible: bool,
    pub global: bool,
}

/// One canonicalized input row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    #[serde(rename = "type")]
    pub kind: ProductKind,
    pub sku: Option<String>,
    pub name: String,
    pub published: bool,
    pub featured: bool,
    pub visibility: Visibility,
    pub short_description: String,
    pub description: String,
    pub regular_price: Option<String>,
    pub sale_price: Option<String>,
    /// Each path is the list of category names from root to leaf.
    pub categories: Vec<Vec<String>>,
    pub images: Vec<String>,
    pub attributes: Vec<AttributeSlot>,
    pub parent: Option<String>,
}

impl NormalizedRecord {
    pub fn new(kind: ProductKind, sku: Option<&str>, name: &str) -> Self {
        NormalizedRecord {
            kind,
            sku: sku.map(str::to_string),
            name: name.to_string(),
            published: true,
            featured: false,
            visibility: Visibility::Visible,
            short_description: String::new(),
            description: String::new(),
            regular_price: None,
            sale_price: None,
            categories: Vec::new(),
            images: Vec::new(),
            attributes: Vec::new(),
            parent: None,
        }
    }

    pub fn sku_label(&self) -> &str {
        self.sku.as_deref().unwrap_or("")
    }
}

/// Orders records simple → variable → variation, keeping file order within each kind.
pub fn sort_for_import(records: &mut [NormalizedRecord]) {
    records.sort_by_key(|record| record.kind.import_rank());
}

/// Splits `A > B, C` into `[[A, B], [C]]`, dropping empty segments.
pub fn parse_category_paths(value: &str) -> Vec<Vec<String>> {
    value
        .split(',')
        .map(|path| {
            path.split('>')
                .map(str::trim)
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|path| !path.is_empty())
        .collect()
}

pub fn parse_list(value: &str, separator: char) -> Vec<String> {
    value
        .split(separator)
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
