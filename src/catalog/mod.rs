use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::kind::{ProductKind, ProductStatus, Visibility};

mod sqlite;

pub use sqlite::{SqliteCatalog, StoredProduct};

pub type ProductId = i64;
pub type CategoryId = i64;
pub type MediaId = i64;

/// An attribute as attached to a simple or variable product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductAttribute {
    /// Taxonomy id for global attributes.
    pub id: Option<i64>,
    /// `pa_{slug}` for global attributes, the display name otherwise.
    pub name: String,
    pub options: Vec<String>,
    pub visible: bool,
    pub variation: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeSet {
    Product(Vec<ProductAttribute>),
    /// `slug(name) -> value` pairs of a variation.
    Variation(BTreeMap<String, String>),
}

impl AttributeSet {
    pub fn is_empty(&self) -> bool {
        match self {
            AttributeSet::Product(list) => list.is_empty(),
            AttributeSet::Variation(map) => map.is_empty(),
        }
    }

    /// Stable identity of a variation's attribute combination.
    pub fn signature(&self) -> String {
        match self {
            AttributeSet::Product(list) => list
                .iter()
                .map(|attribute| format!("{}={}", attribute.name, attribute.options.join("|")))
                .collect::<Vec<_>>()
                .join("&"),
            AttributeSet::Variation(map) => map
                .iter()
                .map(|(slug, value)| format!("{slug}={value}"))
                .collect::<Vec<_>>()
                .join("&"),
        }
    }
}

/// Everything written for one product by an upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductDraft {
    pub kind: ProductKind,
    pub sku: Option<String>,
    pub parent_id: Option<ProductId>,
    /// Identity of a variation without its own SKU.
    pub variation_key: Option<String>,
    pub name: String,
    pub status: ProductStatus,
    pub featured: bool,
    pub visibility: Visibility,
    pub short_description: String,
    pub description: String,
    pub regular_price: Option<String>,
    pub sale_price: Option<String>,
    pub category_ids: Vec<CategoryId>,
    pub image_id: Option<MediaId>,
    pub gallery_ids: Vec<MediaId>,
    pub attributes: AttributeSet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Taxonomy {
    pub id: i64,
    /// `pa_{slug}`
    pub name: String,
}

/// The catalog write API. Every operation is an idempotent upsert.
#[async_trait::async_trait]
pub trait Catalog: Send + Sync {
    async fn find_by_sku(&self, sku: &str) -> Result<Option<ProductId>>;

    async fn find_variation(&self, parent_id: ProductId, key: &str) -> Result<Option<ProductId>>;

    /// Inserts the product or updates the one with the same SKU (or the same
    /// parent and variation key). Empty prices, lists and images keep what is stored.
    async fn upsert_product(&self, draft: &ProductDraft) -> Result<ProductId>;

    async fn ensure_category(&self, name: &str, parent: Option<CategoryId>) -> Result<CategoryId>;

    async fn ensure_attribute_taxonomy(&self, name: &str) -> Result<Taxonomy>;

    async fn ensure_attribute_terms(&self, taxonomy: &Taxonomy, values: &[String]) -> Result<()>;

    /// Media attachment keyed by its source URL.
    async fn ensure_media(&self, source_url: &str, local_path: Option<&Path>) -> Result<MediaId>;
}

/// Lowercase, with runs of anything but letters and digits turned into `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}
