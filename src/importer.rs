use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::catalog::{
    slugify, AttributeSet, Catalog, CategoryId, MediaId, ProductAttribute, ProductDraft, ProductId,
};
use crate::error::ImportError;
use crate::kind::{ProductKind, ProductStatus, Visibility};
use crate::parent_map::ParentMap;
use crate::progress::Outcome;
use crate::record::NormalizedRecord;

/// Attribute slots read per record.
const ATTRIBUTE_SLOTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Imported {
    pub created: bool,
    pub product_id: ProductId,
}

impl Imported {
    pub fn outcome(&self) -> Outcome {
        if self.created {
            Outcome::Created
        } else {
            Outcome::Updated
        }
    }
}

/// Per-job state the importer needs besides the record.
pub struct ImportContext<'a> {
    pub parents: &'a ParentMap,
    pub images_dir: Option<&'a Path>,
}

/// Maps one record onto catalog writes.
#[derive(Clone)]
pub struct Importer {
    catalog: Arc<dyn Catalog>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl Importer {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Importer { catalog }
    }

    pub async fn import_one(
        &self,
        record: &NormalizedRecord,
        ctx: &ImportContext<'_>,
    ) -> Result<Imported, ImportError> {
        let sku = non_empty(record.sku.as_deref());
        if sku.is_none() && record.kind != ProductKind::Variation {
            return Err(ImportError::MissingSku);
        }
        let existing = match sku {
            Some(sku) => self.catalog.find_by_sku(sku).await?,
            None => None,
        };

        let product_id = match record.kind {
            ProductKind::Variation => return self.import_variation(record, sku, existing, ctx).await,
            ProductKind::Variable => {
                let id = self.upsert_product(record, ctx).await?;
                if let Some(sku) = sku {
                    ctx.parents.insert(sku, id).await;
                }
                id
            }
            ProductKind::Simple => self.upsert_product(record, ctx).await?,
        };

        Ok(Imported {
            created: existing.is_none(),
            product_id,
        })
    }

    async fn upsert_product(
        &self,
        record: &NormalizedRecord,
        ctx: &ImportContext<'_>,
    ) -> Result<ProductId, ImportError> {
        let category_ids = self.ensure_categories(&record.categories).await?;
        let mut media = self.ensure_images(&record.images, ctx.images_dir).await?.into_iter();
        let image_id = media.next();
        let attributes = self.product_attributes(record).await?;

        let draft = ProductDraft {
            kind: record.kind,
            sku: non_empty(record.sku.as_deref()).map(str::to_string),
            parent_id: None,
            variation_key: None,
            name: record.name.clone(),
            status: ProductStatus::for_product(record.kind, record.published),
            featured: record.featured,
            visibility: record.visibility,
            short_description: record.short_description.clone(),
            description: record.description.clone(),
            regular_price: non_empty(record.regular_price.as_deref()).map(str::to_string),
            sale_price: non_empty(record.sale_price.as_deref()).map(str::to_string),
            category_ids,
            image_id,
            gallery_ids: media.collect(),
            attributes: AttributeSet::Product(attributes),
        };
        Ok(self.catalog.upsert_product(&draft).await?)
    }

    async fn import_variation(
        &self,
        record: &NormalizedRecord,
        sku: Option<&str>,
        existing: Option<ProductId>,
        ctx: &ImportContext<'_>,
    ) -> Result<Imported, ImportError> {
        let parent = non_empty(record.parent.as_deref()).ok_or(ImportError::MissingParent)?;
        let parent_id = match ctx.parents.get(parent).await {
            Some(id) => id,
            None => self
                .catalog
                .find_by_sku(parent)
                .await?
                .ok_or_else(|| ImportError::ParentNotFound(parent.to_string()))?,
        };

        let attributes = AttributeSet::Variation(variation_attributes(record));
        let variation_key = attributes.signature();
        let existing = match (sku, existing) {
            (Some(_), existing) => existing,
            (None, _) => self.catalog.find_variation(parent_id, &variation_key).await?,
        };

        // variations take a primary image only
        let image_id = self
            .ensure_images(&record.images, ctx.images_dir)
            .await?
            .into_iter()
            .next();

        let draft = ProductDraft {
            kind: ProductKind::Variation,
            sku: sku.map(str::to_string),
            parent_id: Some(parent_id),
            variation_key: Some(variation_key),
            name: record.name.clone(),
            status: ProductStatus::for_product(ProductKind::Variation, record.published),
            featured: false,
            visibility: Visibility::Visible,
            short_description: String::new(),
            description: record.description.clone(),
            regular_price: non_empty(record.regular_price.as_deref()).map(str::to_string),
            sale_price: non_empty(record.sale_price.as_deref()).map(str::to_string),
            category_ids: Vec::new(),
            image_id,
            gallery_ids: Vec::new(),
            attributes,
        };
        let product_id = self.catalog.upsert_product(&draft).await?;

        Ok(Imported {
            created: existing.is_none(),
            product_id,
        })
    }

    /// Ensures every segment of each path under the previous one and returns the leaves.
    async fn ensure_categories(&self, paths: &[Vec<String>]) -> Result<Vec<CategoryId>, ImportError> {
        let mut leaves = Vec::with_capacity(paths.len());
        for path in paths {
            let mut parent = None;
            for segment in path {
                parent = Some(self.catalog.ensure_category(segment, parent).await?);
            }
            if let Some(leaf) = parent {
                if !leaves.contains(&leaf) {
                    leaves.push(leaf);
                }
            }
        }
        Ok(leaves)
    }

    async fn ensure_images(
        &self,
        images: &[String],
        images_dir: Option<&Path>,
    ) -> Result<Vec<MediaId>, ImportError> {
        let mut ids = Vec::with_capacity(images.len());
        for reference in images {
            let Some((source, local)) = resolve_image(reference, images_dir).await else {
                debug!(image = %reference, "Image not found, skipping");
                continue;
            };
            let id = self.catalog.ensure_media(&source, local.as_deref()).await?;
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    async fn product_attributes(
        &self,
        record: &NormalizedRecord,
    ) -> Result<Vec<ProductAttribute>, ImportError> {
        let mut attributes = Vec::new();
        for slot in record.attributes.iter().take(ATTRIBUTE_SLOTS) {
            if slot.name.trim().is_empty() {
                continue;
            }
            let (id, name) = if slot.global {
                let taxonomy = self.catalog.ensure_attribute_taxonomy(&slot.name).await?;
                self.catalog
                    .ensure_attribute_terms(&taxonomy, &slot.values)
                    .await?;
                (Some(taxonomy.id), taxonomy.name)
            } else {
                (None, slot.name.clone())
            };
            attributes.push(ProductAttribute {
                id,
                name,
                options: slot.values.clone(),
                visible: slot.visible,
                variation: record.kind == ProductKind::Variable,
            });
        }
        Ok(attributes)
    }
}

fn variation_attributes(record: &NormalizedRecord) -> BTreeMap<String, String> {
    record
        .attributes
        .iter()
        .take(ATTRIBUTE_SLOTS)
        .filter(|slot| !slot.values.is_empty())
        .map(|slot| (slugify(&slot.name), slot.values.join("|")))
        .filter(|(slug, _)| !slug.is_empty())
        .collect()
}

/// Remote URLs are used as-is. Anything else is looked up under the job's
/// images directory and skipped when missing.
async fn resolve_image(reference: &str, images_dir: Option<&Path>) -> Option<(String, Option<PathBuf>)> {
    let reference = reference.trim();
    if reference.is_empty() {
        return None;
    }
    if reference.starts_with("http://") || reference.starts_with("https://") {
        return Some((reference.to_string(), None));
    }

    let path = images_dir?.join(reference.trim_start_matches('/'));
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => Some((path.to_string_lossy().into_owned(), Some(path))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SqliteCatalog;
    use crate::db::connect_in_memory;
    use crate::record::AttributeSlot;

    async fn setup() -> (Arc<SqliteCatalog>, Importer, ParentMap) {
        let catalog = Arc::new(SqliteCatalog::new(connect_in_memory().await.unwrap()));
        let importer = Importer::new(catalog.clone());
        (catalog, importer, ParentMap::default())
    }

    fn slot(name: &str, values: &[&str], global: bool) -> AttributeSlot {
        AttributeSlot {
            name: name.to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
            visible: true,
            global,
        }
    }

    #[tokio::test]
    async fn simple_product_needs_sku() {
        let (_, importer, parents) = setup().await;
        let ctx = ImportContext {
            parents: &parents,
            images_dir: None,
        };
        let record = NormalizedRecord::new(ProductKind::Simple, None, "No sku");
        let err = importer.import_one(&record, &ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "SKU is required");
    }

    #[tokio::test]
    async fn second_import_updates() {
        let (catalog, importer, parents) = setup().await;
        let ctx = ImportContext {
            parents: &parents,
            images_dir: None,
        };
        let mut record = NormalizedRecord::new(ProductKind::Simple, Some("MUG"), "Mug");
        record.published = false;
        record.categories = vec![vec!["Kitchen".to_string(), "Mugs".to_string()]];
        record.images = vec![
            "https://cdn.test/1.jpg".to_string(),
            "https://cdn.test/2.jpg".to_string(),
        ];

        let first = importer.import_one(&record, &ctx).await.unwrap();
        let second = importer.import_one(&record, &ctx).await.unwrap();
        assert_eq!(first.outcome(), Outcome::Created);
        assert_eq!(second.outcome(), Outcome::Updated);
        assert_eq!(first.product_id, second.product_id);

        let stored = catalog.product(first.product_id).await.unwrap().unwrap();
        assert_eq!(stored.status, "draft");
        assert_eq!(stored.gallery_ids.len(), 1);
        assert!(stored.image_id.is_some());
        assert_eq!(
            catalog.category_path(stored.category_ids[0]).await.unwrap(),
            vec!["Kitchen", "Mugs"]
        );
    }

    #[tokio::test]
    async fn variation_resolves_parent_from_map_or_catalog() {
        let (catalog, importer, parents) = setup().await;
        let ctx = ImportContext {
            parents: &parents,
            images_dir: None,
        };

        let mut parent = NormalizedRecord::new(ProductKind::Variable, Some("TEE"), "Tee");
        parent.attributes = vec![slot("Size", &["S", "M"], true)];
        let parent_id = importer.import_one(&parent, &ctx).await.unwrap().product_id;
        assert_eq!(parents.get("TEE").await, Some(parent_id));

        let mut variation = NormalizedRecord::new(ProductKind::Variation, None, "Tee M");
        variation.parent = Some("TEE".to_string());
        variation.published = false;
        variation.attributes = vec![slot("Size", &["M"], true)];

        let first = importer.import_one(&variation, &ctx).await.unwrap();
        assert!(first.created);

        // a fresh job resolves the parent through the catalog
        let fresh = ParentMap::default();
        let ctx = ImportContext {
            parents: &fresh,
            images_dir: None,
        };
        let second = importer.import_one(&variation, &ctx).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.product_id, first.product_id);

        let stored = catalog.product(first.product_id).await.unwrap().unwrap();
        assert_eq!(stored.status, "private");
        assert_eq!(stored.parent_id, Some(parent_id));
        let mut expected = BTreeMap::new();
        expected.insert("size".to_string(), "M".to_string());
        assert_eq!(stored.attributes, AttributeSet::Variation(expected));

        let stored_parent = catalog.product(parent_id).await.unwrap().unwrap();
        let AttributeSet::Product(attributes) = stored_parent.attributes else {
            panic!("expected product attributes");
        };
        assert_eq!(attributes[0].name, "pa_size");
        assert!(attributes[0].variation);
        assert_eq!(catalog.attribute_terms("pa_size").await.unwrap(), vec!["S", "M"]);
    }

    #[tokio::test]
    async fn variation_errors() {
        let (_, importer, parents) = setup().await;
        let ctx = ImportContext {
            parents: &parents,
            images_dir: None,
        };
        let mut variation = NormalizedRecord::new(ProductKind::Variation, Some("V1"), "v");
        let err = importer.import_one(&variation, &ctx).await.unwrap_err();
        assert!(matches!(err, ImportError::MissingParent));

        variation.parent = Some("GHOST".to_string());
        let err = importer.import_one(&variation, &ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "Parent product not found: GHOST");
    }

    #[tokio::test]
    async fn local_images_resolve_against_images_dir() {
        let (catalog, importer, parents) = setup().await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("front.jpg"), b"jpg").unwrap();
        let ctx = ImportContext {
            parents: &parents,
            images_dir: Some(dir.path()),
        };

        let mut record = NormalizedRecord::new(ProductKind::Simple, Some("CUP"), "Cup");
        record.images = vec!["missing.jpg".to_string(), "front.jpg".to_string()];
        let imported = importer.import_one(&record, &ctx).await.unwrap();

        let stored = catalog.product(imported.product_id).await.unwrap().unwrap();
        assert!(stored.image_id.is_some());
        assert!(stored.gallery_ids.is_empty());
    }
}
