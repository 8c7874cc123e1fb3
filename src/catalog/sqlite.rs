use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;

use super::{
    slugify, AttributeSet, Catalog, CategoryId, MediaId, ProductDraft, ProductId, Taxonomy,
};

/// Columns written by an upsert. Empty prices, lists and images keep the stored value.
const UPSERT_ASSIGNMENTS: &str = "
    kind = excluded.kind,
    parent_id = excluded.parent_id,
    name = excluded.name,
    status = excluded.status,
    featured = excluded.featured,
    visibility = excluded.visibility,
    short_description = excluded.short_description,
    description = excluded.description,
    regular_price = COALESCE(excluded.regular_price, products.regular_price),
    sale_price = COALESCE(excluded.sale_price, products.sale_price),
    image_id = COALESCE(excluded.image_id, products.image_id),
    gallery_ids = CASE WHEN excluded.gallery_ids = '[]' THEN products.gallery_ids ELSE excluded.gallery_ids END,
    category_ids = CASE WHEN excluded.category_ids = '[]' THEN products.category_ids ELSE excluded.category_ids END,
    attributes = CASE WHEN excluded.attributes IN ('[]', '{}') THEN products.attributes ELSE excluded.attributes END,
    updated_at = excluded.updated_at";

const INSERT_PRODUCT: &str = "
    INSERT INTO products (
        sku, kind, parent_id, variation_key, name, status, featured, visibility,
        short_description, description, regular_price, sale_price, image_id,
        gallery_ids, category_ids, attributes, created_at, updated_at
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

/// A product row as stored.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StoredProduct {
    pub id: ProductId,
    pub sku: Option<String>,
    pub kind: String,
    pub parent_id: Option<ProductId>,
    pub variation_key: Option<String>,
    pub name: String,
    pub status: String,
    pub featured: bool,
    pub visibility: String,
    pub regular_price: Option<String>,
    pub sale_price: Option<String>,
    pub image_id: Option<MediaId>,
    #[sqlx(json)]
    pub gallery_ids: Vec<MediaId>,
    #[sqlx(json)]
    pub category_ids: Vec<CategoryId>,
    #[sqlx(json)]
    pub attributes: AttributeSet,
}

#[derive(Clone)]
pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        SqliteCatalog { pool }
    }

    pub async fn product(&self, id: ProductId) -> Result<Option<StoredProduct>> {
        let product = sqlx::query_as(
            "SELECT id, sku, kind, parent_id, variation_key, name, status, featured, visibility,
                regular_price, sale_price, image_id, gallery_ids, category_ids, attributes
            FROM products WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(product)
    }

    pub async fn product_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn category_path(&self, id: CategoryId) -> Result<Vec<String>> {
        let mut path = Vec::new();
        let mut current = id;
        while current != 0 {
            let (name, parent): (String, i64) =
                sqlx::query_as("SELECT name, parent_id FROM categories WHERE id = ?")
                    .bind(current)
                    .fetch_one(&self.pool)
                    .await?;
            path.push(name);
            current = parent;
        }
        path.reverse();
        Ok(path)
    }

    pub async fn attribute_terms(&self, taxonomy: &str) -> Result<Vec<String>> {
        let slug = taxonomy.strip_prefix("pa_").unwrap_or(taxonomy);
        let terms = sqlx::query_scalar(
            "SELECT t.name FROM attribute_terms t
            JOIN attribute_taxonomies x ON x.id = t.taxonomy_id
            WHERE x.slug = ? ORDER BY t.id",
        )
        .bind(slug)
        .fetch_all(&self.pool)
        .await?;
        Ok(terms)
    }
}

#[async_trait::async_trait]
impl Catalog for SqliteCatalog {
    async fn find_by_sku(&self, sku: &str) -> Result<Option<ProductId>> {
        if sku.is_empty() {
            return Ok(None);
        }
        let id = sqlx::query_scalar("SELECT id FROM products WHERE sku = ?")
            .bind(sku)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    async fn find_variation(&self, parent_id: ProductId, key: &str) -> Result<Option<ProductId>> {
        let id = sqlx::query_scalar(
            "SELECT id FROM products WHERE parent_id = ? AND variation_key = ? AND sku IS NULL",
        )
        .bind(parent_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn upsert_product(&self, draft: &ProductDraft) -> Result<ProductId> {
        let conflict = if draft.sku.is_some() {
            "sku"
        } else {
            "parent_id, variation_key"
        };
        let sql = format!(
            "{INSERT_PRODUCT} ON CONFLICT ({conflict}) DO UPDATE SET {UPSERT_ASSIGNMENTS} RETURNING id"
        );
        let now = Utc::now().timestamp_millis();
        let variation_key = if draft.sku.is_some() {
            None
        } else {
            draft.variation_key.as_deref()
        };

        let id: ProductId = sqlx::query_scalar(&sql)
            .bind(draft.sku.as_deref())
            .bind(draft.kind.as_str())
            .bind(draft.parent_id)
            .bind(variation_key)
            .bind(&draft.name)
            .bind(draft.status.as_str())
            .bind(draft.featured)
            .bind(draft.visibility.as_str())
            .bind(&draft.short_description)
            .bind(&draft.description)
            .bind(draft.regular_price.as_deref())
            .bind(draft.sale_price.as_deref())
            .bind(draft.image_id)
            .bind(serde_json::to_string(&draft.gallery_ids)?)
            .bind(serde_json::to_string(&draft.category_ids)?)
            .bind(serde_json::to_string(&draft.attributes)?)
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn ensure_category(&self, name: &str, parent: Option<CategoryId>) -> Result<CategoryId> {
        let id = sqlx::query_scalar(
            "INSERT INTO categories (name, parent_id) VALUES (?, ?)
            ON CONFLICT (name, parent_id) DO UPDATE SET name = excluded.name
            RETURNING id",
        )
        .bind(name)
        .bind(parent.unwrap_or(0))
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn ensure_attribute_taxonomy(&self, name: &str) -> Result<Taxonomy> {
        let slug = slugify(name);
        let id = sqlx::query_scalar(
            "INSERT INTO attribute_taxonomies (name, slug) VALUES (?, ?)
            ON CONFLICT (slug) DO UPDATE SET slug = excluded.slug
            RETURNING id",
        )
        .bind(name)
        .bind(&slug)
        .fetch_one(&self.pool)
        .await?;
        Ok(Taxonomy {
            id,
            name: format!("pa_{slug}"),
        })
    }

    async fn ensure_attribute_terms(&self, taxonomy: &Taxonomy, values: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for value in values {
            sqlx::query(
                "INSERT INTO attribute_terms (taxonomy_id, name) VALUES (?, ?)
                ON CONFLICT (taxonomy_id, name) DO NOTHING",
            )
            .bind(taxonomy.id)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn ensure_media(&self, source_url: &str, local_path: Option<&Path>) -> Result<MediaId> {
        let local_path = local_path.map(|path| path.to_string_lossy().into_owned());
        let id = sqlx::query_scalar(
            "INSERT INTO media (source_url, local_path) VALUES (?, ?)
            ON CONFLICT (source_url) DO UPDATE SET local_path = COALESCE(excluded.local_path, media.local_path)
            RETURNING id",
        )
        .bind(source_url)
        .bind(local_path)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ProductAttribute;
    use crate::db::connect_in_memory;
    use crate::kind::{ProductKind, ProductStatus, Visibility};
    use std::collections::BTreeMap;

    fn draft(sku: Option<&str>) -> ProductDraft {
        ProductDraft {
            kind: ProductKind::Simple,
            sku: sku.map(str::to_string),
            parent_id: None,
            variation_key: None,
            name: "Mug".to_string(),
            status: ProductStatus::Publish,
            featured: false,
            visibility: Visibility::Visible,
            short_description: String::new(),
            description: String::new(),
            regular_price: Some("9.99".to_string()),
            sale_price: None,
            category_ids: Vec::new(),
            image_id: None,
            gallery_ids: Vec::new(),
            attributes: AttributeSet::Product(Vec::new()),
        }
    }

    #[tokio::test]
    async fn upsert_by_sku_keeps_unset_fields() {
        let catalog = SqliteCatalog::new(connect_in_memory().await.unwrap());
        let media = catalog.ensure_media("https://cdn.test/a.jpg", None).await.unwrap();

        let mut first = draft(Some("MUG-1"));
        first.image_id = Some(media);
        first.attributes = AttributeSet::Product(vec![ProductAttribute {
            id: None,
            name: "Material".to_string(),
            options: vec!["Ceramic".to_string()],
            visible: true,
            variation: false,
        }]);
        let id = catalog.upsert_product(&first).await.unwrap();

        let mut second = draft(Some("MUG-1"));
        second.name = "Big mug".to_string();
        second.regular_price = None;
        assert_eq!(catalog.upsert_product(&second).await.unwrap(), id);

        let stored = catalog.product(id).await.unwrap().unwrap();
        assert_eq!(stored.name, "Big mug");
        assert_eq!(stored.regular_price.as_deref(), Some("9.99"));
        assert_eq!(stored.image_id, Some(media));
        assert_eq!(stored.attributes, first.attributes);
        assert_eq!(catalog.product_count().await.unwrap(), 1);
        assert_eq!(catalog.find_by_sku("MUG-1").await.unwrap(), Some(id));
        assert_eq!(catalog.find_by_sku("").await.unwrap(), None);
    }

    #[tokio::test]
    async fn variations_without_sku_are_keyed_by_parent_and_attributes() {
        let catalog = SqliteCatalog::new(connect_in_memory().await.unwrap());
        let parent = catalog.upsert_product(&draft(Some("TEE"))).await.unwrap();

        let mut attributes = BTreeMap::new();
        attributes.insert("size".to_string(), "M".to_string());
        let attributes = AttributeSet::Variation(attributes);

        let mut variation = draft(None);
        variation.kind = ProductKind::Variation;
        variation.parent_id = Some(parent);
        variation.variation_key = Some(attributes.signature());
        variation.attributes = attributes.clone();

        let id = catalog.upsert_product(&variation).await.unwrap();
        assert_eq!(catalog.upsert_product(&variation).await.unwrap(), id);
        assert_eq!(
            catalog.find_variation(parent, &attributes.signature()).await.unwrap(),
            Some(id)
        );
        assert_eq!(catalog.product_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn ensure_operations_are_idempotent() {
        let catalog = SqliteCatalog::new(connect_in_memory().await.unwrap());

        let clothing = catalog.ensure_category("Clothing", None).await.unwrap();
        let shirts = catalog.ensure_category("Shirts", Some(clothing)).await.unwrap();
        assert_eq!(catalog.ensure_category("Clothing", None).await.unwrap(), clothing);
        assert_eq!(catalog.ensure_category("Shirts", Some(clothing)).await.unwrap(), shirts);
        assert_ne!(catalog.ensure_category("Shirts", None).await.unwrap(), shirts);
        assert_eq!(catalog.category_path(shirts).await.unwrap(), vec!["Clothing", "Shirts"]);

        let color = catalog.ensure_attribute_taxonomy("Color").await.unwrap();
        assert_eq!(color.name, "pa_color");
        assert_eq!(catalog.ensure_attribute_taxonomy("Color").await.unwrap(), color);
        let values = vec!["Red".to_string(), "Blue".to_string()];
        catalog.ensure_attribute_terms(&color, &values).await.unwrap();
        catalog.ensure_attribute_terms(&color, &values).await.unwrap();
        assert_eq!(catalog.attribute_terms("pa_color").await.unwrap(), values);

        let a = catalog.ensure_media("img/a.jpg", None).await.unwrap();
        assert_eq!(
            catalog.ensure_media("img/a.jpg", Some(Path::new("/tmp/a.jpg"))).await.unwrap(),
            a
        );
    }
}
