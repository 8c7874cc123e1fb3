use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProductKind {
    #[default]
    Simple,
    Variable,
    Variation,
}

impl ProductKind {
    /// Lenient parse of the `Type` column. Unknown types import as simple products.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "variable" => ProductKind::Variable,
            "variation" => ProductKind::Variation,
            _ => ProductKind::Simple,
        }
    }

    /// Position in the import order: parents must exist before their variations.
    pub fn import_rank(&self) -> u8 {
        match self {
            ProductKind::Simple => 0,
            ProductKind::Variable => 1,
            ProductKind::Variation => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProductKind::Simple => "simple",
            ProductKind::Variable => "variable",
            ProductKind::Variation => "variation",
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Visible,
    Catalog,
    Search,
    Hidden,
}

impl Visibility {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "catalog" => Visibility::Catalog,
            "search" => Visibility::Search,
            "hidden" => Visibility::Hidden,
            _ => Visibility::Visible,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Visible => "visible",
            Visibility::Catalog => "catalog",
            Visibility::Search => "search",
            Visibility::Hidden => "hidden",
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "lowercase")]
pub enum ProductStatus {
    Publish,
    Draft,
    Private,
}

impl ProductStatus {
    pub fn for_product(kind: ProductKind, published: bool) -> Self {
        match (published, kind) {
            (true, _) => ProductStatus::Publish,
            (false, ProductKind::Variation) => ProductStatus::Private,
            (false, _) => ProductStatus::Draft,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProductStatus::Publish => "publish",
            ProductStatus::Draft => "draft",
            ProductStatus::Private => "private",
        }
    }
}
