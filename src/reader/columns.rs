use csv_async::StringRecord;
use serde::Deserialize;
use serde_with::serde_as;
use serde_with::NoneAsEmptyString;
use tracing::warn;

use crate::kind::{ProductKind, Visibility};
use crate::record::{parse_category_paths, parse_list, AttributeSlot, NormalizedRecord};

/// Reads a boolean-like cell. A blank cell is false; only a missing column
/// leaves the field `None` for the default to apply.
pub fn flag<'de, D>(de: D) -> Result<Option<bool>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let val = String::deserialize(de)?;
    Ok(Some(is_truthy(&val)))
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "yes" | "true" | "on"
    )
}

/// A row keyed by the canonical column headers. Unknown columns are ignored.
#[serde_as]
#[derive(Debug, Default, Deserialize)]
struct ProductRow {
    #[serde(rename = "Type", default)]
    #[serde_as(as = "NoneAsEmptyString")]
    kind: Option<String>,
    #[serde(rename = "SKU", default)]
    #[serde_as(as = "NoneAsEmptyString")]
    sku: Option<String>,
    #[serde(rename = "Name", default)]
    #[serde_as(as = "NoneAsEmptyString")]
    name: Option<String>,
    #[serde(rename = "Published", default, deserialize_with = "flag")]
    published: Option<bool>,
    #[serde(rename = "Is featured?", default, deserialize_with = "flag")]
    featured: Option<bool>,
    #[serde(rename = "Visibility in catalog", default)]
    #[serde_as(as = "NoneAsEmptyString")]
    visibility: Option<String>,
    #[serde(rename = "Short description", default)]
    #[serde_as(as = "NoneAsEmptyString")]
    short_description: Option<String>,
    #[serde(rename = "Description", default)]
    #[serde_as(as = "NoneAsEmptyString")]
    description: Option<String>,
    #[serde(rename = "Regular price", default)]
    #[serde_as(as = "NoneAsEmptyString")]
    regular_price: Option<String>,
    #[serde(rename = "Sale price", default)]
    #[serde_as(as = "NoneAsEmptyString")]
    sale_price: Option<String>,
    #[serde(rename = "Categories", default)]
    #[serde_as(as = "NoneAsEmptyString")]
    categories: Option<String>,
    #[serde(rename = "Images", default)]
    #[serde_as(as = "NoneAsEmptyString")]
    images: Option<String>,
    #[serde(rename = "Attribute 1 name", default)]
    #[serde_as(as = "NoneAsEmptyString")]
    attribute_1_name: Option<String>,
    #[serde(rename = "Attribute 1 value(s)", default)]
    #[serde_as(as = "NoneAsEmptyString")]
    attribute_1_values: Option<String>,
    #[serde(rename = "Attribute 1 visible", default, deserialize_with = "flag")]
    attribute_1_visible: Option<bool>,
    #[serde(rename = "Attribute 1 global", default, deserialize_with = "flag")]
    attribute_1_global: Option<bool>,
    #[serde(rename = "Attribute 2 name", default)]
    #[serde_as(as = "NoneAsEmptyString")]
    attribute_2_name: Option<String>,
    #[serde(rename = "Attribute 2 value(s)", default)]
    #[serde_as(as = "NoneAsEmptyString")]
    attribute_2_values: Option<String>,
    #[serde(rename = "Attribute 2 visible", default, deserialize_with = "flag")]
    attribute_2_visible: Option<bool>,
    #[serde(rename = "Attribute 2 global", default, deserialize_with = "flag")]
    attribute_2_global: Option<bool>,
    #[serde(rename = "Parent", default)]
    #[serde_as(as = "NoneAsEmptyString")]
    parent: Option<String>,
}

fn attribute_slot(
    name: Option<String>,
    values: Option<String>,
    visible: Option<bool>,
    global: Option<bool>,
) -> Option<AttributeSlot> {
    let name = name?;
    Some(AttributeSlot {
        name,
        values: values.map(|v| parse_list(&v, '|')).unwrap_or_default(),
        visible: visible.unwrap_or(true),
        global: global.unwrap_or(true),
    })
}

impl ProductRow {
    fn into_record(self) -> NormalizedRecord {
        let attributes = [
            attribute_slot(
                self.attribute_1_name,
                self.attribute_1_values,
                self.attribute_1_visible,
                self.attribute_1_global,
            ),
            attribute_slot(
                self.attribute_2_name,
                self.attribute_2_values,
                self.attribute_2_visible,
                self.attribute_2_global,
            ),
        ]
        .into_iter()
        .flatten()
        .collect();

        NormalizedRecord {
            kind: self
                .kind
                .as_deref()
                .map(ProductKind::parse)
                .unwrap_or_default(),
            sku: self.sku,
            name: self.name.unwrap_or_default(),
            published: self.published.unwrap_or(true),
            featured: self.featured.unwrap_or(false),
            visibility: self
                .visibility
                .as_deref()
                .map(Visibility::parse)
                .unwrap_or_default(),
            short_description: self.short_description.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
            regular_price: self.regular_price,
            sale_price: self.sale_price,
            categories: self
                .categories
                .map(|c| parse_category_paths(&c))
                .unwrap_or_default(),
            images: self
                .images
                .map(|i| parse_list(&i, ','))
                .unwrap_or_default(),
            attributes,
            parent: self.parent,
        }
    }
}

/// Maps raw rows onto records, given the (trimmed) header row of a file.
pub struct RowMapper {
    headers: StringRecord,
}

impl RowMapper {
    pub fn new(headers: &StringRecord) -> Self {
        let headers = headers.iter().map(str::trim).collect::<Vec<_>>();
        RowMapper {
            headers: StringRecord::from(headers),
        }
    }

    /// Returns `None` for empty rows, undecodable rows and rows with neither SKU nor name.
    pub fn map(&self, row: &StringRecord) -> Option<NormalizedRecord> {
        if row.iter().all(|cell| cell.trim().is_empty()) {
            return None;
        }

        // short rows are padded so every column named in the header counts as present
        let mut cells = row.iter().map(str::trim).collect::<Vec<_>>();
        if cells.len() < self.headers.len() {
            cells.resize(self.headers.len(), "");
        }
        let trimmed = StringRecord::from(cells);
        let row: ProductRow = match trimmed.deserialize(Some(&self.headers)) {
            Ok(row) => row,
            Err(e) => {
                warn!(error = %e, "Ignoring row that failed to parse");
                return None;
            }
        };

        if row.sku.is_none() && row.name.is_none() {
            return None;
        }

        Some(row.into_record())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper(headers: &[&str]) -> RowMapper {
        RowMapper::new(&StringRecord::from(headers.to_vec()))
    }

    #[test]
    fn truthy_values() {
        for value in ["1", "yes", "TRUE", "On", " true "] {
            assert!(is_truthy(value), "{value} should be true");
        }
        for value in ["0", "no", "false", "off", "y", ""] {
            assert!(!is_truthy(value), "{value} should be false");
        }
    }

    #[test]
    fn maps_canonical_columns_and_ignores_others() {
        let mapper = mapper(&[" SKU ", "Name", "Warehouse", "Published", "Categories"]);
        let record = mapper
            .map(&StringRecord::from(vec![
                "TS-1",
                " T-Shirt ",
                "B4",
                "no",
                "Clothing > Shirts",
            ]))
            .unwrap();

        assert_eq!(record.sku.as_deref(), Some("TS-1"));
        assert_eq!(record.name, "T-Shirt");
        assert!(!record.published);
        assert_eq!(record.kind, ProductKind::Simple);
        assert_eq!(record.categories, vec![vec!["Clothing", "Shirts"]]);
    }

    #[test]
    fn missing_columns_take_defaults() {
        let mapper = mapper(&["SKU", "Attribute 1 name", "Attribute 1 value(s)"]);
        let record = mapper
            .map(&StringRecord::from(vec!["A1", "Color", "Red|Blue"]))
            .unwrap();

        assert!(record.published);
        assert!(!record.featured);
        assert_eq!(record.visibility, Visibility::Visible);
        assert_eq!(record.regular_price, None);
        assert_eq!(
            record.attributes,
            vec![AttributeSlot {
                name: "Color".into(),
                values: vec!["Red".into(), "Blue".into()],
                visible: true,
                global: true,
            }]
        );
    }

    #[test]
    fn blank_flag_cells_are_false() {
        let mapper = mapper(&[
            "SKU",
            "Name",
            "Published",
            "Attribute 1 name",
            "Attribute 1 value(s)",
            "Attribute 1 visible",
            "Attribute 1 global",
        ]);
        let record = mapper
            .map(&StringRecord::from(vec!["A", "Alpha", "", "Color", "Red", " ", ""]))
            .unwrap();
        assert!(!record.published);
        assert!(!record.attributes[0].visible);
        assert!(!record.attributes[0].global);

        // a row cut short still has the trailing columns, as blanks
        let record = mapper
            .map(&StringRecord::from(vec!["B", "Beta", "yes", "Size", "M"]))
            .unwrap();
        assert!(record.published);
        assert!(!record.attributes[0].visible);
        assert!(!record.attributes[0].global);
    }

    #[test]
    fn rows_without_sku_or_name_are_dropped() {
        let mapper = mapper(&["SKU", "Name", "Description"]);
        assert!(mapper.map(&StringRecord::from(vec!["", " ", ""])).is_none());
        assert!(mapper
            .map(&StringRecord::from(vec!["", "", "orphan description"]))
            .is_none());
        assert!(mapper.map(&StringRecord::from(vec!["", "Named", ""])).is_some());
    }
}
