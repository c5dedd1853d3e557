//! Click records and the classification that decides their counter bucket.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator between a variant prefix and the real entity id (`products_ABC`).
pub const ID_PREFIX_SEPARATOR: char = '_';

/// Which counter bucket a click belongs to.
///
/// Ordering follows payload layout: product clicks first, shop clicks last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClickClassification {
    Product,
    ProductUnderShop,
    Shop,
}

impl ClickClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClickClassification::Product => "product",
            ClickClassification::ProductUnderShop => "product_under_shop",
            ClickClassification::Shop => "shop",
        }
    }
}

impl fmt::Display for ClickClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClickClassification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "product" => Ok(ClickClassification::Product),
            "product_under_shop" | "shop_product" => Ok(ClickClassification::ProductUnderShop),
            "shop" => Ok(ClickClassification::Shop),
            other => Err(format!(
                "Unsupported click classification: {}. Supported: product, product_under_shop, shop",
                other
            )),
        }
    }
}

/// Reduce a raw identifier to its buffer key.
///
/// Variant-prefixed ids (`products_ABC`, `featured_ABC`) collapse onto the
/// trailing segment. Returns `None` for blank input.
pub fn normalize_entity_id(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    match trimmed.rsplit_once(ID_PREFIX_SEPARATOR) {
        Some((_, tail)) if !tail.is_empty() => Some(tail),
        _ => Some(trimmed),
    }
}

/// Accumulated clicks for one normalized entity since the last flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClickRecord {
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shop_id: Option<String>,
    pub count: u64,
    pub classification: ClickClassification,
}

impl ClickRecord {
    pub fn new(
        entity_id: impl Into<String>,
        shop_id: Option<String>,
        classification: ClickClassification,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            shop_id: shop_id.filter(|s| !s.is_empty()),
            count: 1,
            classification,
        }
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }

    /// Fold another record for the same key into this one.
    ///
    /// Counts add up. The classification already held wins; a shop id is only
    /// adopted when this record has none.
    pub fn absorb(&mut self, other: ClickRecord) {
        self.count = self.count.saturating_add(other.count);
        if self.shop_id.is_none() {
            self.shop_id = other.shop_id.filter(|s| !s.is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_prefix() {
        assert_eq!(normalize_entity_id("products_ABC"), Some("ABC"));
        assert_eq!(normalize_entity_id("ABC"), Some("ABC"));
        assert_eq!(normalize_entity_id("featured_shop_XYZ"), Some("XYZ"));
        assert_eq!(normalize_entity_id("  ABC  "), Some("ABC"));
    }

    #[test]
    fn test_normalize_rejects_blank() {
        assert_eq!(normalize_entity_id(""), None);
        assert_eq!(normalize_entity_id("   "), None);
    }

    #[test]
    fn test_normalize_keeps_trailing_separator_ids() {
        assert_eq!(normalize_entity_id("ABC_"), Some("ABC_"));
    }

    #[test]
    fn test_classification_from_str() {
        assert_eq!(
            "product".parse::<ClickClassification>().unwrap(),
            ClickClassification::Product
        );
        assert_eq!(
            "PRODUCT_UNDER_SHOP".parse::<ClickClassification>().unwrap(),
            ClickClassification::ProductUnderShop
        );
        assert_eq!(
            "shop".parse::<ClickClassification>().unwrap(),
            ClickClassification::Shop
        );
        assert!("impression".parse::<ClickClassification>().is_err());
    }

    #[test]
    fn test_absorb_keeps_classification_and_first_shop() {
        let mut record = ClickRecord::new("A", None, ClickClassification::ProductUnderShop);
        record.absorb(
            ClickRecord::new("A", Some("s1".to_string()), ClickClassification::Product)
                .with_count(2),
        );
        assert_eq!(record.count, 3);
        assert_eq!(record.classification, ClickClassification::ProductUnderShop);
        assert_eq!(record.shop_id.as_deref(), Some("s1"));

        record.absorb(ClickRecord::new(
            "A",
            Some("s2".to_string()),
            ClickClassification::ProductUnderShop,
        ));
        assert_eq!(record.shop_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_empty_shop_id_is_treated_as_missing() {
        let record = ClickRecord::new("A", Some(String::new()), ClickClassification::Product);
        assert!(record.shop_id.is_none());
    }
}
