use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use toolhub_catalog::{ToolId, ToolSnapshot};
use toolhub_core::{CategoryId, ManufacturerId};

/// Search-index representation of a tool.
///
/// Every field is derived from a committed [`ToolSnapshot`]; nothing here is
/// authored independently of the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDocument {
    pub tool_id: ToolId,
    pub manufacturer_id: ManufacturerId,
    pub category_id: CategoryId,
    pub type_name: String,
    pub condition_name: String,
    pub price: Decimal,
    pub description: String,
    /// Catalog version the document was derived from.
    pub version: u64,
}

/// Map a committed snapshot to its search document. Total and pure.
pub fn project(snapshot: &ToolSnapshot) -> ToolDocument {
    ToolDocument {
        tool_id: snapshot.tool_id,
        manufacturer_id: snapshot.manufacturer_id,
        category_id: snapshot.category_id,
        type_name: snapshot.tool_type.as_str().to_string(),
        condition_name: snapshot.condition.as_str().to_string(),
        price: snapshot.price,
        description: snapshot.description.clone(),
        version: snapshot.version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolhub_catalog::{ToolCondition, ToolType};

    fn snapshot(price: Decimal, description: &str) -> ToolSnapshot {
        ToolSnapshot {
            tool_id: ToolId::new(1),
            manufacturer_id: ManufacturerId::new(7),
            category_id: CategoryId::new(3),
            tool_type: ToolType::Pneumatic,
            condition: ToolCondition::LikeNew,
            price,
            description: description.to_string(),
            version: 4,
        }
    }

    #[test]
    fn copies_scalars_and_stringifies_enums() {
        let doc = project(&snapshot(Decimal::new(300050, 2), "impact wrench"));

        assert_eq!(doc.tool_id, ToolId::new(1));
        assert_eq!(doc.manufacturer_id, ManufacturerId::new(7));
        assert_eq!(doc.category_id, CategoryId::new(3));
        assert_eq!(doc.type_name, "PNEUMATIC");
        assert_eq!(doc.condition_name, "LIKE_NEW");
        assert_eq!(doc.price, Decimal::new(300050, 2));
        assert_eq!(doc.description, "impact wrench");
        assert_eq!(doc.version, 4);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn projection_is_deterministic(cents in 0i64..10_000_000, description in ".{0,64}") {
                let snap = snapshot(Decimal::new(cents, 2), &description);
                let a = project(&snap);
                let b = project(&snap);
                prop_assert_eq!(&a, &b);
                prop_assert_eq!(a.price, snap.price);
                prop_assert_eq!(a.description, snap.description);
            }
        }
    }
}
