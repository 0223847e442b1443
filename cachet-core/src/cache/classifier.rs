use serde::{Deserialize, Serialize};
use std::fmt;

use super::codec::StructuralCodec;
use super::shape::{ValueShape, probe};
use crate::config::ClassifierConfig;

/// Physical representation of a cached value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingKind {
    /// One serialized value under the key
    Flat,
    /// A field map under the key
    Structured,
    /// Let the performance ledger decide at write time
    Auto,
}

impl fmt::Display for EncodingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingKind::Flat => write!(f, "FLAT"),
            EncodingKind::Structured => write!(f, "STRUCTURED"),
            EncodingKind::Auto => write!(f, "AUTO"),
        }
    }
}

impl std::str::FromStr for EncodingKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "flat" => Ok(EncodingKind::Flat),
            "structured" => Ok(EncodingKind::Structured),
            "auto" => Ok(EncodingKind::Auto),
            other => Err(format!("unknown encoding: {}", other)),
        }
    }
}

/// Decides between flat and structured storage
///
/// Decision order, first match wins:
/// 1. null values are flat
/// 2. primitives, strings, dates and enums are flat
/// 3. collections and maps are flat
/// 4. keys following an entity naming convention are structured
/// 5. structs whose field count falls inside the configured band are
///    structured, anything else (including structs that cannot be flattened)
///    is flat
#[derive(Debug, Clone)]
pub struct StorageClassifier {
    config: ClassifierConfig,
}

impl StorageClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn classify<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> EncodingKind {
        match probe(value) {
            Ok(ValueShape::Composite { .. }) => {}
            // Null, primitive, collection, or a Serialize impl that errored
            _ => return EncodingKind::Flat,
        }

        if self.is_entity_key(key) {
            return EncodingKind::Structured;
        }

        match StructuralCodec::to_field_map(value) {
            Some(map)
                if (self.config.min_fields..=self.config.max_fields).contains(&map.len()) =>
            {
                EncodingKind::Structured
            }
            _ => EncodingKind::Flat,
        }
    }

    /// A marker matches anywhere in the key, or at its start without the
    /// leading separator (`:user:` matches both `app:user:1` and `user:1`).
    pub fn is_entity_key(&self, key: &str) -> bool {
        self.config.entity_markers.iter().any(|marker| {
            if marker.is_empty() {
                return false;
            }
            let bare = marker.trim_start_matches(':');
            key.contains(marker.as_str()) || (!bare.is_empty() && key.starts_with(bare))
        })
    }
}

impl Default for StorageClassifier {
    fn default() -> Self {
        Self::new(ClassifierConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use std::collections::BTreeMap;

    #[derive(Serialize)]
    struct Order {
        id: u64,
        total: f64,
        status: String,
    }

    #[derive(Serialize)]
    struct Pair {
        a: u32,
        b: u32,
    }

    #[derive(Serialize)]
    enum Plan {
        Free,
        Pro,
    }

    #[derive(Serialize)]
    struct Wide {
        a: u8,
        b: u8,
        c: u8,
        d: u8,
        e: u8,
    }

    #[derive(Serialize)]
    struct Tagged {
        #[serde(rename = "@type")]
        kind: String,
        a: u8,
        b: u8,
    }

    fn order() -> Order {
        Order {
            id: 42,
            total: 99.5,
            status: "PAID".to_string(),
        }
    }

    #[test]
    fn test_scalars_are_flat_for_any_key() {
        let classifier = StorageClassifier::default();
        for key in ["flag:enabled", "app:user:1", "user:9", ""] {
            assert_eq!(classifier.classify(key, &true), EncodingKind::Flat);
            assert_eq!(classifier.classify(key, &17i64), EncodingKind::Flat);
            assert_eq!(classifier.classify(key, "hello"), EncodingKind::Flat);
            assert_eq!(classifier.classify(key, &Plan::Pro), EncodingKind::Flat);
            assert_eq!(classifier.classify(key, &Plan::Free), EncodingKind::Flat);
            assert_eq!(
                classifier.classify(key, &chrono::Utc::now()),
                EncodingKind::Flat
            );
            assert_eq!(
                classifier.classify(key, &Option::<Order>::None),
                EncodingKind::Flat
            );
        }
    }

    #[test]
    fn test_collections_are_flat_for_any_key() {
        let classifier = StorageClassifier::default();
        let mut map = BTreeMap::new();
        map.insert("a", 1);
        map.insert("b", 2);
        map.insert("c", 3);
        assert_eq!(classifier.classify("app:user:1", &map), EncodingKind::Flat);
        assert_eq!(
            classifier.classify("app:user:1", &vec![order(), order()]),
            EncodingKind::Flat
        );
    }

    #[test]
    fn test_struct_in_band_is_structured() {
        let classifier = StorageClassifier::default();
        assert_eq!(classifier.classify("order:42", &order()), EncodingKind::Structured);
        assert_eq!(
            classifier.classify("order:42", &Some(order())),
            EncodingKind::Structured
        );
    }

    #[test]
    fn test_struct_below_band_is_flat() {
        let classifier = StorageClassifier::default();
        assert_eq!(
            classifier.classify("pair:1", &Pair { a: 1, b: 2 }),
            EncodingKind::Flat
        );
    }

    #[test]
    fn test_struct_above_band_is_flat() {
        let classifier = StorageClassifier::new(ClassifierConfig {
            max_fields: 4,
            ..ClassifierConfig::default()
        });
        let wide = Wide {
            a: 1,
            b: 2,
            c: 3,
            d: 4,
            e: 5,
        };
        assert_eq!(classifier.classify("wide", &wide), EncodingKind::Flat);
    }

    #[test]
    fn test_entity_marker_forces_structured() {
        let classifier = StorageClassifier::default();
        let pair = Pair { a: 1, b: 2 };
        assert_eq!(classifier.classify("app:user:1", &pair), EncodingKind::Structured);
        assert_eq!(classifier.classify("user:1", &pair), EncodingKind::Structured);
        assert_eq!(classifier.classify("superuser", &pair), EncodingKind::Flat);
    }

    #[test]
    fn test_unflattenable_struct_is_flat() {
        let classifier = StorageClassifier::default();
        let tagged = Tagged {
            kind: "x".to_string(),
            a: 1,
            b: 2,
        };
        assert_eq!(classifier.classify("tagged:1", &tagged), EncodingKind::Flat);
    }

    #[test]
    fn test_encoding_kind_parse_and_display() {
        assert_eq!("flat".parse::<EncodingKind>().unwrap(), EncodingKind::Flat);
        assert_eq!(
            "STRUCTURED".parse::<EncodingKind>().unwrap(),
            EncodingKind::Structured
        );
        assert!("blob".parse::<EncodingKind>().is_err());
        assert_eq!(EncodingKind::Auto.to_string(), "AUTO");
    }
}
