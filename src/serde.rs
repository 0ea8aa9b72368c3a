use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;

use serde::de::{Deserialize, MapAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde::Deserializer;

use super::ReferenceMap;

/// Builds a [`ReferenceMap`] with the default configuration from a serialized map.
pub struct ReferenceMapVisitor<K, V, H: BuildHasher> {
    #[allow(clippy::type_complexity)]
    marker: PhantomData<fn() -> ReferenceMap<K, V, H>>,
}

impl<K, V, H: BuildHasher> ReferenceMapVisitor<K, V, H> {
    fn new() -> Self {
        ReferenceMapVisitor {
            marker: PhantomData,
        }
    }
}

impl<'de, K, V, H> Visitor<'de> for ReferenceMapVisitor<K, V, H>
where
    K: 'static + Deserialize<'de> + Eq + Hash,
    V: 'static + Deserialize<'de>,
    H: BuildHasher + Default,
{
    type Value = ReferenceMap<K, V, H>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a ReferenceMap")
    }

    fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
    where
        M: MapAccess<'de>,
    {
        let map = ReferenceMap::default();
        while let Some((key, value)) = access.next_entry()? {
            drop(map.put_internal(key, value, true));
        }
        Ok(map)
    }
}

impl<'de, K, V, H> Deserialize<'de> for ReferenceMap<K, V, H>
where
    K: 'static + Deserialize<'de> + Eq + Hash,
    V: 'static + Deserialize<'de>,
    H: BuildHasher + Default,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(ReferenceMapVisitor::<K, V, H>::new())
    }
}

impl<K, V, H> Serialize for ReferenceMap<K, V, H>
where
    K: Serialize,
    V: Serialize,
    H: BuildHasher,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        for entry in self.iter() {
            if let Some(result) = entry.read(|v| map.serialize_entry(entry.key(), v)) {
                result?;
            }
        }
        map.end()
    }
}

#[cfg(test)]
mod serde_test {
    use crate::{Config, ReferenceKind, ReferenceMap};

    use serde_test::{assert_de_tokens, assert_ser_tokens, assert_tokens, Token};

    #[test]
    fn serde_reference_map() {
        let map: ReferenceMap<u64, i16> = ReferenceMap::new();
        assert!(map.put(2, -6).is_none());
        assert_ser_tokens(
            &map,
            &[
                Token::Map { len: None },
                Token::U64(2),
                Token::I16(-6),
                Token::MapEnd,
            ],
        );
    }

    #[test]
    fn deserialize_reference_map() {
        let map: ReferenceMap<u64, i16> = ReferenceMap::new();
        assert!(map.put(3, 9).is_none());
        assert_de_tokens(
            &map,
            &[
                Token::Map { len: Some(1) },
                Token::U64(3),
                Token::I16(9),
                Token::MapEnd,
            ],
        );
    }

    #[test]
    fn serde_reference_kind() {
        assert_tokens(
            &ReferenceKind::Weak,
            &[Token::UnitVariant {
                name: "ReferenceKind",
                variant: "Weak",
            }],
        );
    }

    #[test]
    fn deserialize_partial_config() {
        let config = Config::default().concurrency_level(4);
        assert_de_tokens(
            &config,
            &[
                Token::Struct {
                    name: "Config",
                    len: 1,
                },
                Token::Str("concurrency_level"),
                Token::U64(4),
                Token::StructEnd,
            ],
        );
    }
}
