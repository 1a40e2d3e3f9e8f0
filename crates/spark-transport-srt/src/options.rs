//! 传递给传输引擎的键值选项包。

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// 有序的字符串选项集合（如 `payloadsize = "32"`）。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 选项的语义完全由引擎定义，本层只负责累积并原样转交，
///   因此不做任何数值或名称校验；
/// - 保留插入顺序，便于引擎按调用方书写顺序应用存在依赖关系的选项。
///
/// ## 契约（What）
/// - 重复设置同一键时就地替换值，位置保持首次插入处；
/// - [`Options::merged`] 以参数为准覆盖同名键，其余键保持原值；
/// - 序列化为映射（TOML 表 / JSON 对象）。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Options {
    entries: Vec<(String, String)>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// 由键值对序列构造选项包。
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut options = Self::new();
        for (key, value) in pairs {
            options.insert(key, value);
        }
        options
    }

    /// Builder 风格的 [`Options::insert`]。
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 以 `overrides` 覆盖当前选项，返回新的选项包。
    pub fn merged(&self, overrides: &Options) -> Options {
        let mut merged = self.clone();
        for (key, value) in overrides.iter() {
            merged.insert(key, value);
        }
        merged
    }
}

impl<K, V> FromIterator<(K, V)> for Options
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Options::from_pairs(iter)
    }
}

impl Serialize for Options {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Options {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OptionsVisitor;

        impl<'de> Visitor<'de> for OptionsVisitor {
            type Value = Options;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of string options")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Options, A::Error> {
                let mut options = Options::new();
                while let Some((key, value)) = access.next_entry::<String, String>()? {
                    options.insert(key, value);
                }
                Ok(options)
            }
        }

        deserializer.deserialize_map(OptionsVisitor)
    }
}
