//! Typed target-field dictionary exchanged with the catalog store.
//!
//! Known fields are strongly typed; anything else the catalog returns lives
//! in [`PackageDict::fields`]. Free-form metadata is kept in [`Extras`], an
//! ordered key/value list. The serde representation is the CKAN action-API
//! shape, so a `PackageDict` can be posted as-is.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Typed field names that `field`/`set_field` route to struct members.
const TYPED_FIELDS: &[&str] = &["id", "name", "title", "notes", "owner_org", "type"];

/// Collection fields that cannot be overwritten through `set_field`.
const COLLECTION_FIELDS: &[&str] = &["tags", "groups", "resources", "extras"];

/// One free-form key/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extra {
    pub key: String,
    pub value: String,
}

/// Ordered list of extras with map-like access. Keys are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Extras(Vec<Extra>);

impl Extras {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.iter().any(|e| e.key == key)
    }

    /// Replaces the value in place when the key exists, appends otherwise.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|e| e.key == key) {
            Some(extra) => extra.value = value,
            None => self.0.push(Extra { key, value }),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.0.iter().position(|e| e.key == key)?;
        Some(self.0.remove(index).value)
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.iter().map(|e| e.key.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Extra> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Extras {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut extras = Extras::new();
        for (key, value) in iter {
            extras.set(key, value);
        }
        extras
    }
}

/// Field dictionary for one target object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageDict {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_org: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub package_type: Option<String>,
    #[serde(default, with = "name_list")]
    pub tags: Vec<String>,
    #[serde(default, with = "name_list")]
    pub groups: Vec<String>,
    #[serde(default)]
    pub resources: Vec<Map<String, Value>>,
    #[serde(default)]
    pub extras: Extras,
    /// Other top-level fields (`license_id`, `url`, `private`, ...).
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl PackageDict {
    /// True when `key` names a top-level field that carries a value.
    pub fn has_field(&self, key: &str) -> bool {
        match key {
            "tags" => !self.tags.is_empty(),
            "groups" => !self.groups.is_empty(),
            "resources" => !self.resources.is_empty(),
            "extras" => !self.extras.is_empty(),
            _ => self.field(key).is_some(),
        }
    }

    /// Returns a scalar top-level field as JSON.
    pub fn field(&self, key: &str) -> Option<Value> {
        let typed = match key {
            "id" => self.id.clone(),
            "name" => self.name.clone(),
            "title" => Some(self.title.clone()).filter(|t| !t.is_empty()),
            "notes" => self.notes.clone(),
            "owner_org" => self.owner_org.clone(),
            "type" => self.package_type.clone(),
            _ => return self.fields.get(key).filter(|v| !v.is_null()).cloned(),
        };
        typed.map(Value::String)
    }

    /// Sets a scalar top-level field. Returns false for collection fields,
    /// which have dedicated members.
    pub fn set_field(&mut self, key: &str, value: Value) -> bool {
        if COLLECTION_FIELDS.contains(&key) {
            return false;
        }
        if TYPED_FIELDS.contains(&key) {
            let text = match value {
                Value::String(s) => Some(s),
                Value::Null => None,
                other => Some(other.to_string()),
            };
            match key {
                "id" => self.id = text,
                "name" => self.name = text,
                "title" => self.title = text.unwrap_or_default(),
                "notes" => self.notes = text,
                "owner_org" => self.owner_org = text,
                _ => self.package_type = text,
            }
            return true;
        }
        self.fields.insert(key.to_string(), value);
        true
    }

    /// Adds a tag unless one with the same name is present.
    pub fn add_tag(&mut self, tag: &str) {
        if !self.tags.iter().any(|t| t == tag) {
            self.tags.push(tag.to_string());
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// (De)serializes `[{"name": ..}]` lists as plain names. Bare strings are
/// accepted on input as well.
mod name_list {
    use super::*;

    #[derive(Serialize)]
    struct Named<'a> {
        name: &'a str,
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NamedIn {
        Plain(String),
        Object { name: String },
    }

    pub fn serialize<S: Serializer>(names: &[String], serializer: S) -> Result<S::Ok, S::Error> {
        let named: Vec<Named<'_>> = names.iter().map(|n| Named { name: n }).collect();
        named.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
        let items: Option<Vec<NamedIn>> = Option::deserialize(deserializer)?;
        Ok(items
            .unwrap_or_default()
            .into_iter()
            .map(|item| match item {
                NamedIn::Plain(name) | NamedIn::Object { name } => name,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extras_set_replaces_in_place() {
        let mut extras: Extras = [("a", "1"), ("b", "2")].into_iter().collect();
        extras.set("a", "3");
        assert_eq!(extras.keys(), vec!["a", "b"]);
        assert_eq!(extras.get("a"), Some("3"));
    }

    #[test]
    fn test_extras_remove() {
        let mut extras: Extras = [("a", "1")].into_iter().collect();
        assert_eq!(extras.remove("a"), Some("1".to_string()));
        assert_eq!(extras.remove("a"), None);
        assert!(extras.is_empty());
    }

    #[test]
    fn test_deserialize_ckan_shape() {
        let value = json!({
            "id": "abc",
            "name": "air-quality",
            "title": "Air Quality",
            "type": "dataset",
            "tags": [{"name": "air"}, "quality"],
            "groups": [{"name": "environment", "title": "Environment"}],
            "extras": [{"key": "frequency", "value": "daily"}],
            "resources": [{"url": "https://example.org/a.csv", "url_type": "upload"}],
            "license_id": "cc-by",
            "private": false
        });

        let dict: PackageDict = serde_json::from_value(value).unwrap();
        assert_eq!(dict.package_type.as_deref(), Some("dataset"));
        assert_eq!(dict.tags, vec!["air", "quality"]);
        assert_eq!(dict.groups, vec!["environment"]);
        assert_eq!(dict.extras.get("frequency"), Some("daily"));
        assert_eq!(dict.fields.get("license_id"), Some(&json!("cc-by")));
        assert_eq!(dict.fields.get("private"), Some(&json!(false)));
        assert_eq!(dict.resources.len(), 1);
    }

    #[test]
    fn test_serialize_ckan_shape() {
        let mut dict = PackageDict {
            title: "Air Quality".to_string(),
            tags: vec!["air".to_string()],
            ..Default::default()
        };
        dict.extras.set("theme", "environment");
        dict.set_field("license_id", json!("cc-by"));

        let value = dict.to_value().unwrap();
        assert_eq!(value["tags"], json!([{"name": "air"}]));
        assert_eq!(value["extras"], json!([{"key": "theme", "value": "environment"}]));
        assert_eq!(value["license_id"], json!("cc-by"));
        assert!(value.get("id").is_none());
    }

    #[test]
    fn test_field_routing() {
        let mut dict = PackageDict::default();
        assert!(dict.set_field("notes", json!("Some notes")));
        assert!(dict.set_field("frequency", json!("daily")));
        assert!(!dict.set_field("tags", json!(["x"])));

        assert_eq!(dict.notes.as_deref(), Some("Some notes"));
        assert_eq!(dict.field("frequency"), Some(json!("daily")));
        assert!(dict.has_field("notes"));
        assert!(!dict.has_field("title"));
        assert!(!dict.has_field("tags"));
    }

    #[test]
    fn test_add_tag_dedups() {
        let mut dict = PackageDict::default();
        dict.add_tag("a");
        dict.add_tag("a");
        dict.add_tag("b");
        assert_eq!(dict.tags, vec!["a", "b"]);
    }
}
