//! DCAT-JSON record format (`data.json` catalogs).
//!
//! Accepts either a bare array of datasets or the Project Open Data
//! envelope `{"dataset": [...]}`. Each dataset is identified by its
//! `identifier` and serialized back to compact JSON as the record content.

use serde_json::{Map, Value};

use gleaner_core::error::AppError;
use gleaner_core::models::ParsedRecord;
use gleaner_core::package::PackageDict;
use gleaner_core::traits::{RecordFormat, RecordIter};

/// Keys consumed by typed fields; everything else becomes an extra.
const MAPPED_KEYS: &[&str] = &[
    "identifier",
    "title",
    "description",
    "keyword",
    "distribution",
    "landingPage",
    "license",
    "publisher",
    "contactPoint",
    "language",
    "issued",
    "modified",
    "theme",
    "@type",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct DcatJsonFormat;

impl DcatJsonFormat {
    fn datasets(content: &str) -> Result<Vec<Value>, AppError> {
        let value: Value =
            serde_json::from_str(content).map_err(|e| AppError::ParseError(e.to_string()))?;
        match value {
            Value::Array(items) => Ok(items),
            Value::Object(mut obj) => match obj.remove("dataset") {
                Some(Value::Array(items)) => Ok(items),
                _ => Err(AppError::ParseError(
                    "expected a list of datasets or a \"dataset\" list".to_string(),
                )),
            },
            _ => Err(AppError::ParseError(
                "expected a list of datasets".to_string(),
            )),
        }
    }
}

fn identifier(dataset: &Value) -> Option<String> {
    match dataset.get("identifier")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn keywords(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(s) => s
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn resource(distribution: &Value) -> Option<Map<String, Value>> {
    let obj = distribution.as_object()?;
    let url = obj
        .get("downloadURL")
        .or_else(|| obj.get("accessURL"))
        .and_then(Value::as_str)?;

    let mut resource = Map::new();
    resource.insert("url".to_string(), Value::String(url.to_string()));
    for (from, to) in [
        ("title", "name"),
        ("description", "description"),
        ("format", "format"),
        ("mediaType", "mimetype"),
    ] {
        if let Some(value) = obj.get(from).and_then(text) {
            resource.insert(to.to_string(), Value::String(value));
        }
    }
    Some(resource)
}

impl RecordFormat for DcatJsonFormat {
    fn parse<'a>(
        &self,
        content: &'a str,
        _content_type: Option<&str>,
    ) -> Result<RecordIter<'a>, AppError> {
        let datasets = Self::datasets(content)?;
        Ok(Box::new(datasets.into_iter().map(|dataset| {
            let guid = identifier(&dataset).ok_or_else(|| {
                AppError::ParseError("dataset without an identifier".to_string())
            })?;
            Ok(ParsedRecord {
                guid,
                content: dataset.to_string(),
            })
        })))
    }

    fn to_package_dict(&self, content: &str) -> Result<PackageDict, AppError> {
        let dataset: Value = serde_json::from_str(content)?;
        let obj = dataset
            .as_object()
            .ok_or_else(|| AppError::ParseError("dataset is not an object".to_string()))?;

        let mut package = PackageDict {
            title: obj.get("title").and_then(text).unwrap_or_default(),
            notes: obj.get("description").and_then(text),
            tags: obj.get("keyword").map(keywords).unwrap_or_default(),
            resources: obj
                .get("distribution")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(resource).collect())
                .unwrap_or_default(),
            ..Default::default()
        };

        if let Some(url) = obj.get("landingPage").and_then(text) {
            package.set_field("url", Value::String(url));
        }
        if let Some(license) = obj.get("license").and_then(text) {
            package.set_field("license_id", Value::String(license));
        }

        if let Some(guid) = identifier(&dataset) {
            package.extras.set("guid", guid);
        }
        for key in ["issued", "modified"] {
            if let Some(value) = obj.get(key).and_then(text) {
                package.extras.set(format!("dcat_{}", key), value);
            }
        }
        match obj.get("publisher") {
            Some(Value::Object(publisher)) => {
                if let Some(name) = publisher.get("name").and_then(text) {
                    package.extras.set("dcat_publisher_name", name);
                }
                if let Some(mbox) = publisher.get("mbox").and_then(text) {
                    package.extras.set("dcat_publisher_email", mbox);
                }
            }
            Some(other) => {
                if let Some(name) = text(other) {
                    package.extras.set("dcat_publisher_name", name);
                }
            }
            None => {}
        }
        if let Some(Value::Object(contact)) = obj.get("contactPoint") {
            if let Some(name) = contact.get("fn").and_then(text) {
                package.extras.set("contact_name", name);
            }
            if let Some(email) = contact.get("hasEmail").and_then(text) {
                let email = email.trim_start_matches("mailto:").to_string();
                package.extras.set("contact_email", email);
            }
        }
        if let Some(language) = obj.get("language") {
            let joined = match language {
                Value::Array(items) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(","),
                other => text(other).unwrap_or_default(),
            };
            if !joined.is_empty() {
                package.extras.set("language", joined);
            }
        }

        // A theme list keeps its first entry.
        let theme = match obj.get("theme") {
            Some(Value::Array(items)) => items.iter().find_map(text),
            Some(other) => text(other),
            None => None,
        };
        if let Some(theme) = theme.filter(|t| !t.trim().is_empty()) {
            package.extras.set("theme", theme);
        }

        for (key, value) in obj {
            if MAPPED_KEYS.contains(&key.as_str()) {
                continue;
            }
            if let Some(value) = text(value) {
                package.extras.set(key.as_str(), value);
            }
        }

        Ok(package)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_array_and_envelope() {
        let array = r#"[{"identifier": "a"}, {"identifier": 7}]"#;
        let guids: Vec<String> = DcatJsonFormat
            .parse(array, None)
            .unwrap()
            .map(|r| r.unwrap().guid)
            .collect();
        assert_eq!(guids, vec!["a", "7"]);

        let envelope = r#"{"conformsTo": "x", "dataset": [{"identifier": "b"}]}"#;
        let records: Vec<ParsedRecord> = DcatJsonFormat
            .parse(envelope, None)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].guid, "b");
        assert_eq!(records[0].content, r#"{"identifier":"b"}"#);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            DcatJsonFormat.parse("{not json", None),
            Err(AppError::ParseError(_))
        ));
        assert!(matches!(
            DcatJsonFormat.parse(r#"{"datasets": []}"#, None),
            Err(AppError::ParseError(_))
        ));

        let mut records = DcatJsonFormat.parse(r#"[{"title": "no id"}]"#, None).unwrap();
        assert!(matches!(records.next(), Some(Err(AppError::ParseError(_)))));
    }

    #[test]
    fn test_to_package_dict() {
        let dataset = json!({
            "identifier": "air-1",
            "title": "Air Quality",
            "description": "<p>Hourly</p>",
            "keyword": ["air", "environment"],
            "landingPage": "https://example.org/air",
            "license": "cc-by",
            "modified": "2024-01-01",
            "publisher": {"name": "City", "mbox": "data@example.org"},
            "contactPoint": {"fn": "Data Team", "hasEmail": "mailto:team@example.org"},
            "language": ["en", "it"],
            "accrualPeriodicity": "R/P1D",
            "spatial": "Rome",
            "distribution": [
                {"downloadURL": "https://example.org/air.csv", "format": "CSV", "title": "CSV"},
                {"title": "no url"}
            ]
        });

        let package = DcatJsonFormat
            .to_package_dict(&dataset.to_string())
            .unwrap();
        assert_eq!(package.title, "Air Quality");
        assert_eq!(package.notes.as_deref(), Some("<p>Hourly</p>"));
        assert_eq!(package.tags, vec!["air", "environment"]);
        assert_eq!(package.field("url"), Some(json!("https://example.org/air")));
        assert_eq!(package.field("license_id"), Some(json!("cc-by")));
        assert_eq!(package.resources.len(), 1);
        assert_eq!(package.resources[0]["name"], json!("CSV"));

        let extras = &package.extras;
        assert_eq!(extras.get("guid"), Some("air-1"));
        assert_eq!(extras.get("dcat_modified"), Some("2024-01-01"));
        assert_eq!(extras.get("dcat_publisher_name"), Some("City"));
        assert_eq!(extras.get("contact_email"), Some("team@example.org"));
        assert_eq!(extras.get("language"), Some("en,it"));
        assert_eq!(extras.get("spatial"), Some("Rome"));
        assert_eq!(extras.get("accrualPeriodicity"), Some("R/P1D"));
        assert!(!extras.contains("title"));
    }

    #[test]
    fn test_theme_list_keeps_first_entry() {
        let package = DcatJsonFormat
            .to_package_dict(r#"{"identifier": "a", "theme": ["Environment", "Health"]}"#)
            .unwrap();
        assert_eq!(package.extras.get("theme"), Some("Environment"));

        let package = DcatJsonFormat
            .to_package_dict(r#"{"identifier": "b", "theme": "Transport"}"#)
            .unwrap();
        assert_eq!(package.extras.get("theme"), Some("Transport"));

        let package = DcatJsonFormat
            .to_package_dict(r#"{"identifier": "c", "theme": []}"#)
            .unwrap();
        assert!(!package.extras.contains("theme"));
    }

    #[test]
    fn test_keyword_string_is_split() {
        let package = DcatJsonFormat
            .to_package_dict(r#"{"identifier": "a", "keyword": "air, water ,"}"#)
            .unwrap();
        assert_eq!(package.tags, vec!["air", "water"]);
    }
}
