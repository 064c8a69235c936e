use async_trait::async_trait;
use gleaner_core::error::{AppError, FieldErrors};
use gleaner_core::models::{CatalogContext, Group};
use gleaner_core::package::PackageDict;
use gleaner_core::traits::CatalogStore;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

/// Generic wrapper for CKAN action API responses.
///
/// CKAN API reference: <https://docs.ckan.org/en/2.9/api/>
///
/// ```json
/// { "success": true, "result": ... }
/// { "success": false, "error": { "__type": "Validation Error", "name": ["..."] } }
/// ```
#[derive(Deserialize, Debug)]
struct CkanResponse<T> {
    success: bool,
    result: Option<T>,
    #[serde(default)]
    error: Option<Value>,
}

/// Group as returned by `group_list` with `all_fields`.
#[derive(Deserialize, Debug)]
struct CkanGroup {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

impl From<CkanGroup> for Group {
    fn from(group: CkanGroup) -> Self {
        Group {
            display_name: group
                .display_name
                .or(group.title)
                .unwrap_or_else(|| group.name.clone()),
            name: group.name,
        }
    }
}

/// Turns a CKAN validation error object into field errors.
///
/// # Examples
///
/// ```
/// use gleaner_client::ckan::field_errors;
/// use serde_json::json;
///
/// let errors = field_errors(&json!({
///     "__type": "Validation Error",
///     "name": ["That URL is already in use."]
/// }));
/// assert_eq!(errors.to_string(), "name: That URL is already in use.");
/// ```
pub fn field_errors(error: &Value) -> FieldErrors {
    let mut errors = FieldErrors::new();
    if let Some(obj) = error.as_object() {
        for (field, messages) in obj.iter().filter(|(k, _)| k.as_str() != "__type") {
            match messages {
                Value::Array(items) => {
                    for item in items {
                        match item {
                            Value::String(s) => errors.add(field.as_str(), s.as_str()),
                            other => errors.add(field.as_str(), other.to_string()),
                        }
                    }
                }
                Value::String(s) => errors.add(field.as_str(), s.as_str()),
                other => errors.add(field.as_str(), other.to_string()),
            }
        }
    }
    errors
}

/// [`CatalogStore`] over the CKAN action API.
///
/// Writes are authorized with the API token; the identity returned by
/// [`CatalogStore::site_context`] is the token's owner.
///
/// # Examples
///
/// ```no_run
/// use gleaner_client::CkanCatalog;
/// use gleaner_core::CatalogStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let catalog = CkanCatalog::new("https://catalog.example.org", Some("token".to_string()))?;
/// let ctx = catalog.site_context().await?;
/// let groups = catalog.groups_available(&ctx).await?;
/// println!("{} groups", groups.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CkanCatalog {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    user: String,
}

impl CkanCatalog {
    /// Creates a client for the catalog at `base_url_str`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidUrl` if the URL is malformed.
    pub fn new(base_url_str: &str, api_key: Option<String>) -> Result<Self, AppError> {
        let base_url = Url::parse(base_url_str)
            .map_err(|_| AppError::InvalidUrl(format!("Invalid CKAN URL: {}", base_url_str)))?;

        let client = Client::builder()
            .user_agent("Gleaner/0.1 (catalog-harvester)")
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::CatalogError(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            api_key,
            user: "harvest".to_string(),
        })
    }

    /// Name recorded as the acting user in the catalog context.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    fn action_url(&self, action: &str) -> Result<Url, AppError> {
        self.base_url
            .join(&format!("api/3/action/{}", action))
            .map_err(|e| AppError::InvalidUrl(e.to_string()))
    }

    async fn call<T: DeserializeOwned>(&self, action: &str, body: &Value) -> Result<T, AppError> {
        self.call_optional(action, body)
            .await?
            .ok_or_else(|| AppError::CatalogError(format!("{} returned no result", action)))
    }

    /// POSTs `body` to an action and unwraps the CKAN envelope.
    ///
    /// 404 maps to `TargetNotFound`, 409 to `ValidationError`.
    async fn call_optional<T: DeserializeOwned>(
        &self,
        action: &str,
        body: &Value,
    ) -> Result<Option<T>, AppError> {
        let url = self.action_url(action)?;
        let mut request = self.client.post(url).json(body);
        if let Some(key) = &self.api_key {
            request = request.header(AUTHORIZATION, key);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| AppError::CatalogError(format!("{} failed: {}", action, e)))?;
        let status = resp.status();

        let envelope: Option<CkanResponse<T>> = resp.json().await.ok();

        match status {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => {
                let id = body.get("id").and_then(Value::as_str).unwrap_or(action);
                return Err(AppError::TargetNotFound(id.to_string()));
            }
            StatusCode::CONFLICT => {
                let error = envelope.and_then(|e| e.error).unwrap_or(Value::Null);
                return Err(AppError::ValidationError(field_errors(&error)));
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(AppError::IdentityUnavailable(format!(
                    "{} denied: HTTP {}",
                    action,
                    status.as_u16()
                )));
            }
            _ => {
                return Err(AppError::CatalogError(format!(
                    "{} returned HTTP {}",
                    action,
                    status.as_u16()
                )));
            }
        }

        let envelope = envelope.ok_or_else(|| {
            AppError::CatalogError(format!("{} returned an unreadable body", action))
        })?;
        if !envelope.success {
            return Err(AppError::CatalogError(format!(
                "{} returned success: false ({})",
                action,
                envelope.error.unwrap_or(Value::Null)
            )));
        }
        Ok(envelope.result)
    }

    fn package_id(package: &Value, action: &str) -> Result<String, AppError> {
        package
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AppError::CatalogError(format!("{} returned no id", action)))
    }
}

#[async_trait]
impl CatalogStore for CkanCatalog {
    async fn create_target(
        &self,
        _ctx: &CatalogContext,
        fields: &PackageDict,
    ) -> Result<String, AppError> {
        let created: Value = self.call("package_create", &fields.to_value()?).await?;
        Self::package_id(&created, "package_create")
    }

    async fn update_target(
        &self,
        _ctx: &CatalogContext,
        id: &str,
        fields: &PackageDict,
    ) -> Result<String, AppError> {
        let mut body = fields.to_value()?;
        if let Some(obj) = body.as_object_mut() {
            obj.insert("id".to_string(), Value::String(id.to_string()));
        }
        let updated: Value = self.call("package_update", &body).await?;
        Self::package_id(&updated, "package_update")
    }

    async fn delete_target(&self, _ctx: &CatalogContext, id: &str) -> Result<(), AppError> {
        self.call_optional::<Value>("package_delete", &json!({ "id": id }))
            .await?;
        Ok(())
    }

    async fn get_target(
        &self,
        _ctx: &CatalogContext,
        id: &str,
    ) -> Result<Option<PackageDict>, AppError> {
        match self.call::<PackageDict>("package_show", &json!({ "id": id })).await {
            Ok(package) => Ok(Some(package)),
            Err(AppError::TargetNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn groups_available(&self, _ctx: &CatalogContext) -> Result<Vec<Group>, AppError> {
        let groups: Vec<CkanGroup> = self
            .call("group_list", &json!({ "all_fields": true }))
            .await?;
        Ok(groups.into_iter().map(Group::from).collect())
    }

    async fn group_exists(&self, _ctx: &CatalogContext, name: &str) -> Result<bool, AppError> {
        match self.call::<Value>("group_show", &json!({ "id": name })).await {
            Ok(_) => Ok(true),
            Err(AppError::TargetNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn name_exists(&self, ctx: &CatalogContext, name: &str) -> Result<bool, AppError> {
        Ok(self.get_target(ctx, name).await?.is_some())
    }

    async fn site_context(&self) -> Result<CatalogContext, AppError> {
        if self.api_key.is_none() {
            return Err(AppError::IdentityUnavailable(
                "no API token configured".to_string(),
            ));
        }
        Ok(CatalogContext {
            user: self.user.clone(),
            ignore_auth: true,
        })
    }
}
