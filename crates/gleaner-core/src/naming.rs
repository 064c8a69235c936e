//! Target-name synthesis.
//!
//! Catalog names are URL slugs: lowercase ASCII letters, digits, `-` and
//! `_`, between 2 and 100 characters.

use crate::error::AppError;
use crate::models::CatalogContext;
use crate::traits::CatalogStore;

pub const MIN_NAME_LENGTH: usize = 2;
pub const MAX_NAME_LENGTH: usize = 100;

/// Suffix attempts before giving up on a unique name.
const MAX_SUFFIX: u32 = 100;

/// Turns a free-text title into a URL-safe slug.
///
/// # Examples
///
/// ```
/// use gleaner_core::naming::munge_title_to_name;
///
/// assert_eq!(munge_title_to_name("Air Quality (2024)"), "air-quality-2024");
/// assert_eq!(munge_title_to_name("  --Hello__World--  "), "hello__world");
/// ```
pub fn munge_title_to_name(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_dash = false;

    for c in title.trim().chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() || c == '_' {
            slug.push(c);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }

    let slug = slug.trim_matches('-');
    slug.chars().take(MAX_NAME_LENGTH).collect::<String>().trim_end_matches('-').to_string()
}

/// Derives a name from `title` that the catalog does not know yet, appending
/// `1`, `2`, ... to the slug while the candidate is taken.
pub async fn unique_name<C>(catalog: &C, ctx: &CatalogContext, title: &str) -> Result<String, AppError>
where
    C: CatalogStore + ?Sized,
{
    let base = munge_title_to_name(title);
    if base.len() < MIN_NAME_LENGTH {
        return Err(AppError::NameGeneration(format!(
            "title '{}' yields no usable name",
            title
        )));
    }

    if !catalog.name_exists(ctx, &base).await? {
        return Ok(base);
    }

    for suffix in 1..=MAX_SUFFIX {
        let suffix = suffix.to_string();
        let keep = MAX_NAME_LENGTH.saturating_sub(suffix.len()).min(base.len());
        let candidate = format!("{}{}", &base[..keep], suffix);
        if !catalog.name_exists(ctx, &candidate).await? {
            tracing::debug!(name = %candidate, "Generated unique name");
            return Ok(candidate);
        }
    }

    Err(AppError::NameGeneration(format!(
        "every candidate for '{}' is taken",
        base
    )))
}
