//! Gleaner Client - I/O implementations of the core collaborator traits.
//!
//! - [`fetcher`] - HTTP and local-file [`ContentSource`](gleaner_core::ContentSource)
//!   with size guard and session hooks
//! - [`ckan`] - CKAN action API [`CatalogStore`](gleaner_core::CatalogStore)
//! - [`formats`] - DCAT-JSON [`RecordFormat`](gleaner_core::RecordFormat)

pub mod ckan;
pub mod fetcher;
pub mod formats;

pub use ckan::CkanCatalog;
pub use fetcher::{guess_format, paged_url, ContentFetcher, HeaderHook, SessionHook};
pub use formats::DcatJsonFormat;
