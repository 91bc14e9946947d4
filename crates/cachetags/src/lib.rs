//! Tag-based cache invalidation.
//!
//! Pages rendered from shared data register under that data's tags; when the
//! data changes, an invalidation request names the tags and every page
//! registered under them is revalidated.
//!
//! ```no_run
//! use cachetags::prelude::*;
//!
//! # async fn run() -> cachetags::Result<()> {
//! let tags = CacheTags::new(MemoryRegistry::new());
//! tags.register("/posts/1", &["post:1".to_string(), "posts".to_string()]).await?;
//!
//! let handler = tags.invalidator(InvalidatorConfig::<Vec<String>, MyResponse>::new(
//!     |request: &Vec<String>| Ok::<_, anyhow::Error>(request.clone()),
//!     revalidate_with(|path: String| async move {
//!         println!("revalidate {path}");
//!         Ok::<_, anyhow::Error>(())
//!     }),
//! ));
//!
//! let mut response = MyResponse::default();
//! handler.handle(&vec!["post:1".to_string()], &mut response).await;
//! # Ok(())
//! # }
//! # #[derive(Default)]
//! # struct MyResponse;
//! # impl InvalidationResponse for MyResponse {
//! #     fn send_ok(&mut self) {}
//! #     fn send_error(&mut self, _status: u16, _body: ErrorBody) {}
//! # }
//! ```

pub mod cache_tags;
pub mod invalidator;
pub mod logging;

pub use cache_tags::CacheTags;
pub use invalidator::{
    revalidate_with, DefaultHooks, ErrorBody, InvalidationHandler, InvalidationHooks,
    InvalidationOutcome, InvalidationResponse, InvalidatorConfig, Revalidator, TagResolver,
};

pub use cachetags_core::{
    config, default_hash, error, hash, CacheTagsConfig, CacheTagsError, InspectableRegistry,
    Registry, Result, TagHasher,
};
pub use cachetags_storage as storage;
pub use cachetags_storage::{AnyRegistry, FileRegistry, MemoryRegistry, RemoteRegistry};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache_tags::CacheTags;
    pub use crate::invalidator::{
        revalidate_with, DefaultHooks, ErrorBody, InvalidationHooks, InvalidationResponse,
        InvalidatorConfig, Revalidator, TagResolver,
    };
    pub use cachetags_core::prelude::*;
    pub use cachetags_storage::prelude::*;
}
