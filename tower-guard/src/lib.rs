//! # Tower Guard
//!
//! `tower-guard` puts a [`shot_guard::Engine`] in front of any
//! [Tower](https://github.com/tower-rs/tower) service.
//!
//! Every request is classified into an [`shot_guard::EntryRequest`] and
//! admitted or rejected by the engine's rules. Admitted requests report their
//! latency and outcome back to the engine when the inner future resolves, so
//! circuit breakers see real failures. Rejected requests fail fast with a
//! [`RejectError`].
//!
//! ```rust
//! use tower::ServiceBuilder;
//! use tower::service_fn;
//! use tower_guard::ServiceBuilderExt;
//!
//! # fn build(engine: shot_guard::Engine) {
//! let svc = ServiceBuilder::new()
//!     .guard(engine, "orders")
//!     .service(service_fn(|_: ()| async { Ok::<_, tower::BoxError>("done") }));
//! # let _ = svc;
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`RejectError`], converting rejections
//!   to HTTP status codes (429, 503, 403).

mod classify;
mod error;
mod layer;
mod service;
mod utils;


pub use classify::Classify;
pub use classify::FixedResource;
pub use error::RejectError;
pub use layer::GuardLayer;
pub use service::GuardService;
pub use utils::ServiceBuilderExt;
pub use utils::make_guarded_svc;
