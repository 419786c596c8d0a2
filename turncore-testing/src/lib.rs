//! Test utilities for `turncore`
//!
//! - [`chaos`]: repository wrapper that injects random failures and
//!   version conflicts from a seedable RNG.
//! - [`conflicting`]: repository wrapper that loses exactly N races.
//! - [`audit`]: checks that a command declares every entity it touches.
//! - [`fixtures`]: small game commands and entity builders.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod chaos;
pub mod conflicting;
pub mod fixtures;

pub use audit::{assert_dependencies_cover, audit_dependencies, DependencyAudit};
pub use chaos::{ChaosConfig, ChaosRepository, ChaosRepositoryExt, Probability};
pub use conflicting::ConflictingRepository;
