pub mod auth;
pub mod botservice;
pub mod credentials;
pub mod error;
pub mod graph;
pub mod manifest;
pub mod provision;
pub mod report;
pub mod validate;

/// Region used for the scoping resource group when none is supplied.
pub const DEFAULT_REGION: &str = "westus";

/// Client secrets are minted with this validity unless overridden.
pub const DEFAULT_SECRET_VALIDITY_YEARS: u32 = 2;
