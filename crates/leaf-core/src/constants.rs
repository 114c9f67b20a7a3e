//! Constants used throughout the leaf core crate.

/// Environment variable naming the YAML configuration file.
pub const CONFIG_PATH_ENV: &str = "LEAF_CONFIG";

/// Default address for the REST server.
pub const DEFAULT_REST_ADDR: &str = "0.0.0.0:3000";

/// Largest single-responder cohort for which patient-level views are served when the
/// configuration does not say otherwise.
pub const DEFAULT_CACHE_LIMIT: u64 = 200_000;

/// Bounds for responder coordinates.
pub const MAX_LATITUDE: f64 = 90.0;
pub const MAX_LONGITUDE: f64 = 180.0;
