//! Header names used across the mesh

/// Combined identity of the calling service
pub const X_SERVICE_ID: &str = "X-Service-Id";

/// Instance id of the calling service
pub const X_INSTANCE_ID: &str = "X-Instance-Id";

/// Name of the star a request originated on
pub const X_STAR_NAME: &str = "X-Star-Name";

/// Name of the star a request is destined for
pub const X_STAR_TARGET: &str = "X-Star-Target";

/// Caller credentials forwarded with relayed requests
pub const X_USER_TOKEN: &str = "X-User-Token";
