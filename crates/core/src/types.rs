/// Backend-assigned job identifier (opaque, e.g. `"3f9a1c2e"`).
pub type JobId = String;

/// Backend-assigned batch identifier.
pub type BatchId = String;

/// Backend-assigned diff identifier.
pub type DiffId = String;
