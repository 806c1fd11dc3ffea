//! Canonical hashing of cache identities.
//!
//! Sources and params are hashed as SHA-256 over their JSON form. Maps are
//! key-sorted, so two equal configurations always produce the same hash.

use crate::resource::{Params, Source, Version};
use sha2::{Digest, Sha256};

/// Params hash recorded for a fetch without params.
pub const NULL_PARAMS_HASH: &str = "null";

fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Hash a source configuration.
pub fn source_hash(source: &Source) -> crate::Result<String> {
    let json = serde_json::to_vec(source)?;
    Ok(sha256_hex(&json))
}

/// Hash a parameter set. Absent and empty params both hash to [`NULL_PARAMS_HASH`].
pub fn params_hash(params: Option<&Params>) -> crate::Result<String> {
    match params {
        Some(p) if !p.is_empty() => {
            let json = serde_json::to_vec(p)?;
            Ok(sha256_hex(&json))
        }
        _ => Ok(NULL_PARAMS_HASH.to_string()),
    }
}

/// Serialize a version to its stored form.
pub fn version_json(version: &Version) -> crate::Result<String> {
    Ok(serde_json::to_string(version)?)
}

/// Parse a version from its stored form.
pub fn parse_version(json: &str) -> crate::Result<Version> {
    serde_json::from_str(json).map_err(|e| crate::Error::InvalidVersion(e.to_string()))
}
