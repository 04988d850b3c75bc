//! Image reference helpers
//!
//! Two concerns live here: joining registry and image names for component
//! containers, and resolving the precompiled driver image for a node pool.

use crate::error::{Error, Result};

const LATEST: &str = "latest";
const PULL_ALWAYS: &str = "Always";

/// Join a registry and an image name with exactly one `/`
pub fn compose_image_reference(registry: &str, image: &str) -> String {
    let registry = registry.trim().trim_matches('/');
    let image = image.trim().trim_matches('/');
    if registry.is_empty() {
        return image.to_string();
    }
    format!("{}/{}", registry, image)
}

/// Image reference with its tag, plus the effective pull policy.
///
/// An empty tag becomes `latest`, and `latest` is always pulled.
pub fn tagged_image(reference: &str, tag: Option<&str>, pull_policy: &str) -> (String, String) {
    let tag = match tag.map(str::trim) {
        Some(tag) if !tag.is_empty() => tag,
        _ => LATEST,
    };
    let policy = if tag == LATEST { PULL_ALWAYS } else { pull_policy };
    (format!("{}:{}", reference, tag), policy.to_string())
}

/// Resolve `{registry}/{image}:{version}-{kernel}-{os}`.
///
/// Digest-pinned images cannot carry the per-pool tag and are rejected.
pub fn precompiled_image_path(
    registry: &str,
    image: &str,
    version: &str,
    kernel: &str,
    os: &str,
) -> Result<String> {
    if os.is_empty() || kernel.is_empty() {
        return Err(Error::Configuration(
            "osVersion and kernelVersion are required".to_string(),
        ));
    }

    let registry = registry.trim().trim_matches('/');
    let image = image.trim().trim_matches('/');
    let version = version.trim();
    if version.is_empty() {
        return Err(Error::Configuration("driver version is required".to_string()));
    }
    if image.contains("@sha256:") || version.contains("sha256:") {
        return Err(Error::Configuration(
            "specifying image digest is not supported when precompiled is enabled".to_string(),
        ));
    }

    Ok(format!("{}/{}:{}-{}-{}", registry, image, version, kernel, os))
}
