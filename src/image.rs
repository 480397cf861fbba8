//! Container image reference parsing
//!
//! Decomposes an OCI image string into a `(component, version, sub_image,
//! registry)` tuple using repository-relative first-segment extraction: the
//! first path segment after the configured anchor names the component.

use crate::{Error, Result};

/// Docker Hub host aliases normalized to the canonical host
const DOCKER_HUB_HOSTS: [&str; 3] = ["docker.io", "index.docker.io", "registry-1.docker.io"];
const DOCKER_HUB_CANONICAL: &str = "docker.io";

/// A parsed container image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Component name extracted relative to the repository anchor
    pub component: String,
    /// Tag, or `latest` when the reference carries none
    pub version: String,
    /// Remainder path beneath the component segment, if any
    pub sub_image: Option<String>,
    /// Canonical registry host, absent for implicit Docker Hub
    pub registry: Option<String>,
    /// The verbatim (trimmed) input, kept for diagnostics
    pub full_image: String,
}

// OCI distribution convention: a first segment is a host iff it contains a
// dot or a port separator.
fn is_registry_host(first_segment: &str) -> bool {
    first_segment.contains('.') || first_segment.contains(':')
}

fn normalize_docker_hub(registry: Option<String>, mut path: Vec<String>) -> (Option<String>, Vec<String>) {
    let registry = registry.map(|r| {
        if DOCKER_HUB_HOSTS.contains(&r.as_str()) {
            DOCKER_HUB_CANONICAL.to_string()
        } else {
            r
        }
    });
    // single-segment Docker Hub paths imply the library/ namespace
    let is_docker_hub = match &registry {
        None => true,
        Some(r) => r == DOCKER_HUB_CANONICAL,
    };
    if is_docker_hub && path.len() == 1 {
        path.insert(0, "library".to_string());
    }
    (registry, path)
}

/// Parse a container image reference into structured components
///
/// Fails only on empty/whitespace input; an anchor that never occurs in the
/// path falls back to the last path segment rather than erroring.
pub fn parse_image_reference(image: &str, repository_anchor: &str) -> Result<ImageReference> {
    let image = image.trim();
    if image.is_empty() {
        return Err(Error::InvalidImage("image reference must not be empty".to_string()));
    }

    // Pinned digests (@sha256:...) are irrelevant to version comparison
    let working = match image.find('@') {
        Some(at) => &image[..at],
        None => image,
    };

    let mut segments: Vec<String> = working.split('/').map(String::from).collect();
    let last = segments.last().cloned().unwrap_or_default();
    let version = match last.rfind(':') {
        Some(colon) => {
            let version = last[colon + 1..].to_string();
            *segments.last_mut().expect("split produced at least one segment") = last[..colon].to_string();
            version
        }
        None => "latest".to_string(),
    };

    let mut registry = None;
    if segments.len() > 1 && is_registry_host(&segments[0]) {
        registry = Some(segments.remove(0));
    }

    let (registry, path) = normalize_docker_hub(registry, segments);

    let mut component = String::new();
    let mut sub_image = None;
    match path.iter().position(|s| s == repository_anchor) {
        Some(idx) => {
            let after = &path[idx + 1..];
            match after.first() {
                // anchor is the last segment: degenerate case, anchor doubles as component
                None => component = repository_anchor.to_string(),
                Some(first) => {
                    component = first.clone();
                    if after.len() > 1 {
                        sub_image = Some(after[1..].join("/"));
                    }
                }
            }
        }
        // anchor not present: last path segment names the component
        None => {
            if let Some(lastseg) = path.last() {
                component = lastseg.clone();
            }
        }
    }

    Ok(ImageReference {
        component,
        version,
        sub_image,
        registry,
        full_image: image.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(image: &str) -> ImageReference {
        parse_image_reference(image, "my-app").unwrap()
    }

    #[test]
    fn anchored_images() {
        let cases = [
            ("registry.example.com/my-org/my-app/backend:1.2.3", "backend", None, "1.2.3"),
            ("registry.example.com/my-org/my-app/frontend:1.2.4", "frontend", None, "1.2.4"),
            (
                "registry.example.com/my-org/my-app/portal/internal/server:v8.13.0",
                "portal",
                Some("internal/server"),
                "v8.13.0",
            ),
            (
                "registry.example.com/my-org/my-app/portal/internal/init-svc:v8.13.0",
                "portal",
                Some("internal/init-svc"),
                "v8.13.0",
            ),
            (
                "registry.example.com/my-org/my-app/plugins/plugins-hub:2.0.0",
                "plugins",
                Some("plugins-hub"),
                "2.0.0",
            ),
            ("registry.example.com/my-org/my-app/bar-baz:1.5.0", "bar-baz", None, "1.5.0"),
        ];
        for (image, component, sub_image, version) in cases {
            let r = parse(image);
            assert_eq!(r.component, component, "{image}");
            assert_eq!(r.sub_image.as_deref(), sub_image, "{image}");
            assert_eq!(r.version, version, "{image}");
            assert_eq!(r.full_image, image);
            assert_eq!(r.registry.as_deref(), Some("registry.example.com"));
        }
    }

    #[test]
    fn anchor_without_registry() {
        let r = parse("my-app/backend:1.2.3");
        assert_eq!(r.component, "backend");
        assert_eq!(r.sub_image, None);
        assert_eq!(r.version, "1.2.3");
        assert_eq!(r.registry, None);
    }

    #[test]
    fn anchor_as_last_segment_is_component() {
        let r = parse("registry.example.com/my-org/my-app:2.0.0");
        assert_eq!(r.component, "my-app");
        assert_eq!(r.version, "2.0.0");
    }

    #[test]
    fn bare_image_defaults_to_latest() {
        let r = parse("redis");
        assert_eq!(r.component, "redis");
        assert_eq!(r.version, "latest");
        assert_eq!(r.sub_image, None);
    }

    #[test]
    fn bare_image_with_tag() {
        let r = parse("redis:alpine");
        assert_eq!(r.component, "redis");
        assert_eq!(r.version, "alpine");
    }

    #[test]
    fn bare_image_with_numeric_tag() {
        let r = parse("nginx:1.21");
        assert_eq!(r.component, "nginx");
        assert_eq!(r.version, "1.21");
    }

    #[test]
    fn explicit_docker_io_registry() {
        let r = parse("docker.io/library/redis:7.0");
        assert_eq!(r.component, "redis");
        assert_eq!(r.version, "7.0");
        assert_eq!(r.registry.as_deref(), Some("docker.io"));
    }

    #[test]
    fn index_docker_io_normalized() {
        let r = parse("index.docker.io/library/nginx:latest");
        assert_eq!(r.component, "nginx");
        assert_eq!(r.registry.as_deref(), Some("docker.io"));
    }

    #[test]
    fn registry_1_docker_io_normalized() {
        let r = parse("registry-1.docker.io/library/alpine:3.18");
        assert_eq!(r.component, "alpine");
        assert_eq!(r.version, "3.18");
        assert_eq!(r.registry.as_deref(), Some("docker.io"));
    }

    #[test]
    fn gcr_io_falls_back_to_last_segment() {
        let r = parse("gcr.io/google-containers/pause:3.2");
        assert_eq!(r.component, "pause");
        assert_eq!(r.version, "3.2");
        assert_eq!(r.registry.as_deref(), Some("gcr.io"));
    }

    #[test]
    fn digest_suffix_keeps_tag() {
        let r = parse("registry.example.com/my-org/my-app/backend:1.2.3@sha256:abc123");
        assert_eq!(r.component, "backend");
        assert_eq!(r.version, "1.2.3");
        assert_eq!(r.registry.as_deref(), Some("registry.example.com"));
    }

    #[test]
    fn digest_suffix_without_tag_defaults_to_latest() {
        let r = parse("registry.example.com/my-org/my-app/backend@sha256:abc123");
        assert_eq!(r.component, "backend");
        assert_eq!(r.version, "latest");
    }

    #[test]
    fn digest_suffix_on_bare_image() {
        let r = parse("redis@sha256:deadbeef");
        assert_eq!(r.component, "redis");
        assert_eq!(r.version, "latest");
    }

    #[test]
    fn digest_stripping_equivalent_to_plain_parse() {
        let plain = parse("registry.example.com/my-org/my-app/portal/internal/server:v8.13.0");
        let pinned = parse("registry.example.com/my-org/my-app/portal/internal/server:v8.13.0@sha256:abc");
        assert_eq!(pinned.component, plain.component);
        assert_eq!(pinned.sub_image, plain.sub_image);
        assert_eq!(pinned.version, plain.version);
        assert_eq!(pinned.registry, plain.registry);
    }

    #[test]
    fn empty_input_rejected() {
        assert!(matches!(parse_image_reference("", "my-app"), Err(Error::InvalidImage(_))));
    }

    #[test]
    fn whitespace_only_rejected() {
        assert!(matches!(parse_image_reference("   ", "my-app"), Err(Error::InvalidImage(_))));
    }

    #[test]
    fn surrounding_whitespace_trimmed() {
        let r = parse("  redis:alpine  ");
        assert_eq!(r.component, "redis");
        assert_eq!(r.version, "alpine");
        assert_eq!(r.full_image, "redis:alpine");
    }

    #[test]
    fn non_matching_anchor_falls_back() {
        let r = parse("registry.example.com/some-project/other-repo/my-service:3.0.0");
        assert_eq!(r.component, "my-service");
        assert_eq!(r.version, "3.0.0");
        assert_eq!(r.sub_image, None);
    }

    #[test]
    fn custom_anchor() {
        let r = parse_image_reference("registry.example.com/project/my-repo/service:2.0.0", "my-repo").unwrap();
        assert_eq!(r.component, "service");
        assert_eq!(r.version, "2.0.0");
    }

    #[test]
    fn docker_hub_explicit_namespace() {
        let r = parse("bitnami/redis:7.0");
        assert_eq!(r.component, "redis");
        assert_eq!(r.version, "7.0");
        assert_eq!(r.registry, None);
    }

    #[test]
    fn port_based_registry_detected() {
        let r = parse_image_reference("localhost:5000/my-app:1.0.0", "other-anchor").unwrap();
        assert_eq!(r.component, "my-app");
        assert_eq!(r.version, "1.0.0");
        assert_eq!(r.registry.as_deref(), Some("localhost:5000"));
    }

    #[test]
    fn full_image_always_preserved() {
        for image in [
            "registry.example.com/my-org/my-app/backend:1.2.3",
            "redis",
            "localhost:5000/thing@sha256:abc",
        ] {
            assert_eq!(parse(image).full_image, image);
        }
    }
}
