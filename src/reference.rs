//! Image reference parsing and source/destination rewriting
//!
//! Input lines accept several shapes: a full `registry/ns/img:tag`, the
//! same with an `http(s)://` scheme (the scheme only feeds the insecure
//! flag), a registry-less `ns/img:tag` completed from configuration, and
//! an arrow rename `src -> dst`.

use crate::error::{Result, TransmitError};

/// A parsed `registry/repository:tag` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoUrl {
    registry: String,
    repository: String,
    tag: String,
}

impl RepoUrl {
    /// Parse a scheme-less reference. The first segment must look like a
    /// registry host (contains a dot or port, or is `localhost`).
    pub fn parse(url: &str) -> Result<RepoUrl> {
        let url = strip_scheme(url.trim());
        let (path, tag) = match url.rsplit_once(':') {
            // a colon inside the last path segment is a tag; a colon
            // before a slash belongs to a registry port
            Some((path, tag)) if !tag.contains('/') => (path, tag.to_string()),
            _ => (url, String::from("latest")),
        };

        let mut segments = path.split('/');
        let registry = segments.next().unwrap_or_default();
        if !looks_like_registry(registry) {
            return Err(TransmitError::InvalidUrl(format!(
                "no registry host in reference: {}",
                url
            )));
        }
        let repository = segments.collect::<Vec<_>>().join("/");
        if repository.is_empty() || tag.is_empty() {
            return Err(TransmitError::InvalidUrl(format!(
                "incomplete reference: {}",
                url
            )));
        }

        Ok(RepoUrl {
            registry: registry.to_string(),
            repository,
            tag,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository including its namespace, without the tag.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn url(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

fn looks_like_registry(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

/// True when a repository string wrongly embeds a `:tag`.
pub fn includes_tag(repository: &str) -> bool {
    match repository.rsplit_once(':') {
        Some((_, rest)) => !rest.contains('/'),
        None => false,
    }
}

pub fn strip_scheme(url: &str) -> &str {
    url.trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches('/')
}

/// An `http://` line or a global skip-verify forces the insecure transport.
pub fn insecure_target(endpoint: &str, skip_tls_verify: bool) -> bool {
    !endpoint.starts_with("https") || skip_tls_verify
}

/// Rewrite one image-list line into `(source, destination)` references.
///
/// `src_reg` is empty in upload mode, where the original reference is kept
/// verbatim. `dst_repo` is the configured destination repository prefix:
/// it replaces the first path segment on plain lines, and on renamed lines
/// it is overridden whenever the right side supplies more than one path
/// segment. A renamed right side whose first segment contains a dot names
/// an explicit destination registry.
pub fn gen_repo_url(src_reg: &str, dst_reg: &str, dst_repo: &str, raw_url: &str) -> (String, String) {
    let (raw_src, raw_dst, rename) = match raw_url.split_once("->") {
        Some((l, r)) => (l, r, true),
        None => (raw_url, raw_url, false),
    };

    // upload mode keeps the original reference untouched
    let mut src = if src_reg.is_empty() {
        raw_src.trim().to_string()
    } else {
        String::new()
    };

    let raw_src = strip_scheme(raw_src.trim());
    let raw_dst = strip_scheme(raw_dst.trim());

    let mut seg_src: Vec<&str> = raw_src.split('/').collect();
    if seg_src.first().is_some_and(|s| s.contains('.')) {
        seg_src.remove(0);
    }

    let mut seg_dst: Vec<&str> = raw_dst.split('/').collect();
    let mut dst_reg = dst_reg;
    if seg_dst.first().is_some_and(|s| s.contains('.')) {
        if rename {
            // explicit destination registry on the right side
            dst_reg = seg_dst[0];
        }
        seg_dst.remove(0);
    }

    if src.is_empty() {
        src = format!("{}/{}", src_reg, seg_src.join("/"));
    }

    let mut dst_repo = dst_repo;
    if !dst_repo.is_empty() {
        if rename {
            if seg_dst.len() > 1 {
                dst_repo = "";
            }
        } else {
            seg_dst.remove(0);
        }
    }

    let dst = if dst_repo.is_empty() {
        format!("{}/{}", dst_reg, seg_dst.join("/"))
    } else {
        format!("{}/{}/{}", dst_reg, dst_repo, seg_dst.join("/"))
    };

    (src, dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_reference() {
        let u = RepoUrl::parse("hub.x.io/ns/img:1").unwrap();
        assert_eq!(u.registry(), "hub.x.io");
        assert_eq!(u.repository(), "ns/img");
        assert_eq!(u.tag(), "1");
        assert_eq!(u.url(), "hub.x.io/ns/img:1");
    }

    #[test]
    fn test_parse_defaults_to_latest() {
        let u = RepoUrl::parse("hub.x.io/ns/img").unwrap();
        assert_eq!(u.tag(), "latest");
    }

    #[test]
    fn test_parse_registry_port() {
        let u = RepoUrl::parse("localhost:5000/img:2").unwrap();
        assert_eq!(u.registry(), "localhost:5000");
        assert_eq!(u.repository(), "img");
        assert_eq!(u.tag(), "2");
    }

    #[test]
    fn test_parse_strips_scheme() {
        let u = RepoUrl::parse("https://hub.x.io/ns/img:1").unwrap();
        assert_eq!(u.registry(), "hub.x.io");
    }

    #[test]
    fn test_parse_rejects_missing_registry() {
        assert!(RepoUrl::parse("ns/img:1").is_err());
    }

    #[test]
    fn test_includes_tag() {
        assert!(includes_tag("ns/img:1"));
        assert!(!includes_tag("ns/img"));
        assert!(!includes_tag("localhost:5000/img"));
    }

    #[test]
    fn test_insecure_target() {
        assert!(insecure_target("http://reg.io", false));
        assert!(!insecure_target("https://reg.io", false));
        assert!(insecure_target("https://reg.io", true));
    }

    #[test]
    fn test_rewrite_plain() {
        let (src, dst) = gen_repo_url("hub.x.io", "hub.y.io", "", "hub.x.io/ns/img:1");
        assert_eq!(src, "hub.x.io/ns/img:1");
        assert_eq!(dst, "hub.y.io/ns/img:1");
    }

    #[test]
    fn test_rewrite_with_repo_prefix() {
        let (src, dst) = gen_repo_url("hub.x.io", "hub.y.io", "p", "hub.x.io/ns/img:1");
        assert_eq!(src, "hub.x.io/ns/img:1");
        assert_eq!(dst, "hub.y.io/p/img:1");
    }

    #[test]
    fn test_rewrite_rename() {
        let (src, dst) = gen_repo_url("hub.x.io", "hub.y.io", "", "hub.x.io/ns/img:1 -> newns/newimg:2");
        assert_eq!(src, "hub.x.io/ns/img:1");
        assert_eq!(dst, "hub.y.io/newns/newimg:2");
    }

    #[test]
    fn test_rewrite_rename_overrides_prefix() {
        let (_, dst) = gen_repo_url("hub.x.io", "hub.y.io", "p", "hub.x.io/ns/img:1 -> newns/newimg:2");
        assert_eq!(dst, "hub.y.io/newns/newimg:2");

        // a single-segment rename keeps the configured prefix
        let (_, dst) = gen_repo_url("hub.x.io", "hub.y.io", "p", "hub.x.io/ns/img:1 -> newimg:2");
        assert_eq!(dst, "hub.y.io/p/newimg:2");
    }

    #[test]
    fn test_rewrite_registry_less_line() {
        let (src, dst) = gen_repo_url("hub.x.io", "hub.y.io", "", "ns/img:1");
        assert_eq!(src, "hub.x.io/ns/img:1");
        assert_eq!(dst, "hub.y.io/ns/img:1");
    }

    #[test]
    fn test_rewrite_explicit_destination_registry() {
        let (_, dst) = gen_repo_url("hub.x.io", "hub.y.io", "", "hub.x.io/ns/img:1 -> hub.z.io/other/img:1");
        assert_eq!(dst, "hub.z.io/other/img:1");
    }

    #[test]
    fn test_rewrite_upload_mode_keeps_source() {
        let (src, _) = gen_repo_url("", "hub.y.io", "", "https://hub.x.io/ns/img:1");
        assert_eq!(src, "https://hub.x.io/ns/img:1");
    }
}
