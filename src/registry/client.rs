//! Registry client: manifest and blob operations against the v2 API
//!
//! [`ImageSource`] and [`ImageDestination`] wrap one repository each and
//! carry their own resolved credential. The insecure flag both disables
//! certificate verification and allows the plain-http fallback for
//! registries that never grew TLS.

use crate::error::{Result, TransmitError};
use crate::registry::auth::{self, Credential};
use crate::registry::manifest::{self, BlobInfo, Manifest};
use crate::reference;
use reqwest::blocking::{Body, Client, RequestBuilder};
use reqwest::header::{CONTENT_TYPE, LOCATION};
use serde::Deserialize;
use std::io::Read;
use std::time::Duration;

struct RegistryHttp {
    client: Client,
    endpoint: String,
    repository: String,
    credential: Credential,
}

impl RegistryHttp {
    fn new(
        registry: &str,
        repository: &str,
        username: &str,
        password: &str,
        insecure: bool,
        scope_actions: &str,
    ) -> Result<RegistryHttp> {
        if reference::includes_tag(repository) {
            return Err(TransmitError::InvalidUrl(format!(
                "repository string should not include tag: {}",
                repository
            )));
        }

        let mut builder = Client::builder()
            .timeout(None::<Duration>)
            .connect_timeout(Duration::from_secs(30));
        if insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build()?;

        let endpoint = Self::probe_endpoint(&client, registry, insecure);
        let credential = auth::resolve_credential(
            &client,
            &endpoint,
            repository,
            username,
            password,
            scope_actions,
        )?;

        Ok(RegistryHttp {
            client,
            endpoint,
            repository: repository.to_string(),
            credential,
        })
    }

    /// An `https://` registry stays https. Insecure registries are probed
    /// once: when https does not answer at all, fall back to plain http.
    fn probe_endpoint(client: &Client, registry: &str, insecure: bool) -> String {
        let registry = reference::strip_scheme(registry);
        let https = format!("https://{}", registry);
        if !insecure {
            return https;
        }
        match client.get(format!("{}/v2/", https)).send() {
            Ok(_) => https,
            Err(_) => format!("http://{}", registry),
        }
    }

    fn apply_credential(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credential {
            Credential::None => request,
            Credential::Basic { username, password } => request.basic_auth(username, Some(password)),
            Credential::Bearer(token) => request.bearer_auth(token),
        }
    }

    fn url(&self, tail: &str) -> String {
        format!("{}/v2/{}/{}", self.endpoint, self.repository, tail)
    }
}

/// A remote image we pull from.
pub struct ImageSource {
    http: RegistryHttp,
    registry: String,
    tag: String,
}

impl ImageSource {
    /// `repository` must not embed a tag; an empty `tag` means `latest`.
    pub fn new(
        registry: &str,
        repository: &str,
        tag: &str,
        username: &str,
        password: &str,
        insecure: bool,
    ) -> Result<ImageSource> {
        let http = RegistryHttp::new(registry, repository, username, password, insecure, "pull")?;
        Ok(ImageSource {
            http,
            registry: reference::strip_scheme(registry).to_string(),
            tag: if tag.is_empty() { "latest".to_string() } else { tag.to_string() },
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.http.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn url(&self) -> String {
        format!("{}/{}:{}", self.registry, self.http.repository, self.tag)
    }

    /// Fetch the manifest bytes and their media type.
    pub fn get_manifest(&self) -> Result<(Vec<u8>, String)> {
        self.manifest_by_reference(&self.tag)
    }

    /// Fetch a sub-manifest of a fat manifest by digest.
    pub fn get_manifest_by_digest(&self, digest: &str) -> Result<(Vec<u8>, String)> {
        self.manifest_by_reference(digest)
    }

    fn manifest_by_reference(&self, reference: &str) -> Result<(Vec<u8>, String)> {
        let request = self
            .http
            .client
            .get(self.http.url(&format!("manifests/{}", reference)))
            .header(reqwest::header::ACCEPT, manifest::MANIFEST_ACCEPT);
        let response = self.http.apply_credential(request).send()?;
        if !response.status().is_success() {
            return Err(TransmitError::Registry(format!(
                "get manifest {} status: {}",
                reference,
                response.status()
            )));
        }
        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(manifest::MEDIA_TYPE_DOCKER_MANIFEST)
            .to_string();
        let bytes = response.bytes()?.to_vec();
        Ok((bytes, media_type))
    }

    /// Flatten a single manifest into config + layers. Fat manifests must
    /// be fanned out by the caller.
    pub fn get_blob_infos(&self, manifest_bytes: &[u8], media_type: &str) -> Result<Vec<BlobInfo>> {
        if manifest::is_manifest_list(media_type) {
            return Err(TransmitError::Parse(
                "manifest list must be resolved per sub-manifest".to_string(),
            ));
        }
        Ok(Manifest::parse(manifest_bytes)?.blob_infos())
    }

    /// Open a blob stream. The returned size is the transport's when it
    /// declares one, the manifest's otherwise.
    pub fn get_a_blob(&self, info: &BlobInfo) -> Result<(reqwest::blocking::Response, i64)> {
        let request = self
            .http
            .client
            .get(self.http.url(&format!("blobs/{}", info.digest)));
        let response = self.http.apply_credential(request).send()?;
        if !response.status().is_success() {
            return Err(TransmitError::Registry(format!(
                "get blob {} status: {}",
                info.digest,
                response.status()
            )));
        }
        let size = response
            .content_length()
            .map(|n| n as i64)
            .unwrap_or(info.size);
        Ok((response, size))
    }

    /// List every tag of the repository.
    pub fn get_source_repo_tags(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct TagList {
            #[serde(default)]
            tags: Vec<String>,
        }
        let request = self.http.client.get(self.http.url("tags/list"));
        let response = self.http.apply_credential(request).send()?;
        if !response.status().is_success() {
            return Err(TransmitError::Registry(format!(
                "list tags status: {}",
                response.status()
            )));
        }
        let tags: TagList = response.json()?;
        Ok(tags.tags)
    }
}

/// A remote image we push to.
pub struct ImageDestination {
    http: RegistryHttp,
    registry: String,
    tag: String,
}

impl ImageDestination {
    /// `repository` must not embed a tag; an empty `tag` means `latest`.
    pub fn new(
        registry: &str,
        repository: &str,
        tag: &str,
        username: &str,
        password: &str,
        insecure: bool,
    ) -> Result<ImageDestination> {
        let http = RegistryHttp::new(registry, repository, username, password, insecure, "pull,push")?;
        Ok(ImageDestination {
            http,
            registry: reference::strip_scheme(registry).to_string(),
            tag: if tag.is_empty() { "latest".to_string() } else { tag.to_string() },
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.http.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn url(&self) -> String {
        format!("{}/{}:{}", self.registry, self.http.repository, self.tag)
    }

    /// Try-reuse probe: does the destination already hold the blob?
    pub fn check_blob_exist(&self, info: &BlobInfo) -> Result<bool> {
        let request = self
            .http
            .client
            .head(self.http.url(&format!("blobs/{}", info.digest)));
        let response = self.http.apply_credential(request).send()?;
        match response.status() {
            s if s.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            s => Err(TransmitError::Registry(format!(
                "check blob {} status: {}",
                info.digest, s
            ))),
        }
    }

    /// Upload one blob: open an upload session, then stream the monolithic
    /// PUT. Consumes the reader.
    pub fn put_a_blob<R: Read + Send + 'static>(&self, reader: R, info: &BlobInfo) -> Result<()> {
        let request = self.http.client.post(self.http.url("blobs/uploads/"));
        let response = self.http.apply_credential(request).send()?;
        if !response.status().is_success() {
            return Err(TransmitError::Registry(format!(
                "start blob upload status: {}",
                response.status()
            )));
        }
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                TransmitError::Registry("no Location header in upload response".to_string())
            })?;
        let location = if location.starts_with('/') {
            format!("{}{}", self.http.endpoint, location)
        } else {
            location.to_string()
        };
        let upload_url = if location.contains('?') {
            format!("{}&digest={}", location, info.digest)
        } else {
            format!("{}?digest={}", location, info.digest)
        };

        let body = if info.size >= 0 {
            Body::sized(reader, info.size as u64)
        } else {
            Body::new(reader)
        };
        let request = self
            .http
            .client
            .put(&upload_url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body);
        let response = self.http.apply_credential(request).send()?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().unwrap_or_default();
            return Err(TransmitError::Registry(format!(
                "upload blob {} failed (status {}): {}",
                info.digest, status, text
            )));
        }
        Ok(())
    }

    /// Push manifest bytes to the destination tag.
    pub fn push_manifest(&self, manifest_bytes: &[u8]) -> Result<()> {
        let tag = self.tag.clone();
        self.push_manifest_reference(manifest_bytes, &tag)
    }

    /// Push a sub-manifest addressed by digest; fat manifests push their
    /// members this way before the list itself claims the tag.
    pub fn push_manifest_digest(&self, manifest_bytes: &[u8], digest: &str) -> Result<()> {
        self.push_manifest_reference(manifest_bytes, digest)
    }

    fn push_manifest_reference(&self, manifest_bytes: &[u8], reference: &str) -> Result<()> {
        let media_type = manifest::manifest_media_type(manifest_bytes);
        let request = self
            .http
            .client
            .put(self.http.url(&format!("manifests/{}", reference)))
            .header(CONTENT_TYPE, media_type)
            .body(manifest_bytes.to_vec());
        let response = self.http.apply_credential(request).send()?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().unwrap_or_default();
            return Err(TransmitError::Registry(format!(
                "push manifest {} failed (status {}): {}",
                reference, status, text
            )));
        }
        Ok(())
    }
}
