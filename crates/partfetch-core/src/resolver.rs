//! Content resolver - expands a remote folder or file into a flat file list
//!
//! The tree is fetched folder by folder. Only a failure on the root (or an
//! auth failure anywhere) is fatal; an unreachable subfolder is logged and
//! skipped while its siblings still resolve.

use crate::api::{ContentApi, ContentInfo, ContentKind};
use crate::auth::TokenManager;
use crate::error::FetchError;
use crate::filter::{sanitize_name, NameFilter};
use futures::future::BoxFuture;
use futures::FutureExt;
use partfetch_types::{ContentNode, RemoteFile};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Folders nested deeper than this are not followed
const MAX_DEPTH: usize = 32;

/// Options for one resolve call
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    pub dest_dir: PathBuf,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub password: Option<String>,
}

/// Expands content ids into downloadable files
pub struct ContentResolver {
    api: ContentApi,
    tokens: Arc<TokenManager>,
}

impl ContentResolver {
    pub fn new(api: ContentApi, tokens: Arc<TokenManager>) -> Self {
        Self { api, tokens }
    }

    /// Resolve `root` (a content id or share URL) into a flat, ordered file list
    pub async fn resolve(
        &self,
        root: &str,
        options: &ResolveOptions,
    ) -> Result<Vec<RemoteFile>, FetchError> {
        let filter = NameFilter::new(&options.include, &options.exclude)?;
        let tree = self.fetch_tree(root, options.password.as_deref()).await?;

        let mut files = Vec::new();
        let mut taken = HashSet::new();
        flatten(&tree, &filter, &options.dest_dir, &mut taken, &mut files);

        info!(
            "Resolved {} into {} file(s), {} bytes",
            root,
            files.len(),
            files.iter().map(|f| f.size).sum::<u64>()
        );
        Ok(files)
    }

    /// Fetch the content tree rooted at `root`
    pub async fn fetch_tree(
        &self,
        root: &str,
        password: Option<&str>,
    ) -> Result<ContentNode, FetchError> {
        let content_id = parse_content_id(root)?;
        let password_hash = password.map(hash_password);

        let info = self.lookup(&content_id, password_hash.as_deref()).await?;
        let node = self
            .build(info, password_hash.as_deref(), 0)
            .await?
            .ok_or_else(|| FetchError::Protocol(format!("root {} has no usable content", content_id)))?;
        Ok(node)
    }

    fn build<'a>(
        &'a self,
        info: ContentInfo,
        password_hash: Option<&'a str>,
        depth: usize,
    ) -> BoxFuture<'a, Result<Option<ContentNode>, FetchError>> {
        async move {
            match info.kind {
                ContentKind::File => {
                    let Some(link) = info.link.clone().filter(|l| !l.is_empty()) else {
                        warn!("File {} ({}) has no download link, skipping", info.name, info.id);
                        return Ok(None);
                    };
                    Ok(Some(ContentNode::File {
                        id: info.id,
                        name: info.name,
                        link,
                        size: info.size,
                    }))
                }
                ContentKind::Folder => {
                    if depth >= MAX_DEPTH {
                        warn!("Folder {} is nested too deeply, skipping", info.name);
                        return Ok(None);
                    }

                    let mut children = Vec::new();
                    for child in info.ordered_children() {
                        let child = match child.kind {
                            ContentKind::Folder if child.children.is_none() => {
                                debug!("Fetching subfolder {} ({})", child.name, child.id);
                                match self.lookup(&child.id, password_hash).await {
                                    Ok(full) => full,
                                    Err(e @ FetchError::Auth(_)) => return Err(e),
                                    Err(e) => {
                                        warn!("Skipping unreachable folder {}: {}", child.name, e);
                                        continue;
                                    }
                                }
                            }
                            _ => child,
                        };
                        if let Some(node) = self.build(child, password_hash, depth + 1).await? {
                            children.push(node);
                        }
                    }

                    Ok(Some(ContentNode::Folder {
                        id: info.id,
                        name: info.name,
                        children,
                    }))
                }
            }
        }
        .boxed()
    }

    /// Look up one id, refreshing the token once if it is rejected
    async fn lookup(
        &self,
        content_id: &str,
        password_hash: Option<&str>,
    ) -> Result<ContentInfo, FetchError> {
        let credential = self.tokens.acquire().await?;
        match self
            .api
            .get_content(content_id, credential.as_str(), password_hash)
            .await
        {
            Err(e) if e.is_auth_rejection() => {
                self.tokens.invalidate(&credential).await;
                let fresh = self.tokens.acquire().await?;
                self.api
                    .get_content(content_id, fresh.as_str(), password_hash)
                    .await
                    .map_err(|e| {
                        if e.is_auth_rejection() {
                            FetchError::Auth(format!("token rejected for {}", content_id))
                        } else {
                            e
                        }
                    })
            }
            other => other,
        }
    }
}

fn flatten(
    node: &ContentNode,
    filter: &NameFilter,
    dest_dir: &Path,
    taken: &mut HashSet<String>,
    out: &mut Vec<RemoteFile>,
) {
    match node {
        ContentNode::File {
            id,
            name,
            link,
            size,
        } => {
            if !filter.matches(name) {
                debug!("Filtered out {}", name);
                return;
            }
            let local = unique_name(&sanitize_name(name), taken);
            out.push(RemoteFile {
                id: id.clone(),
                name: name.clone(),
                link: link.clone(),
                size: *size,
                dest_path: dest_dir.join(local),
            });
        }
        ContentNode::Folder { children, .. } => {
            for child in children {
                flatten(child, filter, dest_dir, taken, out);
            }
        }
    }
}

/// Pick a local name not used earlier in the same resolve
fn unique_name(name: &str, taken: &mut HashSet<String>) -> String {
    if taken.insert(name.to_string()) {
        return name.to_string();
    }
    let (stem, ext) = match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    };
    let mut counter = 1;
    loop {
        let candidate = format!("{} ({}){}", stem, counter, ext);
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        counter += 1;
    }
}

/// Extract the content id from a share URL, or accept a bare id
pub fn parse_content_id(root: &str) -> Result<String, FetchError> {
    let root = root.trim();
    if root.contains("://") {
        let url = url::Url::parse(root).map_err(|_| FetchError::InvalidUrl(root.to_string()))?;
        return url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .map(str::to_string)
            .ok_or_else(|| FetchError::InvalidUrl(root.to_string()));
    }
    if root.is_empty() || root.contains('/') {
        return Err(FetchError::InvalidUrl(root.to_string()));
    }
    Ok(root.to_string())
}

fn hash_password(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
