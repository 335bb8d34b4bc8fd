//! Concatenation of finished parts into one file

use crate::disk::DiskBudgetGuard;
use crate::engine::download_task::CompletedPart;
use crate::engine::remove_quietly;
use crate::engine::plan::partial_path;
use crate::error::FetchError;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

/// Merge `parts` (in index order) into `dest` and delete them
///
/// The merged size is reserved up front since the parts and the merged
/// file coexist until the copy finishes. On success the parts' own bytes
/// are released, leaving exactly the merged file reserved.
pub async fn merge_parts(
    parts: &[CompletedPart],
    dest: &Path,
    disk: &DiskBudgetGuard,
) -> Result<PathBuf, FetchError> {
    if let [only] = parts {
        if only.path == dest {
            return Ok(dest.to_path_buf());
        }
    }

    let mut ordered: Vec<&CompletedPart> = parts.iter().collect();
    ordered.sort_by_key(|p| p.range.part_index);
    let total: u64 = ordered.iter().map(|p| p.range.len()).sum();

    info!("Merging {} parts into {:?}", ordered.len(), dest);
    disk.try_reserve(total)?;

    let staging = partial_path(dest);
    if let Err(source) = concatenate(&ordered, &staging, dest).await {
        error!("Failed to merge into {:?}: {}", dest, source);
        remove_quietly(&staging).await;
        disk.forfeit(total);
        return Err(FetchError::Merge {
            path: dest.to_path_buf(),
            source,
        });
    }

    disk.mark_written(total);
    for part in &ordered {
        remove_quietly(&part.path).await;
    }
    disk.release(total);
    info!("Merged {} bytes into {:?}", total, dest);
    Ok(dest.to_path_buf())
}

async fn concatenate(
    parts: &[&CompletedPart],
    staging: &Path,
    dest: &Path,
) -> std::io::Result<()> {
    let mut output = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(staging)
        .await?;

    for part in parts {
        let mut input = File::open(&part.path).await?;
        let copied = tokio::io::copy(&mut input, &mut output).await?;
        if copied != part.range.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "part {:?} has {} bytes, expected {}",
                    part.path,
                    copied,
                    part.range.len()
                ),
            ));
        }
    }

    output.flush().await?;
    output.sync_all().await?;
    drop(output);
    tokio::fs::rename(staging, dest).await
}
