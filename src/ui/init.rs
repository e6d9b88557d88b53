//! `init` subcommand: lays out an empty repository, ready for
//! `backup` to run against.

use anyhow::{Context, Result};
use camino::Utf8Path;
use clap::Parser;
use tracing::info;

use crate::blobstore::BlobStore;
use crate::catalog::CatalogSession;

#[derive(Debug, Parser)]
pub struct Args {}

pub fn run(repository: &Utf8Path, _args: Args) -> Result<()> {
    std::fs::create_dir_all(repository).with_context(|| format!("Couldn't create {repository}"))?;

    let blobs_root = repository.join("blobs");
    let bs = BlobStore::open(&blobs_root).context("Couldn't initialize the blob store")?;
    bs.prepare_blob_directories()?;

    let catalog_path = repository.join("catalog.db");
    CatalogSession::open(&catalog_path).context("Couldn't initialize the catalog")?;

    info!("Initialized repository at {repository}");
    Ok(())
}
