//! `backup` subcommand: runs the ingest pipeline against a source
//! tree and prints a one-line summary of the result.

use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow};
use byte_unit::{Byte, UnitType};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;

use crate::config::Configuration;

/// Back up a directory tree into a repository.
#[derive(Debug, Parser)]
pub struct Args {
    /// The path to back up.
    pub source: Utf8PathBuf,

    /// Override the backup's recorded author (otherwise the hostname is used).
    #[clap(short, long, name = "name")]
    pub author: Option<String>,

    /// A comment to attach to this backup.
    #[clap(short, long, default_value = "")]
    pub comment: String,

    /// Attach a `key=value` metadata tag to this backup (can be given more than once).
    #[clap(short, long = "tag", name = "tag")]
    pub tags: Vec<String>,
}

pub fn run(repository: &Utf8Path, config: &Configuration, args: Args) -> Result<()> {
    let author = match args.author {
        Some(a) => a,
        None => hostname::get()
            .context("Couldn't get hostname")?
            .to_string_lossy()
            .to_string(),
    };

    let mut tags = BTreeMap::new();
    for tag in &args.tags {
        let (k, v) = tag
            .split_once('=')
            .ok_or_else(|| anyhow!("Tag {tag:?} isn't of the form key=value"))?;
        tags.insert(k.to_string(), v.to_string());
    }

    let blobs_root = repository.join("blobs");
    let catalog_path = repository.join("catalog.db");

    let info = crate::run::run(&blobs_root, &catalog_path, &args.source, config, &author, &args.comment, tags)?;

    println!(
        "backup {}: {} files, {} raw / {} stored",
        info.id,
        info.file_count,
        Byte::from_u64(info.raw_bytes).get_appropriate_unit(UnitType::Binary),
        Byte::from_u64(info.stored_bytes).get_appropriate_unit(UnitType::Binary),
    );
    Ok(())
}
