#![allow(dead_code)]

use std::path::{Path, PathBuf};

use anyhow::Result;
use assert_cmd::Command;

pub fn cli_run(repository: &Path) -> Result<Command> {
    let bin_name = env!("CARGO_PKG_NAME");
    let mut cmd = Command::cargo_bin(bin_name)?;
    cmd.arg("--repository").arg(repository);
    cmd.arg("-vvv");
    Ok(cmd)
}

pub fn init(repository: &Path) -> Result<()> {
    cli_run(repository)?.arg("init").assert().success();
    Ok(())
}

/// Every blob file currently sitting in the repository's fan-out layout.
pub fn blob_files(repository: &Path) -> Result<Vec<PathBuf>> {
    Ok(walkdir::WalkDir::new(repository.join("blobs"))
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect())
}
