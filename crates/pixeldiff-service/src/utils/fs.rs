use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

/// Atomically writes `bytes` to `path`.
///
/// The bytes go to a temp file in the target directory first and are moved
/// into place afterwards, so readers never observe a partially written file.
/// Missing parent directories are created.
pub fn persist_bytes(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("no parent directory to persist into"))?;
    std::fs::create_dir_all(parent)?;

    let mut temp_file = NamedTempFile::new_in(parent)?;
    temp_file.write_all(bytes)?;
    temp_file.persist(path).map_err(|err| err.error)?;
    Ok(())
}
