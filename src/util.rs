//! Miscellaneous utilities shared across components.

use std::{
    fs,
    io::{self, Write},
};

use camino::{Utf8Path, Utf8PathBuf};

/// Atomically write a file.
///
/// # Panics
///
/// Panics if 'path' does not have a containing directory.
pub fn write_file(path: &Utf8Path, contents: &[u8]) -> io::Result<()> {
    // Ensure such a path _can_ exist.
    let dir = path
        .parent()
        .expect("'path' must be a file, so it must have a parent");
    fs::create_dir_all(dir)?;

    // Obtain a temporary file in the same directory.
    let mut tmp_file = tempfile::Builder::new().tempfile_in(dir)?;

    // Fill up the temporary file.
    tmp_file.as_file_mut().write_all(contents)?;

    // Replace the target path with the temporary file.
    let _ = tmp_file.persist(path)?;

    Ok(())
}

/// Async wrapper around [`write_file`], for call sites that must not block
/// the executing `tokio` worker thread (everything past the point a
/// component's lock guard is dropped).
pub async fn write_file_async(path: Utf8PathBuf, contents: Vec<u8>) -> io::Result<()> {
    tokio::task::spawn_blocking(move || write_file(&path, &contents))
        .await
        .expect("write_file task panicked")
}
