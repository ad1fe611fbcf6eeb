//! Staged file writes: everything lands in `<final>.tmp` first and is only
//! renamed onto the final path on commit. An aborted or failed transfer can
//! therefore never leave a half-written file where a complete one is
//! expected.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Write handle for a staged download target.
///
/// Dropping a `StagedFile` without calling [`commit`](Self::commit) removes
/// the temporary file, which is the correct recovery after any write error.
pub struct StagedFile {
    final_path: PathBuf,
    tmp_path: PathBuf,
    file: Option<File>,
}

impl StagedFile {
    /// Create `<final_path>.tmp` for writing, creating parent directories as
    /// needed. The final path itself is left untouched.
    pub fn open(final_path: impl Into<PathBuf>) -> Result<StagedFile> {
        let final_path = final_path.into();
        if let Some(parent) = final_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| Error::Create {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let mut tmp_path = final_path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);
        let file = File::create(&tmp_path).map_err(|source| Error::Create {
            path: tmp_path.clone(),
            source,
        })?;
        Ok(StagedFile {
            final_path,
            tmp_path,
            file: Some(file),
        })
    }

    /// Append `buf` to the temporary file.
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        let file = self.file.as_mut().expect("write after close");
        file.write_all(buf).map_err(|source| Error::Write {
            path: self.tmp_path.clone(),
            source,
        })
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Close the handle and rename the temporary file onto the final path,
    /// replacing any previous file there.
    pub fn commit(mut self) -> Result<()> {
        drop(self.file.take());
        // rename over an existing file is not atomic everywhere, remove first
        if self.final_path.exists() {
            fs::remove_file(&self.final_path).map_err(|source| Error::Remove {
                path: self.final_path.clone(),
                source,
            })?;
        }
        fs::rename(&self.tmp_path, &self.final_path).map_err(|source| Error::Rename {
            from: self.tmp_path.clone(),
            to: self.final_path.clone(),
            source,
        })
    }

    /// Close the handle and delete the temporary file. The final path keeps
    /// whatever was there before the transfer started.
    pub fn discard(mut self) {
        drop(self.file.take());
        let _ = fs::remove_file(&self.tmp_path);
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn commit_renames_tmp_to_final() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("sub/dir/file.bin");
        let mut staged = StagedFile::open(&dest).unwrap();
        staged.write(b"hello ").unwrap();
        staged.write(b"world").unwrap();
        staged.commit().unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"hello world");
        assert!(!dest.with_extension("bin.tmp").exists());
    }

    #[test]
    fn discard_preserves_previous_final() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("file.bin");
        fs::write(&dest, b"old contents").unwrap();

        let mut staged = StagedFile::open(&dest).unwrap();
        staged.write(b"new contents").unwrap();
        staged.discard();

        assert_eq!(fs::read(&dest).unwrap(), b"old contents");
        let tmp = dir.path().join("file.bin.tmp");
        assert!(!tmp.exists());
    }

    #[test]
    fn drop_without_commit_removes_tmp() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("file.bin");
        {
            let mut staged = StagedFile::open(&dest).unwrap();
            staged.write(b"partial").unwrap();
        }
        assert!(!dest.exists());
        assert!(!dir.path().join("file.bin.tmp").exists());
    }

    #[test]
    fn commit_replaces_existing_final() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("file.bin");
        fs::write(&dest, b"old").unwrap();

        let mut staged = StagedFile::open(&dest).unwrap();
        staged.write(b"new").unwrap();
        staged.commit().unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new");
    }
}
