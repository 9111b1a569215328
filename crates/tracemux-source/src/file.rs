use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{Result, SourceError};
use crate::{ByteSource, FILE_POLL_DELAY};

/// Reads trace bytes from a regular file.
///
/// At end of file the source either reports [`SourceError::EndOfInput`] or
/// keeps polling, picking up bytes appended by another process.
#[derive(Debug)]
pub struct FileSource {
    file: fs::File,
    path: PathBuf,
    terminate_on_eof: bool,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>, terminate_on_eof: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = fs::File::open(&path).map_err(|source| SourceError::FileOpen {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            file,
            path,
            terminate_on_eof,
        })
    }
}

impl ByteSource for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.file.read(buf)?;
        if n == 0 {
            if self.terminate_on_eof {
                return Err(SourceError::EndOfInput);
            }
            std::thread::sleep(FILE_POLL_DELAY);
        }
        Ok(n)
    }

    fn describe(&self) -> String {
        format!(
            "file {} ({})",
            self.path.display(),
            if self.terminate_on_eof {
                "terminate on exhaustion"
            } else {
                "ongoing read"
            }
        )
    }
}
