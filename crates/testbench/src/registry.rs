//! Endpoint registry file
//!
//! The proxy under test cannot discover server addresses on its own, so the
//! orchestrator writes them to a uniquely named text file, one address per
//! line, and passes the path on the proxy's command line. The file lives
//! for exactly one scenario run.

use std::fmt::Display;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct EndpointRegistry {
    path: PathBuf,
    file: Option<TempPath>,
}

impl EndpointRegistry {
    /// Write `addresses` to a fresh file in `dir`
    pub fn create<I>(dir: &Path, addresses: I) -> io::Result<Self>
    where
        I: IntoIterator,
        I::Item: Display,
    {
        let dir = dir.canonicalize()?;
        let mut file = tempfile::Builder::new()
            .prefix("abr-servers-")
            .suffix(".txt")
            .tempfile_in(&dir)?;

        let mut count = 0;
        for addr in addresses {
            writeln!(file, "{}", addr)?;
            count += 1;
        }
        file.as_file().sync_all()?;

        let file = file.into_temp_path();
        let path = file.to_path_buf();
        debug!("Wrote {} endpoint(s) to {}", count, path.display());

        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// Absolute path of the registry file
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Delete the file, reporting failure. Later calls are no-ops.
    pub fn try_close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(file) => {
                file.close()?;
                debug!("Removed endpoint registry {}", self.path.display());
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Delete the file; failures are logged, never returned
    pub fn close(&mut self) {
        if let Err(e) = self.try_close() {
            warn!(
                "Failed to remove endpoint registry {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

impl Drop for EndpointRegistry {
    fn drop(&mut self) {
        self.close();
    }
}
