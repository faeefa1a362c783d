use crate::config::DEFAULT_SOCKET_DIR;
use log::info;
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt};
use std::path::{Path, PathBuf};

/// Location of a driver's Unix socket: `<socket_dir>/<driver_name>.sock`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverSocket {
    socket_dir: PathBuf,
    driver_name: String,
    socket_file: PathBuf,
}

impl DriverSocket {
    /// An empty directory falls back to the default socket directory
    pub fn new(socket_dir: impl AsRef<Path>, driver_name: &str) -> Self {
        let socket_dir = socket_dir.as_ref();
        let socket_dir = if socket_dir.as_os_str().is_empty() {
            PathBuf::from(DEFAULT_SOCKET_DIR)
        } else {
            socket_dir.to_path_buf()
        };
        let socket_file = socket_dir.join(format!("{}.sock", driver_name));
        Self {
            socket_dir,
            driver_name: driver_name.to_string(),
            socket_file,
        }
    }

    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    pub fn socket_file(&self) -> &Path {
        &self.socket_file
    }

    /// Prepare the path for binding.
    ///
    /// Creates the socket directory (mode 0700) if needed and deletes any
    /// socket file left behind by a previous daemon. No liveness check is made:
    /// whoever calls this takes the path over.
    pub fn setup(&self) -> io::Result<&Path> {
        match fs::metadata(&self.socket_dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("'{}' exists and is not a directory", self.socket_dir.display()),
                ))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                DirBuilder::new()
                    .recursive(true)
                    .mode(0o700)
                    .create(&self.socket_dir)?;
                info!("Created socket directory '{}'", self.socket_dir.display());
            }
            Err(e) => return Err(e),
        }

        info!("Socket file: '{}'", self.socket_file.display());
        match fs::symlink_metadata(&self.socket_file) {
            Ok(meta) => {
                if meta.is_dir() {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("'{}' is a directory", self.socket_file.display()),
                    ));
                }
                fs::remove_file(&self.socket_file)?;
                info!(
                    "Deleted old {} '{}'",
                    if meta.file_type().is_socket() { "socket" } else { "file" },
                    self.socket_file.display()
                );
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        Ok(&self.socket_file)
    }
}
