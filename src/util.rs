//! Utility functions for filesystem operations

use std::{
   fs::{self, File},
   io::{self, Write},
   path::{Path, PathBuf},
};

use uuid::Uuid;

/// Flushes directory metadata so a preceding rename survives a crash.
pub fn fsync_dir(path: &Path) -> io::Result<()> {
   #[cfg(unix)]
   {
      File::open(path)?.sync_all()
   }

   #[cfg(not(unix))]
   {
      let _ = path;
      Ok(())
   }
}

/// [`fsync_dir`] on the blocking pool, for callers inside async code.
pub async fn sync_dir(path: PathBuf) -> io::Result<()> {
   tokio::task::spawn_blocking(move || fsync_dir(&path))
      .await
      .map_err(io::Error::other)?
}

/// Verifies a directory accepts writes by creating and removing a scratch file.
pub fn check_dir_writable(dir: &Path) -> io::Result<()> {
   let scratch = dir.join(format!(".write-check-{}", Uuid::new_v4()));
   let mut file = File::create(&scratch)?;
   file.write_all(b"ok")?;
   drop(file);
   fs::remove_file(&scratch)
}

/// Formats a byte count as a human-readable size string
pub fn format_size(bytes: u64) -> String {
   const KB: u64 = 1024;
   const MB: u64 = KB * 1024;
   const GB: u64 = MB * 1024;

   if bytes < KB {
      format!("{bytes} B")
   } else if bytes < MB {
      format!("{:.1} KB", bytes as f64 / KB as f64)
   } else if bytes < GB {
      format!("{:.1} MB", bytes as f64 / MB as f64)
   } else {
      format!("{:.1} GB", bytes as f64 / GB as f64)
   }
}
