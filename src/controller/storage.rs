use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::info;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::error::{LabError, Result};

pub const USER_SUBDIRS: [&str; 4] = ["datasets", "notebooks", "models", "workspace"];

/// Holds the raw user id that owns a user directory.
const OWNER_FILE: &str = ".ailab-owner";

/// Filesystem layout under the data root:
/// `users/<user>/{datasets,notebooks,models,workspace}`, `shared/` and `backups/`.
#[derive(Debug, Clone)]
pub struct WorkspaceStorage {
    data_root: PathBuf,
}

/// Maps a user id onto a directory name, e.g. `test@ailab.com` to `test_at_ailab_com`.
///
/// The mapping is not injective: `a.b` and `a_b`, or `a@b` and `a_at_b`, share a
/// name. `WorkspaceStorage::ensure_user_dirs` refuses the second user.
pub fn sanitize_user_id(user_id: &str) -> String {
    let mut out = String::with_capacity(user_id.len());
    for ch in user_id.trim().chars() {
        match ch {
            '@' => out.push_str("_at_"),
            c if c.is_ascii_alphanumeric() || c == '-' || c == '_' => out.push(c),
            _ => out.push('_'),
        }
    }
    out
}

impl WorkspaceStorage {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    pub fn user_dir(&self, user_id: &str) -> PathBuf {
        self.data_root.join("users").join(sanitize_user_id(user_id))
    }

    pub fn shared_dir(&self) -> PathBuf {
        self.data_root.join("shared")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.data_root.join("backups")
    }

    /// Creates the user's directory tree and the shared dataset directory.
    /// Fails when the directory was first claimed by a different user id that
    /// sanitizes to the same name.
    pub async fn ensure_user_dirs(&self, user_id: &str) -> Result<PathBuf> {
        let user_dir = self.user_dir(user_id);
        let owner = user_id.trim();
        let marker = user_dir.join(OWNER_FILE);
        match tokio::fs::read_to_string(&marker).await {
            Ok(existing) if existing != owner => {
                return Err(LabError::Storage(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("data directory {} belongs to user {existing}", user_dir.display()),
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&user_dir).await?;
                tokio::fs::write(&marker, owner).await?;
            }
            Err(e) => return Err(e.into()),
        }
        for sub in USER_SUBDIRS {
            tokio::fs::create_dir_all(user_dir.join(sub)).await?;
        }
        tokio::fs::create_dir_all(self.shared_dir()).await?;
        Ok(user_dir)
    }

    /// Zips the user's directory into the backup directory and returns the
    /// archive path.
    pub async fn backup_user(&self, user_id: &str) -> Result<PathBuf> {
        let user_dir = self.user_dir(user_id);
        if !tokio::fs::try_exists(&user_dir).await? {
            return Err(LabError::NotFound(format!("data directory for user {user_id}")));
        }

        let backup_dir = self.backup_dir();
        tokio::fs::create_dir_all(&backup_dir).await?;
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let archive = backup_dir.join(format!("{}_{timestamp}.zip", sanitize_user_id(user_id)));

        let source = user_dir.clone();
        let target = archive.clone();
        tokio::task::spawn_blocking(move || write_zip(&source, &target))
            .await
            .map_err(|e| LabError::Storage(io::Error::new(io::ErrorKind::Other, e)))??;

        info!("Backed up {} to {}", user_dir.display(), archive.display());
        Ok(archive)
    }
}

fn write_zip(source: &Path, target: &Path) -> io::Result<()> {
    let file = File::create(target)?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let name = relative.to_string_lossy().replace('\\', "/");

        if entry.file_type().is_dir() {
            writer.add_directory(format!("{name}/"), options).map_err(zip_error)?;
        } else if entry.file_type().is_file() {
            writer.start_file(name, options).map_err(zip_error)?;
            let mut input = File::open(entry.path())?;
            io::copy(&mut input, &mut writer)?;
        }
    }

    writer.finish().map_err(zip_error)?;
    Ok(())
}

fn zip_error(e: zip::result::ZipError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}
