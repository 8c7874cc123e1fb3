use std::io::Cursor;
use std::path::{Component, Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::UploadError;
use crate::reader::TabularFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadKind {
    Zip,
    #[serde(alias = "spreadsheet")]
    Excel,
}

/// A file queued for import, with the name shown in progress errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: PathBuf,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Upload {
    pub files: Vec<SourceFile>,
    pub file_count: usize,
    pub images_dir: Option<PathBuf>,
    pub scratch_dir: PathBuf,
}

/// Stages uploads in per-upload directories under `root`.
#[derive(Debug, Clone)]
pub struct Uploads {
    root: PathBuf,
}

/// Last path component only, so a name can never leave its directory.
fn safe_file_name(name: &str) -> String {
    Path::new(name.trim())
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "upload".to_string())
}

/// True if `dir` lies strictly below `root`. A path that climbs back out with
/// `..` never does.
pub fn is_below(root: &Path, dir: &Path) -> bool {
    let Ok(rest) = dir.strip_prefix(root) else {
        return false;
    };
    rest.components().next().is_some()
        && rest
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

fn is_tabular(path: &Path) -> bool {
    let lock_file = path
        .file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with("~$"));
    !lock_file && TabularFormat::detect(path).is_some()
}

impl Uploads {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Uploads { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn stage(&self, bytes: Vec<u8>, name: &str, kind: UploadKind) -> Result<Upload, UploadError> {
        let name = safe_file_name(name);
        match kind {
            UploadKind::Zip if !name.to_lowercase().ends_with(".zip") => {
                return Err(UploadError::InvalidType {
                    expected: "a .zip archive",
                    name,
                })
            }
            UploadKind::Excel if !is_tabular(Path::new(&name)) => {
                return Err(UploadError::InvalidType {
                    expected: "a spreadsheet (.xlsx, .xls, .ods, .csv, .tsv)",
                    name,
                })
            }
            _ => {}
        }

        let scratch_dir = self.create_scratch_dir().await?;
        let result = match kind {
            UploadKind::Excel => self.stage_spreadsheet(bytes, &name, &scratch_dir).await,
            UploadKind::Zip => self.stage_archive(bytes, &scratch_dir).await,
        };
        if result.is_err() {
            self.discard(&scratch_dir).await;
        }
        result
    }

    async fn create_scratch_dir(&self) -> Result<PathBuf, UploadError> {
        let suffix: u32 = rand::thread_rng().gen_range(1000..=9999);
        let dir = self
            .root
            .join(format!("upload_{}_{}", chrono::Utc::now().timestamp(), suffix));
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    async fn stage_spreadsheet(
        &self,
        bytes: Vec<u8>,
        name: &str,
        scratch_dir: &Path,
    ) -> Result<Upload, UploadError> {
        let path = scratch_dir.join(name);
        tokio::fs::write(&path, bytes).await?;
        info!(?path, "Staged spreadsheet");
        Ok(Upload {
            files: vec![SourceFile {
                path,
                name: name.to_string(),
            }],
            file_count: 1,
            images_dir: None,
            scratch_dir: scratch_dir.to_path_buf(),
        })
    }

    async fn stage_archive(&self, bytes: Vec<u8>, scratch_dir: &Path) -> Result<Upload, UploadError> {
        let dir = scratch_dir.to_path_buf();
        let files = tokio::task::spawn_blocking(move || {
            extract(bytes, &dir)?;
            let mut files = Vec::new();
            find_tabular_files(&dir, &mut files)?;
            Ok::<_, UploadError>(files)
        })
        .await
        .map_err(std::io::Error::other)??;

        if files.is_empty() {
            return Err(UploadError::NoTabularFiles);
        }

        let mut images_dir = None;
        for candidate in ["images", "Images"] {
            let dir = scratch_dir.join(candidate);
            if tokio::fs::metadata(&dir).await.is_ok_and(|meta| meta.is_dir()) {
                images_dir = Some(dir);
                break;
            }
        }

        info!(?scratch_dir, files = files.len(), has_images = images_dir.is_some(), "Extracted archive");
        Ok(Upload {
            file_count: files.len(),
            files,
            images_dir,
            scratch_dir: scratch_dir.to_path_buf(),
        })
    }

    /// True if `dir` is a staging directory this instance could have created.
    pub fn owns(&self, dir: &Path) -> bool {
        is_below(&self.root, dir)
    }

    /// Removes a staged directory. Paths outside the upload root are left alone.
    pub async fn discard(&self, dir: &Path) {
        if !self.owns(dir) {
            warn!(?dir, "Not removing directory outside the upload root");
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(?dir, error = %e, "Failed to remove upload");
            }
        }
    }
}

fn extract(bytes: Vec<u8>, dir: &Path) -> Result<(), UploadError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(relative) = entry.enclosed_name() else {
            warn!(name = entry.name(), "Skipping archive entry with unsafe path");
            continue;
        };
        let target = dir.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

/// Collects spreadsheet files below `dir` in path order.
fn find_tabular_files(dir: &Path, files: &mut Vec<SourceFile>) -> Result<(), UploadError> {
    let mut entries = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort();

    for path in entries {
        if path.is_dir() {
            if path.file_name().is_some_and(|name| name == "__MACOSX") {
                continue;
            }
            find_tabular_files(&path, files)?;
        } else if is_tabular(&path) {
            debug!(?path, "Found spreadsheet");
            files.push(SourceFile {
                name: path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                path,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[tokio::test]
    async fn stages_single_spreadsheet() {
        let root = tempfile::tempdir().unwrap();
        let uploads = Uploads::new(root.path());

        let upload = uploads
            .stage(b"SKU,Name\nA,a\n".to_vec(), "../../products.csv", UploadKind::Excel)
            .await
            .unwrap();
        assert_eq!(upload.file_count, 1);
        assert_eq!(upload.files[0].name, "products.csv");
        assert!(upload.files[0].path.starts_with(root.path()));
        assert!(upload.images_dir.is_none());

        uploads.discard(&upload.scratch_dir).await;
        assert!(!upload.scratch_dir.exists());
    }

    #[tokio::test]
    async fn rejects_wrong_types() {
        let root = tempfile::tempdir().unwrap();
        let uploads = Uploads::new(root.path());

        let err = uploads
            .stage(Vec::new(), "notes.txt", UploadKind::Excel)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidType { .. }));
        let err = uploads
            .stage(Vec::new(), "products.xlsx", UploadKind::Zip)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidType { .. }));
    }

    #[tokio::test]
    async fn extracts_archive_with_images() {
        let root = tempfile::tempdir().unwrap();
        let uploads = Uploads::new(root.path());
        let bytes = archive(&[
            ("b/second.csv", b"SKU,Name\nB,b\n"),
            ("a.csv", b"SKU,Name\nA,a\n"),
            ("~$a.xlsx", b"lock"),
            ("readme.txt", b"hi"),
            ("__MACOSX/._a.csv", b"junk"),
            ("images/front.jpg", b"jpg"),
        ]);

        let upload = uploads.stage(bytes, "bundle.zip", UploadKind::Zip).await.unwrap();
        let names: Vec<&str> = upload.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.csv", "second.csv"]);
        assert_eq!(upload.images_dir, Some(upload.scratch_dir.join("images")));
        assert!(upload.images_dir.as_ref().unwrap().join("front.jpg").is_file());
    }

    #[tokio::test]
    async fn archive_without_spreadsheets_is_rejected_and_removed() {
        let root = tempfile::tempdir().unwrap();
        let uploads = Uploads::new(root.path());
        let bytes = archive(&[("readme.txt", b"hi")]);

        let err = uploads.stage(bytes, "bundle.zip", UploadKind::Zip).await.unwrap_err();
        assert!(matches!(err, UploadError::NoTabularFiles));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);

        let err = uploads
            .stage(b"not a zip".to_vec(), "broken.zip", UploadKind::Zip)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Archive(_)));
    }

    #[tokio::test]
    async fn discard_ignores_paths_outside_root() {
        let root = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let uploads = Uploads::new(root.path());
        uploads.discard(other.path()).await;
        assert!(other.path().exists());

        // lexically below the root, but resolves to the sibling directory
        let climbing = root.path().join("..").join(other.path().file_name().unwrap());
        uploads.discard(&climbing).await;
        assert!(other.path().exists());

        uploads.discard(root.path()).await;
        assert!(root.path().exists());
    }

    #[test]
    fn below_root_rejects_parent_components() {
        let root = Path::new("/data/uploads");
        assert!(is_below(root, Path::new("/data/uploads/upload_1_1000")));
        assert!(!is_below(root, Path::new("/data/uploads")));
        assert!(!is_below(root, Path::new("/data/uploads/../victim")));
        assert!(!is_below(root, Path::new("/data/uploads/upload_1/../../victim")));
        assert!(!is_below(root, Path::new("/data/other")));
        assert!(is_below(Path::new("../data"), Path::new("../data/upload_1_1000")));
    }
}
