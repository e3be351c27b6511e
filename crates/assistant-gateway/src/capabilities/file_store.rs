//! File operations executed inside a sandbox directory
use super::{bool_param, str_param, WireParams};
use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOperation {
    List { path: String },
    Read { path: String },
    Write { path: String, content: String, create_dirs: bool },
    Mkdir { path: String, exist_ok: bool },
    Delete { path: String },
    Move { source: String, destination: String },
    Copy { source: String, destination: String },
}

impl FileOperation {
    pub fn tag(&self) -> &'static str {
        match self {
            FileOperation::List { .. } => "list",
            FileOperation::Read { .. } => "read",
            FileOperation::Write { .. } => "write",
            FileOperation::Mkdir { .. } => "mkdir",
            FileOperation::Delete { .. } => "delete",
            FileOperation::Move { .. } => "move",
            FileOperation::Copy { .. } => "copy",
        }
    }

    /// Build from a detector's `{operation, parameters}` pair. Accepts both
    /// the short tags and the `*_file` spellings models tend to produce.
    /// Returns None when the tag is unknown or a required parameter is missing.
    pub fn from_wire(tag: &str, params: &WireParams) -> Option<Self> {
        let path = || str_param(params, "path");
        let source = || str_param(params, "source").or_else(|| str_param(params, "path"));
        let destination = || str_param(params, "destination");

        match tag.trim().to_ascii_lowercase().as_str() {
            "list" | "list_files" | "list_directory" => Some(FileOperation::List {
                path: path().unwrap_or_default(),
            }),
            "read" | "read_file" => Some(FileOperation::Read { path: path()? }),
            "write" | "write_file" => Some(FileOperation::Write {
                path: path()?,
                content: params
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                create_dirs: bool_param(params, "create_dirs").unwrap_or(false),
            }),
            "mkdir" | "create_directory" => Some(FileOperation::Mkdir {
                path: path()?,
                exist_ok: bool_param(params, "exist_ok").unwrap_or(false),
            }),
            "delete" | "delete_file" => Some(FileOperation::Delete { path: path()? }),
            "move" | "move_file" => Some(FileOperation::Move {
                source: source()?,
                destination: destination()?,
            }),
            "copy" | "copy_file" => Some(FileOperation::Copy {
                source: source()?,
                destination: destination()?,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FilePayload {
    None,
    Listing { current_dir: String, entries: Vec<FileEntry> },
    Content { path: String, content: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileOutcome {
    pub success: bool,
    pub message: String,
    pub payload: FilePayload,
}

impl FileOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into(), payload: FilePayload::None }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into(), payload: FilePayload::None }
    }
}

#[async_trait]
pub trait FileStore: Send + Sync {
    async fn execute(&self, operation: &FileOperation) -> anyhow::Result<FileOutcome>;
}

/// Filesystem-backed store. Every path is resolved relative to `root` and
/// may not leave it.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        info!("Local file store rooted at {}", root.display());
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn resolve(&self, relative: &str) -> anyhow::Result<PathBuf> {
        let resolved = self.resolve_lexically(relative)?;
        self.ensure_inside_root(&resolved, relative).await?;
        Ok(resolved)
    }

    fn resolve_lexically(&self, relative: &str) -> anyhow::Result<PathBuf> {
        let requested = Path::new(relative);
        let requested = if requested.is_absolute() {
            requested
                .strip_prefix(&self.root)
                .map_err(|_| anyhow::anyhow!("Path is outside the file root: {}", relative))?
        } else {
            requested
        };

        let mut resolved = self.root.clone();
        for component in requested.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return Err(anyhow::anyhow!("Path is outside the file root: {}", relative)),
            }
        }
        Ok(resolved)
    }

    /// Symlinks inside the root may point anywhere, so the deepest existing
    /// ancestor of `path` is canonicalized and compared with the real root.
    async fn ensure_inside_root(&self, path: &Path, relative: &str) -> anyhow::Result<()> {
        let root = tokio::fs::canonicalize(&self.root)
            .await
            .with_context(|| format!("File root is not accessible: {}", self.root.display()))?;
        let mut existing = path;
        loop {
            match tokio::fs::canonicalize(existing).await {
                Ok(real) if real.starts_with(&root) => return Ok(()),
                Ok(_) => break,
                // a dangling link would be followed by a later write
                Err(_) if tokio::fs::symlink_metadata(existing).await.is_ok() => break,
                Err(_) => match existing.parent() {
                    Some(parent) => existing = parent,
                    None => break,
                },
            }
        }
        Err(anyhow::anyhow!("Path is outside the file root: {}", relative))
    }

    fn display(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let shown = relative.to_string_lossy();
        if shown.is_empty() { ".".to_string() } else { shown.into_owned() }
    }

    async fn list(&self, path: &str) -> anyhow::Result<FileOutcome> {
        let dir = self.resolve(path).await?;
        if !tokio::fs::metadata(&dir).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Ok(FileOutcome::failure(format!("ディレクトリが見つかりません: {}", path)));
        }

        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to read directory {}", dir.display()))?;
        while let Some(entry) = reader.next_entry().await? {
            let metadata = entry.metadata().await?;
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                size: if metadata.is_file() { Some(metadata.len()) } else { None },
            });
        }
        entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));

        Ok(FileOutcome {
            success: true,
            message: format!("{}件の項目があります", entries.len()),
            payload: FilePayload::Listing { current_dir: self.display(&dir), entries },
        })
    }

    async fn read(&self, path: &str) -> anyhow::Result<FileOutcome> {
        let file = self.resolve(path).await?;
        if !tokio::fs::metadata(&file).await.map(|m| m.is_file()).unwrap_or(false) {
            return Ok(FileOutcome::failure(format!("ファイルが見つかりません: {}", path)));
        }
        let bytes = tokio::fs::read(&file)
            .await
            .with_context(|| format!("Failed to read {}", file.display()))?;
        match String::from_utf8(bytes) {
            Ok(content) => Ok(FileOutcome {
                success: true,
                message: format!("ファイルを読み込みました: {}", path),
                payload: FilePayload::Content { path: self.display(&file), content },
            }),
            Err(_) => Ok(FileOutcome::failure(format!("テキストファイルではありません: {}", path))),
        }
    }

    async fn write(&self, path: &str, content: &str, create_dirs: bool) -> anyhow::Result<FileOutcome> {
        let file = self.resolve(path).await?;
        if let Some(parent) = file.parent() {
            if !tokio::fs::try_exists(parent).await.unwrap_or(false) {
                if !create_dirs {
                    return Ok(FileOutcome::failure(format!("親ディレクトリが存在しません: {}", path)));
                }
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&file, content)
            .await
            .with_context(|| format!("Failed to write {}", file.display()))?;
        Ok(FileOutcome::ok(format!("ファイルを書き込みました: {}", path)))
    }

    async fn mkdir(&self, path: &str, exist_ok: bool) -> anyhow::Result<FileOutcome> {
        let dir = self.resolve(path).await?;
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) && !exist_ok {
            return Ok(FileOutcome::failure(format!("既に存在します: {}", path)));
        }
        tokio::fs::create_dir_all(&dir).await?;
        Ok(FileOutcome::ok(format!("ディレクトリを作成しました: {}", path)))
    }

    async fn delete(&self, path: &str) -> anyhow::Result<FileOutcome> {
        let target = self.resolve(path).await?;
        if target == self.root {
            return Ok(FileOutcome::failure("ルートディレクトリは削除できません"));
        }
        match tokio::fs::metadata(&target).await {
            Ok(m) if m.is_dir() => tokio::fs::remove_dir_all(&target).await?,
            Ok(_) => tokio::fs::remove_file(&target).await?,
            Err(_) => return Ok(FileOutcome::failure(format!("見つかりません: {}", path))),
        }
        Ok(FileOutcome::ok(format!("削除しました: {}", path)))
    }

    async fn move_entry(&self, source: &str, destination: &str) -> anyhow::Result<FileOutcome> {
        let from = self.resolve(source).await?;
        let to = self.resolve(destination).await?;
        if !tokio::fs::try_exists(&from).await.unwrap_or(false) {
            return Ok(FileOutcome::failure(format!("見つかりません: {}", source)));
        }
        tokio::fs::rename(&from, &to).await?;
        Ok(FileOutcome::ok(format!("{} を {} に移動しました", source, destination)))
    }

    async fn copy_entry(&self, source: &str, destination: &str) -> anyhow::Result<FileOutcome> {
        let from = self.resolve(source).await?;
        let to = self.resolve(destination).await?;
        match tokio::fs::metadata(&from).await {
            Ok(m) if m.is_file() => {
                tokio::fs::copy(&from, &to).await?;
                Ok(FileOutcome::ok(format!("{} を {} にコピーしました", source, destination)))
            }
            Ok(_) => Ok(FileOutcome::failure("ディレクトリのコピーには対応していません")),
            Err(_) => Ok(FileOutcome::failure(format!("見つかりません: {}", source))),
        }
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn execute(&self, operation: &FileOperation) -> anyhow::Result<FileOutcome> {
        debug!("Executing file operation: {}", operation.tag());
        match operation {
            FileOperation::List { path } => self.list(path).await,
            FileOperation::Read { path } => self.read(path).await,
            FileOperation::Write { path, content, create_dirs } => self.write(path, content, *create_dirs).await,
            FileOperation::Mkdir { path, exist_ok } => self.mkdir(path, *exist_ok).await,
            FileOperation::Delete { path } => self.delete(path).await,
            FileOperation::Move { source, destination } => self.move_entry(source, destination).await,
            FileOperation::Copy { source, destination } => self.copy_entry(source, destination).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wire(value: serde_json::Value) -> WireParams {
        value.as_object().cloned().unwrap()
    }

    // ===== Wire mapping =====

    #[test]
    fn test_from_wire_accepts_long_tags() {
        let op = FileOperation::from_wire("read_file", &wire(json!({"path": "a.txt"}))).unwrap();
        assert_eq!(op, FileOperation::Read { path: "a.txt".into() });

        let op = FileOperation::from_wire("move_file", &wire(json!({"path": "a", "destination": "b"}))).unwrap();
        assert_eq!(op, FileOperation::Move { source: "a".into(), destination: "b".into() });
    }

    #[test]
    fn test_from_wire_requires_parameters() {
        assert!(FileOperation::from_wire("read", &wire(json!({}))).is_none());
        assert!(FileOperation::from_wire("copy", &wire(json!({"source": "a"}))).is_none());
        assert!(FileOperation::from_wire("format_disk", &wire(json!({}))).is_none());
        assert_eq!(
            FileOperation::from_wire("list_files", &wire(json!({}))),
            Some(FileOperation::List { path: String::new() })
        );
    }

    // ===== Local store =====

    #[tokio::test]
    async fn test_write_read_list_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());

        let outcome = store
            .execute(&FileOperation::Write { path: "notes/a.txt".into(), content: "hello".into(), create_dirs: true })
            .await
            .unwrap();
        assert!(outcome.success);

        let outcome = store.execute(&FileOperation::Read { path: "notes/a.txt".into() }).await.unwrap();
        assert_eq!(outcome.payload, FilePayload::Content { path: "notes/a.txt".into(), content: "hello".into() });

        store.execute(&FileOperation::Mkdir { path: "notes/sub".into(), exist_ok: false }).await.unwrap();
        let outcome = store.execute(&FileOperation::List { path: "notes".into() }).await.unwrap();
        match outcome.payload {
            FilePayload::Listing { entries, .. } => {
                assert_eq!(entries[0], FileEntry { name: "sub".into(), is_dir: true, size: None });
                assert_eq!(entries[1], FileEntry { name: "a.txt".into(), is_dir: false, size: Some(5) });
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_without_parent_fails_in_band() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());
        let outcome = store
            .execute(&FileOperation::Write { path: "missing/a.txt".into(), content: "x".into(), create_dirs: false })
            .await
            .unwrap();
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn test_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());
        assert!(store.execute(&FileOperation::Read { path: "../etc/passwd".into() }).await.is_err());
        assert!(store.execute(&FileOperation::Read { path: "/etc/passwd".into() }).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_out_of_root_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        tokio::fs::write(outside.path().join("secret.txt"), "secret").await.unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("escape")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("gone.txt"), root.path().join("dangling")).unwrap();
        tokio::fs::create_dir(root.path().join("docs")).await.unwrap();
        std::os::unix::fs::symlink(root.path().join("docs"), root.path().join("alias")).unwrap();
        let store = LocalFileStore::new(root.path());

        assert!(store.execute(&FileOperation::Read { path: "escape/secret.txt".into() }).await.is_err());
        assert!(store.execute(&FileOperation::List { path: "escape".into() }).await.is_err());
        let write = FileOperation::Write { path: "escape/new.txt".into(), content: "x".into(), create_dirs: true };
        assert!(store.execute(&write).await.is_err());
        let write = FileOperation::Write { path: "dangling".into(), content: "x".into(), create_dirs: false };
        assert!(store.execute(&write).await.is_err());
        assert!(!outside.path().join("new.txt").exists());
        assert!(!outside.path().join("gone.txt").exists());

        // links that stay inside the root keep working
        let write = FileOperation::Write { path: "alias/inside.txt".into(), content: "ok".into(), create_dirs: false };
        assert!(store.execute(&write).await.unwrap().success);
        assert!(root.path().join("docs/inside.txt").exists());
    }

    #[tokio::test]
    async fn test_copy_move_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());
        tokio::fs::write(dir.path().join("a.txt"), "data").await.unwrap();

        assert!(store.execute(&FileOperation::Copy { source: "a.txt".into(), destination: "b.txt".into() }).await.unwrap().success);
        assert!(store.execute(&FileOperation::Move { source: "b.txt".into(), destination: "c.txt".into() }).await.unwrap().success);
        assert!(!dir.path().join("b.txt").exists());
        assert!(store.execute(&FileOperation::Delete { path: "c.txt".into() }).await.unwrap().success);
        assert!(!store.execute(&FileOperation::Delete { path: "c.txt".into() }).await.unwrap().success);
        assert!(!store.execute(&FileOperation::Delete { path: ".".into() }).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_binary_file_is_not_read() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("bin"), [0xff, 0xfe, 0x00]).await.unwrap();
        let store = LocalFileStore::new(dir.path());
        assert!(!store.execute(&FileOperation::Read { path: "bin".into() }).await.unwrap().success);
    }
}
