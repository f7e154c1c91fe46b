// src/filestore/security.rs
// Path sandboxing and per-session access control

use crate::error::{AgentError, Result};
use crate::filestore::types::{FileCategory, FileRef};
use std::path::{Component, Path, PathBuf};

/// Validate a file_id before it touches the filesystem.
///
/// Rejects path separators, traversal sequences, NUL/CR/LF, and empty ids.
pub fn validate_file_id(file_id: &str) -> Result<()> {
    if file_id.is_empty() {
        return Err(AgentError::PathViolation("empty file_id".to_string()));
    }
    if file_id.contains('/') || file_id.contains('\\') {
        return Err(AgentError::PathViolation(format!(
            "file_id contains path separator: {}",
            file_id
        )));
    }
    if file_id.contains("..") {
        return Err(AgentError::PathViolation(format!(
            "file_id contains traversal sequence: {}",
            file_id
        )));
    }
    if file_id.contains('\0') || file_id.contains('\n') || file_id.contains('\r') {
        return Err(AgentError::PathViolation(
            "file_id contains control bytes".to_string(),
        ));
    }
    Ok(())
}

/// Resolve `(category, file_id)` to a filesystem path under `base_dir`.
///
/// The category directory is canonicalized and the final path is verified to
/// be a strict descendant of it, so symlinked or crafted ids cannot escape.
pub fn resolve_path(base_dir: &Path, category: FileCategory, file_id: &str) -> Result<PathBuf> {
    resolve_in_dir(&base_dir.join(category.dir_name()), file_id)
}

/// Resolve a scoped path `<category dir>/<scope>/<file_id>` (session-nested
/// categories such as checkpoints). Scope and id each pass the same
/// validation as a bare file_id.
pub fn resolve_scoped_path(
    base_dir: &Path,
    category: FileCategory,
    scope: &str,
    file_id: &str,
) -> Result<PathBuf> {
    validate_file_id(scope)?;
    resolve_in_dir(&base_dir.join(category.dir_name()).join(scope), file_id)
}

fn resolve_in_dir(dir: &Path, file_id: &str) -> Result<PathBuf> {
    validate_file_id(file_id)?;

    std::fs::create_dir_all(dir)?;
    let category_resolved = dir
        .canonicalize()
        .map_err(|e| AgentError::PathViolation(format!("cannot resolve category dir: {}", e)))?;

    let candidate = category_resolved.join(file_id);

    // The joined path must stay lexically clean and inside the category dir.
    for component in candidate.components() {
        if matches!(component, Component::ParentDir) {
            return Err(AgentError::PathViolation(format!(
                "traversal in resolved path for {}",
                file_id
            )));
        }
    }
    if !candidate.starts_with(&category_resolved) || candidate == category_resolved {
        return Err(AgentError::PathViolation(format!(
            "path escapes category directory: {}",
            file_id
        )));
    }

    // If the target already exists, resolve symlinks and re-check.
    if candidate.exists() {
        let resolved = candidate
            .canonicalize()
            .map_err(|e| AgentError::PathViolation(format!("cannot resolve path: {}", e)))?;
        if !resolved.starts_with(&category_resolved) {
            return Err(AgentError::PathViolation(format!(
                "symlink escapes category directory: {}",
                file_id
            )));
        }
        return Ok(resolved);
    }

    Ok(candidate)
}

/// Session-scoped access control over FileRefs.
///
/// A caller may read a ref iff the category is globally readable (memory),
/// the ref belongs to the caller's session, or the ref has no recorded
/// session and the category is chart/cache. Delete authority matches read
/// authority.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileAccessControl;

impl FileAccessControl {
    pub fn can_access(&self, file_ref: &FileRef, session_id: &str) -> bool {
        match file_ref.category {
            FileCategory::Memory => true,
            FileCategory::Chart | FileCategory::Cache => match &file_ref.session_id {
                Some(owner) => owner == session_id,
                None => true,
            },
            _ => file_ref
                .session_id
                .as_deref()
                .is_some_and(|owner| owner == session_id),
        }
    }

    pub fn can_delete(&self, file_ref: &FileRef, session_id: &str) -> bool {
        self.can_access(file_ref, session_id)
    }

    pub fn filter_accessible<'a>(
        &self,
        refs: impl IntoIterator<Item = &'a FileRef>,
        session_id: &str,
    ) -> Vec<&'a FileRef> {
        refs.into_iter()
            .filter(|r| self.can_access(r, session_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_ref(category: FileCategory, session_id: Option<&str>) -> FileRef {
        FileRef {
            file_id: "f1".to_string(),
            category,
            session_id: session_id.map(String::from),
            size_bytes: 0,
            hash: String::new(),
            mime_type: String::new(),
            created_at: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_validate_rejects_separators() {
        assert!(validate_file_id("a/b").is_err());
        assert!(validate_file_id("a\\b").is_err());
    }

    #[test]
    fn test_validate_rejects_traversal_and_control() {
        assert!(validate_file_id("..").is_err());
        assert!(validate_file_id("a..b").is_err());
        assert!(validate_file_id("a\0b").is_err());
        assert!(validate_file_id("a\nb").is_err());
        assert!(validate_file_id("a\rb").is_err());
        assert!(validate_file_id("").is_err());
    }

    #[test]
    fn test_validate_accepts_normal_ids() {
        assert!(validate_file_id("550e8400e29b41d4a716446655440000").is_ok());
        assert!(validate_file_id("report-2024.xlsx").is_ok());
    }

    #[test]
    fn test_resolve_path_stays_inside_category() {
        let dir = tempfile::tempdir().unwrap();
        let path = resolve_path(dir.path(), FileCategory::Artifact, "file1").unwrap();
        assert!(path.starts_with(dir.path().join("artifacts").canonicalize().unwrap()));
    }

    #[test]
    fn test_resolve_path_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_path(dir.path(), FileCategory::Artifact, "../etc/passwd");
        assert!(matches!(err, Err(AgentError::PathViolation(_))));
    }

    #[test]
    fn test_resolve_scoped_path_nests_under_scope() {
        let dir = tempfile::tempdir().unwrap();
        let path =
            resolve_scoped_path(dir.path(), FileCategory::Checkpoint, "sess1", "plan.json")
                .unwrap();
        let scope_dir = dir
            .path()
            .join("temp/checkpoints/sess1")
            .canonicalize()
            .unwrap();
        assert!(path.starts_with(&scope_dir));
    }

    #[test]
    fn test_resolve_scoped_path_validates_both_components() {
        let dir = tempfile::tempdir().unwrap();
        for (scope, name) in [
            ("../escape", "plan.json"),
            ("sess1", "../escape.json"),
            ("a/b", "plan.json"),
            ("sess1", "a\\b.json"),
            ("", "plan.json"),
            ("sess1", ""),
        ] {
            let err = resolve_scoped_path(dir.path(), FileCategory::Checkpoint, scope, name);
            assert!(
                matches!(err, Err(AgentError::PathViolation(_))),
                "{}/{}",
                scope,
                name
            );
        }
    }

    #[test]
    fn test_access_memory_is_global() {
        let ctl = FileAccessControl;
        let r = make_ref(FileCategory::Memory, None);
        assert!(ctl.can_access(&r, "anyone"));
    }

    #[test]
    fn test_access_session_owned() {
        let ctl = FileAccessControl;
        let r = make_ref(FileCategory::Upload, Some("s1"));
        assert!(ctl.can_access(&r, "s1"));
        assert!(!ctl.can_access(&r, "s2"));
    }

    #[test]
    fn test_access_sessionless_upload_denied() {
        let ctl = FileAccessControl;
        let r = make_ref(FileCategory::Upload, None);
        assert!(!ctl.can_access(&r, "s1"));
    }

    #[test]
    fn test_access_sessionless_chart_and_cache_allowed() {
        let ctl = FileAccessControl;
        assert!(ctl.can_access(&make_ref(FileCategory::Chart, None), "s1"));
        assert!(ctl.can_access(&make_ref(FileCategory::Cache, None), "s1"));
        // But session-scoped chart/cache refs stay private
        assert!(!ctl.can_access(&make_ref(FileCategory::Chart, Some("s2")), "s1"));
    }

    #[test]
    fn test_delete_matches_read() {
        let ctl = FileAccessControl;
        let r = make_ref(FileCategory::Report, Some("s1"));
        assert_eq!(ctl.can_access(&r, "s1"), ctl.can_delete(&r, "s1"));
        assert_eq!(ctl.can_access(&r, "s2"), ctl.can_delete(&r, "s2"));
    }
}
