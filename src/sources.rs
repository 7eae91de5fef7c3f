//! Input discovery.
//!
//! Resolves the input path through [`Storage`], parses every supported file
//! with the [`ParserRegistry`], and joins the results into the single
//! canonical text the pipeline works on. Each file's share of the global
//! word positions is recorded as a [`SourceSpan`] so output can map a
//! position back to `(file_id, file_position)`.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::models::{FileMetadata, SourceSpan};
use crate::parser::ParserRegistry;
use crate::storage::{parent_dir, Storage};

/// Separator placed between the texts of consecutive files.
pub const FILE_SEPARATOR: &str = "\n\n";

/// One parsed input file.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFile {
    pub path: String,
    pub id: String,
    pub format_metadata: BTreeMap<String, String>,
}

/// Where the canonical text came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceMap {
    /// Input path as given.
    pub root: String,
    pub files: Vec<SourceFile>,
    /// One span per file, in concatenation order.
    pub spans: Vec<SourceSpan>,
}

impl SourceMap {
    /// File id and file-relative word position for global word `position`.
    pub fn locate(&self, position: usize) -> Option<(&str, usize)> {
        let idx = self
            .spans
            .partition_point(|s| s.word_start + s.word_count <= position);
        let span = self.spans.get(idx)?;
        (position >= span.word_start)
            .then(|| (span.file_id.as_str(), position - span.word_start))
    }
}

/// Canonical text plus its provenance.
#[derive(Debug, Clone, Default)]
pub struct LoadedInput {
    pub content: String,
    pub sources: SourceMap,
}

/// First 12 hex chars of SHA-256 over the path and its mtime (unix seconds).
pub fn file_id(path: &str, modified: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(modified.timestamp().to_string().as_bytes());
    hex::encode(hasher.finalize())[..12].to_string()
}

fn build_extension_globset(registry: &ParserRegistry) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for ext in registry.extensions() {
        let glob = GlobBuilder::new(&format!("*{}", ext))
            .case_insensitive(true)
            .build()?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

/// Supported files under `input`, sorted by path.
///
/// A file input yields itself. A directory yields its direct children, or
/// every descendant when `recursive` is set.
pub async fn discover(
    storage: &dyn Storage,
    registry: &ParserRegistry,
    input: &str,
    recursive: bool,
) -> Result<Vec<String>, PipelineError> {
    let access = |source: anyhow::Error| PipelineError::InputAccess {
        path: input.to_string(),
        source,
    };

    if !storage.exists(input).await.map_err(access)? {
        return Err(access(anyhow::anyhow!("{} does not exist", input)));
    }

    if !storage.is_directory(input).await.map_err(access)? {
        if !registry.is_supported(input) {
            return Err(PipelineError::UnsupportedFormat(input.to_string()));
        }
        return Ok(vec![input.to_string()]);
    }

    let supported = build_extension_globset(registry).map_err(access)?;
    let root = input.trim_matches('/');
    let mut paths: Vec<String> = storage
        .list(input)
        .await
        .map_err(access)?
        .into_iter()
        .filter(|p| supported.is_match(crate::storage::base_name(p)))
        .filter(|p| recursive || parent_dir(p).trim_matches('/') == root)
        .collect();
    paths.sort();

    debug!(input, files = paths.len(), recursive, "Discovered input files");
    Ok(paths)
}

async fn parse_file(
    storage: &dyn Storage,
    registry: &ParserRegistry,
    path: &str,
) -> Result<(String, BTreeMap<String, String>), PipelineError> {
    let mut parser = registry
        .for_path(path)
        .map_err(|_| PipelineError::UnsupportedFormat(path.to_string()))?;
    let bytes = storage
        .read(path)
        .await
        .map_err(|source| PipelineError::InputAccess {
            path: path.to_string(),
            source,
        })?;

    let owned_path = path.to_string();
    tokio::task::spawn_blocking(move || {
        let text = parser
            .parse(&mut bytes.as_slice())
            .with_context(|| format!("Failed to parse {}", owned_path))?;
        Ok::<_, anyhow::Error>((
            String::from_utf8_lossy(&text).into_owned(),
            parser.format_metadata(),
        ))
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))
    .and_then(|r| r)
    .map_err(|source| PipelineError::InputAccess {
        path: path.to_string(),
        source,
    })
}

/// Discover, parse, and concatenate the input.
///
/// A single-file input that fails to parse is an error; inside a directory
/// the broken file is skipped with a warning.
pub async fn load_input(
    storage: &dyn Storage,
    registry: &ParserRegistry,
    input: &str,
    recursive: bool,
) -> Result<LoadedInput, PipelineError> {
    let paths = discover(storage, registry, input, recursive).await?;
    let single = paths.len() == 1 && paths[0] == input;

    let mut loaded = LoadedInput {
        content: String::new(),
        sources: SourceMap {
            root: input.to_string(),
            ..SourceMap::default()
        },
    };
    let mut word_start = 0usize;

    for path in paths {
        let (text, format_metadata) = match parse_file(storage, registry, &path).await {
            Ok(parsed) => parsed,
            Err(e) if !single => {
                warn!(path = %path, error = %e, "Skipping unreadable input file");
                continue;
            }
            Err(e) => return Err(e),
        };

        let modified = storage
            .stat(&path)
            .await
            .map(|info| info.modified)
            .map_err(|source| PipelineError::InputAccess {
                path: path.clone(),
                source,
            })?;
        let id = file_id(&path, modified);
        let word_count = text.split_whitespace().count();

        if !loaded.sources.files.is_empty() {
            loaded.content.push_str(FILE_SEPARATOR);
        }
        loaded.content.push_str(&text);
        loaded.sources.spans.push(SourceSpan {
            file_id: id.clone(),
            word_start,
            word_count,
        });
        loaded.sources.files.push(SourceFile {
            path,
            id,
            format_metadata,
        });
        word_start += word_count;
    }

    info!(
        input,
        files = loaded.sources.files.len(),
        words = word_start,
        "Loaded input"
    );
    Ok(loaded)
}

/// Describe `path` for the metadata manifest. File contents are hashed by
/// streaming through [`Storage::get_reader`]; directories get a zero hash.
pub async fn describe_file(
    storage: &dyn Storage,
    path: &str,
    format_metadata: BTreeMap<String, String>,
) -> Result<FileMetadata> {
    let info = storage
        .stat(path)
        .await
        .with_context(|| format!("Failed to stat {}", path))?;

    let sha256 = if info.is_dir {
        "0".repeat(64)
    } else {
        let mut reader = storage.get_reader(path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .with_context(|| format!("Failed to read {}", path))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        hex::encode(hasher.finalize())
    };

    Ok(FileMetadata {
        id: file_id(path, info.modified),
        path: path.to_string(),
        directory: parent_dir(path).to_string(),
        modified: info.modified,
        size: info.size,
        sha256,
        format_metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_fs::LocalStorage;
    use chrono::TimeZone;

    fn write(dir: &std::path::Path, rel: &str, body: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn file_id_is_short_hash() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let id = file_id("docs/a.txt", t);
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, file_id("docs/a.txt", t));
        assert_ne!(id, file_id("docs/b.txt", t));
    }

    #[test]
    fn locate_maps_to_file_positions() {
        let map = SourceMap {
            root: "in".into(),
            files: vec![],
            spans: vec![
                SourceSpan {
                    file_id: "a".into(),
                    word_start: 0,
                    word_count: 3,
                },
                SourceSpan {
                    file_id: "empty".into(),
                    word_start: 3,
                    word_count: 0,
                },
                SourceSpan {
                    file_id: "b".into(),
                    word_start: 3,
                    word_count: 2,
                },
            ],
        };
        assert_eq!(map.locate(0), Some(("a", 0)));
        assert_eq!(map.locate(2), Some(("a", 2)));
        assert_eq!(map.locate(3), Some(("b", 0)));
        assert_eq!(map.locate(4), Some(("b", 1)));
        assert_eq!(map.locate(5), None);
    }

    #[tokio::test]
    async fn directory_discovery_filters_and_sorts() {
        let tmp = tempfile::TempDir::new().unwrap();
        write(tmp.path(), "b.txt", "bee");
        write(tmp.path(), "a.MD", "# A");
        write(tmp.path(), "skip.png", "x");
        write(tmp.path(), "nested/c.txt", "sea");
        let root = tmp.path().to_string_lossy().to_string();
        let registry = ParserRegistry::default();

        let flat = discover(&LocalStorage::new(), &registry, &root, false)
            .await
            .unwrap();
        let names: Vec<&str> = flat.iter().map(|p| crate::storage::base_name(p)).collect();
        assert_eq!(names, vec!["a.MD", "b.txt"]);

        let deep = discover(&LocalStorage::new(), &registry, &root, true)
            .await
            .unwrap();
        assert_eq!(deep.len(), 3);
    }

    #[tokio::test]
    async fn single_file_errors() {
        let tmp = tempfile::TempDir::new().unwrap();
        write(tmp.path(), "x.png", "x");
        let registry = ParserRegistry::default();
        let storage = LocalStorage::new();

        let png = tmp.path().join("x.png").to_string_lossy().to_string();
        assert!(matches!(
            discover(&storage, &registry, &png, false).await,
            Err(PipelineError::UnsupportedFormat(_))
        ));
        let missing = tmp.path().join("nope.txt").to_string_lossy().to_string();
        assert!(matches!(
            discover(&storage, &registry, &missing, false).await,
            Err(PipelineError::InputAccess { .. })
        ));
    }

    #[tokio::test]
    async fn load_concatenates_with_spans() {
        let tmp = tempfile::TempDir::new().unwrap();
        write(tmp.path(), "1.txt", "alpha beta");
        write(tmp.path(), "2.txt", "gamma delta epsilon");
        let root = tmp.path().to_string_lossy().to_string();

        let loaded = load_input(&LocalStorage::new(), &ParserRegistry::default(), &root, false)
            .await
            .unwrap();
        assert_eq!(loaded.content, "alpha beta\n\ngamma delta epsilon");
        assert_eq!(loaded.sources.files.len(), 2);
        assert_eq!(loaded.sources.spans[1].word_start, 2);
        assert_eq!(loaded.sources.spans[1].word_count, 3);
        assert_ne!(loaded.sources.files[0].id, loaded.sources.files[1].id);
    }

    #[tokio::test]
    async fn describe_hashes_contents() {
        let tmp = tempfile::TempDir::new().unwrap();
        write(tmp.path(), "a.txt", "abc");
        let storage = LocalStorage::new();
        let path = tmp.path().join("a.txt").to_string_lossy().to_string();

        let meta = describe_file(&storage, &path, BTreeMap::new()).await.unwrap();
        assert_eq!(
            meta.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(meta.size, 3);

        let dir = tmp.path().to_string_lossy().to_string();
        let meta = describe_file(&storage, &dir, BTreeMap::new()).await.unwrap();
        assert_eq!(meta.sha256, "0".repeat(64));
    }
}
