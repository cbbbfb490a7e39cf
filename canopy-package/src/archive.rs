//! Distributable plugin archives (zip).
//!
//! An archive holds at least one `manifest.json` and the file its `entry`
//! names, at any nesting depth. When several manifests exist the shallowest
//! one wins, even over a shorter path that sits deeper; equal depths go to
//! the shorter path, then the lexicographically smaller one. The entry path
//! is resolved relative to the manifest's directory.

use std::collections::BTreeMap;
use std::io::{Read, Seek, Write};

use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::entry::EntrySource;
use crate::manifest::PluginManifest;
use crate::PackageError;

pub const MANIFEST_FILE: &str = "manifest.json";
const MACOS_METADATA_PREFIX: &str = "__MACOSX/";

/// A plugin extracted from an archive: validated manifest plus entry code.
#[derive(Debug, Clone)]
pub struct PluginArchive {
    pub manifest: PluginManifest,
    pub entry_source: EntrySource,
    /// Archive path of the manifest that was selected.
    pub manifest_path: String,
    /// Archive path the entry was read from.
    pub entry_path: String,
}

impl PluginArchive {
    /// Opens an archive, selects its manifest and reads the entry file.
    pub fn open<R: Read + Seek>(reader: R) -> Result<Self, PackageError> {
        let mut archive = ZipArchive::new(reader)?;

        let mut files: BTreeMap<String, usize> = BTreeMap::new();
        for i in 0..archive.len() {
            let file = archive.by_index(i)?;
            if file.is_dir() {
                continue;
            }
            let Some(name) = normalize(file.name()) else {
                continue;
            };
            if name.starts_with(MACOS_METADATA_PREFIX) {
                continue;
            }
            files.insert(name, i);
        }

        let manifest_path = files
            .keys()
            .filter(|name| file_name(name) == MANIFEST_FILE)
            // Depth first, then path length, then name.
            .min_by(|a, b| {
                depth(a)
                    .cmp(&depth(b))
                    .then(a.len().cmp(&b.len()))
                    .then(a.cmp(b))
            })
            .cloned()
            .ok_or(PackageError::ManifestNotFound)?;

        let manifest_bytes = read_entry(&mut archive, files[&manifest_path])?;
        let manifest = PluginManifest::from_json(&manifest_bytes)?;

        let entry_path = resolve_relative(parent_dir(&manifest_path), &manifest.entry)
            .ok_or_else(|| {
                PackageError::ManifestInvalid(format!(
                    "entry '{}' escapes the archive root",
                    manifest.entry
                ))
            })?;
        let index = *files
            .get(&entry_path)
            .ok_or_else(|| PackageError::EntryNotFound(entry_path.clone()))?;
        let entry_bytes = read_entry(&mut archive, index)?;
        let entry_source = EntrySource::from_bytes(entry_bytes).ok_or_else(|| {
            PackageError::EntryUnreadable {
                path: entry_path.clone(),
            }
        })?;

        Ok(Self {
            manifest,
            entry_source,
            manifest_path,
            entry_path,
        })
    }

    /// Opens an archive held in memory.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PackageError> {
        Self::open(std::io::Cursor::new(bytes))
    }
}

fn read_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    index: usize,
) -> Result<Vec<u8>, PackageError> {
    let mut file = archive.by_index(index)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    Ok(data)
}

/// Canonical archive path: forward slashes, no leading `/`, no `.` segments.
/// Returns `None` for paths that climb above the root.
fn normalize(path: &str) -> Option<String> {
    resolve_relative("", path)
}

fn resolve_relative(base_dir: &str, relative: &str) -> Option<String> {
    let mut segments: Vec<&str> = base_dir.split('/').filter(|s| !s.is_empty()).collect();
    for segment in relative.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }
    Some(segments.join("/"))
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

fn file_name(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, name)| name).unwrap_or(path)
}

fn depth(path: &str) -> usize {
    path.matches('/').count()
}

/// Fluent builder for plugin archives.
pub struct ArchiveBuilder {
    files: Vec<(String, Vec<u8>)>,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self { files: Vec::new() }
    }

    /// Adds `manifest.json` (pretty JSON) at `dir` (empty for the root).
    pub fn manifest(self, dir: &str, manifest: &PluginManifest) -> Result<Self, PackageError> {
        let json = serde_json::to_vec_pretty(manifest)?;
        Ok(self.file(&join(dir, MANIFEST_FILE), json))
    }

    pub fn file(mut self, path: &str, data: impl Into<Vec<u8>>) -> Self {
        self.files.push((path.to_string(), data.into()));
        self
    }

    /// Builds the zip archive and returns the raw bytes.
    pub fn build(self) -> Result<Vec<u8>, PackageError> {
        let buf = std::io::Cursor::new(Vec::new());
        let mut zip = ZipWriter::new(buf);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        for (path, data) in &self.files {
            zip.start_file(path.as_str(), options)?;
            zip.write_all(data)?;
        }

        let cursor = zip.finish()?;
        Ok(cursor.into_inner())
    }
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn join(dir: &str, name: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}
