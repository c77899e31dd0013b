//! Steam library registry editing.
//!
//! Steam keeps its list of game libraries in `libraryfolders.vdf`, a
//! brace-delimited KeyValues text file with one numbered block per library.
//! Every library folder carries its own `libraryfolder.vdf` with a single
//! `"libraryfolder"` block. Registering a mounted drive means copying that
//! block into the registry under the next free index, together with the
//! drive's path.
//!
//! Appending is a text splice: everything before the registry's last closing
//! brace is kept byte-for-byte. Reading the registry for display uses the
//! `keyvalues-serde` crate.
//!
//! The registry is not locked while it is edited. Steam must not be running;
//! [`SteamControl`] stops and relaunches it around an edit.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, IoResultExt, Result};

/// File name of the per-library metadata file at the root of a library folder.
pub const LIBRARY_METADATA_FILE: &str = "libraryfolder.vdf";

/// Key of the block inside [`LIBRARY_METADATA_FILE`].
const METADATA_KEY: &str = "\"libraryfolder\"";

/// Represents a Steam library folder entry.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LibraryFolder {
    /// Path to the library folder.
    pub path: PathBuf,
    /// Optional label for the library.
    #[serde(default)]
    pub label: String,
    /// Content ID (typically "0" for custom folders).
    #[serde(default)]
    pub contentid: String,
    /// Total size (typically "0" for custom folders).
    #[serde(default)]
    pub totalsize: String,
    /// Map of app IDs to sizes.
    #[serde(default)]
    pub apps: HashMap<String, String>,
}

/// Root structure for libraryfolders.vdf.
#[derive(Debug, Deserialize)]
struct LibraryFoldersRoot {
    #[serde(flatten)]
    folders: HashMap<String, LibraryFolder>,
}

/// Returns the path to Steam's libraryfolders.vdf file.
pub fn steam_library_vdf_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or(Error::HomeDirNotFound)?;
    let vdf_path = home
        .join(".local")
        .join("share")
        .join("Steam")
        .join("steamapps")
        .join("libraryfolders.vdf");

    if !vdf_path.exists() {
        return Err(Error::SteamVdfNotFound {
            path: vdf_path.clone(),
        });
    }

    Ok(vdf_path)
}

/// Starting and stopping the Steam client around registry edits.
///
/// Steam rewrites `libraryfolders.vdf` when it exits, so an entry appended
/// while it runs is lost.
pub trait SteamControl {
    fn is_running(&self) -> bool;

    /// Stops Steam and waits until the process is gone.
    fn shutdown(&self) -> Result<()>;

    /// Launches Steam in the background.
    fn start(&self) -> Result<()>;
}

/// [`SteamControl`] backed by `pgrep` and the `steam` launcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct SteamCommands;

impl SteamControl for SteamCommands {
    fn is_running(&self) -> bool {
        is_steam_running()
    }

    fn shutdown(&self) -> Result<()> {
        shutdown_steam()
    }

    fn start(&self) -> Result<()> {
        start_steam()
    }
}

/// Checks if Steam is currently running.
pub fn is_steam_running() -> bool {
    Command::new("pgrep")
        .args(["-x", "steam"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Shuts down Steam gracefully.
///
/// Sends `steam --shutdown` and polls until the process has exited.
pub fn shutdown_steam() -> Result<()> {
    if !is_steam_running() {
        return Ok(());
    }

    let output = Command::new("steam")
        .arg("--shutdown")
        .output()
        .command_context("steam --shutdown")?;

    thread::sleep(Duration::from_secs(3));

    for _ in 0..10 {
        if !is_steam_running() {
            info!("Steam shut down");
            return Ok(());
        }
        thread::sleep(Duration::from_millis(500));
    }

    // Steam --shutdown often exits non-zero even when it worked
    let stderr = String::from_utf8_lossy(&output.stderr);
    let message = if output.status.success() || stderr.trim().is_empty() {
        "Steam did not shut down within timeout".to_string()
    } else {
        stderr.trim().to_string()
    };
    Err(Error::SteamProcess { message })
}

/// Launches Steam without waiting for it.
pub fn start_steam() -> Result<()> {
    Command::new("steam").spawn().command_context("steam")?;
    info!("Steam restarted");
    Ok(())
}

/// Returns the path of the metadata file for a candidate library folder.
pub fn library_metadata_path(library_folder: &Path) -> PathBuf {
    library_folder.join(LIBRARY_METADATA_FILE)
}

/// Returns true if the folder looks like a Steam library.
pub fn has_library_metadata(library_folder: &Path) -> bool {
    library_metadata_path(library_folder).is_file()
}

/// Builds the registry block for `library_folder` under `index`.
///
/// The fields of the folder's `"libraryfolder"` block are copied and a `"path"`
/// field is appended before the closing brace.
pub fn build_entry_block(library_folder: &Path, index: u32) -> Result<String> {
    let metadata_path = library_metadata_path(library_folder);
    let metadata = fs::read_to_string(&metadata_path).vdf_read_context(&metadata_path)?;

    render_entry(&metadata, &library_folder.to_string_lossy(), index).map_err(|message| {
        Error::MalformedMetadata {
            path: metadata_path,
            message,
        }
    })
}

/// Registers `library_folder` in the registry at `registry_path`.
///
/// Returns the index the new entry was written under.
pub fn append_library(registry_path: &Path, library_folder: &Path) -> Result<u32> {
    let content = fs::read_to_string(registry_path).vdf_read_context(registry_path)?;

    let index = next_library_index(&content);
    let block = build_entry_block(library_folder, index)?;

    let output = splice_entry(&content, &block).ok_or_else(|| Error::InvalidRegistryFormat {
        path: registry_path.to_path_buf(),
        message: "could not find closing brace".to_string(),
    })?;

    fs::write(registry_path, output).vdf_write_context(registry_path)?;

    info!(
        registry = %registry_path.display(),
        library = %library_folder.display(),
        index,
        "library folder registered"
    );
    Ok(index)
}

/// Returns one more than the highest top-level numeric key, or 0 if there is none.
///
/// A key line is a line holding only a quoted integer, directly inside the
/// root block.
pub fn next_library_index(registry: &str) -> u32 {
    let mut depth = 0usize;
    let mut highest: Option<u32> = None;

    for line in registry.lines() {
        let line = line.trim();
        match line {
            "{" => depth += 1,
            "}" => depth = depth.saturating_sub(1),
            _ if depth == 1 => {
                if let Some(index) = parse_index_key(line) {
                    highest = Some(highest.map_or(index, |h| h.max(index)));
                }
            }
            _ => {}
        }
    }

    highest.map_or(0, |h| h + 1)
}

fn parse_index_key(line: &str) -> Option<u32> {
    let inner = line.strip_prefix('"')?.strip_suffix('"')?;
    if inner.is_empty() || !inner.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    inner.parse().ok()
}

/// Re-keys the `"libraryfolder"` block of `metadata` under `index`.
fn render_entry(
    metadata: &str,
    library_path: &str,
    index: u32,
) -> std::result::Result<String, String> {
    let key_pos = metadata
        .find(METADATA_KEY)
        .ok_or_else(|| format!("missing {} key", METADATA_KEY))?;
    let after_key = key_pos + METADATA_KEY.len();

    let open = metadata[after_key..]
        .find(|c: char| !c.is_whitespace())
        .map(|offset| after_key + offset)
        .filter(|&pos| metadata.as_bytes()[pos] == b'{')
        .ok_or_else(|| format!("expected '{{' after {}", METADATA_KEY))?;

    let close = find_matching_brace(metadata, open)
        .ok_or_else(|| "missing closing brace for libraryfolder block".to_string())?;

    let mut block = format!("\t\"{}\"\n\t{{\n", index);
    let mut depth = 0usize;
    for line in metadata[open + 1..close].lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('}') {
            depth = depth.saturating_sub(1);
        }
        block.push_str("\t\t");
        block.push_str(&"\t".repeat(depth));
        block.push_str(line);
        block.push('\n');
        if line.ends_with('{') {
            depth += 1;
        }
    }
    block.push_str(&format!("\t\t\"path\"\t\t\"{}\"\n", escape_vdf(library_path)));
    block.push_str("\t}");

    Ok(block)
}

/// Finds the brace closing the one at `open`, skipping quoted strings.
fn find_matching_brace(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut escaped = false;

    for (pos, byte) in text.bytes().enumerate().skip(open) {
        if in_quotes {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_quotes = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_quotes = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(pos);
                }
            }
            _ => {}
        }
    }
    None
}

/// Inserts `block` before the last closing brace of `content`.
fn splice_entry(content: &str, block: &str) -> Option<String> {
    let last_brace = content.rfind('}')?;
    let (before, after) = content.split_at(last_brace);

    let mut output = String::with_capacity(content.len() + block.len() + 2);
    output.push_str(before);
    if !before.ends_with('\n') {
        output.push('\n');
    }
    output.push_str(block);
    output.push('\n');
    output.push_str(after);
    Some(output)
}

/// Escapes backslashes and quotes for a VDF string value.
fn escape_vdf(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Copies the registry to `<path>.backup.<unix-seconds>` and returns the backup path.
pub fn backup_registry(path: &Path) -> Result<PathBuf> {
    let timestamp = chrono_lite_timestamp();
    let backup_path = PathBuf::from(format!("{}.backup.{}", path.display(), timestamp));

    fs::copy(path, &backup_path).backup_context(&backup_path)?;

    Ok(backup_path)
}

/// Simple timestamp without external dependencies.
fn chrono_lite_timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    format!("{}", duration.as_secs())
}

/// Parses the libraryfolders.vdf file.
pub fn parse_library_folders(path: &Path) -> Result<Vec<(String, LibraryFolder)>> {
    let content = fs::read_to_string(path).vdf_read_context(path)?;

    parse_library_folders_content(&content)
}

/// Parses libraryfolders.vdf content.
fn parse_library_folders_content(content: &str) -> Result<Vec<(String, LibraryFolder)>> {
    let root: LibraryFoldersRoot =
        keyvalues_serde::from_str(content).map_err(|e| Error::VdfParse {
            message: format!("Failed to parse VDF: {}", e),
        })?;

    // Filter to only numeric IDs (actual library folders) and sort by ID
    let mut folders: Vec<(String, LibraryFolder)> = root
        .folders
        .into_iter()
        .filter(|(id, _)| id.chars().all(|c| c.is_ascii_digit()))
        .collect();

    folders.sort_by(|(a, _), (b, _)| {
        a.parse::<u32>()
            .unwrap_or(0)
            .cmp(&b.parse::<u32>().unwrap_or(0))
    });

    Ok(folders)
}

/// Returns true if the registry already lists `library_folder`.
pub fn is_library_registered(registry_path: &Path, library_folder: &Path) -> Result<bool> {
    Ok(parse_library_folders(registry_path)?
        .iter()
        .any(|(_, folder)| folder.path == library_folder))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE_VDF: &str = r#""libraryfolders"
{
	"0"
	{
		"path"		"/home/deck/.local/share/Steam"
		"label"		""
		"contentid"		"1234567890"
		"totalsize"		"0"
		"apps"
		{
			"730"		"12345678"
			"440"		"87654321"
		}
	}
	"1"
	{
		"path"		"/run/media/mmcblk0p1"
		"label"		"SD Card"
		"contentid"		"0"
		"totalsize"		"0"
		"apps"
		{
		}
	}
}
"#;

    const EMPTY_VDF: &str = "\"libraryfolders\"\n{\n}\n";

    const SAMPLE_METADATA: &str = r#""libraryfolder"
{
	"contentid"		"7044157330437711426"
	"label"		""
}
"#;

    fn library_with_metadata(metadata: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(LIBRARY_METADATA_FILE), metadata).unwrap();
        dir
    }

    fn registry_with(content: &str) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("libraryfolders.vdf");
        fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_parse_library_folders() {
        let folders = parse_library_folders_content(SAMPLE_VDF).unwrap();

        assert_eq!(folders.len(), 2);

        let (id0, folder0) = &folders[0];
        assert_eq!(id0, "0");
        assert_eq!(folder0.path, PathBuf::from("/home/deck/.local/share/Steam"));
        assert_eq!(folder0.apps.len(), 2);
        assert_eq!(folder0.apps.get("730"), Some(&"12345678".to_string()));

        let (id1, folder1) = &folders[1];
        assert_eq!(id1, "1");
        assert_eq!(folder1.label, "SD Card");
    }

    #[test]
    fn test_next_library_index() {
        assert_eq!(next_library_index(SAMPLE_VDF), 2);
        assert_eq!(next_library_index(EMPTY_VDF), 0);

        // Nested numeric keys and gaps
        let sparse = "\"libraryfolders\"\n{\n\t\"0\"\n\t{\n\t\t\"apps\"\n\t\t{\n\t\t\t\"99\"\n\t\t\t{\n\t\t\t}\n\t\t}\n\t}\n\t\"5\"\n\t{\n\t}\n}\n";
        assert_eq!(next_library_index(sparse), 6);
    }

    #[test]
    fn test_render_entry() {
        let block = render_entry(SAMPLE_METADATA, "/run/media/ABC123", 2).unwrap();
        let expected = "\t\"2\"\n\t{\n\t\t\"contentid\"\t\t\"7044157330437711426\"\n\t\t\"label\"\t\t\"\"\n\t\t\"path\"\t\t\"/run/media/ABC123\"\n\t}";
        assert_eq!(block, expected);
    }

    #[test]
    fn test_render_entry_nested_block() {
        let metadata = "\"libraryfolder\"\n{\n\t\"contentid\"\t\t\"1\"\n\t\"apps\"\n\t{\n\t\t\"730\"\t\t\"1\"\n\t}\n}\n";
        let block = render_entry(metadata, "/mnt/x", 0).unwrap();
        assert!(block.contains("\t\t\"apps\"\n\t\t{\n\t\t\t\"730\"\t\t\"1\"\n\t\t}\n"));
    }

    #[test]
    fn test_render_entry_malformed() {
        assert!(render_entry("\"something\"\n{\n}\n", "/x", 0).is_err());
        assert!(render_entry("\"libraryfolder\"\n\"label\" \"\"\n", "/x", 0).is_err());
        assert!(render_entry("\"libraryfolder\"\n{\n\t\"label\"\t\t\"\"\n", "/x", 0).is_err());
        // A brace inside a quoted value does not close the block
        assert!(render_entry("\"libraryfolder\"\n{\n\t\"label\"\t\t\"}\"\n", "/x", 0).is_err());
    }

    #[test]
    fn test_escape_vdf() {
        assert_eq!(escape_vdf("/run/media/a\"b"), "/run/media/a\\\"b");
        assert_eq!(escape_vdf("C:\\Games"), "C:\\\\Games");
    }

    #[test]
    fn test_append_library_preserves_existing_entries() {
        let (_registry_dir, registry) = registry_with(SAMPLE_VDF);
        let library = library_with_metadata(SAMPLE_METADATA);

        let index = append_library(&registry, library.path()).unwrap();
        assert_eq!(index, 2);

        let updated = fs::read_to_string(&registry).unwrap();
        let last_brace = SAMPLE_VDF.rfind('}').unwrap();
        assert!(updated.starts_with(&SAMPLE_VDF[..last_brace]));
        assert!(updated.ends_with(&SAMPLE_VDF[last_brace..]));

        let folders = parse_library_folders_content(&updated).unwrap();
        let ids: Vec<&str> = folders.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "2"]);
        assert_eq!(folders[2].1.path, library.path());
        assert_eq!(folders[2].1.contentid, "7044157330437711426");
    }

    #[test]
    fn test_append_library_to_empty_registry() {
        let (_registry_dir, registry) = registry_with(EMPTY_VDF);
        let library = library_with_metadata(SAMPLE_METADATA);

        assert_eq!(append_library(&registry, library.path()).unwrap(), 0);

        let folders = parse_library_folders(&registry).unwrap();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].0, "0");
        assert!(is_library_registered(&registry, library.path()).unwrap());
    }

    #[test]
    fn test_append_library_without_closing_brace() {
        let (_registry_dir, registry) = registry_with("\"libraryfolders\"\n");
        let library = library_with_metadata(SAMPLE_METADATA);

        let err = append_library(&registry, library.path()).unwrap_err();
        assert!(matches!(err, Error::InvalidRegistryFormat { .. }));
        assert_eq!(fs::read_to_string(&registry).unwrap(), "\"libraryfolders\"\n");
    }

    #[test]
    fn test_append_library_with_malformed_metadata() {
        let (_registry_dir, registry) = registry_with(SAMPLE_VDF);
        let library = library_with_metadata("\"notalibrary\"\n{\n}\n");

        let err = append_library(&registry, library.path()).unwrap_err();
        assert!(matches!(err, Error::MalformedMetadata { .. }));
        assert_eq!(fs::read_to_string(&registry).unwrap(), SAMPLE_VDF);
    }

    #[test]
    fn test_has_library_metadata() {
        let library = library_with_metadata(SAMPLE_METADATA);
        assert!(has_library_metadata(library.path()));

        let empty = TempDir::new().unwrap();
        assert!(!has_library_metadata(empty.path()));
    }

    #[test]
    fn test_backup_registry() {
        let (_registry_dir, registry) = registry_with(SAMPLE_VDF);
        let backup = backup_registry(&registry).unwrap();

        assert_ne!(backup, registry);
        assert_eq!(fs::read_to_string(backup).unwrap(), SAMPLE_VDF);
    }
}
