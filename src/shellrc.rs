//! Idempotent shell startup-file edits.
//!
//! Blindly appending `export PATH=...` grows the startup file by one line
//! per run. These helpers read, check, and only then append: a line is
//! added when no existing line already says the same thing, so any number
//! of runs leaves exactly one occurrence.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// The PATH export persisted into the shell startup file.
pub fn path_export_line(bin_dir: &Path) -> String {
    format!("export PATH={}:$PATH", bin_dir.display())
}

/// Merge `line` into `file`, appending only when it is not already present.
///
/// Presence is judged per line, ignoring surrounding whitespace. The file is
/// created if missing. Returns `true` when the file was changed.
pub fn ensure_line(file: &Path, line: &str) -> Result<bool> {
    let line = line.trim();
    if line.is_empty() {
        anyhow::bail!("Refusing to merge an empty line into {:?}", file);
    }

    let mut content = match fs::read_to_string(file) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read startup file {:?}", file))
        }
    };

    if content.lines().any(|existing| existing.trim() == line) {
        tracing::debug!("Line already present in {:?}: {}", file, line);
        return Ok(false);
    }

    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(line);
    content.push('\n');

    fs::write(file, content)
        .with_context(|| format!("Failed to write startup file {:?}", file))?;

    tracing::info!("Appended to {:?}: {}", file, line);
    Ok(true)
}

/// Count how many lines of `file` equal `line` (ignoring surrounding
/// whitespace). A missing file counts zero.
pub fn count_occurrences(file: &Path, line: &str) -> Result<usize> {
    let line = line.trim();
    let content = match fs::read_to_string(file) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read startup file {:?}", file))
        }
    };

    Ok(content
        .lines()
        .filter(|existing| existing.trim() == line)
        .count())
}

/// Whether `file` already contains `line`.
pub fn contains_line(file: &Path, line: &str) -> Result<bool> {
    Ok(count_occurrences(file, line)? > 0)
}

/// Whether `file` contains `marker` anywhere. Used for the shell-hook
/// initialization block, which spans multiple lines.
pub fn has_marker(file: &Path, marker: &str) -> Result<bool> {
    let content = match fs::read_to_string(file) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read startup file {:?}", file))
        }
    };

    Ok(content.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const EXPORT: &str = "export PATH=/root/miniforge3/bin:$PATH";

    #[test]
    fn test_path_export_line_format() {
        let line = path_export_line(Path::new("/root/miniforge3/bin"));
        assert_eq!(line, "export PATH=/root/miniforge3/bin:$PATH");
    }

    #[test]
    fn test_ensure_line_creates_missing_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let rc = temp_dir.path().join(".bashrc");

        let changed = ensure_line(&rc, EXPORT).unwrap();

        assert!(changed);
        assert_eq!(fs::read_to_string(&rc).unwrap(), format!("{}\n", EXPORT));
    }

    #[test]
    fn test_ensure_line_is_idempotent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let rc = temp_dir.path().join(".bashrc");

        assert!(ensure_line(&rc, EXPORT).unwrap());
        assert!(!ensure_line(&rc, EXPORT).unwrap());
        assert!(!ensure_line(&rc, EXPORT).unwrap());

        assert_eq!(count_occurrences(&rc, EXPORT).unwrap(), 1);
    }

    #[test]
    fn test_ensure_line_preserves_existing_content() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"# .bashrc\nalias ll='ls -l'\n")
            .unwrap();
        temp_file.flush().unwrap();

        let changed = ensure_line(temp_file.path(), EXPORT).unwrap();

        assert!(changed);
        let content = fs::read_to_string(temp_file.path()).unwrap();
        assert_eq!(
            content,
            format!("# .bashrc\nalias ll='ls -l'\n{}\n", EXPORT)
        );
    }

    #[test]
    fn test_ensure_line_handles_missing_trailing_newline() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"# no trailing newline").unwrap();
        temp_file.flush().unwrap();

        ensure_line(temp_file.path(), EXPORT).unwrap();

        let content = fs::read_to_string(temp_file.path()).unwrap();
        assert_eq!(content, format!("# no trailing newline\n{}\n", EXPORT));
    }

    #[test]
    fn test_ensure_line_treats_padded_line_as_present() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(format!("  {}  \n", EXPORT).as_bytes())
            .unwrap();
        temp_file.flush().unwrap();

        let changed = ensure_line(temp_file.path(), EXPORT).unwrap();

        assert!(!changed, "Indented existing line should count as present");
        assert_eq!(count_occurrences(temp_file.path(), EXPORT).unwrap(), 1);
    }

    #[test]
    fn test_ensure_line_rejects_empty_line() {
        let temp_dir = tempfile::tempdir().unwrap();
        let rc = temp_dir.path().join(".bashrc");

        assert!(ensure_line(&rc, "   ").is_err());
    }

    #[test]
    fn test_count_occurrences_sees_duplicates() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(format!("{}\n# comment\n{}\n", EXPORT, EXPORT).as_bytes())
            .unwrap();
        temp_file.flush().unwrap();

        assert_eq!(count_occurrences(temp_file.path(), EXPORT).unwrap(), 2);
    }

    #[test]
    fn test_count_occurrences_missing_file() {
        assert_eq!(
            count_occurrences(Path::new("/nonexistent/.bashrc"), EXPORT).unwrap(),
            0
        );
    }

    #[test]
    fn test_contains_line() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(format!("{}\n", EXPORT).as_bytes()).unwrap();
        temp_file.flush().unwrap();

        assert!(contains_line(temp_file.path(), EXPORT).unwrap());
        assert!(!contains_line(temp_file.path(), "export TAR=/bin/tar").unwrap());
    }

    #[test]
    fn test_has_marker_finds_block_start() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"# >>> conda initialize >>>\n# managed block\n# <<< conda initialize <<<\n")
            .unwrap();
        temp_file.flush().unwrap();

        assert!(has_marker(temp_file.path(), "# >>> conda initialize >>>").unwrap());
        assert!(!has_marker(temp_file.path(), "# >>> other tool >>>").unwrap());
    }

    #[test]
    fn test_has_marker_missing_file() {
        assert!(!has_marker(Path::new("/nonexistent/.bashrc"), "# >>>").unwrap());
    }
}
