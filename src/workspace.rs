//! Local filesystem surface for the dispatcher
//!
//! Owns the two pieces of local state the dispatcher writes through:
//! - a temp-file registry handing out never-reissued `kssh_<UUID>_temp`
//!   paths and able to sweep whatever is still outstanding at shutdown;
//! - the output destination, in one of two shapes: a single append-target
//!   for line mode, or a directory of per-input `.out` files for file mode.

use crate::error::{WorkspaceError, WorkspaceResult};
use crate::remote::RunKey;
use crate::source::Block;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where fetched block output goes
#[derive(Debug)]
enum OutputTarget {
    /// Line mode without --output: append to the process's stdout
    Stdout,
    /// Line mode with --output: append to one file
    LineFile(PathBuf),
    /// File mode: one `<basename>.out` per input inside this directory
    Directory(PathBuf),
}

/// Temp-file registry plus output writer
#[derive(Debug)]
pub struct Workspace {
    /// Directory temp files are created under
    temp_dir: PathBuf,

    /// Every temp path handed out and not yet removed
    issued: HashSet<PathBuf>,

    /// Output destination
    target: OutputTarget,
}

impl Workspace {
    /// Build a line-mode workspace.
    ///
    /// With no output path the destination is stdout. A directory output
    /// synthesizes `<KEY>_result` inside it. A file output is truncated if
    /// it already exists.
    pub fn for_lines(
        temp_dir: &Path,
        output: Option<&Path>,
        key: &RunKey,
    ) -> WorkspaceResult<Self> {
        let target = match output {
            None => OutputTarget::Stdout,
            Some(path) => {
                let dest = if path.is_dir() {
                    path.join(format!("{key}_result"))
                } else {
                    path.to_path_buf()
                };
                // Truncate any previous run's results up front so every
                // append lands in a fresh file.
                File::create(&dest).map_err(|e| WorkspaceError::PrepareOutput {
                    path: dest.clone(),
                    reason: e.to_string(),
                })?;
                OutputTarget::LineFile(dest)
            }
        };

        Ok(Self {
            temp_dir: temp_dir.to_path_buf(),
            issued: HashSet::new(),
            target,
        })
    }

    /// Build a file-mode workspace; the output directory is created if it
    /// does not exist yet.
    pub fn for_files(temp_dir: &Path, output_dir: &Path) -> WorkspaceResult<Self> {
        std::fs::create_dir_all(output_dir).map_err(|e| WorkspaceError::PrepareOutput {
            path: output_dir.to_path_buf(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            temp_dir: temp_dir.to_path_buf(),
            issued: HashSet::new(),
            target: OutputTarget::Directory(output_dir.to_path_buf()),
        })
    }

    /// Reserve a fresh temp path. The file itself is created by whoever
    /// writes it (a block spill, or a fetch redirection).
    pub fn create_temp(&mut self) -> PathBuf {
        loop {
            let name = format!("kssh_{}_temp", Uuid::new_v4().simple());
            let path = self.temp_dir.join(name);
            if self.issued.insert(path.clone()) {
                return path;
            }
        }
    }

    /// Delete a temp file from disk and the registry. Absence is logged and
    /// tolerated: a failed fetch may never have materialized its file.
    pub fn remove_temp(&mut self, path: &Path) {
        self.issued.remove(path);
        if let Err(e) = std::fs::remove_file(path) {
            debug!(host = "localhost", path = %path.display(), error = %e, "Temp file already gone");
        }
    }

    /// Remove every outstanding temp file (normal-shutdown sweep).
    pub fn cleanup(&mut self) {
        let outstanding: Vec<PathBuf> = self.issued.drain().collect();
        for path in outstanding {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!(host = "localhost", path = %path.display(), error = %e, "Temp file already gone");
            }
        }
    }

    /// Number of temp paths currently outstanding
    pub fn outstanding_temps(&self) -> usize {
        self.issued.len()
    }

    /// Write one fetched block: its stdout temp into the output target and
    /// its stderr temp into the log, tagged with the worker's hostname.
    /// Returns the number of output bytes written. Both temp files are
    /// released.
    pub fn write(
        &mut self,
        hostname: &str,
        block: &Block,
        out_tmp: &Path,
        err_tmp: &Path,
    ) -> WorkspaceResult<u64> {
        let written = match &self.target {
            OutputTarget::Stdout => {
                let stdout = std::io::stdout();
                let mut handle = stdout.lock();
                copy_into(out_tmp, &mut handle)?
            }
            OutputTarget::LineFile(dest) => {
                let mut file = OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(dest)
                    .map_err(|e| WorkspaceError::WriteOutput {
                        path: dest.clone(),
                        reason: e.to_string(),
                    })?;
                copy_into(out_tmp, &mut file)?
            }
            OutputTarget::Directory(dir) => {
                let dest = self.unique_output_path(dir, block);
                move_file(out_tmp, &dest)?;
                info!(
                    host = %hostname,
                    block = %block.desc(),
                    output = %dest.display(),
                    "Block output written"
                );
                std::fs::metadata(&dest).map(|m| m.len()).unwrap_or(0)
            }
        };

        self.log_stderr(hostname, err_tmp);
        self.remove_temp(out_tmp);
        self.remove_temp(err_tmp);

        Ok(written)
    }

    /// `<dir>/<basename>.out`, suffixing a counter on collision
    fn unique_output_path(&self, dir: &Path, block: &Block) -> PathBuf {
        let base = block
            .input()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "block".to_string());

        let mut candidate = dir.join(format!("{base}.out"));
        let mut counter = 0u32;
        while candidate.exists() {
            counter += 1;
            candidate = dir.join(format!("{base}.out{counter}"));
        }
        candidate
    }

    /// Stream a stderr temp file into the log line by line, tagged with the
    /// originating hostname.
    fn log_stderr(&self, hostname: &str, err_tmp: &Path) {
        let file = match File::open(err_tmp) {
            Ok(f) => f,
            Err(_) => return,
        };
        for line in BufReader::new(file).lines() {
            match line {
                Ok(line) if !line.is_empty() => info!(host = %hostname, "{line}"),
                Ok(_) => {}
                Err(e) => {
                    warn!(host = %hostname, error = %e, "Failed to read task stderr");
                    break;
                }
            }
        }
    }
}

/// Append the whole contents of `src` into `writer`
fn copy_into(src: &Path, writer: &mut dyn Write) -> WorkspaceResult<u64> {
    let mut file = match File::open(src) {
        Ok(f) => f,
        // An empty fetch may not have created the file at all.
        Err(_) => return Ok(0),
    };
    std::io::copy(&mut file, writer).map_err(|e| WorkspaceError::WriteOutput {
        path: src.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Rename, falling back to copy-and-delete when the temp directory and the
/// output directory live on different filesystems.
fn move_file(src: &Path, dest: &Path) -> WorkspaceResult<()> {
    if std::fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    std::fs::copy(src, dest).map_err(|e| WorkspaceError::WriteOutput {
        path: dest.to_path_buf(),
        reason: e.to_string(),
    })?;
    let _ = std::fs::remove_file(src);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines_workspace(dir: &Path, output: &Path) -> Workspace {
        Workspace::for_lines(dir, Some(output), &RunKey::generate()).unwrap()
    }

    #[test]
    fn test_create_temp_unique() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let mut ws = lines_workspace(dir.path(), &out);

        let a = ws.create_temp();
        let b = ws.create_temp();
        assert_ne!(a, b);
        assert!(a.file_name().unwrap().to_string_lossy().starts_with("kssh_"));
        assert_eq!(ws.outstanding_temps(), 2);
    }

    #[test]
    fn test_remove_temp_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let mut ws = lines_workspace(dir.path(), &out);

        let t = ws.create_temp();
        // Never materialized on disk.
        ws.remove_temp(&t);
        assert_eq!(ws.outstanding_temps(), 0);
    }

    #[test]
    fn test_cleanup_sweeps_outstanding() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let mut ws = lines_workspace(dir.path(), &out);

        let a = ws.create_temp();
        let b = ws.create_temp();
        std::fs::write(&a, "x").unwrap();
        std::fs::write(&b, "y").unwrap();

        ws.cleanup();
        assert!(!a.exists());
        assert!(!b.exists());
        assert_eq!(ws.outstanding_temps(), 0);
    }

    #[test]
    fn test_lines_write_appends() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let mut ws = lines_workspace(dir.path(), &out);

        let block = Block::for_file(dir.path().join("in.txt"));
        for chunk in ["first\n", "second\n"] {
            let out_tmp = ws.create_temp();
            let err_tmp = ws.create_temp();
            std::fs::write(&out_tmp, chunk).unwrap();
            std::fs::write(&err_tmp, "").unwrap();
            ws.write("w1", &block, &out_tmp, &err_tmp).unwrap();
        }

        assert_eq!(std::fs::read_to_string(&out).unwrap(), "first\nsecond\n");
        assert_eq!(ws.outstanding_temps(), 0);
    }

    #[test]
    fn test_lines_output_truncated_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        std::fs::write(&out, "stale contents").unwrap();

        let _ws = lines_workspace(dir.path(), &out);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "");
    }

    #[test]
    fn test_lines_output_dir_synthesizes_name() {
        let dir = tempfile::tempdir().unwrap();
        let key = RunKey::generate();
        let ws = Workspace::for_lines(dir.path(), Some(dir.path()), &key).unwrap();

        match &ws.target {
            OutputTarget::LineFile(p) => {
                assert_eq!(
                    p.file_name().unwrap().to_string_lossy(),
                    format!("{key}_result")
                );
            }
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn test_files_write_renames_with_collision_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join("results");
        let mut ws = Workspace::for_files(dir.path(), &out_dir).unwrap();

        let block = Block::for_file(dir.path().join("data.txt"));
        for (i, content) in ["one", "two", "three"].iter().enumerate() {
            let out_tmp = ws.create_temp();
            let err_tmp = ws.create_temp();
            std::fs::write(&out_tmp, content).unwrap();
            std::fs::write(&err_tmp, "").unwrap();
            let written = ws.write("w1", &block, &out_tmp, &err_tmp).unwrap();
            assert_eq!(written, content.len() as u64, "write {i}");
        }

        assert_eq!(
            std::fs::read_to_string(out_dir.join("data.txt.out")).unwrap(),
            "one"
        );
        assert_eq!(
            std::fs::read_to_string(out_dir.join("data.txt.out1")).unwrap(),
            "two"
        );
        assert_eq!(
            std::fs::read_to_string(out_dir.join("data.txt.out2")).unwrap(),
            "three"
        );
    }
}
