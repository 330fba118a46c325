//! Block production for the dispatcher
//!
//! A `Block` is one atomic unit of work: a local file holding the input
//! bytes plus a human-readable description. Blocks come from a
//! `BlockSource`, which owns the underlying input and a FIFO retry queue.
//! Retried blocks are always handed out before fresh ones.
//!
//! The two source variants form a small closed family, so they are modeled
//! as an enum with a shared operation set rather than a trait object:
//! - `Files`: one block per listed input file, in order
//! - `Lines`: a text stream cut into blocks of up to `blocksize` lines,
//!   each materialized into a workspace temp file

use crate::config::LineInput;
use crate::error::{DispatchError, Result, SourceError, WorkspaceError};
use crate::workspace::Workspace;
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One atomic unit of work
#[derive(Debug)]
pub struct Block {
    /// Local file holding the input bytes
    input: PathBuf,

    /// Human-readable description for the log
    desc: String,
}

impl Block {
    /// A block backed by a whole input file
    pub fn for_file(path: PathBuf) -> Self {
        let desc = format!("file {}", path.display());
        Self { input: path, desc }
    }

    /// A block backed by a spilled line range
    pub fn for_lines(path: PathBuf, first: u64, last: u64) -> Self {
        Self {
            input: path,
            desc: format!("lines [{first},{last}]"),
        }
    }

    /// Path of the local input file
    pub fn input(&self) -> &Path {
        &self.input
    }

    /// Description for logging
    pub fn desc(&self) -> &str {
        &self.desc
    }

    /// Input size in bytes, queried on demand
    pub fn size(&self) -> u64 {
        std::fs::metadata(&self.input).map(|m| m.len()).unwrap_or(0)
    }
}

/// Lazy producer of blocks with a retry queue
pub enum BlockSource {
    Files(FileSource),
    Lines(LineSource),
}

impl BlockSource {
    /// Source yielding one block per input file, in the given order
    pub fn files(paths: Vec<PathBuf>) -> Self {
        let total = paths.len() as u64;
        Self::Files(FileSource {
            paths: paths.into(),
            retry: VecDeque::new(),
            total,
        })
    }

    /// Source cutting a text stream into line blocks.
    ///
    /// With `shuffle` the whole stream is read up front, shuffled, and
    /// spilled to a temp file which then backs the source (and makes it
    /// countable even for stdin).
    pub fn lines(
        input: &LineInput,
        blocksize: usize,
        shuffle: bool,
        workspace: &mut Workspace,
    ) -> Result<Self> {
        let (reader, origin): (Box<dyn BufRead>, Option<PathBuf>) = if shuffle {
            let mut lines = read_all_lines(input)?;
            lines.shuffle(&mut rand::rng());

            let spill = workspace.create_temp();
            let file = File::create(&spill).map_err(|e| WorkspaceError::WriteTemp {
                path: spill.clone(),
                reason: e.to_string(),
            })?;
            let mut writer = BufWriter::new(file);
            for line in &lines {
                writer
                    .write_all(line.as_bytes())
                    .map_err(|e| WorkspaceError::WriteTemp {
                        path: spill.clone(),
                        reason: e.to_string(),
                    })?;
            }
            writer.flush().map_err(|e| WorkspaceError::WriteTemp {
                path: spill.clone(),
                reason: e.to_string(),
            })?;

            let reopened = open_reader(&spill)?;
            (reopened, Some(spill))
        } else {
            match input {
                LineInput::Stdin => (Box::new(BufReader::new(std::io::stdin())), None),
                LineInput::File(path) => (open_reader(path)?, Some(path.clone())),
            }
        };

        Ok(Self::Lines(LineSource {
            reader: Some(reader),
            origin,
            blocksize,
            next_line: 0,
            peeked: None,
            retry: VecDeque::new(),
        }))
    }

    /// True while a retry is queued or the underlying input can still
    /// produce a fresh block
    pub fn has_more(&mut self) -> bool {
        match self {
            Self::Files(s) => !s.retry.is_empty() || !s.paths.is_empty(),
            Self::Lines(s) => !s.retry.is_empty() || s.peek_available(),
        }
    }

    /// Next block: the oldest retry if any, otherwise a fresh one.
    /// Fails with `SourceError::Exhausted` when neither is available.
    pub fn next(&mut self, workspace: &mut Workspace) -> Result<Block> {
        match self {
            Self::Files(s) => {
                if let Some(b) = s.retry.pop_front() {
                    return Ok(b);
                }
                s.paths
                    .pop_front()
                    .map(Block::for_file)
                    .ok_or(DispatchError::Source(SourceError::Exhausted))
            }
            Self::Lines(s) => {
                if let Some(b) = s.retry.pop_front() {
                    return Ok(b);
                }
                s.produce(workspace)?
                    .ok_or(DispatchError::Source(SourceError::Exhausted))
            }
        }
    }

    /// Queue a block for re-dispatch (FIFO)
    pub fn retry(&mut self, block: Block) {
        debug!(host = "localhost", block = %block.desc(), "Block queued for retry");
        match self {
            Self::Files(s) => s.retry.push_back(block),
            Self::Lines(s) => s.retry.push_back(block),
        }
    }

    /// Signal that a block was fetched successfully. Line mode releases the
    /// block's spill file; file mode leaves the user's input alone.
    pub fn done(&mut self, block: Block, workspace: &mut Workspace) {
        match self {
            Self::Files(_) => {
                debug!(host = "localhost", block = %block.desc(), "Block complete");
            }
            Self::Lines(_) => workspace.remove_temp(block.input()),
        }
    }

    /// Release the underlying input
    pub fn close(&mut self) {
        match self {
            Self::Files(s) => s.paths.clear(),
            Self::Lines(s) => {
                s.reader = None;
                s.peeked = None;
            }
        }
    }

    /// Exact total block count. Fails for a raw stdin stream, which cannot
    /// be counted without consuming it.
    pub fn len(&self) -> Result<u64> {
        match self {
            Self::Files(s) => Ok(s.total),
            Self::Lines(s) => {
                let origin = s
                    .origin
                    .as_ref()
                    .ok_or(DispatchError::Source(SourceError::LenUnavailable))?;
                let lines = count_lines(origin)?;
                Ok(lines.div_ceil(s.blocksize as u64))
            }
        }
    }

    /// Drop everything still unprocessed, releasing spill files, and return
    /// how many blocks were abandoned. Used when the whole fleet has been
    /// excluded.
    pub fn abandon(&mut self, workspace: &mut Workspace) -> u64 {
        match self {
            Self::Files(s) => {
                let lost = s.retry.len() as u64 + s.paths.len() as u64;
                s.retry.clear();
                s.paths.clear();
                lost
            }
            Self::Lines(s) => {
                let mut lost = 0u64;
                while let Some(b) = s.retry.pop_front() {
                    workspace.remove_temp(b.input());
                    lost += 1;
                }
                // Count what the stream would still have produced.
                let mut remaining_lines = 0u64;
                while s.peek_available() {
                    s.peeked = None;
                    remaining_lines += 1;
                }
                s.reader = None;
                lost + remaining_lines.div_ceil(s.blocksize as u64)
            }
        }
    }
}

/// Whole-file variant state
pub struct FileSource {
    paths: VecDeque<PathBuf>,
    retry: VecDeque<Block>,
    total: u64,
}

/// Line-stream variant state
pub struct LineSource {
    reader: Option<Box<dyn BufRead>>,
    /// Countable backing path; `None` only for raw stdin
    origin: Option<PathBuf>,
    blocksize: usize,
    next_line: u64,
    peeked: Option<String>,
    retry: VecDeque<Block>,
}

impl LineSource {
    /// Ensure one line of lookahead; returns whether a line is available
    fn peek_available(&mut self) -> bool {
        if self.peeked.is_some() {
            return true;
        }
        let Some(reader) = self.reader.as_mut() else {
            return false;
        };
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => {
                self.reader = None;
                false
            }
            Ok(_) => {
                self.peeked = Some(line);
                true
            }
        }
    }

    /// Spill the next up-to-`blocksize` lines into a fresh temp file
    fn produce(&mut self, workspace: &mut Workspace) -> Result<Option<Block>> {
        if !self.peek_available() {
            return Ok(None);
        }

        let first = self.next_line;
        let path = workspace.create_temp();
        let file = File::create(&path).map_err(|e| WorkspaceError::WriteTemp {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let mut writer = BufWriter::new(file);

        let mut count = 0u64;
        while count < self.blocksize as u64 {
            let Some(line) = self.peeked.take() else {
                break;
            };
            writer
                .write_all(line.as_bytes())
                .map_err(|e| WorkspaceError::WriteTemp {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            count += 1;
            self.next_line += 1;
            if count < self.blocksize as u64 && !self.peek_available() {
                break;
            }
        }
        writer.flush().map_err(|e| WorkspaceError::WriteTemp {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        Ok(Some(Block::for_lines(path, first, first + count - 1)))
    }
}

fn open_reader(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).map_err(|e| SourceError::Read {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(Box::new(BufReader::new(file)))
}

fn read_all_lines(input: &LineInput) -> Result<Vec<String>> {
    let reader: Box<dyn BufRead> = match input {
        LineInput::Stdin => Box::new(BufReader::new(std::io::stdin())),
        LineInput::File(path) => open_reader(path)?,
    };

    let mut lines = Vec::new();
    let mut reader = reader;
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).map_err(|e| SourceError::Read {
            path: match input {
                LineInput::Stdin => PathBuf::from("-"),
                LineInput::File(p) => p.clone(),
            },
            reason: e.to_string(),
        })?;
        if read == 0 {
            break;
        }
        lines.push(line);
    }
    Ok(lines)
}

fn count_lines(path: &Path) -> Result<u64> {
    let mut reader = open_reader(path)?;
    let mut count = 0u64;
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line).map_err(|e| SourceError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if read == 0 {
            return Ok(count);
        }
        count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RunKey;

    fn workspace(dir: &Path) -> Workspace {
        Workspace::for_lines(dir, Some(&dir.join("out.txt")), &RunKey::generate()).unwrap()
    }

    #[test]
    fn test_file_source_order_and_len() {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = workspace(dir.path());
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, "aa").unwrap();
        std::fs::write(&b, "bb").unwrap();

        let mut source = BlockSource::files(vec![a.clone(), b.clone()]);
        assert_eq!(source.len().unwrap(), 2);
        assert!(source.has_more());

        let first = source.next(&mut ws).unwrap();
        assert_eq!(first.input(), a.as_path());
        assert_eq!(first.size(), 2);

        let second = source.next(&mut ws).unwrap();
        assert_eq!(second.input(), b.as_path());
        assert!(!source.has_more());

        let err = source.next(&mut ws).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Source(SourceError::Exhausted)
        ));
    }

    #[test]
    fn test_retry_queue_is_fifo_and_served_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = workspace(dir.path());
        let paths: Vec<PathBuf> = ["a", "b", "c"]
            .iter()
            .map(|n| {
                let p = dir.path().join(n);
                std::fs::write(&p, n).unwrap();
                p
            })
            .collect();

        let mut source = BlockSource::files(paths.clone());
        let first = source.next(&mut ws).unwrap();
        let second = source.next(&mut ws).unwrap();

        source.retry(first);
        source.retry(second);

        // Retries come back in push order, ahead of the fresh block "c".
        assert_eq!(source.next(&mut ws).unwrap().input(), paths[0].as_path());
        assert_eq!(source.next(&mut ws).unwrap().input(), paths[1].as_path());
        assert_eq!(source.next(&mut ws).unwrap().input(), paths[2].as_path());
    }

    #[test]
    fn test_line_source_block_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = workspace(dir.path());
        let input = dir.path().join("input.txt");
        std::fs::write(&input, "0\n1\n2\n3\n4\n").unwrap();

        let mut source =
            BlockSource::lines(&LineInput::File(input), 2, false, &mut ws).unwrap();
        assert_eq!(source.len().unwrap(), 3);

        let b0 = source.next(&mut ws).unwrap();
        assert_eq!(b0.desc(), "lines [0,1]");
        assert_eq!(std::fs::read_to_string(b0.input()).unwrap(), "0\n1\n");

        let b1 = source.next(&mut ws).unwrap();
        assert_eq!(b1.desc(), "lines [2,3]");

        // Final block is short.
        let b2 = source.next(&mut ws).unwrap();
        assert_eq!(b2.desc(), "lines [4,4]");
        assert_eq!(std::fs::read_to_string(b2.input()).unwrap(), "4\n");

        assert!(!source.has_more());
        source.done(b0, &mut ws);
        source.done(b1, &mut ws);
        source.done(b2, &mut ws);
    }

    #[test]
    fn test_line_source_done_removes_spill() {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = workspace(dir.path());
        let input = dir.path().join("input.txt");
        std::fs::write(&input, "x\ny\n").unwrap();

        let mut source =
            BlockSource::lines(&LineInput::File(input), 10, false, &mut ws).unwrap();
        let block = source.next(&mut ws).unwrap();
        let spill = block.input().to_path_buf();
        assert!(spill.exists());

        source.done(block, &mut ws);
        assert!(!spill.exists());
    }

    #[test]
    fn test_line_source_preserves_missing_final_newline() {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = workspace(dir.path());
        let input = dir.path().join("input.txt");
        std::fs::write(&input, "a\nb").unwrap();

        let mut source =
            BlockSource::lines(&LineInput::File(input), 10, false, &mut ws).unwrap();
        let block = source.next(&mut ws).unwrap();
        assert_eq!(std::fs::read_to_string(block.input()).unwrap(), "a\nb");
    }

    #[test]
    fn test_empty_line_source_is_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = workspace(dir.path());
        let input = dir.path().join("empty.txt");
        std::fs::write(&input, "").unwrap();

        let mut source =
            BlockSource::lines(&LineInput::File(input), 5, false, &mut ws).unwrap();
        assert!(!source.has_more());
        assert!(matches!(
            source.next(&mut ws).unwrap_err(),
            DispatchError::Source(SourceError::Exhausted)
        ));
    }

    #[test]
    fn test_shuffled_lines_keep_the_full_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = workspace(dir.path());
        let input = dir.path().join("input.txt");
        let body: String = (0..50).map(|i| format!("{i}\n")).collect();
        std::fs::write(&input, &body).unwrap();

        let mut source =
            BlockSource::lines(&LineInput::File(input), 7, true, &mut ws).unwrap();
        // Spilled stream stays countable.
        assert_eq!(source.len().unwrap(), 8);

        let mut seen = Vec::new();
        while source.has_more() {
            let b = source.next(&mut ws).unwrap();
            let text = std::fs::read_to_string(b.input()).unwrap();
            seen.extend(text.lines().map(|l| l.to_string()));
            source.done(b, &mut ws);
        }

        let mut expected: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        seen.sort();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_abandon_counts_and_sweeps() {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = workspace(dir.path());
        let input = dir.path().join("input.txt");
        std::fs::write(&input, "0\n1\n2\n3\n4\n5\n").unwrap();

        let mut source =
            BlockSource::lines(&LineInput::File(input), 2, false, &mut ws).unwrap();
        let block = source.next(&mut ws).unwrap();
        let spill = block.input().to_path_buf();
        source.retry(block);

        // One retried block plus two un-produced blocks.
        assert_eq!(source.abandon(&mut ws), 3);
        assert!(!spill.exists());
        assert!(!source.has_more());
    }
}
