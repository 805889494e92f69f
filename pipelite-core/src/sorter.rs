// pipelite-core/src/sorter.rs
// External merge sort: bounded in-memory buffer, sorted spill runs,
// k-way merge on drain
//
// Used by $sort for its blocking buffer and by $group to merge spilled
// partial groups. Keys and payloads are both [`Value`]s; the caller
// supplies the key comparator so multi-field sort patterns and
// collator-aware group keys share one code path.

use crate::error::{PipeLiteError, Result};
use crate::value::Value;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Key ordering used for run sorting and merging.
pub type KeyComparator = Arc<dyn Fn(&Value, &Value) -> Ordering + Send + Sync>;

/// A (key, payload) pair flowing through the sorter.
pub type SortEntry = (Value, Value);

/// External sorter with a byte budget.
///
/// `add` accumulates into an in-memory buffer; crossing the budget
/// either spills a sorted run to a temp file (when disk use is
/// allowed) or fails with a memory-limit error. `finish` merges the
/// remaining buffer with every spilled run.
pub struct ExternalSorter {
    compare: KeyComparator,
    buffer: Vec<SortEntry>,
    buffer_bytes: usize,
    max_memory_bytes: usize,
    allow_disk_use: bool,
    spill_dir: Option<PathBuf>,
    runs: Vec<SpillRun>,
    /// Bounded top-k mode: only this many smallest entries survive
    limit: Option<usize>,
    spill_count: usize,
}

impl ExternalSorter {
    pub fn new(
        compare: KeyComparator,
        max_memory_bytes: usize,
        allow_disk_use: bool,
        spill_dir: Option<PathBuf>,
    ) -> ExternalSorter {
        ExternalSorter {
            compare,
            buffer: Vec::new(),
            buffer_bytes: 0,
            max_memory_bytes,
            allow_disk_use,
            spill_dir,
            runs: Vec::new(),
            limit: None,
            spill_count: 0,
        }
    }

    /// Keep only the `limit` smallest entries; with a limit set the
    /// sorter prunes instead of spilling where possible.
    pub fn with_limit(mut self, limit: usize) -> ExternalSorter {
        self.limit = Some(limit);
        self
    }

    pub fn spill_count(&self) -> usize {
        self.spill_count
    }

    pub fn memory_usage(&self) -> usize {
        self.buffer_bytes
    }

    pub fn add(&mut self, key: Value, payload: Value) -> Result<()> {
        self.buffer_bytes += key.approximate_size() + payload.approximate_size();
        self.buffer.push((key, payload));

        if self.buffer_bytes <= self.max_memory_bytes {
            return Ok(());
        }

        // Over budget: prune in top-k mode, else spill
        if let Some(limit) = self.limit {
            if self.buffer.len() > limit {
                self.sort_buffer();
                self.buffer.truncate(limit);
                self.recount_buffer_bytes();
                if self.buffer_bytes <= self.max_memory_bytes {
                    return Ok(());
                }
            }
        }
        if !self.allow_disk_use {
            return Err(PipeLiteError::MemoryLimitExceeded(format!(
                "sort exceeded memory limit of {} bytes but disk use is not allowed",
                self.max_memory_bytes
            )));
        }
        self.spill()
    }

    /// Write the current buffer as one sorted run.
    pub fn spill(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.sort_buffer();

        let file = match &self.spill_dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        let mut writer = BufWriter::new(file);
        let count = self.buffer.len() as u64;
        bincode::serialize_into(&mut writer, &count)
            .map_err(|e| PipeLiteError::Serialization(e.to_string()))?;
        for entry in self.buffer.drain(..) {
            bincode::serialize_into(&mut writer, &entry)
                .map_err(|e| PipeLiteError::Serialization(e.to_string()))?;
        }
        writer.flush()?;
        let mut file = writer
            .into_inner()
            .map_err(|e| PipeLiteError::SpillIo(e.into_error()))?;
        file.seek(SeekFrom::Start(0))?;

        crate::log_debug!("spilled run of {} entries to disk", count);
        self.runs.push(SpillRun::new(file, count)?);
        self.buffer_bytes = 0;
        self.spill_count += 1;
        Ok(())
    }

    /// Sort whatever is buffered and merge it with the spilled runs.
    pub fn finish(mut self) -> Result<SortedStream> {
        self.sort_buffer();
        if let Some(limit) = self.limit {
            self.buffer.truncate(limit);
        }
        let in_memory = std::mem::take(&mut self.buffer);
        Ok(SortedStream {
            compare: self.compare.clone(),
            in_memory: in_memory.into_iter().peekable(),
            runs: std::mem::take(&mut self.runs),
            limit: self.limit,
            returned: 0,
        })
    }

    fn sort_buffer(&mut self) {
        let compare = self.compare.clone();
        self.buffer.sort_by(|a, b| compare(&a.0, &b.0));
    }

    fn recount_buffer_bytes(&mut self) {
        self.buffer_bytes = self
            .buffer
            .iter()
            .map(|(k, v)| k.approximate_size() + v.approximate_size())
            .sum();
    }
}

/// One sorted on-disk run with its streaming reader state.
struct SpillRun {
    reader: BufReader<File>,
    remaining: u64,
    head: Option<SortEntry>,
}

impl SpillRun {
    fn new(file: File, count: u64) -> Result<SpillRun> {
        let mut reader = BufReader::new(file);
        // Skip the count header; `count` was captured at write time
        let _: u64 = bincode::deserialize_from(&mut reader)
            .map_err(|e| PipeLiteError::Serialization(e.to_string()))?;
        let mut run = SpillRun {
            reader,
            remaining: count,
            head: None,
        };
        run.advance()?;
        Ok(run)
    }

    fn advance(&mut self) -> Result<()> {
        self.head = if self.remaining == 0 {
            None
        } else {
            self.remaining -= 1;
            Some(
                bincode::deserialize_from(&mut self.reader)
                    .map_err(|e| PipeLiteError::Serialization(e.to_string()))?,
            )
        };
        Ok(())
    }
}

/// K-way merged output of the sorter: the in-memory run plus every
/// spilled run, smallest key first.
pub struct SortedStream {
    compare: KeyComparator,
    in_memory: std::iter::Peekable<std::vec::IntoIter<SortEntry>>,
    runs: Vec<SpillRun>,
    limit: Option<usize>,
    returned: usize,
}

impl SortedStream {
    /// Pull the next smallest entry. The run count is small, so a
    /// linear scan over run heads beats heap bookkeeping.
    pub fn next_entry(&mut self) -> Result<Option<SortEntry>> {
        if let Some(limit) = self.limit {
            if self.returned >= limit {
                return Ok(None);
            }
        }

        let mut best: Option<usize> = None; // index into runs, or in-memory marker below
        let mut best_from_memory = false;

        if self.in_memory.peek().is_some() {
            best_from_memory = true;
        }
        for (i, run) in self.runs.iter().enumerate() {
            let Some((run_key, _)) = &run.head else {
                continue;
            };
            let better = if best_from_memory {
                let (mem_key, _) = self.in_memory.peek().unwrap();
                (self.compare)(run_key, mem_key) == Ordering::Less
            } else {
                match best {
                    None => true,
                    Some(j) => {
                        let (best_key, _) = self.runs[j].head.as_ref().unwrap();
                        (self.compare)(run_key, best_key) == Ordering::Less
                    }
                }
            };
            if better {
                best = Some(i);
                best_from_memory = false;
            }
        }

        let entry = if best_from_memory {
            self.in_memory.next()
        } else if let Some(i) = best {
            let entry = self.runs[i].head.take();
            self.runs[i].advance()?;
            entry
        } else {
            None
        };

        if entry.is_some() {
            self.returned += 1;
        }
        Ok(entry)
    }
}
