//! External input and output endpoints.
//!
//! The planner core does not read or write user data itself; it consumes a
//! pluggable [`DataSource`] per `Load` node and a pluggable [`DataSink`] per
//! persisted output. Both traits are type-erased: data crosses them as opaque
//! [`Partition`]s, with the element type described by the endpoint's
//! [`WireFormat`].
//!
//! [`MemorySource`] and [`MemorySink`] are the in-memory implementations used
//! by the in-process runtime and the test suite. File- or cluster-backed
//! endpoints implement the same traits outside this crate.

use crate::wire::{wire_format_for, Partition, WireFormat};
use anyhow::{anyhow, Result};
use std::mem;
use std::sync::{Arc, Mutex};

/// One unit of parallel input.
#[derive(Clone, Copy, Debug)]
pub struct Split {
    /// Index into the source's split list.
    pub index: usize,
    /// Rough byte size of this split, if the source can estimate it.
    pub approx_bytes: Option<u64>,
}

/// An external distributed-collection input, consumed by a `Load` node.
pub trait DataSource: Send + Sync {
    /// Describe the input splits of this source.
    ///
    /// # Errors
    /// Fails when the underlying input cannot be enumerated.
    fn input_splits(&self) -> Result<Vec<Split>>;

    /// Read one split into a partition of the source's element type.
    ///
    /// # Errors
    /// Fails on I/O errors or an out-of-range split index.
    fn read_split(&self, split: Split) -> Result<Partition>;

    /// The serialiser descriptor of the produced elements.
    fn wire(&self) -> WireFormat;

    /// Total byte-size estimate for the reducer-count heuristic, if available.
    fn size_hint(&self) -> Option<u64> {
        None
    }

    /// A short name for logs and validation messages.
    fn name(&self) -> String;
}

/// Writes one job's output for a sink.
pub trait SinkWriter: Send {
    /// Append one partition of elements.
    ///
    /// # Errors
    /// Fails on I/O errors or an element-type mismatch.
    fn write(&mut self, part: Partition) -> Result<()>;
}

/// An external user-facing output endpoint.
pub trait DataSink: Send + Sync {
    /// Stable identity of the output (e.g., an output path). Two sinks with
    /// the same id writing in one run is a validation error.
    fn output_id(&self) -> String;

    /// Open a writer for one job's output.
    ///
    /// # Errors
    /// Fails when the output cannot be opened.
    fn open(&self) -> Result<Box<dyn SinkWriter>>;

    /// Called once at job end, after all writers finished.
    ///
    /// # Errors
    /// Fails when the output cannot be finalised.
    fn commit(&self) -> Result<()> {
        Ok(())
    }

    /// The serialiser descriptor of the consumed elements.
    fn wire(&self) -> WireFormat;
}

// |-----------------------|
// | In-memory collaborators |
// |-----------------------|

/// A [`DataSource`] over a host-memory vector.
///
/// Splits are contiguous chunks, sized so the source yields `splits` units of
/// parallel work (fewer for tiny inputs).
pub struct MemorySource<T> {
    data: Arc<Vec<T>>,
    splits: usize,
    label: String,
}

impl<T: Clone + Send + Sync + 'static> MemorySource<T> {
    pub fn new(label: impl Into<String>, data: Vec<T>) -> Self {
        Self {
            data: Arc::new(data),
            splits: 1,
            label: label.into(),
        }
    }

    /// Request the input be served as up to `n` splits.
    #[must_use]
    pub fn with_splits(mut self, n: usize) -> Self {
        self.splits = n.max(1);
        self
    }
}

impl<T: Clone + Send + Sync + 'static> DataSource for MemorySource<T> {
    fn input_splits(&self) -> Result<Vec<Split>> {
        let len = self.data.len();
        let n = self.splits.min(len.max(1));
        let chunk = len.div_ceil(n).max(1);
        let elem_bytes = mem::size_of::<T>() as u64;
        Ok((0..n)
            .map(|i| {
                let take = chunk.min(len.saturating_sub(i * chunk));
                Split {
                    index: i,
                    approx_bytes: Some(take as u64 * elem_bytes),
                }
            })
            .collect())
    }

    fn read_split(&self, split: Split) -> Result<Partition> {
        let len = self.data.len();
        let n = self.splits.min(len.max(1));
        let chunk = len.div_ceil(n).max(1);
        let start = split.index * chunk;
        if split.index >= n {
            return Err(anyhow!(
                "source {}: split {} out of range ({} splits)",
                self.label,
                split.index,
                n
            ));
        }
        let end = (start + chunk).min(len);
        Ok(Box::new(self.data[start..end].to_vec()))
    }

    fn wire(&self) -> WireFormat {
        wire_format_for::<T>()
    }

    fn size_hint(&self) -> Option<u64> {
        Some((self.data.len() * mem::size_of::<T>()) as u64)
    }

    fn name(&self) -> String {
        self.label.clone()
    }
}

/// A [`DataSink`] collecting into a shared host-memory vector.
///
/// The collected contents stay available after the run via
/// [`MemorySink::contents`]; `committed` flips when the job finalises.
pub struct MemorySink<T> {
    out: Arc<Mutex<Vec<T>>>,
    committed: Arc<Mutex<bool>>,
    label: String,
}

impl<T: Clone + Send + Sync + 'static> MemorySink<T> {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            out: Arc::new(Mutex::new(Vec::new())),
            committed: Arc::new(Mutex::new(false)),
            label: label.into(),
        })
    }

    /// Everything written so far.
    pub fn contents(&self) -> Vec<T> {
        self.out.lock().expect("sink contents lock").clone()
    }

    /// Whether `commit` ran.
    pub fn is_committed(&self) -> bool {
        *self.committed.lock().expect("sink committed lock")
    }
}

struct MemorySinkWriter<T> {
    out: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone + Send + Sync + 'static> SinkWriter for MemorySinkWriter<T> {
    fn write(&mut self, part: Partition) -> Result<()> {
        let v = part
            .downcast::<Vec<T>>()
            .map_err(|_| anyhow!("sink write: element type mismatch"))?;
        self.out.lock().expect("sink write lock").extend(*v);
        Ok(())
    }
}

impl<T: Clone + Send + Sync + 'static> DataSink for MemorySink<T> {
    fn output_id(&self) -> String {
        self.label.clone()
    }

    fn open(&self) -> Result<Box<dyn SinkWriter>> {
        Ok(Box::new(MemorySinkWriter {
            out: Arc::clone(&self.out),
        }))
    }

    fn commit(&self) -> Result<()> {
        *self.committed.lock().expect("sink commit lock") = true;
        Ok(())
    }

    fn wire(&self) -> WireFormat {
        wire_format_for::<T>()
    }
}
