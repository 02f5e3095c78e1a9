//! Asynchronous execution tracer.
//!
//! The CPU thread enqueues one `(first pc, instruction count)` entry per finished
//! block and never blocks on it. A writer thread drains the queue:
//! 1. **Decode:** reads the instructions from the bus and disassembles them lazily,
//!    through an [`OpcodeCache`].
//! 2. **Format:** renders one line per instruction in the configured [`TraceFormat`].
//! 3. **Flush:** writes to the file once the buffer passes the flush threshold or
//!    the queue runs empty.
//!
//! [`ExecutionTracer::stop`] closes the queue and joins the writer, so every
//! enqueued block is on disk when it returns.

/// Opcode disassembly cache.
pub mod cache;
/// Output formats and disassemblers.
pub mod format;

pub use cache::OpcodeCache;
pub use format::{Disassembled, Disassembler, FixedWidthDisassembler, TraceFormat};

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use serde::Serialize;
use tracing::{debug, warn};

use crate::bus::BusController;
use crate::common::TracerError;
use crate::config::TracerConfig;

/// Widest instruction the writer reads from the bus.
const MAX_INSTRUCTION_SIZE: usize = 8;

#[derive(Debug, Clone, Copy)]
struct TraceBlock {
    pc: u64,
    count: u32,
}

/// Totals reported when the tracer stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TraceStats {
    /// Blocks received.
    pub blocks: u64,
    /// Instruction lines written.
    pub instructions: u64,
    /// Bytes written to the file.
    pub bytes_written: u64,
    /// Opcode cache hits.
    pub cache_hits: u64,
    /// Opcode cache misses.
    pub cache_misses: u64,
}

/// Block trace written to a file by a background thread.
pub struct ExecutionTracer {
    path: PathBuf,
    format: TraceFormat,
    sender: Mutex<Option<Sender<TraceBlock>>>,
    writer: Mutex<Option<JoinHandle<Result<TraceStats, TracerError>>>>,
}

impl ExecutionTracer {
    /// Creates the trace file and starts the writer thread.
    ///
    /// # Arguments
    ///
    /// * `path` - Output file, truncated if it exists.
    /// * `config` - Format, flush threshold and cache capacity.
    /// * `bus` - Source of instruction bytes.
    /// * `disassembler` - Instruction decoder.
    pub fn start(
        path: impl AsRef<Path>,
        config: &TracerConfig,
        bus: Arc<dyn BusController>,
        disassembler: Box<dyn Disassembler>,
    ) -> Result<Self, TracerError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        let (sender, receiver) = mpsc::channel();
        let writer = TraceWriter {
            file,
            format: config.format,
            flush_threshold: config.flush_threshold_bytes.max(1),
            bus,
            disassembler,
            cache: OpcodeCache::new(config.opcode_cache_capacity),
            buffer: String::new(),
            stats: TraceStats::default(),
        };
        let handle = std::thread::Builder::new()
            .name("execution-tracer".to_string())
            .spawn(move || writer.run(&receiver))?;
        debug!(path = %path.display(), format = ?config.format, "execution tracer started");
        Ok(Self {
            path,
            format: config.format,
            sender: Mutex::new(Some(sender)),
            writer: Mutex::new(Some(handle)),
        })
    }

    /// Output file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Output format.
    pub const fn format(&self) -> TraceFormat {
        self.format
    }

    /// Queues a finished block. Dropped silently after [`ExecutionTracer::stop`].
    pub fn enqueue(&self, pc: u64, count: u32) {
        if count == 0 {
            return;
        }
        if let Some(sender) = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            let _ = sender.send(TraceBlock { pc, count });
        }
    }

    /// Whether the tracer still accepts blocks.
    pub fn is_running(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Closes the queue, waits until everything is written and returns the totals.
    pub fn stop(&self) -> Result<TraceStats, TracerError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_none() {
            return Err(TracerError::Stopped);
        }
        drop(sender);
        let handle = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TracerError::Stopped)?;
        let stats = handle.join().map_err(|_| TracerError::WriterPanicked)??;
        debug!(
            path = %self.path.display(),
            blocks = stats.blocks,
            instructions = stats.instructions,
            "execution tracer stopped"
        );
        Ok(stats)
    }
}

impl Drop for ExecutionTracer {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.stop() {
                warn!(path = %self.path.display(), error = %e, "execution tracer failed while stopping");
            }
        }
    }
}

impl std::fmt::Debug for ExecutionTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionTracer")
            .field("path", &self.path)
            .field("format", &self.format)
            .field("running", &self.is_running())
            .finish()
    }
}

struct TraceWriter {
    file: File,
    format: TraceFormat,
    flush_threshold: usize,
    bus: Arc<dyn BusController>,
    disassembler: Box<dyn Disassembler>,
    cache: OpcodeCache,
    buffer: String,
    stats: TraceStats,
}

impl TraceWriter {
    fn run(mut self, receiver: &Receiver<TraceBlock>) -> Result<TraceStats, TracerError> {
        loop {
            let block = match receiver.try_recv() {
                Ok(block) => block,
                Err(TryRecvError::Empty) => {
                    self.write_out()?;
                    match receiver.recv() {
                        Ok(block) => block,
                        Err(_) => break,
                    }
                }
                Err(TryRecvError::Disconnected) => break,
            };
            self.trace_block(block);
            if self.buffer.len() >= self.flush_threshold {
                self.write_out()?;
            }
        }
        self.write_out()?;
        self.file.flush()?;
        self.stats.cache_hits = self.cache.hits();
        self.stats.cache_misses = self.cache.misses();
        Ok(self.stats)
    }

    fn write_out(&mut self) -> Result<(), TracerError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.file.write_all(self.buffer.as_bytes())?;
        self.stats.bytes_written += self.buffer.len() as u64;
        self.buffer.clear();
        Ok(())
    }

    fn fetch(&self, pc: u64) -> Vec<u8> {
        let mut size = MAX_INSTRUCTION_SIZE;
        while size > 0 {
            let mut bytes = vec![0u8; size];
            if self.bus.read_bytes(pc, &mut bytes) {
                return bytes;
            }
            size /= 2;
        }
        Vec::new()
    }

    fn decode(&mut self, pc: u64, bytes: &[u8]) -> Disassembled {
        let prefix = &bytes[..bytes.len().min(cache::MAX_CACHEABLE_SIZE)];
        let key = OpcodeCache::key(prefix);
        if let Some(hit) = key.and_then(|k| self.cache.get(k)) {
            return hit;
        }
        let decoded = self.disassembler.disassemble(pc, bytes);
        match decoded {
            Some(decoded) => {
                if let Some(key) = key {
                    if !decoded.pc_relative && decoded.size <= cache::MAX_CACHEABLE_SIZE {
                        self.cache.insert(key, decoded.clone());
                    }
                }
                decoded
            }
            None => Disassembled {
                size: prefix.len().max(1),
                text: "<invalid>".to_string(),
                pc_relative: false,
            },
        }
    }

    fn trace_block(&mut self, block: TraceBlock) {
        self.stats.blocks += 1;
        let mut pc = block.pc;
        for _ in 0..block.count {
            let bytes = self.fetch(pc);
            let decoded = self.decode(pc, &bytes);
            let size = decoded.size.clamp(1, bytes.len().max(1));
            let opcode = &bytes[..size.min(bytes.len())];
            format::write_line(
                &mut self.buffer,
                self.format,
                pc,
                opcode,
                Some(decoded.text.as_str()),
            );
            self.stats.instructions += 1;
            pc = pc.wrapping_add(size as u64);
        }
    }
}
