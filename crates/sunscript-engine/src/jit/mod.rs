//! Tracing JIT infrastructure
//!
//! The dispatcher tees executed opcodes into the [`recorder`], which
//! streams typed IR through the [`pipeline`] into a [`backend`]. The
//! [`JitRuntime`] wires those pieces together and owns the trace
//! [`cache`].

pub mod backend;
pub mod cache;
pub mod ir;
pub mod pipeline;
pub mod recorder;
pub mod snapshot;

use backend::{CompileError, TraceBackend};
use cache::{TraceCache, TraceEntry};
use pipeline::OptLevel;
use recorder::{TraceEvent, TraceRecorder, TraceSink};

/// The VM-side JIT driver: back-end, recorder, and trace cache
pub struct JitRuntime {
    backend: Box<dyn TraceBackend>,
    recorder: TraceRecorder,
    cache: TraceCache,
}

impl JitRuntime {
    /// Create a runtime around `backend`, recording at full optimization.
    pub fn new(mut backend: Box<dyn TraceBackend>) -> Self {
        backend.initialize();
        JitRuntime {
            backend,
            recorder: TraceRecorder::new(OptLevel::Full),
            cache: TraceCache::new(),
        }
    }

    /// Set the optimization level for future recordings.
    pub fn set_optimization_level(&mut self, level: u8) {
        self.recorder.set_level(OptLevel::from_u8(level));
    }

    /// Back-end name, for diagnostics.
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Whether a recording is in progress.
    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    /// Compiled trace anchored at `pc`, if any.
    pub fn trace_at(&self, pc: usize) -> Option<&TraceEntry> {
        self.cache.get(pc)
    }

    /// Borrow the back-end for trace execution.
    pub fn backend_mut(&mut self) -> &mut dyn TraceBackend {
        self.backend.as_mut()
    }

    /// Execute the compiled trace anchored at `pc`, if any. Returns the
    /// back-end status and the bytecode pc of the snapshot the exit went
    /// through.
    pub fn execute_at(
        &mut self,
        pc: usize,
        ctx: &mut backend::TraceContext<'_>,
        exit: &mut backend::TraceExit,
    ) -> Option<(crate::vm::Status, usize)> {
        let handle = self.cache.get(pc)?.handle;
        let status = self.backend.execute(handle, ctx, exit);
        let entry = self.cache.get(pc)?;
        let resume_pc = entry
            .snapshots
            .get(exit.snap_id as usize)
            .map(|snapshot| snapshot.pc())
            .unwrap_or(pc);
        Some((status, resume_pc))
    }

    /// Number of compiled traces.
    pub fn compiled_traces(&self) -> usize {
        self.cache.len()
    }

    /// Begin recording at a trace-start marker, unless this site already
    /// has a trace or previously failed.
    pub fn maybe_start_recording(&mut self, pc: usize) {
        if self.recorder.is_idle() && !self.cache.contains(pc) && !self.cache.is_blacklisted(pc) {
            self.recorder.start(pc);
        }
    }

    /// Discard any in-progress recording (run boundary, error unwind).
    pub fn reset_recording(&mut self) {
        self.recorder.reset();
    }

    /// Throw a trace away and stop recording at its site. Used when a
    /// guard exit lands back on the loop head: the type assumptions the
    /// trace was built on no longer hold there.
    pub fn evict(&mut self, pc: usize) {
        self.cache.remove(pc);
        self.cache.blacklist(pc);
    }

    /// Drop all traces (new program image).
    pub fn clear(&mut self) {
        self.recorder.reset();
        self.cache.clear();
    }

    fn finish_if_ready(&mut self) {
        if self.recorder.is_aborted() {
            self.cache.blacklist(self.recorder.start_pc());
            self.recorder.reset();
            return;
        }
        let recording = match self.recorder.take_recording() {
            Some(recording) => recording,
            None => return,
        };
        match self.backend.compile_trace(&recording) {
            Ok(handle) => {
                self.cache.insert(TraceEntry {
                    start_pc: recording.start_pc,
                    handle,
                    snapshots: recording.snapshots,
                    head_snap: recording.head_snap,
                });
            }
            Err(CompileError::Unsupported(_)) | Err(CompileError::Unavailable) => {
                self.cache.blacklist(recording.start_pc);
            }
        }
    }
}

impl TraceSink for JitRuntime {
    fn record(&mut self, _pc: usize, next_pc: usize, event: TraceEvent<'_>) {
        if !self.recorder.is_recording() {
            return;
        }
        self.recorder.record(next_pc, event);
        self.finish_if_ready();
    }
}

impl Drop for JitRuntime {
    fn drop(&mut self) {
        self.backend.shutdown();
    }
}
