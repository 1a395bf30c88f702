//! Symbolization: runtime instruction pointer → source-level frames.
//!
//! Layered: mapping lookup against the session's snapshot, translation into
//! the library's file-virtual address space, then a pluggable backend
//! (native ELF/DWARF via blazesym, an out-of-process symbolizer over pipes,
//! or a deterministic fake for tests). Results are memoized process-wide in
//! a single-flight cache: once a `(library, file_vaddr)` pair resolves, it
//! resolves to the same value for the lifetime of the process.

pub mod external;
pub mod fake;
pub mod native;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use smallvec::{SmallVec, smallvec};

use crate::error::Result;
use crate::maps::{DynamicLibMapping, MappingSnapshot};

pub use external::ExternalBackend;
pub use fake::FakeBackend;
pub use native::NativeBackend;

/// Function name synthesized when a backend answers but has no symbol
/// covering the address.
pub const UNKNOWN_UNSET: &str = "<unknown-unset>";

/// One source-level frame at an address.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleFrame {
    /// File-virtual address within the library (or the raw IP when no
    /// mapping contained it).
    pub address: u64,
    pub function_name: String,
    pub function_offset: u64,
    /// Short library label, e.g. `libfoo` for `/lib/libfoo.so`.
    pub library: Option<String>,
    pub vmap: Option<DynamicLibMapping>,
    pub source_file: Option<String>,
    pub source_line: Option<u32>,
}

/// Everything one IP resolves to: at least one frame; more than one only
/// when the backend reports inlining (innermost inlinee first, the physical
/// frame last).
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolisedStackFrame {
    pub frames: SmallVec<[SingleFrame; 2]>,
}

impl SymbolisedStackFrame {
    /// Synthetic resolution for an IP no mapping contained.
    pub fn unknown(ip: u64) -> Self {
        Self {
            frames: smallvec![SingleFrame {
                address: ip,
                function_name: format!("unknown @ {ip:#x}"),
                function_offset: 0,
                library: None,
                vmap: None,
                source_file: None,
                source_line: None,
            }],
        }
    }

    /// Synthetic resolution for an address the backend had no symbol for.
    pub fn unresolved(mapping: &DynamicLibMapping, file_vaddr: u64) -> Self {
        Self {
            frames: smallvec![SingleFrame {
                address: file_vaddr,
                function_name: UNKNOWN_UNSET.to_string(),
                function_offset: 0,
                library: Some(mapping.library_label().to_string()),
                vmap: Some(mapping.clone()),
                source_file: None,
                source_line: None,
            }],
        }
    }
}

/// A symbolization backend. Implementations must be callable from any
/// thread; per-query failures are returned as errors and the caller
/// substitutes a synthetic frame.
pub trait SymbolizeBackend: Send + Sync {
    fn symbolize(&self, mapping: &DynamicLibMapping, file_vaddr: u64) -> Result<Vec<SingleFrame>>;

    /// Release backend resources; outstanding queries fail with
    /// `Cancelled`. Idempotent.
    fn shutdown(&self) {}
}

/// Which backend a session should use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendChoice {
    Native,
    Fake,
    External { command: Vec<String> },
}

impl BackendChoice {
    pub fn create(&self) -> Result<Box<dyn SymbolizeBackend>> {
        Ok(match self {
            BackendChoice::Native => Box::new(NativeBackend::new()),
            BackendChoice::Fake => Box::new(FakeBackend),
            BackendChoice::External { command } => {
                Box::new(ExternalBackend::start(command.clone())?)
            }
        })
    }

    /// Parse the HTTP-facing backend name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "native" => Some(BackendChoice::Native),
            "fake" => Some(BackendChoice::Fake),
            _ => None,
        }
    }
}

type CacheKey = (String, u64);

/// Process-wide memoization of backend lookups with single-flight
/// semantics: concurrent misses on the same key subscribe to one in-flight
/// resolution instead of issuing duplicate backend queries. Distinct keys
/// proceed in parallel.
#[derive(Default)]
pub struct SymbolCache {
    entries: Mutex<HashMap<CacheKey, Arc<OnceLock<SymbolisedStackFrame>>>>,
}

impl SymbolCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_resolve(
        &self,
        path: &str,
        file_vaddr: u64,
        resolve: impl FnOnce() -> SymbolisedStackFrame,
    ) -> SymbolisedStackFrame {
        let cell = {
            let mut entries = self.entries.lock().unwrap();
            entries
                .entry((path.to_string(), file_vaddr))
                .or_default()
                .clone()
        };
        // OnceLock serializes concurrent initializers of the same key; the
        // winner's value is what everyone observes, forever.
        cell.get_or_init(resolve).clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The symbolization front end: mapping snapshot + backend + shared cache.
pub struct Symbolizer {
    mappings: Arc<MappingSnapshot>,
    backend: Box<dyn SymbolizeBackend>,
    cache: SymbolCache,
}

impl Symbolizer {
    pub fn new(mappings: Arc<MappingSnapshot>, backend: Box<dyn SymbolizeBackend>) -> Self {
        Self {
            mappings,
            backend,
            cache: SymbolCache::new(),
        }
    }

    pub fn mappings(&self) -> &MappingSnapshot {
        &self.mappings
    }

    /// Resolve one runtime IP. Never fails: mapping misses and backend
    /// errors degrade to synthetic frames.
    pub fn symbolize_ip(&self, ip: u64) -> SymbolisedStackFrame {
        let Some(mapping) = self.mappings.lookup(ip) else {
            return SymbolisedStackFrame::unknown(ip);
        };
        let file_vaddr = mapping.file_vaddr(ip);
        self.cache
            .get_or_resolve(&mapping.path, file_vaddr, || {
                match self.backend.symbolize(mapping, file_vaddr) {
                    Ok(frames) if !frames.is_empty() => SymbolisedStackFrame {
                        frames: SmallVec::from_vec(frames),
                    },
                    Ok(_) => SymbolisedStackFrame::unresolved(mapping, file_vaddr),
                    Err(err) => {
                        tracing::debug!(ip, library = %mapping.path, %err, "backend lookup failed");
                        SymbolisedStackFrame::unresolved(mapping, file_vaddr)
                    }
                }
            })
    }

    pub fn shutdown(&self) {
        self.backend.shutdown();
    }
}
