// Shader source location registry
//
// Instrumented code cannot afford to embed full source locations in
// its 64-bit messages, so each (shader, instruction offset) pair that
// can emit a message is interned here into a dense SGUID small enough
// to pack. Handlers resolve the SGUID back when building reports.
//
// Austin Shafer - 2025

use fxhash::FxHashMap;
use std::sync::Mutex;

/// SGUIDs pack into 20-bit message fields
pub const SGUID_BITS: u32 = 20;
pub const SGUID_CEILING: usize = (1 << SGUID_BITS) - 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SguidEntry {
    /// Content hash of the shader the location lives in
    pub shader_hash: u64,
    /// Word offset of the instrumented instruction
    pub inst_offset: u32,
}

struct RegistryInternal {
    ri_lookup: FxHashMap<(u64, u32), u32>,
    ri_entries: Vec<SguidEntry>,
}

pub struct SguidRegistry {
    sr_internal: Mutex<RegistryInternal>,
}

impl SguidRegistry {
    pub fn new() -> Self {
        Self {
            sr_internal: Mutex::new(RegistryInternal {
                ri_lookup: FxHashMap::default(),
                ri_entries: Vec::new(),
            }),
        }
    }

    /// Intern a location, returning its dense id
    ///
    /// Returns None once the 20-bit space is exhausted; the rewrite
    /// pass then reuses sguid 0, which resolves to "unknown location".
    pub fn intern(&self, shader_hash: u64, inst_offset: u32) -> Option<u32> {
        let mut internal = self.sr_internal.lock().unwrap();

        if let Some(id) = internal.ri_lookup.get(&(shader_hash, inst_offset)) {
            return Some(*id);
        }

        if internal.ri_entries.len() >= SGUID_CEILING {
            return None;
        }

        // sguid 0 is reserved for "unknown"
        let id = internal.ri_entries.len() as u32 + 1;
        internal.ri_entries.push(SguidEntry {
            shader_hash: shader_hash,
            inst_offset: inst_offset,
        });
        internal.ri_lookup.insert((shader_hash, inst_offset), id);
        Some(id)
    }

    pub fn resolve(&self, sguid: u32) -> Option<SguidEntry> {
        if sguid == 0 {
            return None;
        }
        let internal = self.sr_internal.lock().unwrap();
        internal.ri_entries.get(sguid as usize - 1).copied()
    }
}
