// Interned shader records
//
// Shader modules are interned by content hash: two modules created
// with identical bytecode share one record, and with it every
// instrumented variant. Variants are keyed by the full
// instrumentation key, since a shader shared by two pipelines with
// different layouts needs different rewrites.
//
// Austin Shafer - 2025

use fxhash::{FxHashMap, FxHasher};

use std::hash::Hasher;
use std::sync::{Arc, Mutex};

pub type ContentHash = u64;

pub fn hash_bytecode(bytecode: &[u8]) -> ContentHash {
    let mut hasher = FxHasher::default();
    hasher.write(bytecode);
    hasher.finish()
}

/// Identifies one instrumented variant of a shader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrumentationKey {
    /// The feature bit set the variant was compiled for
    pub features: u64,
    /// Summary hash of the owning pipeline's layout
    pub layout_summary: u64,
    /// Hash of the concatenated specialization streams
    pub specialization_hash: u64,
}

/// State of one variant slot
pub enum VariantSlot {
    /// A compile job holds the reservation
    Reserved,
    Compiled(Arc<Vec<u8>>),
    Failed,
}

/// One interned shader module
pub struct ShaderRecord {
    sr_hash: ContentHash,
    sr_bytecode: Vec<u8>,
    sr_variants: Mutex<FxHashMap<InstrumentationKey, VariantSlot>>,
}

impl ShaderRecord {
    pub fn hash(&self) -> ContentHash {
        self.sr_hash
    }

    pub fn bytecode(&self) -> &[u8] {
        &self.sr_bytecode
    }

    /// Try to claim compilation of a variant
    ///
    /// Only one job may compile each key; the first caller to reserve
    /// wins and everyone else skips. Re-reserving a failed slot is
    /// allowed so a later batch can retry after its inputs changed.
    pub fn reserve(&self, key: InstrumentationKey) -> bool {
        let mut variants = self.sr_variants.lock().unwrap();
        match variants.get(&key) {
            None | Some(VariantSlot::Failed) => {
                variants.insert(key, VariantSlot::Reserved);
                true
            }
            Some(_) => false,
        }
    }

    /// Store the outcome of a reserved compile
    pub fn store(&self, key: InstrumentationKey, result: Option<Vec<u8>>) {
        let mut variants = self.sr_variants.lock().unwrap();
        let slot = match result {
            Some(bytes) => VariantSlot::Compiled(Arc::new(bytes)),
            None => VariantSlot::Failed,
        };
        variants.insert(key, slot);
    }

    /// Fetch a compiled variant, None while pending or failed
    pub fn get_variant(&self, key: &InstrumentationKey) -> Option<Arc<Vec<u8>>> {
        let variants = self.sr_variants.lock().unwrap();
        match variants.get(key) {
            Some(VariantSlot::Compiled(bytes)) => Some(bytes.clone()),
            _ => None,
        }
    }
}

/// The per-device shader intern table
///
/// Records stay alive while any pipeline holds a handle. Removing a
/// dead record happens under the store lock, which closes the race
/// against a concurrent lookup reviving the entry.
pub struct ShaderStore {
    ss_records: Mutex<FxHashMap<ContentHash, Arc<ShaderRecord>>>,
}

impl ShaderStore {
    pub fn new() -> Self {
        Self {
            ss_records: Mutex::new(FxHashMap::default()),
        }
    }

    /// Intern a module's bytecode
    pub fn intern(&self, bytecode: &[u8]) -> Arc<ShaderRecord> {
        let hash = hash_bytecode(bytecode);
        let mut records = self.ss_records.lock().unwrap();

        if let Some(record) = records.get(&hash) {
            return record.clone();
        }

        let record = Arc::new(ShaderRecord {
            sr_hash: hash,
            sr_bytecode: bytecode.to_vec(),
            sr_variants: Mutex::new(FxHashMap::default()),
        });
        records.insert(hash, record.clone());
        record
    }

    pub fn get(&self, hash: ContentHash) -> Option<Arc<ShaderRecord>> {
        self.ss_records.lock().unwrap().get(&hash).cloned()
    }

    /// Drop records no pipeline references anymore
    pub fn collect(&self) {
        let mut records = self.ss_records.lock().unwrap();
        records.retain(|_, record| Arc::strong_count(record) > 1);
    }

    pub fn len(&self) -> usize {
        self.ss_records.lock().unwrap().len()
    }
}
