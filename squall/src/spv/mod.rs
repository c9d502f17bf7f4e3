//! SPIR-V word stream parsing and rewriting.
//!
//! The instrumentation passes work directly on the module's word
//! stream: parse the header, walk instructions, and splice new
//! sequences in front of the accesses being validated. Anything
//! deeper than that (full def-use graphs, control flow analysis) is
//! deliberately out of scope; the passes only need block boundaries,
//! fresh result ids, and a handful of shared type declarations.
//
// Austin Shafer - 2025

pub mod emit;

use crate::{Result, SquallError};
use spirv_headers::Op;

pub const SPIRV_MAGIC: u32 = 0x0723_0203;
const HEADER_WORDS: usize = 5;

/// A parsed SPIR-V module
///
/// `m_data` always holds a header-complete word stream. The id bound
/// in the header is kept in sync with `m_bound` when the module is
/// serialized back out.
#[derive(Debug, Clone)]
pub struct Module {
    m_data: Vec<u32>,
    m_version: (u8, u8),
    m_bound: u32,
}

/// One instruction inside the word stream
#[derive(Debug, Copy, Clone)]
pub struct InstRef {
    /// Word offset of the instruction in the module
    pub offset: usize,
    pub opcode: u16,
    pub word_count: usize,
}

impl Module {
    pub fn from_bytes(data: &[u8]) -> Result<Module> {
        if data.len() < HEADER_WORDS * 4 || data.len() % 4 != 0 {
            return Err(SquallError::INVALID_SPIRV);
        }

        let words: Vec<u32> = data
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::from_words(&words)
    }

    pub fn from_words(words: &[u32]) -> Result<Module> {
        if words.len() < HEADER_WORDS {
            return Err(SquallError::INVALID_SPIRV);
        }
        if words[0] != SPIRV_MAGIC {
            return Err(SquallError::INVALID_SPIRV);
        }

        let version = (
            ((words[1] & 0x00ff_0000) >> 16) as u8,
            ((words[1] & 0x0000_ff00) >> 8) as u8,
        );

        Ok(Module {
            m_data: words.to_vec(),
            m_version: version,
            m_bound: words[3],
        })
    }

    pub fn version(&self) -> (u8, u8) {
        self.m_version
    }

    pub fn id_bound(&self) -> u32 {
        self.m_bound
    }

    /// Mint a fresh result id
    pub fn fresh_id(&mut self) -> u32 {
        let id = self.m_bound;
        self.m_bound += 1;
        id
    }

    pub fn words(&self) -> &[u32] {
        &self.m_data
    }

    /// Serialize with the header's id bound brought up to date
    pub fn into_words(mut self) -> Vec<u32> {
        self.m_data[3] = self.m_bound;
        self.m_data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.into_words()
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect()
    }

    /// Operand words of an instruction (everything past word 0)
    pub fn operands(&self, inst: &InstRef) -> &[u32] {
        &self.m_data[inst.offset + 1..inst.offset + inst.word_count]
    }

    /// Walk every instruction in the module
    pub fn instructions(&self) -> InstIter {
        InstIter {
            ii_data: &self.m_data,
            ii_offset: HEADER_WORDS,
        }
    }

    /// Word offset where the first function begins, which is where
    /// global declarations end. New types and constants get spliced
    /// in right before this point.
    pub fn global_section_end(&self) -> usize {
        for inst in self.instructions() {
            if inst.opcode == Op::Function as u16 {
                return inst.offset;
            }
        }
        self.m_data.len()
    }

    /// Apply a set of insertions, each a word sequence to place
    /// before the given offset. Offsets refer to the pre-edit stream.
    pub fn apply_insertions(&mut self, mut insertions: Vec<(usize, Vec<u32>)>) {
        if insertions.is_empty() {
            return;
        }
        insertions.sort_by_key(|(offset, _)| *offset);

        let mut out = Vec::with_capacity(
            self.m_data.len() + insertions.iter().map(|(_, w)| w.len()).sum::<usize>(),
        );
        let mut cursor = 0;
        for (offset, words) in insertions {
            out.extend_from_slice(&self.m_data[cursor..offset]);
            out.extend_from_slice(&words);
            cursor = offset;
        }
        out.extend_from_slice(&self.m_data[cursor..]);
        self.m_data = out;
    }
}

pub struct InstIter<'m> {
    ii_data: &'m [u32],
    ii_offset: usize,
}

impl<'m> Iterator for InstIter<'m> {
    type Item = InstRef;

    fn next(&mut self) -> Option<InstRef> {
        if self.ii_offset >= self.ii_data.len() {
            return None;
        }

        let word = self.ii_data[self.ii_offset];
        let word_count = (word >> 16) as usize;
        let opcode = (word & 0xffff) as u16;
        if word_count == 0 || self.ii_offset + word_count > self.ii_data.len() {
            // A malformed count would spin us forever, bail
            return None;
        }

        let inst = InstRef {
            offset: self.ii_offset,
            opcode: opcode,
            word_count: word_count,
        };
        self.ii_offset += word_count;
        Some(inst)
    }
}

/// Pack an instruction's first word
pub fn inst_word(op: Op, word_count: usize) -> u32 {
    ((word_count as u32) << 16) | (op as u32 & 0xffff)
}

/// One basic block handed to an injection pass
///
/// The pass reads the block's instructions, mints what it needs from
/// the emitter, and queues word sequences to insert around specific
/// instructions. The pass manager owns applying them after every
/// pass has run over every block.
pub struct Block<'m, 'e> {
    b_module: &'m Module,
    b_emit: &'e mut emit::InstrumentationBuilder,
    /// Instructions of this block, label included
    b_insts: Vec<InstRef>,
    /// (pre-edit word offset, words) queued by the visiting pass
    b_insertions: Vec<(usize, Vec<u32>)>,
}

impl<'m, 'e> Block<'m, 'e> {
    pub fn instructions(&self) -> &[InstRef] {
        &self.b_insts
    }

    pub fn operands(&self, inst: &InstRef) -> &[u32] {
        self.b_module.operands(inst)
    }

    /// The shared emitter for ids, types, and canned sequences
    pub fn emit(&mut self) -> &mut emit::InstrumentationBuilder {
        self.b_emit
    }

    /// Queue `words` for insertion immediately before `inst`
    pub fn insert_before(&mut self, inst: &InstRef, words: Vec<u32>) {
        self.b_insertions.push((inst.offset, words));
    }

    /// Queue `words` for insertion immediately after `inst`
    pub fn insert_after(&mut self, inst: &InstRef, words: Vec<u32>) {
        self.b_insertions
            .push((inst.offset + inst.word_count, words));
    }
}

/// A shader rewrite pass contributed by a feature
///
/// Returns true from visit_block when it queued any edits, which is
/// what marks the shader as actually instrumented for that feature.
pub trait InjectionPass {
    fn name(&self) -> &'static str;

    /// One whole-module scan before any block is visited, for
    /// collecting global state like variable decorations
    fn prepare(&mut self, _module: &Module) {}

    fn visit_block(&mut self, block: &mut Block) -> bool;
}

/// Composes the features' passes over a module
pub struct PassManager {
    pm_passes: Vec<Box<dyn InjectionPass>>,
}

impl PassManager {
    pub fn new() -> Self {
        Self {
            pm_passes: Vec::new(),
        }
    }

    pub fn register(&mut self, pass: Box<dyn InjectionPass>) {
        self.pm_passes.push(pass);
    }

    pub fn is_empty(&self) -> bool {
        self.pm_passes.is_empty()
    }

    /// Run every registered pass over every basic block
    ///
    /// `diag_set` is the descriptor set slot the emitted declarations
    /// bind to. Returns true if any pass modified the module.
    pub fn run(&mut self, module: &mut Module, diag_set: u32) -> Result<bool> {
        let mut builder = emit::InstrumentationBuilder::new(module, diag_set);
        let mut all_insertions: Vec<(usize, Vec<u32>)> = Vec::new();
        let mut modified = false;

        for pass in self.pm_passes.iter_mut() {
            pass.prepare(module);
        }

        // Collect block ranges first, the borrow on the module has to
        // end before we edit it
        let blocks = Self::collect_blocks(module);

        for insts in blocks {
            let mut block = Block {
                b_module: module,
                b_emit: &mut builder,
                b_insts: insts,
                b_insertions: Vec::new(),
            };
            for pass in self.pm_passes.iter_mut() {
                if pass.visit_block(&mut block) {
                    modified = true;
                }
            }
            all_insertions.append(&mut block.b_insertions);
        }

        module.apply_insertions(all_insertions);
        builder.finish(module);
        Ok(modified)
    }

    /// Split the module's functions into basic blocks
    fn collect_blocks(module: &Module) -> Vec<Vec<InstRef>> {
        let mut blocks = Vec::new();
        let mut current: Option<Vec<InstRef>> = None;

        for inst in module.instructions() {
            let op = inst.opcode;
            if op == Op::Label as u16 {
                if let Some(block) = current.take() {
                    blocks.push(block);
                }
                current = Some(vec![inst]);
            } else if op == Op::FunctionEnd as u16 {
                if let Some(block) = current.take() {
                    blocks.push(block);
                }
            } else if let Some(block) = current.as_mut() {
                block.push(inst);
            }
        }
        if let Some(block) = current.take() {
            blocks.push(block);
        }

        blocks
    }
}
