// SPIR-V instrumentation emitter
//
// The injection passes all need the same scaffolding: fresh ids, a
// handful of scalar types, constants, the GLSL extended instruction
// set, and the module-level declarations for the diagnostic stream
// bindings. This builder caches what already exists in the module,
// mints what does not, and splices the new declarations into the
// right sections when the passes are done.
//
// Austin Shafer - 2025

use super::{inst_word, Module};
use crate::streamer::descpool::{
    BINDING_COUNTER, BINDING_PRMT, BINDING_SHADER_DATA, BINDING_STREAM, SHADER_DATA_COUNT,
};
use fxhash::FxHashMap;
use spirv_headers::{Op, StorageClass};

/// GLSL.std.450 UMin
const GLSL_UMIN: u32 = 39;

pub struct InstrumentationBuilder {
    eb_next_id: u32,
    /// Words destined for the extended instruction import section
    eb_ext_imports: Vec<u32>,
    /// Words destined for the annotation section
    eb_decorations: Vec<u32>,
    /// Words destined for the types/constants/variables section
    eb_globals: Vec<u32>,

    /// The diagnostic descriptor set slot for this pipeline layout
    eb_diag_set: u32,

    // cached ids, module-scanned or freshly declared
    eb_ty_bool: Option<u32>,
    eb_ty_u32: Option<u32>,
    eb_ty_u64: Option<u32>,
    eb_glsl_ext: Option<u32>,
    eb_consts_u32: FxHashMap<u32, u32>,
    eb_counter_var: Option<u32>,
    eb_stream_var: Option<u32>,
    eb_ptr_counter: Option<u32>,
    eb_ptr_stream: Option<u32>,
    eb_prmt_var: Option<u32>,
    eb_shader_data_var: Option<u32>,
    eb_ptr_word: Option<u32>,
}

impl InstrumentationBuilder {
    /// Scan the module for reusable declarations and seed the id
    /// counter past its bound
    pub fn new(module: &Module, diag_set: u32) -> Self {
        let mut ret = Self {
            eb_next_id: module.id_bound(),
            eb_ext_imports: Vec::new(),
            eb_decorations: Vec::new(),
            eb_globals: Vec::new(),
            eb_diag_set: diag_set,
            eb_ty_bool: None,
            eb_ty_u32: None,
            eb_ty_u64: None,
            eb_glsl_ext: None,
            eb_consts_u32: FxHashMap::default(),
            eb_counter_var: None,
            eb_stream_var: None,
            eb_ptr_counter: None,
            eb_ptr_stream: None,
            eb_prmt_var: None,
            eb_shader_data_var: None,
            eb_ptr_word: None,
        };

        for inst in module.instructions() {
            let ops = module.operands(&inst);
            if inst.opcode == Op::TypeBool as u16 && ops.len() == 1 {
                ret.eb_ty_bool = Some(ops[0]);
            } else if inst.opcode == Op::TypeInt as u16 && ops.len() == 3 && ops[2] == 0 {
                match ops[1] {
                    32 => ret.eb_ty_u32 = Some(ops[0]),
                    64 => ret.eb_ty_u64 = Some(ops[0]),
                    _ => {}
                }
            }
        }

        ret
    }

    pub fn fresh_id(&mut self) -> u32 {
        let id = self.eb_next_id;
        self.eb_next_id += 1;
        id
    }

    pub fn type_bool(&mut self) -> u32 {
        if let Some(id) = self.eb_ty_bool {
            return id;
        }
        let id = self.fresh_id();
        self.eb_globals
            .extend_from_slice(&[inst_word(Op::TypeBool, 2), id]);
        self.eb_ty_bool = Some(id);
        id
    }

    pub fn type_u32(&mut self) -> u32 {
        if let Some(id) = self.eb_ty_u32 {
            return id;
        }
        let id = self.fresh_id();
        self.eb_globals
            .extend_from_slice(&[inst_word(Op::TypeInt, 4), id, 32, 0]);
        self.eb_ty_u32 = Some(id);
        id
    }

    pub fn type_u64(&mut self) -> u32 {
        if let Some(id) = self.eb_ty_u64 {
            return id;
        }
        let id = self.fresh_id();
        self.eb_globals
            .extend_from_slice(&[inst_word(Op::TypeInt, 4), id, 64, 0]);
        self.eb_ty_u64 = Some(id);
        id
    }

    pub fn const_u32(&mut self, value: u32) -> u32 {
        if let Some(id) = self.eb_consts_u32.get(&value) {
            return *id;
        }
        let ty = self.type_u32();
        let id = self.fresh_id();
        self.eb_globals
            .extend_from_slice(&[inst_word(Op::Constant, 4), ty, id, value]);
        self.eb_consts_u32.insert(value, id);
        id
    }

    /// Import GLSL.std.450, needed for the branchless clamps
    pub fn glsl_ext(&mut self) -> u32 {
        if let Some(id) = self.eb_glsl_ext {
            return id;
        }
        let id = self.fresh_id();
        // "GLSL.std.450" padded to word boundary
        let name = b"GLSL.std.450\0\0\0\0";
        let mut words = vec![inst_word(Op::ExtInstImport, 2 + 4), id];
        for chunk in name.chunks(4) {
            words.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        self.eb_ext_imports.extend_from_slice(&words);
        self.eb_glsl_ext = Some(id);
        id
    }

    /// Declare the message counter binding: a storage buffer holding
    /// the stream header, of which member 0 is written_count
    pub fn counter_var(&mut self) -> u32 {
        if let Some(id) = self.eb_counter_var {
            return id;
        }
        let u32_ty = self.type_u32();

        // struct { u32 written; u32 capacity; u32 cookie; u32 transferred }
        let struct_ty = self.fresh_id();
        self.eb_globals.extend_from_slice(&[
            inst_word(Op::TypeStruct, 6),
            struct_ty,
            u32_ty,
            u32_ty,
            u32_ty,
            u32_ty,
        ]);
        let ptr_struct = self.fresh_id();
        self.eb_globals.extend_from_slice(&[
            inst_word(Op::TypePointer, 4),
            ptr_struct,
            StorageClass::StorageBuffer as u32,
            struct_ty,
        ]);
        let var = self.fresh_id();
        self.eb_globals.extend_from_slice(&[
            inst_word(Op::Variable, 4),
            ptr_struct,
            var,
            StorageClass::StorageBuffer as u32,
        ]);

        // Block decoration plus member offsets, then the binding slot
        self.eb_decorations.extend_from_slice(&[
            inst_word(Op::Decorate, 3),
            struct_ty,
            spirv_headers::Decoration::Block as u32,
        ]);
        for member in 0..4u32 {
            self.eb_decorations.extend_from_slice(&[
                inst_word(Op::MemberDecorate, 5),
                struct_ty,
                member,
                spirv_headers::Decoration::Offset as u32,
                member * 4,
            ]);
        }
        self.decorate_binding(var, BINDING_COUNTER);

        let ptr_u32 = self.fresh_id();
        self.eb_globals.extend_from_slice(&[
            inst_word(Op::TypePointer, 4),
            ptr_u32,
            StorageClass::StorageBuffer as u32,
            u32_ty,
        ]);

        self.eb_counter_var = Some(var);
        self.eb_ptr_counter = Some(ptr_u32);
        var
    }

    /// Declare the message stream binding: a storage buffer of u64
    /// slots
    pub fn stream_var(&mut self) -> u32 {
        if let Some(id) = self.eb_stream_var {
            return id;
        }
        let u64_ty = self.type_u64();

        let array_ty = self.fresh_id();
        self.eb_globals
            .extend_from_slice(&[inst_word(Op::TypeRuntimeArray, 3), array_ty, u64_ty]);
        let struct_ty = self.fresh_id();
        self.eb_globals
            .extend_from_slice(&[inst_word(Op::TypeStruct, 3), struct_ty, array_ty]);
        let ptr_struct = self.fresh_id();
        self.eb_globals.extend_from_slice(&[
            inst_word(Op::TypePointer, 4),
            ptr_struct,
            StorageClass::StorageBuffer as u32,
            struct_ty,
        ]);
        let var = self.fresh_id();
        self.eb_globals.extend_from_slice(&[
            inst_word(Op::Variable, 4),
            ptr_struct,
            var,
            StorageClass::StorageBuffer as u32,
        ]);

        self.eb_decorations.extend_from_slice(&[
            inst_word(Op::Decorate, 4),
            array_ty,
            spirv_headers::Decoration::ArrayStride as u32,
            8,
        ]);
        self.eb_decorations.extend_from_slice(&[
            inst_word(Op::Decorate, 3),
            struct_ty,
            spirv_headers::Decoration::Block as u32,
        ]);
        self.eb_decorations.extend_from_slice(&[
            inst_word(Op::MemberDecorate, 5),
            struct_ty,
            0,
            spirv_headers::Decoration::Offset as u32,
            0,
        ]);
        self.decorate_binding(var, BINDING_STREAM);

        let ptr_u64 = self.fresh_id();
        self.eb_globals.extend_from_slice(&[
            inst_word(Op::TypePointer, 4),
            ptr_u64,
            StorageClass::StorageBuffer as u32,
            u64_ty,
        ]);

        self.eb_stream_var = Some(var);
        self.eb_ptr_stream = Some(ptr_u64);
        var
    }

    fn decorate_binding(&mut self, var: u32, binding: u32) {
        self.eb_decorations.extend_from_slice(&[
            inst_word(Op::Decorate, 4),
            var,
            spirv_headers::Decoration::DescriptorSet as u32,
            self.eb_diag_set,
        ]);
        self.eb_decorations.extend_from_slice(&[
            inst_word(Op::Decorate, 4),
            var,
            spirv_headers::Decoration::Binding as u32,
            binding,
        ]);
    }

    /// Emit the message export sequence
    ///
    /// Bumps the stream counter atomically, clamps the claimed slot
    /// to the capacity (branchless, slots past the limit all collide
    /// on the last entry which the drain ignores), and stores the
    /// packed message. `message_id` must be a u64-typed id already
    /// computed in the block.
    pub fn emit_message_export(&mut self, message_id: u32) -> Vec<u32> {
        let counter = self.counter_var();
        let stream = self.stream_var();
        let ptr_counter = self.eb_ptr_counter.unwrap();
        let ptr_stream = self.eb_ptr_stream.unwrap();
        let u32_ty = self.type_u32();
        let glsl = self.glsl_ext();

        let zero = self.const_u32(0);
        let one = self.const_u32(1);
        // Device scope, no additional ordering: the counter is only
        // reconciled after the submission fences
        let scope = self.const_u32(1);
        let semantics = self.const_u32(0);

        let counter_ptr = self.fresh_id();
        let old = self.fresh_id();
        let cap_ptr = self.fresh_id();
        let cap = self.fresh_id();
        let cap_minus = self.fresh_id();
        let slot = self.fresh_id();
        let slot_ptr = self.fresh_id();

        let mut words = Vec::new();
        // &counter.written_count
        words.extend_from_slice(&[
            inst_word(Op::AccessChain, 5),
            ptr_counter,
            counter_ptr,
            counter,
            zero,
        ]);
        // old = atomicAdd(written_count, 1)
        words.extend_from_slice(&[
            inst_word(Op::AtomicIAdd, 7),
            u32_ty,
            old,
            counter_ptr,
            scope,
            semantics,
            one,
        ]);
        // cap = counter.capacity
        words.extend_from_slice(&[
            inst_word(Op::AccessChain, 5),
            ptr_counter,
            cap_ptr,
            counter,
            one,
        ]);
        words.extend_from_slice(&[inst_word(Op::Load, 4), u32_ty, cap, cap_ptr]);
        // slot = min(old, cap - 1)
        words.extend_from_slice(&[inst_word(Op::ISub, 5), u32_ty, cap_minus, cap, one]);
        words.extend_from_slice(&[
            inst_word(Op::ExtInst, 7),
            u32_ty,
            slot,
            glsl,
            GLSL_UMIN,
            old,
            cap_minus,
        ]);
        // stream.slots[slot] = message
        words.extend_from_slice(&[
            inst_word(Op::AccessChain, 6),
            ptr_stream,
            slot_ptr,
            stream,
            zero,
            slot,
        ]);
        words.extend_from_slice(&[inst_word(Op::Store, 3), slot_ptr, message_id]);

        words
    }

    /// Emit a u64 constant-or composition: base_const | (id zext'd)
    ///
    /// Used to fold a runtime detail value into a packed message
    /// whose type and static fields were computed at rewrite time.
    pub fn emit_pack_message(&mut self, static_bits: u64, detail_id_u32: u32) -> (Vec<u32>, u32) {
        let u64_ty = self.type_u64();

        // u64 constants take two words, low then high
        let base = self.fresh_id();
        self.eb_globals.extend_from_slice(&[
            inst_word(Op::Constant, 5),
            u64_ty,
            base,
            (static_bits & 0xffff_ffff) as u32,
            (static_bits >> 32) as u32,
        ]);

        let detail64 = self.fresh_id();
        let packed = self.fresh_id();
        let words = vec![
            inst_word(Op::UConvert, 4),
            u64_ty,
            detail64,
            detail_id_u32,
            inst_word(Op::BitwiseOr, 5),
            u64_ty,
            packed,
            base,
            detail64,
        ];
        (words, packed)
    }

    /// A word-addressed storage buffer type: struct { u32[] } with
    /// the usual block decorations. Returns (struct_ty, ptr_u32).
    fn word_buffer_type(&mut self) -> (u32, u32) {
        let u32_ty = self.type_u32();

        let array_ty = self.fresh_id();
        self.eb_globals
            .extend_from_slice(&[inst_word(Op::TypeRuntimeArray, 3), array_ty, u32_ty]);
        let struct_ty = self.fresh_id();
        self.eb_globals
            .extend_from_slice(&[inst_word(Op::TypeStruct, 3), struct_ty, array_ty]);

        self.eb_decorations.extend_from_slice(&[
            inst_word(Op::Decorate, 4),
            array_ty,
            spirv_headers::Decoration::ArrayStride as u32,
            4,
        ]);
        self.eb_decorations.extend_from_slice(&[
            inst_word(Op::Decorate, 3),
            struct_ty,
            spirv_headers::Decoration::Block as u32,
        ]);
        self.eb_decorations.extend_from_slice(&[
            inst_word(Op::MemberDecorate, 5),
            struct_ty,
            0,
            spirv_headers::Decoration::Offset as u32,
            0,
        ]);

        let ptr_u32 = match self.eb_ptr_word {
            Some(id) => id,
            None => {
                let id = self.fresh_id();
                self.eb_globals.extend_from_slice(&[
                    inst_word(Op::TypePointer, 4),
                    id,
                    StorageClass::StorageBuffer as u32,
                    u32_ty,
                ]);
                self.eb_ptr_word = Some(id);
                id
            }
        };

        (struct_ty, ptr_u32)
    }

    /// The physical resource mapping table binding
    pub fn prmt_var(&mut self) -> u32 {
        if let Some(id) = self.eb_prmt_var {
            return id;
        }
        let (struct_ty, _) = self.word_buffer_type();

        let ptr_struct = self.fresh_id();
        self.eb_globals.extend_from_slice(&[
            inst_word(Op::TypePointer, 4),
            ptr_struct,
            StorageClass::StorageBuffer as u32,
            struct_ty,
        ]);
        let var = self.fresh_id();
        self.eb_globals.extend_from_slice(&[
            inst_word(Op::Variable, 4),
            ptr_struct,
            var,
            StorageClass::StorageBuffer as u32,
        ]);
        self.decorate_binding(var, BINDING_PRMT);

        self.eb_prmt_var = Some(var);
        var
    }

    /// The per-feature shader data array binding
    pub fn shader_data_var(&mut self) -> u32 {
        if let Some(id) = self.eb_shader_data_var {
            return id;
        }
        let (struct_ty, _) = self.word_buffer_type();

        let count = self.const_u32(SHADER_DATA_COUNT);
        let array_ty = self.fresh_id();
        self.eb_globals.extend_from_slice(&[
            inst_word(Op::TypeArray, 4),
            array_ty,
            struct_ty,
            count,
        ]);
        let ptr_struct = self.fresh_id();
        self.eb_globals.extend_from_slice(&[
            inst_word(Op::TypePointer, 4),
            ptr_struct,
            StorageClass::StorageBuffer as u32,
            array_ty,
        ]);
        let var = self.fresh_id();
        self.eb_globals.extend_from_slice(&[
            inst_word(Op::Variable, 4),
            ptr_struct,
            var,
            StorageClass::StorageBuffer as u32,
        ]);
        self.decorate_binding(var, BINDING_SHADER_DATA);

        self.eb_shader_data_var = Some(var);
        var
    }

    /// Load one u32 word of the PRMT: prmt.words[index_id]
    ///
    /// Appends to `words`, returns the loaded id.
    pub fn emit_prmt_load(&mut self, words: &mut Vec<u32>, index_id: u32) -> u32 {
        let var = self.prmt_var();
        let ptr_u32 = self.eb_ptr_word.unwrap();
        let u32_ty = self.type_u32();
        let zero = self.const_u32(0);

        let ptr = self.fresh_id();
        let val = self.fresh_id();
        words.extend_from_slice(&[
            inst_word(Op::AccessChain, 6),
            ptr_u32,
            ptr,
            var,
            zero,
            index_id,
        ]);
        words.extend_from_slice(&[inst_word(Op::Load, 4), u32_ty, val, ptr]);
        val
    }

    /// Load one u32 word of a shader data entry:
    /// shader_data[entry].words[index_id]
    pub fn emit_shader_data_load(
        &mut self,
        words: &mut Vec<u32>,
        entry: u32,
        index_id: u32,
    ) -> u32 {
        let var = self.shader_data_var();
        let ptr_u32 = self.eb_ptr_word.unwrap();
        let u32_ty = self.type_u32();
        let zero = self.const_u32(0);
        let entry_id = self.const_u32(entry);

        let ptr = self.fresh_id();
        let val = self.fresh_id();
        words.extend_from_slice(&[
            inst_word(Op::AccessChain, 7),
            ptr_u32,
            ptr,
            var,
            entry_id,
            zero,
            index_id,
        ]);
        words.extend_from_slice(&[inst_word(Op::Load, 4), u32_ty, val, ptr]);
        val
    }

    /// Append a binary integer op, returns the result id
    pub fn emit_binop(&mut self, words: &mut Vec<u32>, op: Op, ty: u32, a: u32, b: u32) -> u32 {
        let id = self.fresh_id();
        words.extend_from_slice(&[inst_word(op, 5), ty, id, a, b]);
        id
    }

    /// Append a unary op (converts, logical not), returns the result id
    pub fn emit_unop(&mut self, words: &mut Vec<u32>, op: Op, ty: u32, a: u32) -> u32 {
        let id = self.fresh_id();
        words.extend_from_slice(&[inst_word(op, 4), ty, id, a]);
        id
    }

    /// Append an OpSelect, returns the result id
    pub fn emit_select(
        &mut self,
        words: &mut Vec<u32>,
        ty: u32,
        cond: u32,
        a: u32,
        b: u32,
    ) -> u32 {
        let id = self.fresh_id();
        words.extend_from_slice(&[inst_word(Op::Select, 6), ty, id, cond, a, b]);
        id
    }

    /// Append an unsigned min via GLSL.std.450, returns the result id
    pub fn emit_umin(&mut self, words: &mut Vec<u32>, ty: u32, a: u32, b: u32) -> u32 {
        let glsl = self.glsl_ext();
        let id = self.fresh_id();
        words.extend_from_slice(&[inst_word(Op::ExtInst, 7), ty, id, glsl, GLSL_UMIN, a, b]);
        id
    }

    /// Atomically OR `value_id` into shader_data[entry].words[index_id]
    pub fn emit_shader_data_atomic_or(
        &mut self,
        words: &mut Vec<u32>,
        entry: u32,
        index_id: u32,
        value_id: u32,
    ) {
        let var = self.shader_data_var();
        let ptr_u32 = self.eb_ptr_word.unwrap();
        let u32_ty = self.type_u32();
        let zero = self.const_u32(0);
        let entry_id = self.const_u32(entry);
        let scope = self.const_u32(1);
        let semantics = self.const_u32(0);

        let ptr = self.fresh_id();
        let old = self.fresh_id();
        words.extend_from_slice(&[
            inst_word(Op::AccessChain, 7),
            ptr_u32,
            ptr,
            var,
            entry_id,
            zero,
            index_id,
        ]);
        words.extend_from_slice(&[
            inst_word(Op::AtomicOr, 7),
            u32_ty,
            old,
            ptr,
            scope,
            semantics,
            value_id,
        ]);
    }

    /// Declare a u64 constant (two data words, low then high)
    pub fn const_u64(&mut self, value: u64) -> u32 {
        let ty = self.type_u64();
        let id = self.fresh_id();
        self.eb_globals.extend_from_slice(&[
            inst_word(Op::Constant, 5),
            ty,
            id,
            (value & 0xffff_ffff) as u32,
            (value >> 32) as u32,
        ]);
        id
    }

    /// Wrap `body` in a conditional: executed only when cond_id holds
    ///
    /// This splits the current block: the instructions following the
    /// insertion point land in the merge block, which is exactly what
    /// a guarded message export needs.
    pub fn emit_guarded(&mut self, cond_id: u32, body: Vec<u32>) -> Vec<u32> {
        let then_label = self.fresh_id();
        let merge_label = self.fresh_id();

        let mut words = Vec::with_capacity(body.len() + 10);
        words.extend_from_slice(&[
            inst_word(Op::SelectionMerge, 3),
            merge_label,
            0, // SelectionControl None
        ]);
        words.extend_from_slice(&[
            inst_word(Op::BranchConditional, 4),
            cond_id,
            then_label,
            merge_label,
        ]);
        words.extend_from_slice(&[inst_word(Op::Label, 2), then_label]);
        words.extend_from_slice(&body);
        words.extend_from_slice(&[inst_word(Op::Branch, 2), merge_label]);
        words.extend_from_slice(&[inst_word(Op::Label, 2), merge_label]);
        words
    }

    /// Splice the collected declarations into the module and bring
    /// its id bound up to date
    pub fn finish(self, module: &mut Module) {
        let mut insertions = Vec::new();
        if !self.eb_ext_imports.is_empty() {
            insertions.push((Self::ext_import_point(module), self.eb_ext_imports));
        }
        if !self.eb_decorations.is_empty() {
            insertions.push((Self::annotation_point(module), self.eb_decorations));
        }
        if !self.eb_globals.is_empty() {
            insertions.push((module.global_section_end(), self.eb_globals));
        }
        module.apply_insertions(insertions);

        while module.id_bound() < self.eb_next_id {
            module.fresh_id();
        }
    }

    /// Where new extended instruction imports go: right after the
    /// capability and extension instructions
    fn ext_import_point(module: &Module) -> usize {
        for inst in module.instructions() {
            let op = inst.opcode;
            if op != Op::Capability as u16 && op != Op::Extension as u16 {
                return inst.offset;
            }
        }
        module.words().len()
    }

    /// Where new annotations can legally go: right before the first
    /// type, constant, or global variable
    fn annotation_point(module: &Module) -> usize {
        for inst in module.instructions() {
            let op = inst.opcode;
            if op == Op::TypeVoid as u16
                || op == Op::TypeBool as u16
                || op == Op::TypeInt as u16
                || op == Op::TypeFloat as u16
                || op == Op::TypeVector as u16
                || op == Op::TypeStruct as u16
                || op == Op::TypePointer as u16
                || op == Op::TypeImage as u16
                || op == Op::TypeSampler as u16
                || op == Op::TypeSampledImage as u16
                || op == Op::TypeRuntimeArray as u16
                || op == Op::TypeArray as u16
                || op == Op::Constant as u16
                || op == Op::Variable as u16
                || op == Op::Function as u16
            {
                return inst.offset;
            }
        }
        module.words().len()
    }
}
