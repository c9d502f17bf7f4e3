// The resource bounds checker
//
// A reduced-form feature next to the initialization tracker: it
// rewrites indexed resource accesses to compare the element index
// against the resource's element count (plane 2 of the shader data
// array) and exports an out-of-bounds message on failure. An
// out-of-bounds access never touches metadata bits, the export
// carries the access site's SGUID so the report can name the shader
// location.
//
// Austin Shafer - 2025

use fxhash::FxHashMap;
use spirv_headers::Op;

use crate::messages::{unpack_out_of_bounds, AccessKind, GpuMessage, MessageUid};
use crate::report::Report;
use crate::sguid::SguidRegistry;
use crate::spv::{Block, InjectionPass, Module};
use crate::Result;

use super::{CommandHooks, Feature, FeatureReport, FeatureSet};
use super::init::PRMT_BINDINGS_PER_SET;

use std::sync::{Arc, Mutex};

pub struct ResourceBoundsFeature {
    rb_sguids: Arc<SguidRegistry>,
}

impl ResourceBoundsFeature {
    pub fn new(sguids: Arc<SguidRegistry>) -> Self {
        Self { rb_sguids: sguids }
    }
}

impl Feature for ResourceBoundsFeature {
    fn name(&self) -> &'static str {
        "resource-bounds"
    }

    fn bit(&self) -> u64 {
        FeatureSet::RESOURCE_BOUNDS.bits()
    }

    fn message_uid(&self) -> MessageUid {
        MessageUid::OutOfBounds
    }

    fn on_instrumentation(&self) -> Result<()> {
        // The count plane is maintained by the glue alongside the
        // PUID map, there is no feature-private GPU state
        Ok(())
    }

    fn on_commit(&self) {}
    fn on_deactivate(&self) {}

    fn build_pass(&self, shader_hash: u64) -> Box<dyn InjectionPass> {
        Box::new(BoundsPass {
            bp_shader_hash: shader_hash,
            bp_sguids: self.rb_sguids.clone(),
            bp_var_bindings: FxHashMap::default(),
            bp_chains: FxHashMap::default(),
        })
    }

    fn command_hooks(&self) -> CommandHooks {
        CommandHooks::DRAW | CommandHooks::DISPATCH
    }

    fn handle_message(
        &self,
        msg: GpuMessage,
        report: &Mutex<Report>,
        out: &Mutex<Vec<FeatureReport>>,
    ) {
        let (sguid, kind, offset) = unpack_out_of_bounds(msg);

        report.lock().unwrap().out_of_bounds_reports += 1;
        out.lock().unwrap().push(FeatureReport::OutOfBounds {
            sguid: sguid,
            shader_hash: self.rb_sguids.resolve(sguid).map(|e| e.shader_hash),
            kind: kind,
            offset: offset,
        });
    }
}

struct BoundsPass {
    bp_shader_hash: u64,
    bp_sguids: Arc<SguidRegistry>,
    bp_var_bindings: FxHashMap<u32, (u32, u32)>,
    bp_chains: FxHashMap<u32, (u32, u32)>,
}

impl InjectionPass for BoundsPass {
    fn name(&self) -> &'static str {
        "resource-bounds"
    }

    fn prepare(&mut self, module: &Module) {
        let mut sets: FxHashMap<u32, u32> = FxHashMap::default();
        let mut bindings: FxHashMap<u32, u32> = FxHashMap::default();

        for inst in module.instructions() {
            if inst.opcode == Op::Decorate as u16 {
                let ops = module.operands(&inst);
                if ops.len() == 3 {
                    if ops[1] == spirv_headers::Decoration::DescriptorSet as u32 {
                        sets.insert(ops[0], ops[2]);
                    } else if ops[1] == spirv_headers::Decoration::Binding as u32 {
                        bindings.insert(ops[0], ops[2]);
                    }
                }
            } else if inst.opcode == Op::AccessChain as u16 {
                let ops = module.operands(&inst);
                if ops.len() >= 4 {
                    self.bp_chains
                        .insert(ops[1], (ops[2], *ops.last().unwrap()));
                }
            }
        }

        for (var, set) in sets {
            if let Some(binding) = bindings.get(&var) {
                self.bp_var_bindings.insert(var, (set, *binding));
            }
        }
    }

    fn visit_block(&mut self, block: &mut Block) -> bool {
        let mut targets: Vec<(crate::spv::InstRef, AccessKind, u32, u32, u32)> = Vec::new();

        for inst in block.instructions() {
            let (pointer, kind) = if inst.opcode == Op::Load as u16 {
                let ops = block.operands(inst);
                if ops.len() < 3 {
                    continue;
                }
                (ops[2], AccessKind::Read)
            } else if inst.opcode == Op::Store as u16 {
                let ops = block.operands(inst);
                if ops.len() < 2 {
                    continue;
                }
                (ops[0], AccessKind::Write)
            } else {
                continue;
            };

            let (base_var, index_id) = match self.bp_chains.get(&pointer) {
                Some(chain) => *chain,
                None => continue,
            };
            let (set, binding) = match self.bp_var_bindings.get(&base_var) {
                Some(sb) => *sb,
                None => continue,
            };

            targets.push((*inst, kind, set, binding, index_id));
        }

        let modified = !targets.is_empty();
        for (inst, kind, set, binding, index_id) in targets {
            let sguid = self
                .bp_sguids
                .intern(self.bp_shader_hash, inst.offset as u32)
                .unwrap_or(0);

            let b = block.emit();
            let u32t = b.type_u32();
            let u64t = b.type_u64();
            let boolt = b.type_bool();

            let mut words = Vec::new();

            // count = shader_data[2][puid]
            let prmt_idx = b.const_u32(set * PRMT_BINDINGS_PER_SET + binding);
            let prmt_word = b.emit_prmt_load(&mut words, prmt_idx);
            let puid_mask = b.const_u32((1 << 26) - 1);
            let puid = b.emit_binop(&mut words, Op::BitwiseAnd, u32t, prmt_word, puid_mask);
            let count = b.emit_shader_data_load(&mut words, 2, puid);

            // A zero count means the plane has no entry, skip rather
            // than report everything
            let c0 = b.const_u32(0);
            let have_count = b.emit_binop(&mut words, Op::INotEqual, boolt, count, c0);
            let oob = b.emit_binop(
                &mut words,
                Op::UGreaterThanEqual,
                boolt,
                index_id,
                count,
            );
            let trip = b.emit_binop(&mut words, Op::LogicalAnd, boolt, have_count, oob);

            // message: sguid and kind are compile-time, offset is not
            let static_bits = ((MessageUid::OutOfBounds as u64) << 56)
                | ((sguid as u64) << 36)
                | ((kind as u64) << 35);
            let (pack, msg) = {
                let offset_max = b.const_u64((1u64 << 35) - 1);
                let base_c = b.const_u64(static_bits);
                let off64 = b.emit_unop(&mut words, Op::UConvert, u64t, index_id);
                let mut pack = Vec::new();
                let clamped = {
                    let id = b.emit_umin(&mut pack, u64t, off64, offset_max);
                    id
                };
                let msg = b.emit_binop(&mut pack, Op::BitwiseOr, u64t, base_c, clamped);
                (pack, msg)
            };
            words.extend_from_slice(&pack);

            let export = b.emit_message_export(msg);
            let guarded = b.emit_guarded(trip, export);
            words.extend_from_slice(&guarded);

            block.insert_before(&inst, words);
        }

        modified
    }
}
