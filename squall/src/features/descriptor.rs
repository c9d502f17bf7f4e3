// The descriptor validator
//
// Checks that every consulted binding slot actually resolves through
// the physical resource mapping table: a zeroed PRMT word means the
// application dispatched with a stale or never-written descriptor.
// Reduced form next to the initialization tracker, but it exercises
// the same plumbing end to end: an injection pass, a packed message,
// and a handler.
//
// Austin Shafer - 2025

use fxhash::FxHashMap;
use spirv_headers::Op;

use crate::messages::{unpack_descriptor_mismatch, GpuMessage, MessageUid};
use crate::report::Report;
use crate::sguid::SguidRegistry;
use crate::spv::{Block, InjectionPass, Module};
use crate::Result;

use super::init::PRMT_BINDINGS_PER_SET;
use super::{CommandHooks, Feature, FeatureReport, FeatureSet};

use std::sync::{Arc, Mutex};

pub struct DescriptorValidationFeature {
    dv_sguids: Arc<SguidRegistry>,
}

impl DescriptorValidationFeature {
    pub fn new(sguids: Arc<SguidRegistry>) -> Self {
        Self { dv_sguids: sguids }
    }
}

impl Feature for DescriptorValidationFeature {
    fn name(&self) -> &'static str {
        "descriptor-validation"
    }

    fn bit(&self) -> u64 {
        FeatureSet::DESCRIPTOR_VALIDATION.bits()
    }

    fn message_uid(&self) -> MessageUid {
        MessageUid::DescriptorMismatch
    }

    fn on_instrumentation(&self) -> Result<()> {
        Ok(())
    }

    fn on_commit(&self) {}
    fn on_deactivate(&self) {}

    fn build_pass(&self, shader_hash: u64) -> Box<dyn InjectionPass> {
        Box::new(DescriptorPass {
            dp_shader_hash: shader_hash,
            dp_sguids: self.dv_sguids.clone(),
            dp_var_bindings: FxHashMap::default(),
            dp_checked: FxHashMap::default(),
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
        let (sguid, slot, binding, expected, observed) = unpack_descriptor_mismatch(msg);

        report.lock().unwrap().descriptor_mismatch_reports += 1;
        out.lock().unwrap().push(FeatureReport::DescriptorMismatch {
            sguid: sguid,
            slot: slot,
            binding: binding,
            expected: expected,
            observed: observed,
        });
    }
}

struct DescriptorPass {
    dp_shader_hash: u64,
    dp_sguids: Arc<SguidRegistry>,
    dp_var_bindings: FxHashMap<u32, (u32, u32)>,
    /// (set, binding) pairs already checked in this module; one check
    /// per binding is enough, the mapping cannot change mid-dispatch
    dp_checked: FxHashMap<(u32, u32), bool>,
}

impl InjectionPass for DescriptorPass {
    fn name(&self) -> &'static str {
        "descriptor-validation"
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
            }
        }

        for (var, set) in sets {
            if let Some(binding) = bindings.get(&var) {
                self.dp_var_bindings.insert(var, (set, *binding));
            }
        }
    }

    fn visit_block(&mut self, block: &mut Block) -> bool {
        // Find the first access through each decorated variable and
        // check the slot's mapping there
        let mut targets: Vec<(crate::spv::InstRef, u32, u32)> = Vec::new();

        for inst in block.instructions() {
            if inst.opcode != Op::AccessChain as u16 {
                continue;
            }
            let ops = block.operands(inst);
            if ops.len() < 3 {
                continue;
            }
            let (set, binding) = match self.dp_var_bindings.get(&ops[2]) {
                Some(sb) => *sb,
                None => continue,
            };
            if self.dp_checked.insert((set, binding), true).is_some() {
                continue;
            }
            targets.push((*inst, set, binding));
        }

        let modified = !targets.is_empty();
        for (inst, set, binding) in targets {
            let sguid = self
                .dp_sguids
                .intern(self.dp_shader_hash, inst.offset as u32)
                .unwrap_or(0);

            let b = block.emit();
            let u32t = b.type_u32();
            let u64t = b.type_u64();
            let boolt = b.type_bool();

            let mut words = Vec::new();
            let prmt_idx = b.const_u32(set * PRMT_BINDINGS_PER_SET + binding);
            let prmt_word = b.emit_prmt_load(&mut words, prmt_idx);
            let c0 = b.const_u32(0);
            let unmapped = b.emit_binop(&mut words, Op::IEqual, boolt, prmt_word, c0);

            let message = ((MessageUid::DescriptorMismatch as u64) << 56)
                | ((sguid as u64) << 36)
                | ((set as u64 & 0xff) << 28)
                | ((binding as u64 & 0xfff) << 16);
            let msg = b.const_u64(message);

            let export = b.emit_message_export(msg);
            let guarded = b.emit_guarded(unmapped, export);
            words.extend_from_slice(&guarded);

            block.insert_before(&inst, words);
        }

        modified
    }
}
