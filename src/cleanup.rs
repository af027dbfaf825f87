//! Final IR cleanup: lower the placeholder operations that codegen emitted
//! for this pass to consume.
//!
//! Three rewrites happen here: `gc.pointer_from_objref` becomes a plain
//! pointer-to-integer cast, `gc.alloc_obj` is split at compile time into a
//! pool or big-object allocation (with the type tag stored behind the
//! object), and calls under the arg-array calling conventions are re-issued
//! through a scratch array of rooted argument slots.  Calls still carrying a
//! root-annotation operand bundle are re-issued without it.
//!
//! This stage also runs alone, as a degenerate mode, on modules that never
//! declared the thread-state getter.

use log::{debug, info};
use smallvec::SmallVec;

use crate::ir::{
    AddrSpace, BlockIx, CallConv, CallInst, Func, Inst, InstIx, Tbaa, Ty, Value, WORD_BYTES,
};
use crate::pass::RootPlacement;

/// Allocations up to this many bytes (tag word included) come from the
/// per-thread pools; anything larger goes through the big-object allocator.
pub const MAX_POOL_ALLOC: usize = 2048;

/// Object sizes served by the pools, in bytes.  Requests are rounded up to
/// the nearest class.
const POOL_SIZES: &[usize] = &[
    8, 16, 32, 48, 64, 96, 128, 192, 256, 384, 512, 768, 1024, 1536, 2048,
];

/// Compile-time pool classification: for a payload of `size` bytes, the
/// `(pool index, rounded allocation size)` pair, or `None` when the object
/// must take the big-allocation path.  The tag word is part of the
/// allocation in both cases.
pub fn classify_pool(size: usize) -> Option<(i32, i32)> {
    let total = size + WORD_BYTES as usize;
    if total > MAX_POOL_ALLOC {
        return None;
    }
    let index = POOL_SIZES.iter().position(|&cls| total <= cls).unwrap();
    Some((index as i32, POOL_SIZES[index] as i32))
}

impl RootPlacement {
    pub(crate) fn cleanup_ir(&self, func: &mut Func) -> bool {
        info!("cleanup_ir: begin ({})", func.name);
        let mut changed = false;
        // One scratch array serves every arg-array call in the function;
        // its length is not known yet, so allocate with a placeholder and
        // patch (or delete) it at the end.
        let entry = func.entry();
        let scratch = func.push_front(
            entry,
            Inst::Alloca { elem_ty: Ty::Ptr(AddrSpace::Tracked), count: Some(Value::ConstInt(0)) },
        );
        let mut max_frame_args: Option<usize> = None;

        for n in 0..func.num_blocks() {
            let bix = BlockIx::new(n);
            let snapshot: Vec<_> = func.blocks[n].insts.clone();
            for iix in snapshot {
                let call = match func.inst(iix) {
                    Inst::Call(c) => c.clone(),
                    _ => continue,
                };
                let callee_sym = match call.callee {
                    Value::Func(six) => Some(six),
                    _ => None,
                };
                if callee_sym.is_some() && callee_sym == self.root_flush {
                    // A pure ordering marker; no replacement.
                } else if callee_sym.is_some() && callee_sym == self.pointer_from_objref {
                    let raw = func.insert_before(
                        bix,
                        iix,
                        Inst::PtrToInt { val: call.args[0], ty: call.ty },
                    );
                    func.replace_all_uses_with(Value::Inst(iix), Value::Inst(raw));
                } else if callee_sym.is_some() && callee_sym == self.alloc_obj {
                    self.lower_alloc_obj(func, bix, iix, &call);
                } else if call.cconv != CallConv::Normal {
                    let nframe = self.lower_arg_array_call(func, bix, iix, &call, scratch);
                    max_frame_args = Some(max_frame_args.map_or(nframe, |m| m.max(nframe)));
                } else if !call.has_bundle {
                    // Nothing to lower.
                    continue;
                } else {
                    let mut stripped = call.clone();
                    stripped.has_bundle = false;
                    let neu = func.insert_before(bix, iix, Inst::Call(stripped));
                    func.replace_all_uses_with(Value::Inst(iix), Value::Inst(neu));
                }
                func.erase(bix, iix);
                changed = true;
            }
        }

        match max_frame_args {
            None | Some(0) => func.erase(entry, scratch),
            Some(nargs) => match func.inst_mut(scratch) {
                Inst::Alloca { count, .. } => *count = Some(Value::ConstInt(nargs as i64)),
                _ => unreachable!(),
            },
        }
        info!("cleanup_ir: end (changed={})", changed);
        changed
    }

    /// Replace `gc.alloc_obj(ptls, size, tag)` with the pool or big-object
    /// allocator picked at compile time, then store the tag one word behind
    /// the returned object.
    fn lower_alloc_obj(&self, func: &mut Func, bix: BlockIx, iix: InstIx, call: &CallInst) {
        assert_eq!(call.args.len(), 3, "gc.alloc_obj takes (ptls, size, tag)");
        let ptls = call.args[0];
        let size = call.args[1]
            .as_const_int()
            .expect("gc.alloc_obj size must be a constant") as usize;
        let tag = call.args[2];

        let (callee, args): (_, SmallVec<[Value; 3]>) = match classify_pool(size) {
            Some((pool_index, pool_size)) => {
                debug!("alloc_obj: {} bytes -> pool {} ({})", size, pool_index, pool_size);
                (
                    self.pool_alloc.expect("pool allocator not interned"),
                    smallvec::smallvec![
                        ptls,
                        Value::ConstInt(pool_index as i64),
                        Value::ConstInt(pool_size as i64),
                    ],
                )
            }
            None => {
                debug!("alloc_obj: {} bytes -> big", size);
                (
                    self.big_alloc.expect("big allocator not interned"),
                    smallvec::smallvec![ptls, Value::ConstInt((size + WORD_BYTES as usize) as i64)],
                )
            }
        };
        let neu = func.insert_before(
            bix,
            iix,
            Inst::Call(CallInst {
                callee: Value::Func(callee),
                args: args.to_vec(),
                ty: Ty::Ptr(AddrSpace::Tracked),
                cconv: CallConv::Normal,
                returns_twice: false,
                has_bundle: false,
                attrs: call.attrs,
                dbg: call.dbg,
            }),
        );
        // The tag lives at word -1, addressed through the derived space so
        // the interior pointer never looks like a new root.
        let derived = func.insert_before(
            bix,
            iix,
            Inst::AddrSpaceCast { val: Value::Inst(neu), ty: Ty::Ptr(AddrSpace::Derived) },
        );
        let tag_addr = func.insert_before(
            bix,
            iix,
            Inst::Gep {
                base: Value::Inst(derived),
                offset: Value::ConstInt(-1),
                ty: Ty::Ptr(AddrSpace::Derived),
            },
        );
        func.insert_before(
            bix,
            iix,
            Inst::Store { val: tag, ptr: Value::Inst(tag_addr), tbaa: Some(Tbaa::Tag) },
        );
        func.replace_all_uses_with(Value::Inst(iix), Value::Inst(neu));
    }

    /// Re-issue an arg-array call: every pointer argument is parked in the
    /// scratch array (whose slots are already roots) and the callee receives
    /// `(array, nargs)`, preceded by the function object for the with-func
    /// convention.  Returns the number of slots this call used.
    fn lower_arg_array_call(
        &self,
        func: &mut Func,
        bix: BlockIx,
        iix: InstIx,
        call: &CallInst,
        scratch: InstIx,
    ) -> usize {
        let with_func = call.cconv == CallConv::ArgArrayWithFunc;
        let mut args = call.args.iter().copied();
        let mut replacement: SmallVec<[Value; 3]> = SmallVec::new();
        if with_func {
            replacement.push(args.next().expect("with-func call without function operand"));
        }
        let mut nframe = 0;
        for arg in args {
            let slot = func.insert_before(
                bix,
                iix,
                Inst::Gep {
                    base: Value::Inst(scratch),
                    offset: Value::ConstInt(nframe as i64),
                    ty: Ty::Ptr(AddrSpace::Generic),
                },
            );
            func.insert_before(
                bix,
                iix,
                Inst::Store { val: arg, ptr: Value::Inst(slot), tbaa: None },
            );
            nframe += 1;
        }
        replacement.push(if nframe == 0 {
            Value::NullPtr(AddrSpace::Generic)
        } else {
            Value::Inst(scratch)
        });
        replacement.push(Value::ConstInt(nframe as i64));
        let neu = func.insert_before(
            bix,
            iix,
            Inst::Call(CallInst {
                callee: call.callee,
                args: replacement.to_vec(),
                ty: call.ty,
                cconv: CallConv::Normal,
                returns_twice: call.returns_twice,
                has_bundle: false,
                attrs: call.attrs,
                dbg: call.dbg,
            }),
        );
        func.replace_all_uses_with(Value::Inst(iix), Value::Inst(neu));
        nframe
    }
}

//=============================================================================
// Tests

#[cfg(test)]
mod test {
    use super::{classify_pool, MAX_POOL_ALLOC};

    #[test]
    fn classifier_rounds_up_within_pools() {
        let (idx0, sz0) = classify_pool(0).unwrap();
        assert_eq!((idx0, sz0), (0, 8));
        // 32 bytes of payload plus the tag word lands in the 48-byte class.
        let (_, sz) = classify_pool(32).unwrap();
        assert_eq!(sz, 48);
        let (_, max) = classify_pool(MAX_POOL_ALLOC - 8).unwrap();
        assert_eq!(max as usize, MAX_POOL_ALLOC);
    }

    #[test]
    fn classifier_sends_large_objects_to_big() {
        assert!(classify_pool(MAX_POOL_ALLOC).is_none());
        assert!(classify_pool(1 << 20).is_none());
    }

    #[test]
    fn classifier_is_monotone() {
        let mut last = 0;
        for size in 0..=(MAX_POOL_ALLOC - 8) {
            let (_, cls) = classify_pool(size).unwrap();
            assert!(cls as usize >= size + 8);
            assert!(cls >= last);
            last = cls;
        }
    }
}
