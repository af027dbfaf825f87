//! The SSA IR substrate the root-placement pass runs over.
//!
//! This is deliberately a small, closed instruction set: the pass dispatches
//! on opcode with plain `match`, so every shape the pass must understand is a
//! variant here and nothing else is.  Pointer types carry an address-space
//! tag; the tagged ("special") spaces partition into `Tracked` (a rooted
//! reference the collector relocates or frees), `Derived` (an interior
//! pointer computed from a tracked one) and `Loaded` (a raw slot read whose
//! provenance is a tracked object).
//!
//! Instructions live in a per-function pool indexed by `InstIx` and are
//! referenced from the ordered instruction lists of their blocks.  Erasing an
//! instruction tombstones its pool slot, so an `InstIx` (and any map keyed by
//! one) stays valid for the lifetime of the pass.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;

pub type Map<K, V> = FxHashMap<K, V>;

/// Size of a machine pointer / frame slot, in bytes.
pub const WORD_BYTES: u64 = 8;

//=============================================================================
// Typed indices

macro_rules! define_index {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u32);

        impl $name {
            pub fn new(n: usize) -> Self {
                $name(n as u32)
            }
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }
    };
}

define_index!(BlockIx, "b");
define_index!(InstIx, "i");
define_index!(SymIx, "s");

//=============================================================================
// Types

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AddrSpace {
    /// Untagged address space; the pass has nothing to say about it.
    Generic,
    /// A reference the collector tracks.  Must be reachable from a root at
    /// every safepoint it is live across.
    Tracked,
    /// An interior pointer derived from a tracked base; rooted via the base.
    Derived,
    /// A raw pointer loaded from a tracked object's slot.
    Loaded,
}

impl AddrSpace {
    pub fn is_special(self) -> bool {
        !matches!(self, AddrSpace::Generic)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Ty {
    Void,
    Int(u32),
    Ptr(AddrSpace),
    /// A short vector of pointers, all in the same address space.
    PtrVec(AddrSpace, u32),
    /// The two-field `(tracked pointer, tag selector)` aggregate used for
    /// calls that may return either a reference or a boxed selector.
    UnionRep,
}

impl Ty {
    pub fn addrspace(self) -> Option<AddrSpace> {
        match self {
            Ty::Ptr(a) => Some(a),
            Ty::PtrVec(a, _) => Some(a),
            _ => None,
        }
    }

    pub fn is_special_ptr(self) -> bool {
        matches!(self, Ty::Ptr(a) if a.is_special())
    }

    pub fn is_special_ptr_vec(self) -> bool {
        matches!(self, Ty::PtrVec(a, _) if a.is_special())
    }

    pub fn is_union_rep(self) -> bool {
        matches!(self, Ty::UnionRep)
    }
}

//=============================================================================
// Values

/// An SSA value.  `Value`s are small, copyable and hashable, and remain
/// stable across every mutation the pass performs, so they serve directly as
/// map keys in the numbering.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Value {
    /// The result of an instruction.
    Inst(InstIx),
    /// A function argument, by position.
    Arg(u32),
    /// A typed null pointer constant.
    NullPtr(AddrSpace),
    /// An integer constant.
    ConstInt(i64),
    /// A function symbol from the module table.
    Func(SymIx),
}

impl Value {
    pub fn is_const(self) -> bool {
        matches!(self, Value::NullPtr(_) | Value::ConstInt(_) | Value::Func(_))
    }

    pub fn as_const_int(self) -> Option<i64> {
        match self {
            Value::ConstInt(n) => Some(n),
            _ => None,
        }
    }
}

//=============================================================================
// Metadata

/// Access-path tags.  The pass only ever asks one question of these: does the
/// loaded location hold data that never changes after construction?
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Tbaa {
    /// An immutable field of a heap object.
    Immut,
    /// Ordinary mutable heap data.
    Data,
    /// The frame metadata words maintained by this pass.
    GcFrame,
    /// The object type tag written behind each allocation.
    Tag,
}

impl Tbaa {
    pub fn is_immut(self) -> bool {
        matches!(self, Tbaa::Immut)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DebugLoc {
    pub line: u32,
    pub col: u32,
}

//=============================================================================
// Instructions

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CallConv {
    Normal,
    /// Callee takes `(arg_array, nargs)`; every argument is a tracked
    /// pointer passed through a scratch array in the caller's frame.
    ArgArray,
    /// Like `ArgArray` but the first operand is the callee-level function
    /// object, passed as a leading ordinary argument.
    ArgArrayWithFunc,
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct CallAttrs {
    pub ret_noalias: bool,
}

#[derive(Clone, Debug)]
pub struct CallInst {
    pub callee: Value,
    pub args: Vec<Value>,
    /// Result type; `Ty::Void` for calls whose value is unused by anything.
    pub ty: Ty,
    pub cconv: CallConv,
    /// A call whose control-flow return can happen more than once (longjmp
    /// target).  Forces dedicated root slots for everything live across it.
    pub returns_twice: bool,
    /// The call still carries a root-annotation operand bundle that must be
    /// stripped before codegen.
    pub has_bundle: bool,
    pub attrs: CallAttrs,
    pub dbg: Option<DebugLoc>,
}

#[derive(Clone, Debug)]
pub enum Inst {
    Call(CallInst),
    Load { ty: Ty, ptr: Value, tbaa: Option<Tbaa> },
    Store { val: Value, ptr: Value, tbaa: Option<Tbaa> },
    Select { cond: Value, on_true: Value, on_false: Value, ty: Ty },
    Phi { ty: Ty, incoming: Vec<(BlockIx, Value)> },
    /// Pointer arithmetic in units of words; the result stays in the base
    /// pointer's address space.
    Gep { base: Value, offset: Value, ty: Ty },
    BitCast { val: Value, ty: Ty },
    AddrSpaceCast { val: Value, ty: Ty },
    ExtractValue { agg: Value, field: u32, ty: Ty },
    ExtractElement { vec: Value, lane: u32, ty: Ty },
    InsertElement { vec: Value, elem: Value, lane: u32, ty: Ty },
    ShuffleVector { a: Value, b: Value, mask: Vec<u32>, ty: Ty },
    /// Stack slot of `count` elements of `elem_ty` (one if `count` is
    /// `None`).  The result is a generic pointer to the slot.
    Alloca { elem_ty: Ty, count: Option<Value> },
    PtrToInt { val: Value, ty: Ty },
    Memset { dst: Value, byte: u8, len: Value, tbaa: Option<Tbaa> },
    LifetimeStart { ptr: Value },
    LifetimeEnd { ptr: Value },
    Ret { val: Option<Value> },
    Br { dest: BlockIx },
    CondBr { cond: Value, on_true: BlockIx, on_false: BlockIx },
    Unreachable,
    /// Tombstone for an erased instruction.  Never present in a block's
    /// instruction list.
    Deleted,
}

impl Inst {
    pub fn result_ty(&self) -> Ty {
        match self {
            Inst::Call(c) => c.ty,
            Inst::Load { ty, .. }
            | Inst::Select { ty, .. }
            | Inst::Phi { ty, .. }
            | Inst::Gep { ty, .. }
            | Inst::BitCast { ty, .. }
            | Inst::AddrSpaceCast { ty, .. }
            | Inst::ExtractValue { ty, .. }
            | Inst::ExtractElement { ty, .. }
            | Inst::InsertElement { ty, .. }
            | Inst::ShuffleVector { ty, .. }
            | Inst::PtrToInt { ty, .. } => *ty,
            Inst::Alloca { .. } => Ty::Ptr(AddrSpace::Generic),
            _ => Ty::Void,
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Inst::Ret { .. } | Inst::Br { .. } | Inst::CondBr { .. } | Inst::Unreachable
        )
    }

    pub fn visit_operands<F: FnMut(Value)>(&self, mut f: F) {
        match self {
            Inst::Call(c) => {
                f(c.callee);
                for &a in &c.args {
                    f(a);
                }
            }
            Inst::Load { ptr, .. } => f(*ptr),
            Inst::Store { val, ptr, .. } => {
                f(*val);
                f(*ptr);
            }
            Inst::Select { cond, on_true, on_false, .. } => {
                f(*cond);
                f(*on_true);
                f(*on_false);
            }
            Inst::Phi { incoming, .. } => {
                for &(_, v) in incoming {
                    f(v);
                }
            }
            Inst::Gep { base, offset, .. } => {
                f(*base);
                f(*offset);
            }
            Inst::BitCast { val, .. }
            | Inst::AddrSpaceCast { val, .. }
            | Inst::PtrToInt { val, .. } => f(*val),
            Inst::ExtractValue { agg, .. } => f(*agg),
            Inst::ExtractElement { vec, .. } => f(*vec),
            Inst::InsertElement { vec, elem, .. } => {
                f(*vec);
                f(*elem);
            }
            Inst::ShuffleVector { a, b, .. } => {
                f(*a);
                f(*b);
            }
            Inst::Alloca { count, .. } => {
                if let Some(c) = count {
                    f(*c);
                }
            }
            Inst::Memset { dst, len, .. } => {
                f(*dst);
                f(*len);
            }
            Inst::LifetimeStart { ptr } | Inst::LifetimeEnd { ptr } => f(*ptr),
            Inst::Ret { val } => {
                if let Some(v) = val {
                    f(*v);
                }
            }
            Inst::CondBr { cond, .. } => f(*cond),
            Inst::Br { .. } | Inst::Unreachable | Inst::Deleted => {}
        }
    }

    pub fn visit_operands_mut<F: FnMut(&mut Value)>(&mut self, mut f: F) {
        match self {
            Inst::Call(c) => {
                f(&mut c.callee);
                for a in c.args.iter_mut() {
                    f(a);
                }
            }
            Inst::Load { ptr, .. } => f(ptr),
            Inst::Store { val, ptr, .. } => {
                f(val);
                f(ptr);
            }
            Inst::Select { cond, on_true, on_false, .. } => {
                f(cond);
                f(on_true);
                f(on_false);
            }
            Inst::Phi { incoming, .. } => {
                for (_, v) in incoming.iter_mut() {
                    f(v);
                }
            }
            Inst::Gep { base, offset, .. } => {
                f(base);
                f(offset);
            }
            Inst::BitCast { val, .. }
            | Inst::AddrSpaceCast { val, .. }
            | Inst::PtrToInt { val, .. } => f(val),
            Inst::ExtractValue { agg, .. } => f(agg),
            Inst::ExtractElement { vec, .. } => f(vec),
            Inst::InsertElement { vec, elem, .. } => {
                f(vec);
                f(elem);
            }
            Inst::ShuffleVector { a, b, .. } => {
                f(a);
                f(b);
            }
            Inst::Alloca { count, .. } => {
                if let Some(c) = count {
                    f(c);
                }
            }
            Inst::Memset { dst, len, .. } => {
                f(dst);
                f(len);
            }
            Inst::LifetimeStart { ptr } | Inst::LifetimeEnd { ptr } => f(ptr),
            Inst::Ret { val } => {
                if let Some(v) = val {
                    f(v);
                }
            }
            Inst::CondBr { cond, .. } => f(cond),
            Inst::Br { .. } | Inst::Unreachable | Inst::Deleted => {}
        }
    }

    pub fn operands(&self) -> SmallVec<[Value; 4]> {
        let mut out = SmallVec::new();
        self.visit_operands(|v| out.push(v));
        out
    }
}

//=============================================================================
// Blocks and functions

#[derive(Clone, Default, Debug)]
pub struct Block {
    /// Instruction list in execution order; the last entry is the
    /// terminator.
    pub insts: Vec<InstIx>,
}

#[derive(Clone, Debug)]
pub struct Func {
    pub name: String,
    pub arg_tys: Vec<Ty>,
    /// Block 0 is the entry block.
    pub blocks: Vec<Block>,
    /// Instruction pool; slots of erased instructions are tombstoned.
    pub insts: Vec<Inst>,
}

impl Func {
    pub fn new(name: &str, arg_tys: Vec<Ty>) -> Self {
        Self { name: name.to_string(), arg_tys, blocks: vec![Block::default()], insts: Vec::new() }
    }

    pub fn entry(&self) -> BlockIx {
        BlockIx(0)
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn add_block(&mut self) -> BlockIx {
        self.blocks.push(Block::default());
        BlockIx::new(self.blocks.len() - 1)
    }

    pub fn inst(&self, iix: InstIx) -> &Inst {
        &self.insts[iix.index()]
    }

    pub fn inst_mut(&mut self, iix: InstIx) -> &mut Inst {
        &mut self.insts[iix.index()]
    }

    pub fn value_ty(&self, v: Value) -> Ty {
        match v {
            Value::Inst(iix) => self.inst(iix).result_ty(),
            Value::Arg(n) => self.arg_tys[n as usize],
            Value::NullPtr(a) => Ty::Ptr(a),
            Value::ConstInt(_) => Ty::Int(64),
            Value::Func(_) => Ty::Ptr(AddrSpace::Generic),
        }
    }

    fn alloc_inst(&mut self, inst: Inst) -> InstIx {
        self.insts.push(inst);
        InstIx::new(self.insts.len() - 1)
    }

    /// Append to the end of a (necessarily unterminated) block.
    pub fn push_inst(&mut self, bix: BlockIx, inst: Inst) -> InstIx {
        let iix = self.alloc_inst(inst);
        self.blocks[bix.index()].insts.push(iix);
        iix
    }

    pub fn push_front(&mut self, bix: BlockIx, inst: Inst) -> InstIx {
        let iix = self.alloc_inst(inst);
        self.blocks[bix.index()].insts.insert(0, iix);
        iix
    }

    fn position_in_block(&self, bix: BlockIx, iix: InstIx) -> usize {
        self.blocks[bix.index()]
            .insts
            .iter()
            .position(|&i| i == iix)
            .unwrap_or_else(|| panic!("{:?} not in {:?}", iix, bix))
    }

    pub fn insert_before(&mut self, bix: BlockIx, before: InstIx, inst: Inst) -> InstIx {
        let pos = self.position_in_block(bix, before);
        let iix = self.alloc_inst(inst);
        self.blocks[bix.index()].insts.insert(pos, iix);
        iix
    }

    pub fn insert_after(&mut self, bix: BlockIx, after: InstIx, inst: Inst) -> InstIx {
        let pos = self.position_in_block(bix, after);
        let iix = self.alloc_inst(inst);
        self.blocks[bix.index()].insts.insert(pos + 1, iix);
        iix
    }

    pub fn insert_before_terminator(&mut self, bix: BlockIx, inst: Inst) -> InstIx {
        let iix = self.alloc_inst(inst);
        let insts = &mut self.blocks[bix.index()].insts;
        let pos = insts.len() - 1;
        insts.insert(pos, iix);
        iix
    }

    pub fn terminator(&self, bix: BlockIx) -> InstIx {
        *self.blocks[bix.index()].insts.last().expect("empty block")
    }

    /// Tombstone an instruction and unlink it from its block.  The pool slot
    /// is retained so that outstanding `InstIx`s stay in range.
    pub fn erase(&mut self, bix: BlockIx, iix: InstIx) {
        let pos = self.position_in_block(bix, iix);
        self.blocks[bix.index()].insts.remove(pos);
        self.insts[iix.index()] = Inst::Deleted;
    }

    /// Find the block containing an instruction.  Linear in the function;
    /// used only on the rare paths where the block is not already at hand.
    pub fn block_of(&self, iix: InstIx) -> BlockIx {
        for (n, block) in self.blocks.iter().enumerate() {
            if block.insts.contains(&iix) {
                return BlockIx::new(n);
            }
        }
        panic!("{:?} not in any block", iix);
    }

    pub fn replace_all_uses_with(&mut self, from: Value, to: Value) {
        for inst in self.insts.iter_mut() {
            inst.visit_operands_mut(|v| {
                if *v == from {
                    *v = to;
                }
            });
        }
    }

    pub fn succs(&self, bix: BlockIx) -> SmallVec<[BlockIx; 2]> {
        let mut out = SmallVec::new();
        match self.inst(self.terminator(bix)) {
            Inst::Br { dest } => out.push(*dest),
            Inst::CondBr { on_true, on_false, .. } => {
                out.push(*on_true);
                out.push(*on_false);
            }
            Inst::Ret { .. } | Inst::Unreachable => {}
            other => panic!("bad terminator {:?}", other),
        }
        out
    }

    /// Predecessor lists for every block.  Duplicate edges (a conditional
    /// branch with both arms on the same target) are kept; all the set
    /// operations downstream are idempotent.
    pub fn pred_map(&self) -> Vec<Vec<BlockIx>> {
        let mut preds = vec![Vec::new(); self.num_blocks()];
        for n in 0..self.num_blocks() {
            let bix = BlockIx::new(n);
            for succ in self.succs(bix) {
                preds[succ.index()].push(bix);
            }
        }
        preds
    }

    /// Blocks reachable from the entry, in reverse post-order.
    pub fn reverse_post_order(&self) -> Vec<BlockIx> {
        let mut post = Vec::with_capacity(self.num_blocks());
        let mut visited = vec![false; self.num_blocks()];
        let mut stack: Vec<(BlockIx, usize)> = vec![(self.entry(), 0)];
        visited[self.entry().index()] = true;
        while let Some(&(bix, next_succ)) = stack.last() {
            let succs = self.succs(bix);
            if next_succ < succs.len() {
                stack.last_mut().unwrap().1 += 1;
                let s = succs[next_succ];
                if !visited[s.index()] {
                    visited[s.index()] = true;
                    stack.push((s, 0));
                }
            } else {
                post.push(bix);
                stack.pop();
            }
        }
        post.reverse();
        post
    }
}

//=============================================================================
// Modules: external function declarations

#[derive(Clone, Debug)]
pub struct FuncDecl {
    pub name: String,
    pub ret_ty: Ty,
    pub arg_tys: Vec<Ty>,
    pub ret_noalias: bool,
}

#[derive(Default)]
pub struct Module {
    decls: Vec<FuncDecl>,
    by_name: Map<String, SymIx>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a declaration.  If the name is already declared the existing
    /// symbol is returned unchanged.
    pub fn declare(&mut self, decl: FuncDecl) -> SymIx {
        if let Some(&six) = self.by_name.get(&decl.name) {
            return six;
        }
        let six = SymIx::new(self.decls.len());
        self.by_name.insert(decl.name.clone(), six);
        self.decls.push(decl);
        six
    }

    pub fn lookup(&self, name: &str) -> Option<SymIx> {
        self.by_name.get(name).copied()
    }

    pub fn decl(&self, six: SymIx) -> &FuncDecl {
        &self.decls[six.index()]
    }
}
