//! Target abstraction: the capability bundle `InstructionSelector` and the
//! rest of the pipeline need from a concrete machine, without the core
//! knowing the target's opcode set.

pub mod call_conv;
pub mod registers;
pub mod z80;

pub use call_conv::{CallingConvention, ParamLocation};
pub use z80::opcode::Opcode;

use crate::descriptor::InstructionDescriptorTable;
use crate::mi::MachineInstruction;
use crate::vreg::{Vr, VirtualRegisterAllocator};
use registers::RegisterTable;

/// Synthesises the move/spill/reload instruction sequences
/// `ResolveUnallocated` needs; kept separate from `InstructionSelector`
/// because it runs after allocation, over already-resolved VRs.
pub trait InstructionFactory: Sync {
    /// Copy `src` into `dst` (same size, both either a register or a
    /// stack-backed VR).
    fn make_move(&self, dst: Vr, src: Vr) -> MachineInstruction;

    /// Store `value`'s current register into the frame at `offset`.
    fn make_spill(&self, value: Vr, offset: u32, size_bytes: u32) -> MachineInstruction;

    /// Load the frame slot at `offset` into `dst`.
    fn make_reload(&self, dst: Vr, offset: u32, size_bytes: u32) -> MachineInstruction;
}

/// One concrete target machine: its registers, calling convention,
/// instruction descriptors and move/spill/reload factory. Immutable after
/// construction and shared read-only across every function compiled in one
/// run.
pub trait TargetIsa: Sync {
    fn registers(&self) -> &'static RegisterTable;
    fn calling_convention(&self) -> &'static dyn CallingConvention;
    fn descriptors(&self) -> &'static dyn InstructionDescriptorTable;
    fn factory(&self) -> &'static dyn InstructionFactory;

    /// Construct this target's `InstructionSelector`, borrowing the VR
    /// allocator for the function currently being lowered.
    fn selector<'a>(
        &self,
        vrs: &'a mut VirtualRegisterAllocator,
    ) -> Box<dyn crate::select::InstructionSelector + 'a>;
}
