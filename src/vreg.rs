//! Virtual registers: the operands instruction selection emits, before
//! register allocation has run.

use crate::isa::registers::{AllowSet, RegRef, Size};
use cranelift_entity::{entity_impl, EntityRef};
use std::fmt;

/// An opaque reference to a virtual register, unique and monotonically
/// assigned within one function.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Vr(u32);
entity_impl!(Vr, "vr");

/// The kind of a virtual register.
#[derive(Debug, Clone, PartialEq)]
pub enum VrKind {
    /// Needs a physical register; `allow_set` restricts the choice (empty
    /// means any register of matching size).
    Candidate { allow_set: AllowSet },
    /// Holds a concrete physical register.
    Allocated { reg: RegRef },
    /// Holds a literal value; never appears in Use/Def sets.
    Immediate { value: i32 },
    /// Permanently backed by a frame slot; never colored.
    StackHome { offset: u32 },
    /// A `Candidate` that failed to color and was rewritten to a frame
    /// slot by `ResolveUnallocated`.
    StackLocation { offset: u32 },
}

/// A virtual register: an abstract operand before (or, for some kinds,
/// permanently instead of) allocation.
#[derive(Debug, Clone)]
pub struct VirtualRegister {
    pub id: Vr,
    pub size: Size,
    pub kind: VrKind,
    pub name: Option<String>,
}

impl VirtualRegister {
    pub fn is_candidate(&self) -> bool {
        matches!(self.kind, VrKind::Candidate { .. })
    }

    pub fn is_allocated(&self) -> bool {
        matches!(self.kind, VrKind::Allocated { .. })
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self.kind, VrKind::Immediate { .. })
    }

    pub fn is_stack_home(&self) -> bool {
        matches!(self.kind, VrKind::StackHome { .. })
    }

    pub fn allow_set(&self) -> AllowSet {
        match &self.kind {
            VrKind::Candidate { allow_set } => allow_set,
            _ => &[],
        }
    }

    pub fn assigned_register(&self) -> Option<RegRef> {
        match &self.kind {
            VrKind::Allocated { reg } => Some(reg),
            _ => None,
        }
    }
}

impl fmt::Display for VirtualRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}({})", self.id, name),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Issues fresh virtual registers for one function.
///
/// Ids come from a monotonically increasing counter; the allocator owns the
/// backing table of `VirtualRegister` values so that later passes can look
/// up and mutate a VR's kind in place.
#[derive(Default)]
pub struct VirtualRegisterAllocator {
    table: Vec<VirtualRegister>,
}

impl VirtualRegisterAllocator {
    pub fn new() -> Self {
        Self { table: Vec::new() }
    }

    fn push(&mut self, size: Size, kind: VrKind, name: Option<String>) -> Vr {
        let id = Vr::new(self.table.len());
        self.table.push(VirtualRegister {
            id,
            size,
            kind,
            name,
        });
        id
    }

    /// Allocate a `Candidate` VR restricted to `allow_set`.
    ///
    /// Its size is the common size of the allow-set's members; mixing
    /// register sizes within one allow-set is a caller-contract violation,
    /// not a runtime error.
    pub fn allocate(&mut self, allow_set: AllowSet) -> Vr {
        let size = Self::common_size(allow_set);
        self.push(size, VrKind::Candidate { allow_set }, None)
    }

    /// Like `allocate`, but carries a debug name.
    pub fn allocate_named(&mut self, name: &str, allow_set: AllowSet) -> Vr {
        let size = Self::common_size(allow_set);
        self.push(size, VrKind::Candidate { allow_set }, Some(name.to_string()))
    }

    /// Allocate a VR pre-assigned to a specific physical register (used for
    /// incoming parameters that the calling convention places in a
    /// register, and for accumulator-bound arithmetic operands).
    pub fn allocate_fixed(&mut self, name: Option<&str>, reg: RegRef) -> Vr {
        self.push(reg.size, VrKind::Allocated { reg }, name.map(str::to_string))
    }

    /// Allocate a `StackHome` VR, permanently backed by `offset`.
    pub fn allocate_on_stack(&mut self, name: &str, size: Size, offset: u32) -> Vr {
        self.push(
            size,
            VrKind::StackHome { offset },
            Some(name.to_string()),
        )
    }

    /// Allocate an `Immediate` VR holding a literal value.
    pub fn allocate_immediate(&mut self, value: i32, size: Size) -> Vr {
        self.push(size, VrKind::Immediate { value }, None)
    }

    pub fn get(&self, vr: Vr) -> &VirtualRegister {
        &self.table[vr.index()]
    }

    pub fn get_mut(&mut self, vr: Vr) -> &mut VirtualRegister {
        &mut self.table[vr.index()]
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VirtualRegister> {
        self.table.iter()
    }

    fn common_size(allow_set: AllowSet) -> Size {
        match allow_set.first() {
            Some(first) => {
                debug_assert!(
                    allow_set.iter().all(|r| r.size == first.size),
                    "allow-set mixes register sizes"
                );
                first.size
            }
            // An empty allow-set ("any target register") defaults to 8-bit;
            // callers needing a 16-bit candidate with no further
            // restriction pass the full pair allow-set explicitly.
            None => Size::Bit8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::z80::registers as z80;

    #[test]
    fn ids_are_monotone() {
        let mut vrs = VirtualRegisterAllocator::new();
        let a = vrs.allocate(&[]);
        let b = vrs.allocate(&[]);
        assert!(a.index() < b.index());
    }

    #[test]
    fn allocate_named_keeps_name() {
        let mut vrs = VirtualRegisterAllocator::new();
        let v = vrs.allocate_named("x", &[]);
        assert_eq!(vrs.get(v).name.as_deref(), Some("x"));
    }

    #[test]
    fn stack_home_is_never_a_candidate() {
        let mut vrs = VirtualRegisterAllocator::new();
        let v = vrs.allocate_on_stack("arr", Size::Bit16, 4);
        assert!(!vrs.get(v).is_candidate());
        assert!(vrs.get(v).is_stack_home());
    }

    #[test]
    fn allow_set_size_is_derived() {
        let mut vrs = VirtualRegisterAllocator::new();
        let v = vrs.allocate(&[&z80::A]);
        assert_eq!(vrs.get(v).size, Size::Bit8);
        let v16 = vrs.allocate(&[&z80::HL]);
        assert_eq!(vrs.get(v16).size, Size::Bit16);
    }
}
