//! Target-independent description of physical registers.
//!
//! An 8-bit accumulator-centric target has a handful of registers with one
//! specific aliasing shape: a 16-bit pair register is exactly the
//! concatenation of two named 8-bit registers. `Register` models that
//! directly rather than through a unit-mask scheme built for ISAs with
//! dozens of overlapping register banks, and `RegisterTable::aliases_of`
//! computes the alias closure (a pair conflicts with each of its components
//! and vice versa) by table lookup rather than bit arithmetic.

use std::fmt;

/// Width of a register or virtual register, in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Size {
    Bit8,
    Bit16,
}

impl Size {
    pub fn bytes(self) -> u32 {
        match self {
            Size::Bit8 => 1,
            Size::Bit16 => 2,
        }
    }
}

/// A physical register of the target machine.
///
/// Registers are process-wide constants: the full table for a target is
/// built once and referenced by `&'static` pointer identity thereafter, so
/// `Register` equality is pointer equality, never a by-value comparison of
/// `name`/`size`.
pub struct Register {
    /// Numeric encoding id, opaque here but useful to a downstream
    /// assembler or disassembler, which are out of scope for this crate.
    pub encoding: u8,
    pub name: &'static str,
    pub size: Size,
    /// For a pair register, its low and high 8-bit components in that
    /// order. Empty for an 8-bit register.
    pub components: &'static [&'static Register],
}

impl Register {
    pub fn is_pair(&self) -> bool {
        !self.components.is_empty()
    }
}

impl PartialEq for Register {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}
impl Eq for Register {}

impl std::hash::Hash for Register {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(self, state)
    }
}

impl fmt::Debug for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A reference to a statically-allocated physical register.
pub type RegRef = &'static Register;

/// A set of registers a candidate virtual register may inhabit. An empty
/// allow-set means "any register of matching size".
pub type AllowSet = &'static [RegRef];

/// Static description of every register in a target, used to compute
/// aliasing closures during allocation and resolution.
pub struct RegisterTable {
    pub all: &'static [RegRef],
}

impl RegisterTable {
    /// All registers of a given size.
    pub fn of_size(&self, size: Size) -> impl Iterator<Item = RegRef> + '_ {
        self.all.iter().copied().filter(move |r| r.size == size)
    }

    /// The alias closure of `reg`: itself, its components if it is a pair,
    /// and every pair register that contains it if it is a component.
    pub fn aliases_of(&self, reg: RegRef) -> Vec<RegRef> {
        let mut out = vec![reg];
        out.extend(reg.components.iter().copied());
        for candidate in self.all {
            if candidate.components.contains(&reg) {
                out.push(candidate);
            }
        }
        out
    }

    /// Does `reg` conflict with `other` under pair/component aliasing?
    pub fn conflicts(&self, reg: RegRef, other: RegRef) -> bool {
        std::ptr::eq(reg, other)
            || reg.components.contains(&other)
            || other.components.contains(&reg)
    }
}
