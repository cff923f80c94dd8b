//! The physical register set of the exemplar 8-bit/16-bit target: seven
//! general 8-bit registers, three of which pair up into 16-bit registers,
//! plus the accumulator.

use crate::isa::registers::{Register, RegisterTable, Size};

macro_rules! reg8 {
    ($name:ident, $encoding:expr, $text:expr) => {
        pub static $name: Register = Register {
            encoding: $encoding,
            name: $text,
            size: Size::Bit8,
            components: &[],
        };
    };
}

reg8!(B, 0, "b");
reg8!(C, 1, "c");
reg8!(D, 2, "d");
reg8!(E, 3, "e");
reg8!(H, 4, "h");
reg8!(L, 5, "l");

/// The accumulator: the 8-bit return register and the sole operand of every
/// accumulator-bound arithmetic op.
pub static A: Register = Register {
    encoding: 7,
    name: "a",
    size: Size::Bit8,
    components: &[],
};

macro_rules! pair {
    ($name:ident, $encoding:expr, $text:expr, $lo:expr, $hi:expr) => {
        pub static $name: Register = Register {
            encoding: $encoding,
            name: $text,
            size: Size::Bit16,
            components: &[&$lo, &$hi],
        };
    };
}

pair!(BC, 8, "bc", C, B);
pair!(DE, 9, "de", E, D);
pair!(HL, 10, "hl", L, H);

/// The three general-purpose 16-bit pairs, in the fixed order the calling
/// convention assigns them to parameters.
pub static GENERAL_PAIRS: &[&Register] = &[&BC, &DE, &HL];

/// All allocatable registers in the target, in encoding order. `IX` and
/// `SP` are deliberately absent: they are reserved for the frame pointer and
/// the hardware stack pointer respectively and never participate in
/// `RegisterAllocator`'s colouring.
pub static ALL: &[&Register] = &[&B, &C, &D, &E, &H, &L, &A, &BC, &DE, &HL];

/// The target's register table, over the allocatable set only.
pub static TABLE: RegisterTable = RegisterTable { all: ALL };

/// The frame-pointer register: every local variable and spill slot is
/// addressed `IX + offset`. Reserved, never allocated to a candidate VR.
pub static IX: Register = Register {
    encoding: 0xDD,
    name: "ix",
    size: Size::Bit16,
    components: &[],
};

/// The hardware stack pointer, used only to address stack-passed call
/// arguments beyond the third. Reserved, never allocated to a candidate VR.
pub static SP: Register = Register {
    encoding: 0xFF,
    name: "sp",
    size: Size::Bit16,
    components: &[],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_alias_their_components() {
        assert!(TABLE.conflicts(&HL, &H));
        assert!(TABLE.conflicts(&HL, &L));
        assert!(!TABLE.conflicts(&HL, &BC));
    }

    #[test]
    fn components_alias_their_pair() {
        let aliases = TABLE.aliases_of(&H);
        assert!(aliases.iter().any(|r| std::ptr::eq(*r, &HL)));
    }

    #[test]
    fn distinct_8_bit_registers_never_conflict() {
        assert!(!TABLE.conflicts(&B, &C));
        assert!(!TABLE.conflicts(&A, &B));
    }
}
