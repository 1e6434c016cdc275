use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Operand classification codes.
///
/// The numeric identity matters: 8-bit register codes 0..=7 are embedded
/// directly into opcodes, register pairs map to `(code - 8) << 4`, and
/// condition flags to `(code - 13) << 3`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum Operand {
    B = 0,
    C = 1,
    D = 2,
    E = 3,
    H = 4,
    L = 5,
    /// `(hl)` shares the 8-bit register encoding slot 6.
    IndHl = 6,
    A = 7,
    Bc = 8,
    De = 9,
    Hl = 10,
    Sp = 11,
    Af = 12,
    Nz = 13,
    Z = 14,
    Nc = 15,
    /// Carry flag. Spelled `cr` to stay distinct from the register `c`;
    /// a bare `c` in flag position is also accepted.
    Cy = 16,
    Po = 17,
    Pe = 18,
    P = 19,
    M = 20,
    Ix = 21,
    Iy = 22,
    Ixh = 23,
    Ixl = 24,
    /// `(ix+d)` with an evaluated displacement.
    IndIxd = 25,
    Iyh = 26,
    Iyl = 27,
    /// `(iy+d)` with an evaluated displacement.
    IndIyd = 28,
    IndIx = 29,
    IndIy = 30,
    /// A bare immediate expression.
    Imm = 31,
    /// A parenthesised immediate expression (memory reference).
    IndImm = 32,
    IndC = 33,
    IndSp = 34,
    IndBc = 35,
    IndDe = 36,
    I = 37,
    R = 38,
}

impl Operand {
    /// 8-bit register encoding (b..a plus `(hl)` as 6). Half-index and
    /// displaced forms report the slot they occupy behind their prefix.
    pub fn reg8(self) -> Option<u8> {
        match self {
            Operand::B
            | Operand::C
            | Operand::D
            | Operand::E
            | Operand::H
            | Operand::L
            | Operand::IndHl
            | Operand::A => Some(u8::from(self)),
            Operand::Ixh | Operand::Iyh => Some(4),
            Operand::Ixl | Operand::Iyl => Some(5),
            Operand::IndIxd | Operand::IndIyd => Some(6),
            _ => None,
        }
    }

    /// DD/FD prefix byte demanded by an index-register form.
    pub fn index_prefix(self) -> Option<u8> {
        match self {
            Operand::Ix
            | Operand::Ixh
            | Operand::Ixl
            | Operand::IndIxd
            | Operand::IndIx => Some(0xDD),
            Operand::Iy
            | Operand::Iyh
            | Operand::Iyl
            | Operand::IndIyd
            | Operand::IndIy => Some(0xFD),
            _ => None,
        }
    }

    pub fn is_half_index(self) -> bool {
        matches!(
            self,
            Operand::Ixh | Operand::Ixl | Operand::Iyh | Operand::Iyl
        )
    }

    pub fn is_indexed_mem(self) -> bool {
        matches!(self, Operand::IndIxd | Operand::IndIyd)
    }

    /// Register-pair encoding bits, already shifted into position.
    pub fn pair_bits(self) -> Option<u8> {
        match self {
            Operand::Bc | Operand::De | Operand::Hl | Operand::Sp => {
                Some((u8::from(self) - 8) << 4)
            }
            Operand::Af => Some(3 << 4),
            // index registers occupy the hl slot behind their prefix
            Operand::Ix | Operand::Iy => Some(2 << 4),
            _ => None,
        }
    }

    /// Condition-flag encoding bits. A bare `c` counts as the carry flag.
    pub fn flag_bits(self) -> Option<u8> {
        match self {
            Operand::C => Some(3 << 3),
            Operand::Nz
            | Operand::Z
            | Operand::Nc
            | Operand::Cy
            | Operand::Po
            | Operand::Pe
            | Operand::P
            | Operand::M => Some((u8::from(self) - 13) << 3),
            _ => None,
        }
    }
}

/// Register, flag and special-name spellings recognised in operand
/// position. Anything not listed here is parsed as an expression.
pub const OPERAND_NAMES: &[(&str, Operand)] = &[
    ("b", Operand::B),
    ("c", Operand::C),
    ("d", Operand::D),
    ("e", Operand::E),
    ("h", Operand::H),
    ("l", Operand::L),
    ("a", Operand::A),
    ("bc", Operand::Bc),
    ("de", Operand::De),
    ("hl", Operand::Hl),
    ("sp", Operand::Sp),
    ("af", Operand::Af),
    ("nz", Operand::Nz),
    ("z", Operand::Z),
    ("nc", Operand::Nc),
    ("cr", Operand::Cy),
    ("po", Operand::Po),
    ("pe", Operand::Pe),
    ("p", Operand::P),
    ("m", Operand::M),
    ("ix", Operand::Ix),
    ("iy", Operand::Iy),
    ("ixh", Operand::Ixh),
    ("ixl", Operand::Ixl),
    ("iyh", Operand::Iyh),
    ("iyl", Operand::Iyl),
    ("i", Operand::I),
    ("r", Operand::R),
];

pub fn operand_lookup(name: &str) -> Option<Operand> {
    OPERAND_NAMES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, op)| *op)
}

/// Encoding families. Each mnemonic belongs to exactly one; the family
/// decides how operands are parsed and which opcode bytes come out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// One-byte emission, no operands.
    Basic,
    /// ED-prefixed one-byte emission, no operands.
    BasicExt,
    /// Accumulator arithmetic plus the 16-bit add/adc/sbc forms.
    Arith,
    /// inc/dec, 8- and 16-bit.
    Incr,
    /// CB-prefixed rotates, shifts and bit operations.
    Bitsh,
    /// push/pop.
    Stack,
    Ret,
    Jump,
    JumpRel,
    Call,
    Rst,
    IoIn,
    IoOut,
    Exchange,
    IntMode,
    Load,
}

/// Secondary-byte meanings for the Arith family.
pub const ARITH_UNARY: u8 = 0;
pub const ARITH_CARRY: u8 = 1;
pub const ARITH_ADD: u8 = 2;

#[derive(Debug, Clone, Copy)]
pub struct Instruction {
    pub mnemonic: &'static str,
    pub family: Family,
    pub opcode: u8,
    /// Family-dependent secondary byte: the prefix for BasicExt, the
    /// 16-bit base for Incr, the unconditional opcode for flow control.
    pub arg: u8,
}

const fn isr(
    mnemonic: &'static str,
    family: Family,
    opcode: u8,
    arg: u8,
) -> Instruction {
    Instruction {
        mnemonic,
        family,
        opcode,
        arg,
    }
}

pub const ISR_TABLE: &[Instruction] = &[
    // basic instructions
    isr("nop", Family::Basic, 0x00, 0),
    isr("rlca", Family::Basic, 0x07, 0),
    isr("rrca", Family::Basic, 0x0F, 0),
    isr("rla", Family::Basic, 0x17, 0),
    isr("rra", Family::Basic, 0x1F, 0),
    isr("daa", Family::Basic, 0x27, 0),
    isr("cpl", Family::Basic, 0x2F, 0),
    isr("scf", Family::Basic, 0x37, 0),
    isr("ccf", Family::Basic, 0x3F, 0),
    isr("halt", Family::Basic, 0x76, 0),
    isr("exx", Family::Basic, 0xD9, 0),
    isr("di", Family::Basic, 0xF3, 0),
    isr("ei", Family::Basic, 0xFB, 0),
    // extended basic instructions
    isr("neg", Family::BasicExt, 0x44, 0xED),
    isr("retn", Family::BasicExt, 0x45, 0xED),
    isr("reti", Family::BasicExt, 0x4D, 0xED),
    isr("rrd", Family::BasicExt, 0x67, 0xED),
    isr("rld", Family::BasicExt, 0x6F, 0xED),
    isr("ldi", Family::BasicExt, 0xA0, 0xED),
    isr("cpi", Family::BasicExt, 0xA1, 0xED),
    isr("ini", Family::BasicExt, 0xA2, 0xED),
    isr("outi", Family::BasicExt, 0xA3, 0xED),
    isr("ldd", Family::BasicExt, 0xA8, 0xED),
    isr("cpd", Family::BasicExt, 0xA9, 0xED),
    isr("ind", Family::BasicExt, 0xAA, 0xED),
    isr("outd", Family::BasicExt, 0xAB, 0xED),
    isr("ldir", Family::BasicExt, 0xB0, 0xED),
    isr("cpir", Family::BasicExt, 0xB1, 0xED),
    isr("inir", Family::BasicExt, 0xB2, 0xED),
    isr("otir", Family::BasicExt, 0xB3, 0xED),
    isr("lddr", Family::BasicExt, 0xB8, 0xED),
    isr("cpdr", Family::BasicExt, 0xB9, 0xED),
    isr("indr", Family::BasicExt, 0xBA, 0xED),
    isr("otdr", Family::BasicExt, 0xBB, 0xED),
    // arithmetic
    isr("add", Family::Arith, 0x80, ARITH_ADD),
    isr("adc", Family::Arith, 0x88, ARITH_CARRY),
    isr("sub", Family::Arith, 0x90, ARITH_UNARY),
    isr("sbc", Family::Arith, 0x98, ARITH_CARRY),
    isr("and", Family::Arith, 0xA0, ARITH_UNARY),
    isr("xor", Family::Arith, 0xA8, ARITH_UNARY),
    isr("or", Family::Arith, 0xB0, ARITH_UNARY),
    isr("cp", Family::Arith, 0xB8, ARITH_UNARY),
    // inc / dec
    isr("inc", Family::Incr, 0x04, 0x03),
    isr("dec", Family::Incr, 0x05, 0x0B),
    // bit / shift
    isr("rlc", Family::Bitsh, 0x00, 0),
    isr("rrc", Family::Bitsh, 0x08, 0),
    isr("rl", Family::Bitsh, 0x10, 0),
    isr("rr", Family::Bitsh, 0x18, 0),
    isr("sla", Family::Bitsh, 0x20, 0),
    isr("sra", Family::Bitsh, 0x28, 0),
    isr("sll", Family::Bitsh, 0x30, 0),
    isr("srl", Family::Bitsh, 0x38, 0),
    isr("bit", Family::Bitsh, 0x40, 1),
    isr("res", Family::Bitsh, 0x80, 1),
    isr("set", Family::Bitsh, 0xC0, 1),
    // stack ops
    isr("pop", Family::Stack, 0xC1, 0),
    isr("push", Family::Stack, 0xC5, 0),
    // flow control
    isr("ret", Family::Ret, 0xC0, 0xC9),
    isr("jp", Family::Jump, 0xC2, 0xE9),
    isr("jr", Family::JumpRel, 0x18, 1),
    isr("djnz", Family::JumpRel, 0x10, 0),
    isr("call", Family::Call, 0xC4, 0xCD),
    isr("rst", Family::Rst, 0xC7, 0),
    // i/o
    isr("in", Family::IoIn, 0xDB, 0x40),
    isr("out", Family::IoOut, 0xD3, 0x41),
    // exchange
    isr("ex", Family::Exchange, 0xE3, 0x08),
    // interrupt mode
    isr("im", Family::IntMode, 0x46, 0x5E),
    // load
    isr("ld", Family::Load, 0x00, 0x00),
];

pub fn lookup(mnemonic: &str) -> Option<&'static Instruction> {
    ISR_TABLE.iter().find(|i| i.mnemonic == mnemonic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_encoding_slots() {
        assert_eq!(u8::from(Operand::B), 0);
        assert_eq!(u8::from(Operand::A), 7);
        assert_eq!(Operand::IndHl.reg8(), Some(6));
        assert_eq!(Operand::Ixh.reg8(), Some(4));
        assert_eq!(Operand::Sp.pair_bits(), Some(0x30));
        assert_eq!(Operand::Af.pair_bits(), Some(0x30));
        assert_eq!(Operand::M.flag_bits(), Some(0x38));
        assert_eq!(Operand::C.flag_bits(), Operand::Cy.flag_bits());
    }

    #[test]
    fn table_is_keyed_by_mnemonic() {
        assert_eq!(lookup("halt").unwrap().opcode, 0x76);
        assert_eq!(lookup("otir").unwrap().arg, 0xED);
        assert!(lookup("mov").is_none());
        assert_eq!(operand_lookup("iyl"), Some(Operand::Iyl));
        assert_eq!(operand_lookup("foo"), None);
    }
}
