//! Instruction decoder: classifies a 32-bit word into one of 40 operations
//! across 6 instruction formats.

use crate::fields::{extract, sign_extend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    R,
    I,
    S,
    B,
    U,
    J,
    Undefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RType {
    pub rd: u8,
    pub rs1: u8,
    pub rs2: u8,
    pub funct3: u8,
    pub funct7: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IType {
    pub rd: u8,
    pub rs1: u8,
    pub funct3: u8,
    pub imm: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SType {
    pub rs1: u8,
    pub rs2: u8,
    pub funct3: u8,
    pub imm: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BType {
    pub rs1: u8,
    pub rs2: u8,
    pub funct3: u8,
    pub imm: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UType {
    pub rd: u8,
    pub imm: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JType {
    pub rd: u8,
    pub imm: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    // R-type arithmetic
    Add(RType),
    Sub(RType),
    Sll(RType),
    Slt(RType),
    Sltu(RType),
    Xor(RType),
    Srl(RType),
    Sra(RType),
    Or(RType),
    And(RType),

    // I-type ALU
    Addi(IType),
    Slti(IType),
    Sltiu(IType),
    Xori(IType),
    Ori(IType),
    Andi(IType),
    Slli(IType),
    Srli(IType),
    Srai(IType),

    // I-type loads
    Lb(IType),
    Lh(IType),
    Lw(IType),
    Lbu(IType),
    Lhu(IType),

    // I-type JALR
    Jalr(IType),

    // I-type system
    Ecall,
    Ebreak,

    // S-type stores
    Sb(SType),
    Sh(SType),
    Sw(SType),

    // B-type branches
    Beq(BType),
    Bne(BType),
    Blt(BType),
    Bge(BType),
    Bltu(BType),
    Bgeu(BType),

    // U-type
    Lui(UType),
    Auipc(UType),

    // J-type
    Jal(JType),

    /// A recognized opcode with a funct3/funct7/imm12 pattern that has no
    /// defined meaning.
    Undefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub word: u32,
    pub format: Format,
    pub mnemonic: &'static str,
    pub op: Operation,
}

fn r_fields(word: u32) -> RType {
    RType {
        rd: extract(word, 11, 7) as u8,
        rs1: extract(word, 19, 15) as u8,
        rs2: extract(word, 24, 20) as u8,
        funct3: extract(word, 14, 12) as u8,
        funct7: extract(word, 31, 25) as u8,
    }
}

fn i_fields(word: u32) -> IType {
    IType {
        rd: extract(word, 11, 7) as u8,
        rs1: extract(word, 19, 15) as u8,
        funct3: extract(word, 14, 12) as u8,
        imm: sign_extend(extract(word, 31, 20), 12),
    }
}

fn s_fields(word: u32) -> SType {
    let imm11_5 = extract(word, 31, 25);
    let imm4_0 = extract(word, 11, 7);
    let imm = (imm11_5 << 5) | imm4_0;
    SType {
        rs1: extract(word, 19, 15) as u8,
        rs2: extract(word, 24, 20) as u8,
        funct3: extract(word, 14, 12) as u8,
        imm: sign_extend(imm, 12),
    }
}

fn b_fields(word: u32) -> BType {
    let imm12 = extract(word, 31, 31);
    let imm10_5 = extract(word, 30, 25);
    let imm4_1 = extract(word, 11, 8);
    let imm11 = extract(word, 7, 7);
    let imm = (imm12 << 12) | (imm11 << 11) | (imm10_5 << 5) | (imm4_1 << 1);
    BType {
        rs1: extract(word, 19, 15) as u8,
        rs2: extract(word, 24, 20) as u8,
        funct3: extract(word, 14, 12) as u8,
        imm: sign_extend(imm, 13),
    }
}

fn u_fields(word: u32) -> UType {
    UType {
        rd: extract(word, 11, 7) as u8,
        imm: (word & 0xffff_f000) as i32,
    }
}

fn j_fields(word: u32) -> JType {
    let imm20 = extract(word, 31, 31);
    let imm19_12 = extract(word, 19, 12);
    let imm11 = extract(word, 20, 20);
    let imm10_1 = extract(word, 30, 21);
    let imm = (imm20 << 20) | (imm19_12 << 12) | (imm11 << 11) | (imm10_1 << 1);
    JType {
        rd: extract(word, 11, 7) as u8,
        imm: sign_extend(imm, 21),
    }
}

/// Decode a 32-bit instruction word. Total and deterministic: any word that
/// does not match a defined encoding decodes to `Operation::Undefined`.
pub fn decode(word: u32) -> Decoded {
    let opcode = extract(word, 6, 0);
    let funct3 = extract(word, 14, 12);
    let funct7 = extract(word, 31, 25);

    let undefined = |format: Format| Decoded {
        word,
        format,
        mnemonic: "undefined",
        op: Operation::Undefined,
    };

    match opcode {
        0b0110011 => {
            let f = r_fields(word);
            let (mnemonic, op) = match (funct3, funct7) {
                (0b000, 0b0000000) => ("add", Operation::Add(f)),
                (0b000, 0b0100000) => ("sub", Operation::Sub(f)),
                (0b001, 0b0000000) => ("sll", Operation::Sll(f)),
                (0b010, 0b0000000) => ("slt", Operation::Slt(f)),
                (0b011, 0b0000000) => ("sltu", Operation::Sltu(f)),
                (0b100, 0b0000000) => ("xor", Operation::Xor(f)),
                (0b101, 0b0000000) => ("srl", Operation::Srl(f)),
                (0b101, 0b0100000) => ("sra", Operation::Sra(f)),
                (0b110, 0b0000000) => ("or", Operation::Or(f)),
                (0b111, 0b0000000) => ("and", Operation::And(f)),
                _ => return undefined(Format::R),
            };
            Decoded { word, format: Format::R, mnemonic, op }
        }
        0b0010011 => {
            let f = i_fields(word);
            let (mnemonic, op) = match funct3 {
                0b000 => ("addi", Operation::Addi(f)),
                0b010 => ("slti", Operation::Slti(f)),
                0b011 => ("sltiu", Operation::Sltiu(f)),
                0b100 => ("xori", Operation::Xori(f)),
                0b110 => ("ori", Operation::Ori(f)),
                0b111 => ("andi", Operation::Andi(f)),
                0b001 => {
                    if extract(word, 31, 25) == 0 {
                        ("slli", Operation::Slli(f))
                    } else {
                        return undefined(Format::I);
                    }
                }
                0b101 => match extract(word, 31, 25) {
                    0b0000000 => ("srli", Operation::Srli(f)),
                    0b0100000 => ("srai", Operation::Srai(f)),
                    _ => return undefined(Format::I),
                },
                _ => return undefined(Format::I),
            };
            Decoded { word, format: Format::I, mnemonic, op }
        }
        0b0000011 => {
            let f = i_fields(word);
            let (mnemonic, op) = match funct3 {
                0b000 => ("lb", Operation::Lb(f)),
                0b001 => ("lh", Operation::Lh(f)),
                0b010 => ("lw", Operation::Lw(f)),
                0b100 => ("lbu", Operation::Lbu(f)),
                0b101 => ("lhu", Operation::Lhu(f)),
                _ => return undefined(Format::I),
            };
            Decoded { word, format: Format::I, mnemonic, op }
        }
        0b1100111 => {
            if funct3 != 0 {
                return undefined(Format::I);
            }
            Decoded {
                word,
                format: Format::I,
                mnemonic: "jalr",
                op: Operation::Jalr(i_fields(word)),
            }
        }
        0b1110011 => {
            let imm12 = extract(word, 31, 20);
            match imm12 {
                0 => Decoded {
                    word,
                    format: Format::I,
                    mnemonic: "ecall",
                    op: Operation::Ecall,
                },
                1 => Decoded {
                    word,
                    format: Format::I,
                    mnemonic: "ebreak",
                    op: Operation::Ebreak,
                },
                _ => undefined(Format::I),
            }
        }
        0b0100011 => {
            let f = s_fields(word);
            let (mnemonic, op) = match funct3 {
                0b000 => ("sb", Operation::Sb(f)),
                0b001 => ("sh", Operation::Sh(f)),
                0b010 => ("sw", Operation::Sw(f)),
                _ => return undefined(Format::S),
            };
            Decoded { word, format: Format::S, mnemonic, op }
        }
        0b1100011 => {
            let f = b_fields(word);
            let (mnemonic, op) = match funct3 {
                0b000 => ("beq", Operation::Beq(f)),
                0b001 => ("bne", Operation::Bne(f)),
                0b100 => ("blt", Operation::Blt(f)),
                0b101 => ("bge", Operation::Bge(f)),
                0b110 => ("bltu", Operation::Bltu(f)),
                0b111 => ("bgeu", Operation::Bgeu(f)),
                _ => return undefined(Format::B),
            };
            Decoded { word, format: Format::B, mnemonic, op }
        }
        0b0110111 => Decoded {
            word,
            format: Format::U,
            mnemonic: "lui",
            op: Operation::Lui(u_fields(word)),
        },
        0b0010111 => Decoded {
            word,
            format: Format::U,
            mnemonic: "auipc",
            op: Operation::Auipc(u_fields(word)),
        },
        0b1101111 => Decoded {
            word,
            format: Format::J,
            mnemonic: "jal",
            op: Operation::Jal(j_fields(word)),
        },
        _ => undefined(Format::Undefined),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::*;

    #[test]
    fn decode_add() {
        let word = rtype(0b0000000, 12, 11, 0b000, 10, 0b0110011);
        let d = decode(word);
        assert_eq!(d.format, Format::R);
        assert_eq!(d.mnemonic, "add");
        assert_eq!(
            d.op,
            Operation::Add(RType { rd: 10, rs1: 11, rs2: 12, funct3: 0, funct7: 0 })
        );
    }

    #[test]
    fn decode_andi() {
        let word = itype(0x0ff, 11, 0b111, 10, 0b0010011);
        let d = decode(word);
        assert!(matches!(d.op, Operation::Andi(_)));
    }

    #[test]
    fn decode_srai_vs_srli() {
        let srli = itype(0, 11, 0b101, 10, 0b0010011);
        assert!(matches!(decode(srli).op, Operation::Srli(_)));

        let srai = (0b0100000 << 25) | itype(0, 11, 0b101, 10, 0b0010011);
        assert!(matches!(decode(srai).op, Operation::Srai(_)));
    }

    #[test]
    fn decode_jal() {
        let word = jtype(0x20, 1, 0b1101111);
        let d = decode(word);
        assert_eq!(d.format, Format::J);
        match d.op {
            Operation::Jal(j) => {
                assert_eq!(j.rd, 1);
                assert_eq!(j.imm, 0x20);
            }
            _ => panic!("expected Jal"),
        }
    }

    #[test]
    fn decode_beq() {
        let word = btype(8, 11, 12, 0b000, 0b1100011);
        let d = decode(word);
        match d.op {
            Operation::Beq(b) => assert_eq!(b.imm, 8),
            _ => panic!("expected Beq"),
        }
    }

    #[test]
    fn decode_sw() {
        let word = stype(4, 12, 11, 0b010, 0b0100011);
        let d = decode(word);
        match d.op {
            Operation::Sw(s) => {
                assert_eq!(s.rs1, 11);
                assert_eq!(s.rs2, 12);
                assert_eq!(s.imm, 4);
            }
            _ => panic!("expected Sw"),
        }
    }

    #[test]
    fn decode_lui() {
        let word = utype(0xdead_b000u32 as i32, 10, 0b0110111);
        let d = decode(word);
        match d.op {
            Operation::Lui(u) => assert_eq!(u.imm, 0xdead_b000u32 as i32),
            _ => panic!("expected Lui"),
        }
    }

    #[test]
    fn decode_ecall_ebreak() {
        let ecall = itype(0, 0, 0b000, 0, 0b1110011);
        assert!(matches!(decode(ecall).op, Operation::Ecall));
        let ebreak = itype(1, 0, 0b000, 0, 0b1110011);
        assert!(matches!(decode(ebreak).op, Operation::Ebreak));
    }

    #[test]
    fn decode_undefined_opcode() {
        let d = decode(0b1111111);
        assert_eq!(d.format, Format::Undefined);
        assert_eq!(d.op, Operation::Undefined);
    }

    #[test]
    fn decode_is_total_and_deterministic() {
        for word in [0u32, 0xffff_ffff, 0x1234_5678, 0xdead_beef] {
            let a = decode(word);
            let b = decode(word);
            assert_eq!(a, b);
        }
    }
}
