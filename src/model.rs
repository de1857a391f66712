//! The fetch/decode/execute loop, operation semantics, and host-environment
//! shim.

use std::io::{Read, Write};

use crate::decode::{decode, BType, IType, JType, Operation, RType, SType, UType};
use crate::error::{ElfError, MemoryError, Rights, SimError};
use crate::memory::{Memory, DEFAULT_STACK_SIZE, ENV_FILL_BYTE};
use crate::register_file::RegisterFile;

pub const MODEL_STATE_SIGNATURE: &[u8] = b"RV32I_MDL_STATE\0";

const IALIGN: u32 = 4;

/// Syscall numbers supported by the `ecall` host-environment interface.
mod syscall {
    pub const READ: u32 = 63;
    pub const WRITE: u32 = 64;
    pub const EXIT: u32 = 93;
}

/// Host I/O indirection so the `ecall` READ/WRITE handlers can be driven by
/// the real process stdio in production and by an in-memory buffer in
/// tests.
pub trait HostIo {
    fn host_read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn host_write(&mut self, buf: &[u8]) -> std::io::Result<usize>;
}

/// The default host environment: real process stdin/stdout.
#[derive(Debug, Default)]
pub struct StdIo;

impl HostIo for StdIo {
    fn host_read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        std::io::stdin().read(buf)
    }

    fn host_write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stdout().write(buf)
    }
}

/// Outcome of a single step, telling the loop whether PC was already
/// updated by the operation or needs the default +4 advance, and whether
/// execution should continue.
struct StepOutcome {
    pc_already_set: bool,
    keep_running: bool,
}

impl StepOutcome {
    fn advance() -> Self {
        StepOutcome { pc_already_set: false, keep_running: true }
    }
    fn jumped() -> Self {
        StepOutcome { pc_already_set: true, keep_running: true }
    }
    fn halt() -> Self {
        StepOutcome { pc_already_set: true, keep_running: false }
    }
}

pub struct Model<H: HostIo = StdIo> {
    pub memory: Memory,
    pub registers: RegisterFile,
    pub pc: u32,
    pub executing: bool,
    pub valid: bool,
    host: H,
}

impl Model<StdIo> {
    /// Build a model from an ELF image: load segments, set up the default
    /// stack, and install the boot shim that calls into the entry point.
    pub fn from_elf(bytes: &[u8]) -> Result<Self, SimError> {
        let (mut memory, entry) = crate::elf::load(bytes)?;
        let mut registers = RegisterFile::new();

        let sp = memory.set_up_stack(DEFAULT_STACK_SIZE)?;
        registers.set(2, sp).expect("register index 2 is always in range"); // sp
        registers.set(8, sp).expect("register index 8 is always in range"); // fp

        let shim_pc = set_up_environment(&mut memory, entry)?;

        Ok(Model {
            memory,
            registers,
            pc: shim_pc,
            executing: true,
            valid: true,
            host: StdIo,
        })
    }

    /// Build a model from raw memory and register snapshots plus an
    /// explicit initial PC, as the CLI's `--imem`+`--iregs`+`--pc` path
    /// requires.
    pub fn from_parts(memory: Memory, registers: RegisterFile, pc: u32) -> Self {
        let valid = pc % IALIGN == 0;
        Model { memory, registers, pc, executing: true, valid, host: StdIo }
    }

    /// Build a model from a full `"RV32I_MDL_STATE\0"` snapshot.
    pub fn from_bstate<R: Read>(mut reader: R) -> Result<Self, SimError> {
        let mut signature = vec![0u8; MODEL_STATE_SIGNATURE.len()];
        reader.read_exact(&mut signature)?;
        if signature != MODEL_STATE_SIGNATURE {
            return Err(MemoryError::SignatureMismatch {
                expected: MODEL_STATE_SIGNATURE,
                found: signature,
            }
            .into());
        }

        let mut pc_bytes = [0u8; 4];
        reader.read_exact(&mut pc_bytes)?;
        let pc = u32::from_le_bytes(pc_bytes);

        let registers = RegisterFile::from_bstate(&mut reader)?;
        let memory = Memory::from_bstate(reader)?;

        let valid = pc % IALIGN == 0;
        Ok(Model { memory, registers, pc, executing: true, valid, host: StdIo })
    }

    /// Write a full `"RV32I_MDL_STATE\0"` snapshot: signature, PC, register
    /// image, memory image.
    pub fn binary_dump<W: Write>(&self, mut writer: W) -> Result<(), SimError> {
        writer.write_all(MODEL_STATE_SIGNATURE)?;
        writer.write_all(&self.pc.to_le_bytes())?;
        self.registers.binary_dump(&mut writer)?;
        self.memory.binary_dump(&mut writer)?;
        Ok(())
    }
}

impl<H: HostIo> Model<H> {
    pub fn with_host(memory: Memory, registers: RegisterFile, pc: u32, host: H) -> Self {
        let valid = pc % IALIGN == 0;
        Model { memory, registers, pc, executing: true, valid, host }
    }

    /// Run until halted or invalidated.
    pub fn run(&mut self) -> Result<(), SimError> {
        while self.executing && self.valid {
            self.step()?;
        }
        Ok(())
    }

    /// Execute exactly one fetch/decode/execute/advance cycle.
    pub fn step(&mut self) -> Result<(), SimError> {
        if self.pc % IALIGN != 0 {
            self.valid = false;
            return Err(SimError::PcMisaligned(self.pc));
        }

        let word = match self.memory.fetch_word(self.pc) {
            Ok(w) => w,
            Err(e) => {
                self.valid = false;
                return Err(e.into());
            }
        };

        let decoded = decode(word);
        if decoded.op == Operation::Undefined {
            self.executing = false;
            return Ok(());
        }

        let outcome = match self.execute(decoded.op) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.valid = false;
                return Err(e);
            }
        };

        if !outcome.pc_already_set {
            self.pc = self.pc.wrapping_add(4);
        }
        if !outcome.keep_running {
            self.executing = false;
        }
        Ok(())
    }

    fn reg(&self, n: u8) -> Result<u32, SimError> {
        Ok(self.registers.get(n)?)
    }

    fn set_reg(&mut self, n: u8, v: u32) -> Result<(), SimError> {
        Ok(self.registers.set(n, v)?)
    }

    fn execute(&mut self, op: Operation) -> Result<StepOutcome, SimError> {
        match op {
            Operation::Add(f) => self.r_arith(f, |a, b| a.wrapping_add(b)),
            Operation::Sub(f) => self.r_arith(f, |a, b| a.wrapping_sub(b)),
            Operation::Sll(f) => self.r_arith(f, |a, b| a.wrapping_shl(b & 0x1f)),
            Operation::Srl(f) => self.r_arith(f, |a, b| a.wrapping_shr(b & 0x1f)),
            Operation::Sra(f) => self.r_arith(f, |a, b| ((a as i32) >> (b & 0x1f)) as u32),
            Operation::And(f) => self.r_arith(f, |a, b| a & b),
            Operation::Or(f) => self.r_arith(f, |a, b| a | b),
            Operation::Xor(f) => self.r_arith(f, |a, b| a ^ b),
            Operation::Slt(f) => {
                self.r_arith(f, |a, b| ((a as i32) < (b as i32)) as u32)
            }
            Operation::Sltu(f) => self.r_arith(f, |a, b| (a < b) as u32),

            Operation::Addi(f) => self.i_arith(f, |a, imm| a.wrapping_add(imm as u32)),
            Operation::Xori(f) => self.i_arith(f, |a, imm| a ^ (imm as u32)),
            Operation::Ori(f) => self.i_arith(f, |a, imm| a | (imm as u32)),
            Operation::Andi(f) => self.i_arith(f, |a, imm| a & (imm as u32)),
            Operation::Slti(f) => self.i_arith(f, |a, imm| ((a as i32) < imm) as u32),
            Operation::Sltiu(f) => self.i_arith(f, |a, imm| (a < imm as u32) as u32),
            Operation::Slli(f) => self.i_arith(f, |a, imm| a.wrapping_shl((imm as u32) & 0x1f)),
            Operation::Srli(f) => self.i_arith(f, |a, imm| a.wrapping_shr((imm as u32) & 0x1f)),
            Operation::Srai(f) => {
                self.i_arith(f, |a, imm| ((a as i32) >> ((imm as u32) & 0x1f)) as u32)
            }

            Operation::Lb(f) => self.load(f, |mem, a| mem.read_byte(a).map(|b| b as i32 as u32)),
            Operation::Lh(f) => self.load(f, |mem, a| mem.read_half(a).map(|h| h as i32 as u32)),
            Operation::Lw(f) => self.load(f, |mem, a| mem.read_word(a)),
            Operation::Lbu(f) => self.load(f, |mem, a| mem.read_byte(a).map(|b| b as u32)),
            Operation::Lhu(f) => self.load(f, |mem, a| mem.read_half(a).map(|h| h as u32)),

            Operation::Sb(f) => self.store(f, |mem, a, v| mem.write_byte(a, v as u8)),
            Operation::Sh(f) => self.store(f, |mem, a, v| mem.write_half(a, v as u16)),
            Operation::Sw(f) => self.store(f, |mem, a, v| mem.write_word(a, v)),

            Operation::Jalr(f) => self.jalr(f),
            Operation::Jal(f) => self.jal(f),

            Operation::Beq(f) => self.branch(f, |a, b| a == b),
            Operation::Bne(f) => self.branch(f, |a, b| a != b),
            Operation::Blt(f) => self.branch(f, |a, b| (a as i32) < (b as i32)),
            Operation::Bge(f) => self.branch(f, |a, b| (a as i32) >= (b as i32)),
            Operation::Bltu(f) => self.branch(f, |a, b| a < b),
            Operation::Bgeu(f) => self.branch(f, |a, b| a >= b),

            Operation::Lui(f) => self.lui(f),
            Operation::Auipc(f) => self.auipc(f),

            Operation::Ecall => self.ecall(),
            Operation::Ebreak => Ok(StepOutcome::halt()),

            Operation::Undefined => unreachable!("caller filters Undefined before execute"),
        }
    }

    fn r_arith(&mut self, f: RType, op: impl Fn(u32, u32) -> u32) -> Result<StepOutcome, SimError> {
        let a = self.reg(f.rs1)?;
        let b = self.reg(f.rs2)?;
        self.set_reg(f.rd, op(a, b))?;
        Ok(StepOutcome::advance())
    }

    fn i_arith(&mut self, f: IType, op: impl Fn(u32, i32) -> u32) -> Result<StepOutcome, SimError> {
        let a = self.reg(f.rs1)?;
        self.set_reg(f.rd, op(a, f.imm))?;
        Ok(StepOutcome::advance())
    }

    fn load(
        &mut self,
        f: IType,
        read: impl Fn(&Memory, u32) -> Result<u32, MemoryError>,
    ) -> Result<StepOutcome, SimError> {
        let base = self.reg(f.rs1)?;
        let addr = base.wrapping_add(f.imm as u32);
        let value = read(&self.memory, addr)?;
        self.set_reg(f.rd, value)?;
        Ok(StepOutcome::advance())
    }

    fn store(
        &mut self,
        f: SType,
        write: impl Fn(&mut Memory, u32, u32) -> Result<(), MemoryError>,
    ) -> Result<StepOutcome, SimError> {
        let base = self.reg(f.rs1)?;
        let addr = base.wrapping_add(f.imm as u32);
        let value = self.reg(f.rs2)?;
        write(&mut self.memory, addr, value)?;
        Ok(StepOutcome::advance())
    }

    fn branch(&mut self, f: BType, cond: impl Fn(u32, u32) -> bool) -> Result<StepOutcome, SimError> {
        let a = self.reg(f.rs1)?;
        let b = self.reg(f.rs2)?;
        if cond(a, b) {
            self.pc = self.pc.wrapping_add(f.imm as u32);
            Ok(StepOutcome::jumped())
        } else {
            Ok(StepOutcome::advance())
        }
    }

    fn lui(&mut self, f: UType) -> Result<StepOutcome, SimError> {
        self.set_reg(f.rd, f.imm as u32)?;
        Ok(StepOutcome::advance())
    }

    fn auipc(&mut self, f: UType) -> Result<StepOutcome, SimError> {
        self.set_reg(f.rd, self.pc.wrapping_add(f.imm as u32))?;
        Ok(StepOutcome::advance())
    }

    fn jal(&mut self, f: JType) -> Result<StepOutcome, SimError> {
        let link = self.pc.wrapping_add(4);
        self.set_reg(f.rd, link)?;
        self.pc = self.pc.wrapping_add(f.imm as u32);
        Ok(StepOutcome::jumped())
    }

    fn jalr(&mut self, f: IType) -> Result<StepOutcome, SimError> {
        let base = self.reg(f.rs1)?;
        let target = base.wrapping_add(f.imm as u32) & !1u32;
        let link = self.pc.wrapping_add(4);
        self.set_reg(f.rd, link)?;
        self.pc = target;
        Ok(StepOutcome::jumped())
    }

    fn ecall(&mut self) -> Result<StepOutcome, SimError> {
        let number = self.reg(17)?; // a7
        match number {
            syscall::READ => {
                let fd = self.reg(10)?;
                let buf_addr = self.reg(11)?;
                let count = self.reg(12)?;
                let n = self.do_read(fd, buf_addr, count)?;
                self.set_reg(10, n)?;
                Ok(StepOutcome::advance())
            }
            syscall::WRITE => {
                let fd = self.reg(10)?;
                let buf_addr = self.reg(11)?;
                let count = self.reg(12)?;
                let n = self.do_write(fd, buf_addr, count)?;
                self.set_reg(10, n)?;
                Ok(StepOutcome::advance())
            }
            syscall::EXIT => Ok(StepOutcome::halt()),
            other => {
                log::warn!("ecall requested unsupported syscall {other}; treating as a no-op");
                Ok(StepOutcome::advance())
            }
        }
    }

    fn do_read(&mut self, _fd: u32, buf_addr: u32, count: u32) -> Result<u32, SimError> {
        // `count` is guest-controlled (it comes straight from a2) and must
        // never be trusted as an allocation size; stream it through a fixed
        // chunk buffer and let `write_byte`'s own bounds check reject an
        // address range that runs past the segment.
        const CHUNK: usize = 4096;
        let mut chunk = [0u8; CHUNK];
        let mut total: u32 = 0;
        while total < count {
            let want = (count - total).min(CHUNK as u32) as usize;
            let n = self.host.host_read(&mut chunk[..want])?;
            if n == 0 {
                break;
            }
            for (i, byte) in chunk[..n].iter().enumerate() {
                self.memory
                    .write_byte(buf_addr.wrapping_add(total + i as u32), *byte)?;
            }
            total += n as u32;
        }
        Ok(total)
    }

    fn do_write(&mut self, _fd: u32, buf_addr: u32, count: u32) -> Result<u32, SimError> {
        const CHUNK: usize = 4096;
        let mut chunk = [0u8; CHUNK];
        let mut total: u32 = 0;
        while total < count {
            let want = (count - total).min(CHUNK as u32) as usize;
            for (i, slot) in chunk[..want].iter_mut().enumerate() {
                *slot = self.memory.read_byte(buf_addr.wrapping_add(total + i as u32))?;
            }
            let n = self.host.host_write(&chunk[..want])?;
            total += n as u32;
            if n < want {
                break;
            }
        }
        Ok(total)
    }
}

/// Reserve a fresh RWX segment, fill it with a distinctive byte, and emit a
/// two-instruction boot shim: `jal x1, pc_main` followed by `ebreak`.
/// Returns the shim's base address.
fn set_up_environment(memory: &mut Memory, pc_main: u32) -> Result<u32, ElfError> {
    let shim_size = 8;
    let base = memory.push_segment(shim_size, Rights::R | Rights::W | Rights::X, 4);
    memory.set(base, ENV_FILL_BYTE, shim_size);

    let offset = (pc_main as i64) - (base as i64);
    let jal_word = crate::encode::jal(1, offset as i32);
    let ebreak_word = crate::encode::ebreak();

    memory.write_word(base, jal_word).map_err(|_| ElfError::NoLoadableSegments)?;
    memory
        .write_word(base + 4, ebreak_word)
        .map_err(|_| ElfError::NoLoadableSegments)?;

    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::*;
    use crate::error::Rights;

    fn program(words: &[u32]) -> Memory {
        let mut mem = Memory::new();
        let size = (words.len() as u32) * 4;
        mem.push_segment(size.max(4), Rights::R | Rights::W | Rights::X, 4);
        for (i, w) in words.iter().enumerate() {
            mem.write_word((i as u32) * 4, *w).unwrap();
        }
        mem
    }

    #[test]
    fn scenario_add() {
        let mem = program(&[add(10, 11, 12)]);
        let mut regs = RegisterFile::new();
        regs.set(11, 0x1D).unwrap();
        regs.set(12, 0x03).unwrap();
        let mut model = Model::from_parts(mem, regs, 0);
        model.run().unwrap();
        assert_eq!(model.registers.get(10).unwrap(), 0x20);
        assert_eq!(model.pc, 4);
    }

    #[test]
    fn scenario_andi() {
        let mem = program(&[andi(10, 11, 0x0ff)]);
        let mut regs = RegisterFile::new();
        regs.set(11, 0xF0F0F0F0).unwrap();
        let mut model = Model::from_parts(mem, regs, 0);
        model.run().unwrap();
        assert_eq!(model.registers.get(10).unwrap(), 0x0000_00F0);
    }

    #[test]
    fn scenario_taken_branch() {
        let mem = program(&[beq(11, 12, 8), addi(0, 0, 0)]);
        let mut regs = RegisterFile::new();
        regs.set(11, 5).unwrap();
        regs.set(12, 5).unwrap();
        let mut model = Model::from_parts(mem, regs, 0);
        model.run().unwrap();
        assert_eq!(model.pc, 8);
    }

    #[test]
    fn scenario_jal_and_return() {
        let mut mem = Memory::new();
        mem.push_segment(0x1100, Rights::R | Rights::W | Rights::X, 4);
        mem.write_word(0x1000, jal(1, 0x20)).unwrap();
        mem.write_word(0x1004, ebreak()).unwrap();
        mem.write_word(0x1020, addi(10, 0, 7)).unwrap();
        mem.write_word(0x1024, jalr(0, 1, 0)).unwrap();

        let regs = RegisterFile::new();
        let mut model = Model::from_parts(mem, regs, 0x1000);
        model.run().unwrap();
        assert_eq!(model.registers.get(10).unwrap(), 7);
        assert_eq!(model.pc, 0x1004);
    }

    #[test]
    fn scenario_load_store_round_trip() {
        let mem = program(&[sw(11, 12, 0), lw(13, 11, 0), ebreak()]);
        let mut regs = RegisterFile::new();
        regs.set(11, 0x100).unwrap();
        regs.set(12, 0xDEADBEEF).unwrap();
        let mut model = Model::from_parts(mem, regs, 0);
        // The program touches address 0x100, well past the tiny program
        // segment, so extend memory with a data segment there.
        model.memory.push_segment(0x100, Rights::R | Rights::W, 4);
        model.run().unwrap();
        assert_eq!(model.registers.get(13).unwrap(), 0xDEADBEEF);
        assert_eq!(model.memory.read_byte(0x100).unwrap(), 0xEF);
        assert_eq!(model.memory.read_byte(0x103).unwrap(), 0xDE);
    }

    #[test]
    fn scenario_x0_invariance() {
        let mem = program(&[addi(0, 0, 0x123), ebreak()]);
        let regs = RegisterFile::new();
        let mut model = Model::from_parts(mem, regs, 0);
        model.run().unwrap();
        assert_eq!(model.registers.get(0).unwrap(), 0);
    }

    #[test]
    fn undefined_instruction_halts_without_advancing() {
        let mem = program(&[0b1111111]);
        let regs = RegisterFile::new();
        let mut model = Model::from_parts(mem, regs, 0);
        model.run().unwrap();
        assert_eq!(model.pc, 0);
        assert!(!model.executing);
        assert!(model.valid);
    }

    #[test]
    fn misaligned_pc_invalidates_model() {
        let mem = program(&[add(10, 11, 12)]);
        let regs = RegisterFile::new();
        let model = Model::from_parts(mem, regs, 1);
        // An invalid model never enters the loop; it is the caller's job
        // (the CLI) to check `valid` before calling `run`.
        assert!(!model.valid);
    }

    #[test]
    fn boot_shim_fills_segment_and_chains_to_ebreak() {
        let mut mem = Memory::new();
        mem.push_segment(4, Rights::R | Rights::W | Rights::X, 4);
        mem.write_word(0, addi(10, 0, 7)).unwrap();
        mem.write_word(4, jalr(0, 1, 0)).unwrap();
        // Entry point at 0 overlaps with shim placement in this tiny test
        // memory, so place entry further out instead.
        let entry = 0x100;
        mem.push_segment(8, Rights::R | Rights::W | Rights::X, 4);
        // realign: write real program at `entry`
        mem.write_word(entry, addi(10, 0, 7)).unwrap();
        mem.write_word(entry + 4, jalr(0, 1, 0)).unwrap();

        let shim_pc = set_up_environment(&mut mem, entry).unwrap();
        let mut model = Model::from_parts(mem, RegisterFile::new(), shim_pc);
        model.run().unwrap();
        assert_eq!(model.registers.get(10).unwrap(), 7);
        assert_eq!(model.pc, shim_pc + 4);
    }

    struct BufferHost {
        input: Vec<u8>,
        output: Vec<u8>,
    }

    impl HostIo for BufferHost {
        fn host_read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.input.len().min(buf.len());
            buf[..n].copy_from_slice(&self.input[..n]);
            self.input.drain(..n);
            Ok(n)
        }

        fn host_write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }
    }

    #[test]
    fn ecall_write_forwards_to_host() {
        let mut mem = program(&[ecall(), ebreak()]);
        mem.push_segment(16, Rights::R | Rights::W, 4);
        let buf_addr = mem.segments()[1].base;
        mem.write_byte(buf_addr, b'h').unwrap();
        mem.write_byte(buf_addr + 1, b'i').unwrap();

        let mut regs = RegisterFile::new();
        regs.set(17, 64).unwrap(); // WRITE
        regs.set(10, 1).unwrap(); // fd
        regs.set(11, buf_addr).unwrap();
        regs.set(12, 2).unwrap();

        let host = BufferHost { input: Vec::new(), output: Vec::new() };
        let mut model = Model::with_host(mem, regs, 0, host);
        model.run().unwrap();
        assert_eq!(model.host.output, b"hi");
        assert_eq!(model.registers.get(10).unwrap(), 2);
    }

    #[test]
    fn ecall_exit_halts() {
        let mem = program(&[ecall()]);
        let mut regs = RegisterFile::new();
        regs.set(17, 93).unwrap(); // EXIT
        let mut model = Model::from_parts(mem, regs, 0);
        model.run().unwrap();
        assert!(!model.executing);
    }

    #[test]
    fn ecall_unsupported_syscall_is_a_noop() {
        let mem = program(&[ecall(), ebreak()]);
        let mut regs = RegisterFile::new();
        regs.set(17, 999).unwrap();
        let mut model = Model::from_parts(mem, regs, 0);
        model.run().unwrap();
        assert_eq!(model.pc, 4);
    }
}
