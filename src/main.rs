use std::fs::File;
use std::io::BufWriter;
use std::process::ExitCode;

use clap::Parser;
use clap_num::maybe_hex;

use rv32i_sim::error::SimError;
use rv32i_sim::memory::Memory;
use rv32i_sim::model::Model;
use rv32i_sim::register_file::RegisterFile;

/// Run an RV32I executable to completion or verify it against a reference.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Args {
    /// Load an executable from an ELF file
    #[arg(long)]
    elf: Option<String>,

    /// Load a full model snapshot (PC + registers + memory)
    #[arg(long)]
    istate: Option<String>,

    /// Load a raw memory image (requires --iregs and --pc)
    #[arg(long, requires_all = ["iregs", "pc"])]
    imem: Option<String>,

    /// Load a register-file snapshot (requires --imem and --pc)
    #[arg(long, requires_all = ["imem", "pc"])]
    iregs: Option<String>,

    /// Initial program counter for the --imem/--iregs path
    #[arg(long, value_parser=maybe_hex::<u32>)]
    pc: Option<u32>,

    /// Write the final model snapshot here after execution halts
    #[arg(long)]
    ostate: Option<String>,
}

fn build_model(args: &Args) -> Result<Model, SimError> {
    if let Some(elf_path) = &args.elf {
        let bytes = std::fs::read(elf_path)?;
        return Model::from_elf(&bytes);
    }

    if let Some(istate_path) = &args.istate {
        let file = File::open(istate_path)?;
        return Model::from_bstate(file);
    }

    if let (Some(imem_path), Some(iregs_path), Some(pc)) = (&args.imem, &args.iregs, args.pc) {
        let memory = Memory::from_bstate(File::open(imem_path)?)?;
        let registers = RegisterFile::from_bstate(File::open(iregs_path)?)?;
        return Ok(Model::from_parts(memory, registers, pc));
    }

    log::error!(
        "exactly one of --elf, --istate, or --imem/--iregs/--pc must be given"
    );
    Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "no input source given").into())
}

fn run(args: Args) -> Result<(), SimError> {
    let mut model = build_model(&args)?;

    if !model.valid {
        log::error!("model failed to construct a valid initial state");
        return Err(SimError::PcMisaligned(model.pc));
    }

    let run_result = model.run();

    if let Some(ostate_path) = &args.ostate {
        let file = File::create(ostate_path)?;
        model.binary_dump(BufWriter::new(file))?;
    }

    run_result
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
