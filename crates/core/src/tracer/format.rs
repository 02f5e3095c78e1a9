//! Trace line formatting.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// What the tracer writes for every executed instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TraceFormat {
    /// Program counter only.
    #[default]
    Pc,
    /// Raw opcode only.
    Opcode,
    /// Program counter and raw opcode.
    PcAndOpcode,
    /// Program counter, raw opcode and disassembly.
    Disassembly,
}

impl TraceFormat {
    /// Whether lines need the instruction bytes.
    pub const fn needs_opcode(self) -> bool {
        !matches!(self, Self::Pc)
    }
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disassembled {
    /// Instruction size in bytes.
    pub size: usize,
    /// Human readable text.
    pub text: String,
    /// Whether `text` depends on the address the instruction runs at, such as a
    /// resolved branch target. Such results are never cached.
    pub pc_relative: bool,
}

/// Decodes instructions for the `Disassembly` format and sizes them for the others.
pub trait Disassembler: Send {
    /// Decodes the instruction at the start of `bytes`. `None` if it is invalid.
    fn disassemble(&self, pc: u64, bytes: &[u8]) -> Option<Disassembled>;
}

/// Treats every instruction as a fixed-width data word.
#[derive(Debug, Clone, Copy)]
pub struct FixedWidthDisassembler {
    width: usize,
}

impl FixedWidthDisassembler {
    /// Creates a disassembler for `width`-byte instructions (1 to 8).
    pub fn new(width: usize) -> Self {
        Self {
            width: width.clamp(1, 8),
        }
    }
}

impl Disassembler for FixedWidthDisassembler {
    fn disassemble(&self, _pc: u64, bytes: &[u8]) -> Option<Disassembled> {
        let bytes = bytes.get(..self.width)?;
        Some(Disassembled {
            size: self.width,
            text: format!(".insn 0x{}", hex_le(bytes)),
            pc_relative: false,
        })
    }
}

/// Hex of a little-endian byte string, most significant byte first.
pub fn hex_le(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes.iter().rev() {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Appends one trace line to `out`.
pub fn write_line(
    out: &mut String,
    format: TraceFormat,
    pc: u64,
    opcode: &[u8],
    text: Option<&str>,
) {
    let _ = match format {
        TraceFormat::Pc => writeln!(out, "0x{pc:x}"),
        TraceFormat::Opcode => writeln!(out, "0x{}", hex_le(opcode)),
        TraceFormat::PcAndOpcode => writeln!(out, "0x{pc:x}: 0x{}", hex_le(opcode)),
        TraceFormat::Disassembly => writeln!(
            out,
            "0x{pc:x}: 0x{} {}",
            hex_le(opcode),
            text.unwrap_or("<invalid>")
        ),
    };
}
