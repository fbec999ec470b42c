//! # Disassembly Module
//!
//! Turns raw bytes into instructions using [`iced_x86`].
//!
//! Used in two places: the [`DisassemblySurface`](crate::surface::DisassemblySurface) shows the
//! code found on the stack, and the ptrace backend needs to know whether the current
//! instruction is a call when stepping over it.

use std::fmt::{Display, Write};

use iced_x86::{
    Decoder, DecoderOptions, FlowControl, Formatter, FormatterOutput, FormatterTextKind,
    Instruction, NasmFormatter,
};
use serde::{Serialize, Serializer};

use crate::addr::Addr;

/// A piece of text and its kind (mnemonic, register, number, ...)
///
/// A UI can use the kind to color different parts of the disassembly.
pub type TextContent = (String, FormatterTextKind);

#[derive(Serialize)]
struct SerializableTextContent {
    text: String,
    kind: String,
}

/// Collects the pieces the formatter produces for one instruction
struct DisassemblyOutput(Vec<TextContent>);

impl FormatterOutput for DisassemblyOutput {
    fn write(&mut self, text: &str, kind: FormatterTextKind) {
        self.0.push((text.to_string(), kind));
    }
}

/// The facts about a single instruction the stepping logic cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub len: usize,
    pub is_call: bool,
    pub is_return: bool,
}

/// Decodes the first instruction of `data`, which is located at `ip`
pub fn decode_one(data: &[u8], ip: Addr, bitness: u32) -> Option<DecodedInstruction> {
    let mut decoder = Decoder::with_ip(bitness, data, ip.u64(), DecoderOptions::NONE);
    if !decoder.can_decode() {
        return None;
    }
    let instruction = decoder.decode();
    if instruction.is_invalid() {
        return None;
    }
    Some(DecodedInstruction {
        len: instruction.len(),
        is_call: matches!(
            instruction.flow_control(),
            FlowControl::Call | FlowControl::IndirectCall
        ),
        is_return: instruction.flow_control() == FlowControl::Return,
    })
}

/// A list of disassembled instructions
#[derive(Debug, Clone, Hash, Default, Serialize)]
pub struct Disassembly {
    // address, raw data, interpreted data for display
    #[serde(serialize_with = "serialize_disassembly_vec")]
    vec: Vec<(Addr, Vec<u8>, Vec<TextContent>)>,
}

impl Disassembly {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Disassembles `data` located at `first_addr`, starting at `entry`
    ///
    /// With `stop_at_return` the disassembly ends after the first return instruction, which
    /// is what recognizing a function from its entry point needs.
    pub fn disassemble(
        data: &[u8],
        first_addr: Addr,
        entry: Addr,
        bitness: u32,
        stop_at_return: bool,
    ) -> Self {
        let mut disassembly = Self::empty();
        let Some(start) = entry.offset_from(first_addr).filter(|o| *o < data.len()) else {
            return disassembly;
        };
        let code = &data[start..];
        let mut decoder = Decoder::with_ip(bitness, code, entry.u64(), DecoderOptions::NONE);
        let mut formatter = NasmFormatter::new();

        // padding
        formatter.options_mut().set_first_operand_char_index(16);

        // numbers stuff
        formatter.options_mut().set_hex_suffix("");
        formatter.options_mut().set_hex_prefix("");
        formatter.options_mut().set_uppercase_hex(false);

        // memory stuff
        formatter.options_mut().set_show_symbol_address(true);
        formatter.options_mut().set_rip_relative_addresses(false);
        formatter
            .options_mut()
            .set_memory_size_options(iced_x86::MemorySizeOptions::Always);

        let mut instruction = Instruction::default();
        let mut text_contents = DisassemblyOutput(Vec::new());
        while decoder.can_decode() {
            decoder.decode_out(&mut instruction);
            text_contents.0.clear();
            formatter.format(&instruction, &mut text_contents);

            let index = (instruction.ip() - entry.u64()) as usize;
            let raw = &code[index..index + instruction.len()];
            let text = text_contents.0.clone();
            let line = (Addr::from(instruction.ip()), raw.to_vec(), text);
            disassembly.vec.push(line);

            if stop_at_return && instruction.flow_control() == FlowControl::Return {
                break;
            }
        }

        disassembly
    }

    /// Tuples of (address, raw bytes, text content) for each instruction
    #[must_use]
    pub fn inner(&self) -> &[(Addr, Vec<u8>, Vec<TextContent>)] {
        &self.vec
    }

    pub fn len(&self) -> usize {
        self.vec.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vec.is_empty()
    }
}

impl Display for Disassembly {
    /// Will look like this:
    ///
    /// ```text
    /// 0x00007ffe00008000    48 31 c0                  xor             rax,rax
    /// 0x00007ffe00008003    c3                        ret
    /// ```
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut buf2 = String::new();
        for (addr, raw, content) in self.inner() {
            write!(f, "{addr}    ")?;
            for byte in raw {
                write!(buf2, "{byte:02x} ")?;
            }
            write!(f, "{buf2:<20}\t")?;
            buf2.clear();
            for (thing, _kind) in content {
                write!(f, "{thing}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl From<&TextContent> for SerializableTextContent {
    fn from(content: &TextContent) -> Self {
        Self {
            text: content.0.clone(),
            kind: format!("{:?}", content.1),
        }
    }
}

fn serialize_disassembly_vec<S>(
    data: &[(Addr, Vec<u8>, Vec<TextContent>)],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let serializable_data: Vec<(Addr, Vec<u8>, Vec<SerializableTextContent>)> = data
        .iter()
        .map(|(addr, raw, content)| {
            (
                *addr,
                raw.clone(),
                content.iter().map(SerializableTextContent::from).collect(),
            )
        })
        .collect();

    serializable_data.serialize(serializer)
}
