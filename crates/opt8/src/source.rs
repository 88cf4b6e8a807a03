//! Loading functions from listing files and CHIP-8 images.

use std::fs;
use std::path::Path;

use opt8_ir::{Function, ListingParser, Reg, Width};

use crate::{Error, Result};

/// Input file format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InputFormat {
    /// Text listing, one instruction per line.
    #[default]
    Listing,
    /// Raw big-endian CHIP-8 program image.
    Chip8,
}

impl InputFormat {
    /// Guess the format from a file extension.
    #[must_use]
    pub fn detect(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("ch8" | "c8") => Self::Chip8,
            _ => Self::Listing,
        }
    }
}

/// Load one function from `path`. The function is named after the file
/// stem; listings use `width` as their default register width.
pub fn load_function(path: &Path, format: InputFormat, width: Width) -> Result<Function> {
    let name = path
        .file_stem()
        .map_or_else(|| "anonymous".to_string(), |stem| stem.to_string_lossy().into_owned());
    match format {
        InputFormat::Listing => {
            let text = fs::read_to_string(path)?;
            let insns = ListingParser::new(width)?.parse(&text)?;
            Ok(Function::new(name, insns))
        }
        InputFormat::Chip8 => {
            let bytes = fs::read(path)?;
            Ok(opt8_chip8::decode_function(name, &bytes)?)
        }
    }
}

/// Parse a comma separated register list such as `R1,R2,R4.16`.
pub fn parse_registers(text: &str, width: Width) -> Result<Vec<Reg>> {
    let parser = ListingParser::new(width)?;
    text.split(',')
        .map(str::trim)
        .filter(|tok| !tok.is_empty())
        .map(|tok| {
            parser
                .register(tok)
                .ok_or_else(|| Error::InvalidRegister(tok.to_string()))
        })
        .collect()
}
