//! Payload parsing for the command line.

use anyhow::{bail, Context, Result};

/// Build the byte payload from `--hex` or `--text`.
pub fn from_args(hex: Option<&str>, text: Option<&str>) -> Result<Vec<u8>> {
    match (hex, text) {
        (Some(hex), None) => parse_hex(hex),
        (None, Some(text)) => Ok(text.as_bytes().to_vec()),
        (Some(_), Some(_)) => bail!("--hex and --text are mutually exclusive"),
        (None, None) => bail!("no payload given, use --hex or --text"),
    }
}

/// Parse hex digits, ignoring whitespace, `:` and `-` separators.
pub fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let digits: Vec<char> = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != '-')
        .collect();

    if digits.len() % 2 != 0 {
        bail!("hex payload has an odd number of digits ({})", digits.len());
    }

    digits
        .chunks(2)
        .enumerate()
        .map(|(i, pair)| {
            let s: String = pair.iter().collect();
            u8::from_str_radix(&s, 16).with_context(|| format!("invalid hex byte {s:?} at {i}"))
        })
        .collect()
}
