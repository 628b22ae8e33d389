use crc16::{State, ARC};
use log::debug;

use super::{structs::RawTelegram, P1Error};

/// Locate the end of the checksummed part: everything up to and
/// including the first `\n!`.
fn split_at_end_marker(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = data.windows(2).position(|w| w == b"\n!")?;
    Some(data.split_at(pos + 2))
}

pub fn calculate_checksum(data: &[u8]) -> u16 {
    State::<ARC>::calculate(data)
}

/// Check the CRC-16/ARC given after the `!` against the telegram content.
pub fn verify_checksum(telegram: &RawTelegram) -> Result<(), P1Error> {
    let (content, suffix) = split_at_end_marker(telegram.as_bytes())
        .ok_or(P1Error::MissingChecksum)?;

    let given = std::str::from_utf8(suffix)
        .ok()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| u16::from_str_radix(s, 16).ok())
        .ok_or(P1Error::MissingChecksum)?;

    let computed = calculate_checksum(content);
    debug!("Given checksum: {:#06x}, calculated checksum: {:#06x}", given, computed);

    if given != computed {
        return Err(P1Error::Checksum { expected: given, computed });
    }
    Ok(())
}
