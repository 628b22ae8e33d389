use log::{debug, warn};

use super::{structs::RawTelegram, LineSource, P1Error};

/// Telegrams are around 1 KiB, anything this large lost its end marker.
pub const MAX_TELEGRAM_SIZE: usize = 16 * 1024;

/// Upper bound for a single read, a line this long without `\n` is noise.
pub const MAX_LINE_LENGTH: usize = MAX_TELEGRAM_SIZE;

/// Reassembles telegrams from the lines read off the P1 port.
///
/// A line containing `/` starts a new telegram and drops whatever was
/// collected before, a line containing `!` completes it.
#[derive(Debug, Default)]
pub struct TelegramFramer {
    buffer: Vec<u8>,
    in_telegram: bool,
}

impl TelegramFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line including its terminator.
    pub fn push_line(&mut self, line: &[u8]) -> Result<Option<RawTelegram>, P1Error> {
        if !line.is_ascii() {
            return Err(P1Error::Framing);
        }

        if line.contains(&b'/') {
            if self.in_telegram && !self.buffer.is_empty() {
                debug!("Dropping {} bytes of an unterminated telegram", self.buffer.len());
            }
            debug!("Found beginning of P1 telegram");
            self.buffer.clear();
            self.in_telegram = true;
        }

        if !self.in_telegram {
            debug!("Skipping line outside of a telegram");
            return Ok(None);
        }

        self.buffer.extend_from_slice(line);

        if self.buffer.len() > MAX_TELEGRAM_SIZE {
            warn!("Telegram exceeds {} bytes without end marker, dropping it", MAX_TELEGRAM_SIZE);
            self.reset();
            return Err(P1Error::Framing);
        }

        if line.contains(&b'!') {
            debug!("Found end of P1 telegram ({} bytes)", self.buffer.len());
            self.in_telegram = false;
            return Ok(Some(RawTelegram(std::mem::take(&mut self.buffer))));
        }

        Ok(None)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.in_telegram = false;
    }
}

/// Lazy sequence of telegrams read from a line source.
///
/// Each item is either a complete telegram or a fault: a framing fault for
/// a line that is not text, a stream fault for a failed read. The sequence
/// ends when the source reports end of stream.
pub struct TelegramStream<'a> {
    source: &'a mut dyn LineSource,
    framer: TelegramFramer,
    line: Vec<u8>,
}

impl<'a> TelegramStream<'a> {
    pub fn new(source: &'a mut dyn LineSource) -> Self {
        TelegramStream { source, framer: TelegramFramer::new(), line: Vec::new() }
    }
}

impl Iterator for TelegramStream<'_> {
    type Item = Result<RawTelegram, P1Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line.clear();
            match self.source.next_line(&mut self.line) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => {
                    // a partial telegram cannot be trusted across a read error
                    self.framer.reset();
                    return Some(Err(P1Error::Stream(e)));
                }
            }

            if self.line.len() >= MAX_LINE_LENGTH && self.line.last() != Some(&b'\n') {
                warn!("Line exceeds {} bytes without terminator, dropping it", MAX_LINE_LENGTH);
                self.framer.reset();
                return Some(Err(P1Error::Framing));
            }

            debug!("Reading: {}", String::from_utf8_lossy(&self.line).trim());
            match self.framer.push_line(&self.line) {
                Ok(Some(telegram)) => return Some(Ok(telegram)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
