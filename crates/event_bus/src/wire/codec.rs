//! Line framing: splitting a byte stream into `<channelId> <rest>` lines.

use crate::error::BusError;
use crate::types::ChannelId;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Default upper bound on the length of a single line, newline excluded.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Splits a decoded line into its channel id and the remainder.
///
/// The id must be a positive decimal integer followed by exactly one space.
/// Failure here leaves no channel to blame, so callers treat it as fatal
/// for the whole connection.
pub fn split_frame(line: &str) -> Result<(ChannelId, &str), BusError> {
    let (id, rest) = line
        .split_once(' ')
        .ok_or_else(|| BusError::protocol(format!("missing channel id separator in {line:?}")))?;
    let id = parse_id(id).ok_or_else(|| BusError::protocol(format!("bad channel id {id:?}")))?;
    if id == 0 {
        return Err(BusError::protocol("channel id 0 is reserved"));
    }
    Ok((id, rest))
}

/// Parses an unsigned decimal number with no sign and no padding tricks.
pub(crate) fn parse_id(text: &str) -> Option<u64> {
    if text.is_empty() || !text.bytes().all(|c| c.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

/// Formats one outgoing line, newline included.
pub fn format_frame(channel_id: ChannelId, rest: &str) -> String {
    let mut line = String::with_capacity(rest.len() + 22);
    line.push_str(&channel_id.to_string());
    line.push(' ');
    line.push_str(rest);
    line.push('\n');
    line
}

/// Reads newline-delimited ASCII lines with a bounded line length.
pub struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    max_line_length: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R, max_line_length: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::with_capacity(256),
            max_line_length,
        }
    }

    /// Returns the next line without its terminator, or `None` on EOF.
    ///
    /// A trailing fragment without a newline at EOF is discarded. Over-long
    /// lines and bytes outside printable ASCII are decode errors.
    pub async fn next_line(&mut self) -> Result<Option<String>, BusError> {
        self.buf.clear();
        let limit = self.max_line_length as u64 + 1;
        let read = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut self.buf)
            .await?;
        if read == 0 {
            return Ok(None);
        }
        if self.buf.last() != Some(&b'\n') {
            if self.buf.len() as u64 >= limit {
                return Err(BusError::protocol(format!(
                    "line exceeds {} bytes",
                    self.max_line_length
                )));
            }
            return Ok(None);
        }
        self.buf.pop();
        if !self.buf.iter().all(|&c| (0x20..=0x7e).contains(&c)) {
            return Err(BusError::protocol("line contains non-printable or non-ASCII bytes"));
        }
        // All bytes are ASCII at this point.
        String::from_utf8(std::mem::take(&mut self.buf))
            .map(Some)
            .map_err(|e| BusError::protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_frame() {
        assert_eq!(split_frame("12 PUB").unwrap(), (12, "PUB"));
        assert_eq!(split_frame("3 SEND q:t:a b:c").unwrap(), (3, "SEND q:t:a b:c"));
        assert_eq!(split_frame("7 ").unwrap(), (7, ""));

        assert!(split_frame("PUB").is_err());
        assert!(split_frame("0 PUB").is_err());
        assert!(split_frame("+4 PUB").is_err());
        assert!(split_frame("-4 PUB").is_err());
        assert!(split_frame(" 4 PUB").is_err());
        assert!(split_frame("99999999999999999999999 PUB").is_err());
    }

    #[test]
    fn test_format_frame() {
        assert_eq!(format_frame(1, "SUB tappables"), "1 SUB tappables\n");
    }

    #[tokio::test]
    async fn test_line_reader_splits_lines() {
        let input: &[u8] = b"1 PUB\n2 SUB q\n\n3 CLOSE\npartial";
        let mut reader = LineReader::new(input, DEFAULT_MAX_LINE_LENGTH);
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("1 PUB"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("2 SUB q"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some(""));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("3 CLOSE"));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_line_reader_rejects_long_and_binary_lines() {
        let input: &[u8] = b"1 SEND q:t:0123456789\n";
        let mut reader = LineReader::new(input, 8);
        assert!(matches!(reader.next_line().await, Err(BusError::Protocol(_))));

        let input: &[u8] = b"1 SEND q:t:\x01\n";
        let mut reader = LineReader::new(input, DEFAULT_MAX_LINE_LENGTH);
        assert!(matches!(reader.next_line().await, Err(BusError::Protocol(_))));
    }
}
