//! Bounded line framing for client connections.
//!
//! A line that is not UTF-8 or grows past the configured size is reported as
//! a [`Frame::Rejected`] and the connection keeps reading after the next
//! newline. The buffer never holds more than `max_bytes + 1` bytes.

use crate::core::MutationError;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

#[derive(Debug, PartialEq)]
pub enum Frame {
    Line(String),
    Rejected(MutationError),
}

/// Reads newline-terminated frames. Cancel safe: partial input stays in the
/// reader's own buffer, so it can sit in a `select!` loop.
pub struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    max_bytes: usize,
    discarding: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R, max_bytes: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::new(),
            max_bytes: max_bytes.max(1),
            discarding: false,
        }
    }

    /// Next frame, or `None` at end of input.
    pub async fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            if self.discarding {
                let chunk = self.inner.fill_buf().await?;
                if chunk.is_empty() {
                    return Ok(None);
                }
                match chunk.iter().position(|byte| *byte == b'\n') {
                    Some(end) => {
                        self.inner.consume(end + 1);
                        self.discarding = false;
                    }
                    None => {
                        let len = chunk.len();
                        self.inner.consume(len);
                    }
                }
                continue;
            }

            let room = (self.max_bytes + 1).saturating_sub(self.buf.len()) as u64;
            (&mut self.inner)
                .take(room)
                .read_until(b'\n', &mut self.buf)
                .await?;

            if self.buf.last() == Some(&b'\n') {
                return Ok(Some(self.finish_line()));
            }
            if self.buf.len() > self.max_bytes {
                self.buf.clear();
                self.discarding = true;
                return Ok(Some(Frame::Rejected(MutationError::validation(
                    "message",
                    format!("line exceeds {} bytes", self.max_bytes),
                ))));
            }
            // End of input; a trailing unterminated line still counts.
            if self.buf.is_empty() {
                return Ok(None);
            }
            return Ok(Some(self.finish_line()));
        }
    }

    fn finish_line(&mut self) -> Frame {
        let mut bytes = std::mem::take(&mut self.buf);
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
        }
        match String::from_utf8(bytes) {
            Ok(line) => Frame::Line(line),
            Err(_) => Frame::Rejected(MutationError::validation(
                "message",
                "line is not valid UTF-8",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn frames(input: &[u8], max_bytes: usize) -> Vec<Frame> {
        let mut reader = LineReader::new(input, max_bytes);
        let mut out = Vec::new();
        while let Some(frame) = reader.next_frame().await.unwrap() {
            out.push(frame);
        }
        out
    }

    fn rejected_field(frame: &Frame) -> Option<&str> {
        match frame {
            Frame::Rejected(MutationError::Validation { field, .. }) => field.as_deref(),
            _ => None,
        }
    }

    #[tokio::test]
    async fn splits_lines_and_strips_crlf() {
        let got = frames(b"one\r\ntwo\nthree", 64).await;
        assert_eq!(
            got,
            vec![
                Frame::Line("one".into()),
                Frame::Line("two".into()),
                Frame::Line("three".into()),
            ]
        );
    }

    #[tokio::test]
    async fn invalid_utf8_is_rejected_and_reading_continues() {
        let got = frames(b"\xff\xfe garbage\nping\n", 64).await;
        assert_eq!(got.len(), 2);
        assert_eq!(rejected_field(&got[0]), Some("message"));
        assert_eq!(got[1], Frame::Line("ping".into()));
    }

    #[tokio::test]
    async fn oversized_line_is_skipped_to_the_next_newline() {
        let mut input = vec![b'x'; 100];
        input.extend_from_slice(b"\nok\n");
        let got = frames(&input, 16).await;
        assert_eq!(got.len(), 2);
        assert_eq!(rejected_field(&got[0]), Some("message"));
        assert_eq!(got[1], Frame::Line("ok".into()));
    }

    #[tokio::test]
    async fn line_at_the_limit_is_accepted() {
        let got = frames(b"abcd\n", 4).await;
        assert_eq!(got, vec![Frame::Line("abcd".into())]);
    }
}
