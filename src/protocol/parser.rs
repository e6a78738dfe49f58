//! Incremental RESP Parser
//!
//! Single-pass state machine over arbitrary chunks. Nested arrays are built
//! bottom-up on an explicit stack, so nesting depth never grows the call
//! stack. A bare line without a type byte is an inline command and is
//! promoted to a one-element array on `grab`.

use bytes::Bytes;

use super::value::RespValue;
use crate::error::ProtocolError;

/// Largest accepted bulk string (matches Redis `proto-max-bulk-len`)
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Largest accepted array header
pub const MAX_ARRAY_LEN: i64 = 1024 * 1024;

/// Largest line-terminated scalar or inline command
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Cap on up-front allocation for a declared bulk length
const MAX_PREALLOC: usize = 64 * 1024;

/// Cap on up-front allocation for a declared array length
const MAX_PREALLOC_ITEMS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    Incomplete,
    Invalid,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Type,
    LengthSign,
    Length,
    LengthEnd,
    String,
    StringEnd,
    Data,
    DataEnd1,
    DataEnd2,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    Simple,
    Error,
    Inline,
}

/// In-progress node. The progress counter is the buffer fill for bulk
/// strings and the item count for arrays.
#[derive(Debug)]
enum Partial {
    Line { kind: LineKind, buf: Vec<u8> },
    Integer,
    Bulk { data: Vec<u8>, len: usize },
    Array { items: Vec<RespValue>, len: usize },
}

/// Resumable RESP decoder. One value per completed parse.
#[derive(Debug)]
pub struct RespParser {
    state: State,
    negative: bool,
    digits: usize,
    accum: i64,
    stack: Vec<Partial>,
    latest: Option<RespValue>,
    inline: bool,
    error: Option<ProtocolError>,
}

impl Default for RespParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RespParser {
    pub fn new() -> Self {
        Self {
            state: State::Type,
            negative: false,
            digits: 0,
            accum: 0,
            stack: Vec::new(),
            latest: None,
            inline: false,
            error: None,
        }
    }

    pub fn status(&self) -> ParseStatus {
        match self.state {
            State::Done => ParseStatus::Done,
            State::Error => ParseStatus::Invalid,
            _ => ParseStatus::Incomplete,
        }
    }

    /// Cause of the last `Invalid` status
    pub fn error(&self) -> Option<&ProtocolError> {
        self.error.as_ref()
    }

    /// Current array nesting depth of the value being built
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Take the completed value and return to the initial state.
    ///
    /// Returns `None` unless the status is `Done`.
    pub fn grab(&mut self) -> Option<RespValue> {
        if self.state != State::Done {
            return None;
        }
        let value = self.latest.take()?;
        let inline = std::mem::take(&mut self.inline);
        self.state = State::Type;

        Some(if inline {
            RespValue::Array(vec![value])
        } else {
            value
        })
    }

    /// Drop any partial or completed value, including a failed one
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Feed `input` and return how many bytes were consumed.
    ///
    /// Consumption stops early once a value completes or the input turns out
    /// to be malformed; the caller resumes with the remainder after `grab`.
    pub fn parse(&mut self, input: &[u8]) -> usize {
        let mut i = 0;

        while i < input.len() {
            let byte = input[i];

            match self.state {
                State::Done | State::Error => return i,

                State::Type => {
                    let partial = match byte {
                        b'+' => Partial::Line {
                            kind: LineKind::Simple,
                            buf: Vec::new(),
                        },
                        b'-' => Partial::Line {
                            kind: LineKind::Error,
                            buf: Vec::new(),
                        },
                        b':' => Partial::Integer,
                        b'$' => Partial::Bulk {
                            data: Vec::new(),
                            len: 0,
                        },
                        b'*' => Partial::Array {
                            items: Vec::new(),
                            len: 0,
                        },
                        _ if self.stack.is_empty() => {
                            // Inline command: the byte belongs to the line itself
                            self.stack.push(Partial::Line {
                                kind: LineKind::Inline,
                                buf: Vec::new(),
                            });
                            self.state = State::String;
                            continue;
                        }
                        _ => {
                            return self.fail(
                                i,
                                ProtocolError::UnexpectedByte {
                                    found: byte,
                                    expected: "type byte",
                                },
                            )
                        }
                    };

                    self.state = match partial {
                        Partial::Line { .. } => State::String,
                        _ => State::LengthSign,
                    };
                    self.stack.push(partial);
                    i += 1;
                }

                State::LengthSign => {
                    self.negative = false;
                    self.digits = 0;
                    self.accum = 0;
                    self.state = State::Length;
                    if byte == b'-' {
                        self.negative = true;
                        i += 1;
                    }
                }

                State::Length => {
                    match byte {
                        b'\r' if self.digits > 0 => self.state = State::LengthEnd,
                        b'0'..=b'9' => {
                            let digit = i64::from(byte - b'0');
                            self.accum = match self
                                .accum
                                .checked_mul(10)
                                .and_then(|n| n.checked_add(digit))
                            {
                                Some(n) => n,
                                None => {
                                    return self.fail(i, ProtocolError::LengthLimit(self.accum))
                                }
                            };
                            self.digits += 1;
                        }
                        _ => return self.fail(i, ProtocolError::InvalidLength(byte)),
                    }
                    i += 1;
                }

                State::LengthEnd => {
                    if byte != b'\n' {
                        return self.fail(
                            i,
                            ProtocolError::UnexpectedByte {
                                found: byte,
                                expected: "\\n",
                            },
                        );
                    }
                    i += 1;

                    let n = if self.negative { -self.accum } else { self.accum };
                    if let Err(error) = self.finish_length(n) {
                        return self.fail(i - 1, error);
                    }
                }

                State::String => {
                    let rest = &input[i..];
                    let end = rest.iter().position(|&b| b == b'\r');
                    let take = end.unwrap_or(rest.len());

                    if let Some(Partial::Line { buf, .. }) = self.stack.last_mut() {
                        if buf.len() + take > MAX_LINE_LEN {
                            let len = (buf.len() + take) as i64;
                            return self.fail(i, ProtocolError::LengthLimit(len));
                        }
                        buf.extend_from_slice(&rest[..take]);
                    }

                    i += take;
                    if end.is_some() {
                        self.state = State::StringEnd;
                        i += 1;
                    }
                }

                State::StringEnd => {
                    if byte != b'\n' {
                        return self.fail(
                            i,
                            ProtocolError::UnexpectedByte {
                                found: byte,
                                expected: "\\n",
                            },
                        );
                    }
                    i += 1;
                    self.complete_top();
                }

                State::Data => {
                    if let Some(Partial::Bulk { data, len }) = self.stack.last_mut() {
                        let take = (input.len() - i).min(*len - data.len());
                        data.extend_from_slice(&input[i..i + take]);
                        i += take;
                        if data.len() == *len {
                            self.state = State::DataEnd1;
                        }
                    }
                }

                State::DataEnd1 | State::DataEnd2 => {
                    let (expected, label) = if self.state == State::DataEnd1 {
                        (b'\r', "\\r")
                    } else {
                        (b'\n', "\\n")
                    };
                    if byte != expected {
                        return self.fail(
                            i,
                            ProtocolError::UnexpectedByte {
                                found: byte,
                                expected: label,
                            },
                        );
                    }
                    i += 1;

                    if self.state == State::DataEnd1 {
                        self.state = State::DataEnd2;
                    } else {
                        self.complete_top();
                    }
                }
            }
        }

        i
    }

    fn fail(&mut self, consumed: usize, error: ProtocolError) -> usize {
        self.state = State::Error;
        self.stack.clear();
        self.error = Some(error);
        // The offending byte counts as consumed
        consumed + 1
    }

    /// Apply a completed length line to the node on top of the stack
    fn finish_length(&mut self, n: i64) -> Result<(), ProtocolError> {
        let completed = match self.stack.last_mut() {
            Some(Partial::Integer) => Some(RespValue::Integer(n)),
            Some(Partial::Array { .. } | Partial::Bulk { .. }) if n < 0 => Some(RespValue::Nil),
            Some(Partial::Array { .. }) if n == 0 => Some(RespValue::Array(Vec::new())),
            Some(Partial::Array { items, len }) => {
                if n > MAX_ARRAY_LEN {
                    return Err(ProtocolError::LengthLimit(n));
                }
                *len = n as usize;
                items.reserve((*len).min(MAX_PREALLOC_ITEMS));
                self.state = State::Type;
                None
            }
            Some(Partial::Bulk { data, len }) => {
                if n > MAX_BULK_LEN {
                    return Err(ProtocolError::LengthLimit(n));
                }
                *len = n as usize;
                data.reserve((*len).min(MAX_PREALLOC));
                self.state = if n == 0 {
                    State::DataEnd1
                } else {
                    State::Data
                };
                None
            }
            Some(Partial::Line { .. }) | None => {
                return Err(ProtocolError::UnexpectedByte {
                    found: b'\n',
                    expected: "line terminator",
                })
            }
        };

        if let Some(value) = completed {
            self.stack.pop();
            self.push_completed(value);
        }
        Ok(())
    }

    /// Pop the finished top node and hand it to its parent
    fn complete_top(&mut self) {
        let Some(partial) = self.stack.pop() else {
            return;
        };

        let value = match partial {
            Partial::Line { kind, buf } => {
                let buf = Bytes::from(buf);
                match kind {
                    LineKind::Simple => RespValue::SimpleString(buf),
                    LineKind::Error => RespValue::Error(buf),
                    LineKind::Inline => {
                        self.inline = true;
                        RespValue::BulkString(buf)
                    }
                }
            }
            Partial::Bulk { data, .. } => RespValue::BulkString(Bytes::from(data)),
            Partial::Array { items, .. } => RespValue::Array(items),
            // Integers complete with their length line
            Partial::Integer => return,
        };
        self.push_completed(value);
    }

    /// Attach a finished value to the enclosing array, finishing every
    /// ancestor that becomes full, or publish it as the root
    fn push_completed(&mut self, mut value: RespValue) {
        loop {
            match self.stack.last_mut() {
                None => {
                    self.latest = Some(value);
                    self.state = State::Done;
                    return;
                }
                Some(Partial::Array { items, len }) => {
                    items.push(value);
                    if items.len() < *len {
                        self.state = State::Type;
                        return;
                    }
                    let Some(Partial::Array { items, .. }) = self.stack.pop() else {
                        return;
                    };
                    value = RespValue::Array(items);
                }
                Some(_) => {
                    // Scalars never have children
                    self.state = State::Error;
                    self.error = Some(ProtocolError::UnexpectedByte {
                        found: 0,
                        expected: "array parent",
                    });
                    self.stack.clear();
                    return;
                }
            }
        }
    }
}
