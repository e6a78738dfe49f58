//! RESP Values
//!
//! Owned protocol tree produced by the parser and the reply encoder.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

/// Fast `+OK` reply
pub const OK: &[u8] = b"+OK\r\n";

/// Nil bulk reply
pub const NIL: &[u8] = b"$-1\r\n";

const CRLF: &[u8] = b"\r\n";

/// A single RESP value. Arrays own their children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    Nil,
    SimpleString(Bytes),
    Error(Bytes),
    Integer(i64),
    BulkString(Bytes),
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    pub fn simple(text: &'static str) -> Self {
        RespValue::SimpleString(Bytes::from_static(text.as_bytes()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        RespValue::Error(Bytes::from(message.into()))
    }

    /// Command array as clients send it: one bulk string per argument
    pub fn command<I, T>(args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        RespValue::Array(args.into_iter().map(|arg| RespValue::bulk(arg)).collect())
    }

    pub fn as_bulk(&self) -> Option<&Bytes> {
        match self {
            RespValue::BulkString(data) => Some(data),
            _ => None,
        }
    }

    /// Append the wire form of this value to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            RespValue::Nil => buf.put_slice(NIL),
            RespValue::SimpleString(text) => encode_line(buf, b'+', text),
            RespValue::Error(text) => encode_line(buf, b'-', text),
            RespValue::Integer(n) => encode_header(buf, b':', *n),
            RespValue::BulkString(data) => encode_bulk(buf, data),
            RespValue::Array(items) => {
                encode_header(buf, b'*', items.len() as i64);
                for item in items {
                    item.encode(buf);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// `$<len>\r\n<data>\r\n`
pub fn encode_bulk(buf: &mut BytesMut, data: &[u8]) {
    buf.reserve(data.len() + 16);
    encode_header(buf, b'$', data.len() as i64);
    buf.put_slice(data);
    buf.put_slice(CRLF);
}

/// `<prefix><n>\r\n`, shared by integers and length headers
pub fn encode_header(buf: &mut BytesMut, prefix: u8, n: i64) {
    buf.put_u8(prefix);
    buf.put_slice(n.to_string().as_bytes());
    buf.put_slice(CRLF);
}

fn encode_line(buf: &mut BytesMut, prefix: u8, text: &[u8]) {
    buf.put_u8(prefix);
    buf.put_slice(text);
    buf.put_slice(CRLF);
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::Nil => write!(f, "(nil)"),
            RespValue::SimpleString(text) => write!(f, "{}", String::from_utf8_lossy(text)),
            RespValue::Error(text) => write!(f, "(error) {}", String::from_utf8_lossy(text)),
            RespValue::Integer(n) => write!(f, "(integer) {}", n),
            RespValue::BulkString(data) => write!(f, "\"{}\"", String::from_utf8_lossy(data)),
            RespValue::Array(items) if items.is_empty() => write!(f, "(empty array)"),
            RespValue::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, item)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_message_push() {
        let value = RespValue::command(["message", "room1", "hello"]);
        assert_eq!(
            value.to_bytes().as_ref(),
            b"*3\r\n$7\r\nmessage\r\n$5\r\nroom1\r\n$5\r\nhello\r\n"
        );
    }

    #[test]
    fn test_encode_scalars() {
        assert_eq!(RespValue::Nil.to_bytes().as_ref(), NIL);
        assert_eq!(RespValue::simple("OK").to_bytes().as_ref(), OK);
        assert_eq!(RespValue::Integer(-3).to_bytes().as_ref(), b":-3\r\n");
        assert_eq!(RespValue::error("ERR boom").to_bytes().as_ref(), b"-ERR boom\r\n");
        assert_eq!(RespValue::bulk("").to_bytes().as_ref(), b"$0\r\n\r\n");
    }

    #[test]
    fn test_display_like_cli() {
        let value = RespValue::Array(vec![
            RespValue::bulk("subscribe"),
            RespValue::bulk("room"),
            RespValue::Integer(1),
        ]);
        assert_eq!(value.to_string(), "1) \"subscribe\"\n2) \"room\"\n3) (integer) 1");
    }
}
