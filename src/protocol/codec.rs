//! RESP Codec for Tokio
//!
//! Client side framing on top of `RespParser`. The server drives the same
//! parser directly from the reactor.

use bytes::{Buf, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use super::parser::{ParseStatus, RespParser};
use super::value::RespValue;

/// Tokio codec for RESP values
#[derive(Debug, Default)]
pub struct RespCodec {
    parser: RespParser,
}

impl RespCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while !src.is_empty() {
            let consumed = self.parser.parse(&src[..]);
            src.advance(consumed);

            match self.parser.status() {
                ParseStatus::Done => return Ok(self.parser.grab()),
                ParseStatus::Invalid => {
                    let message = self
                        .parser
                        .error()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "invalid RESP".to_string());
                    return Err(io::Error::new(io::ErrorKind::InvalidData, message));
                }
                ParseStatus::Incomplete if consumed == 0 => break,
                ParseStatus::Incomplete => {}
            }
        }

        Ok(None)
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = io::Error;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::Framed;

    #[test]
    fn test_codec_partial_decode() {
        let mut codec = RespCodec::new();

        let mut buf = BytesMut::from(&b"*3\r\n$7\r\nmessage\r\n$4\r\nro"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());

        buf.extend_from_slice(b"om\r\n$2\r\nhi\r\n:1\r\n");
        let value = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(value, RespValue::command(["message", "room", "hi"]));

        // The next reply stays buffered until asked for
        assert_eq!(buf.as_ref(), b":1\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(RespValue::Integer(1)));
    }

    #[test]
    fn test_codec_invalid_input() {
        let mut codec = RespCodec::new();
        let mut buf = BytesMut::from(&b":1x\r\n"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_framed_request_reply() {
        let io = tokio_test::io::Builder::new()
            .write(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n")
            .read(b"$5\r\nva")
            .read(b"lue\r\n")
            .build();
        let mut framed = Framed::new(io, RespCodec::new());

        framed.send(RespValue::command(["GET", "k"])).await.unwrap();
        let reply = framed.next().await.unwrap().unwrap();
        assert_eq!(reply, RespValue::bulk("value"));
    }
}
