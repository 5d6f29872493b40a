// Copyright (C) 2024  dbgp-proxy contributors
//
// This file is part of dbgp-proxy.
//
// dbgp-proxy is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! DBGp message framing: `<decimal length>\0<body>\0`, length counting only
//! the body. Implemented as a `tokio_util` codec, following the teacher's
//! line-codec pattern adapted from length-delimited lines to a
//! length-prefixed-NUL scheme.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

#[derive(Debug)]
enum DecodeState {
    Length,
    Body(usize),
}

impl Default for DecodeState {
    fn default() -> Self {
        DecodeState::Length
    }
}

/// Codec for one leg of the DBGp wire protocol. Frames are `String`s; the
/// codec itself never inspects the XML inside.
#[derive(Debug, Default)]
pub struct DbgpCodec {
    state: DecodeState,
}

impl DbgpCodec {
    /// Declared frame bodies larger than this are a protocol error rather
    /// than an allocation hazard.
    pub const MAX_FRAME_LEN: usize = 1024 * 1024;

    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for DbgpCodec {
    type Item = String;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, Error> {
        loop {
            match self.state {
                DecodeState::Length => {
                    let nul_pos = match src.iter().position(|&b| b == 0) {
                        Some(pos) => pos,
                        None => {
                            if src.len() > 20 {
                                return Err(Error::Framing(
                                    "length prefix exceeds 20 digits".into(),
                                ));
                            }
                            return Ok(None);
                        }
                    };

                    let len_str = std::str::from_utf8(&src[..nul_pos])
                        .map_err(|_| Error::Framing("length prefix is not utf-8".into()))?;
                    let len: usize = len_str.parse().map_err(|_| {
                        Error::Framing(format!("non-numeric length prefix {len_str:?}"))
                    })?;
                    if len > Self::MAX_FRAME_LEN {
                        return Err(Error::Framing(format!(
                            "frame length {len} exceeds cap of {}",
                            Self::MAX_FRAME_LEN
                        )));
                    }

                    src.advance(nul_pos + 1);
                    self.state = DecodeState::Body(len);
                }
                DecodeState::Body(len) => {
                    if src.len() < len + 1 {
                        src.reserve(len + 1 - src.len());
                        return Ok(None);
                    }

                    let body = src.split_to(len);
                    let trailing_nul = src[0];
                    src.advance(1);
                    self.state = DecodeState::Length;

                    if trailing_nul != 0 {
                        return Err(Error::Framing("frame missing trailing NUL".into()));
                    }

                    let body = String::from_utf8(body.to_vec())
                        .map_err(|_| Error::Framing("frame body is not utf-8".into()))?;
                    return Ok(Some(body));
                }
            }
        }
    }
}

impl Encoder<String> for DbgpCodec {
    type Error = Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Error> {
        Encoder::<&str>::encode(self, item.as_str(), dst)
    }
}

impl Encoder<&str> for DbgpCodec {
    type Error = Error;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), Error> {
        let body = item.as_bytes();
        dst.reserve(body.len() + 24);
        dst.extend_from_slice(body.len().to_string().as_bytes());
        dst.extend_from_slice(&[0]);
        dst.extend_from_slice(body);
        dst.extend_from_slice(&[0]);
        Ok(())
    }
}

/// Read one DBGp frame from `stream`, accumulating across short reads.
/// Returns the decoded body plus whatever trailing bytes were already read
/// past the end of the frame, so callers that switch to raw byte splicing
/// afterwards don't lose them.
pub async fn read_one_frame<R>(stream: &mut R, max_len: usize) -> Result<(String, BytesMut), Error>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut codec = DbgpCodec::new();
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        if let Some(body) = codec.decode(&mut buf)? {
            return Ok((body, buf));
        }
        if buf.len() > max_len {
            return Err(Error::Framing(format!(
                "frame exceeds maximum length of {max_len} bytes before completion"
            )));
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before a complete frame was received",
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_body() {
        let mut codec = DbgpCodec::new();
        let mut buf = BytesMut::new();
        let body = "hello <world/> \u{1F980}";
        Encoder::<&str>::encode(&mut codec, body, &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, body);
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_across_short_reads() {
        let mut codec = DbgpCodec::new();
        let mut buf = BytesMut::new();
        Encoder::<&str>::encode(&mut codec, "STEP_OVER", &mut buf).unwrap();
        let whole = buf.split();

        let mut partial = BytesMut::new();
        assert!(codec.decode(&mut partial).unwrap().is_none());

        for byte in whole.iter() {
            partial.extend_from_slice(&[*byte]);
        }
        let decoded = codec.decode(&mut partial).unwrap();
        assert_eq!(decoded, Some("STEP_OVER".to_string()));
    }

    #[test]
    fn rejects_non_numeric_length() {
        let mut codec = DbgpCodec::new();
        let mut buf = BytesMut::from(&b"abc\0x\0"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut codec = DbgpCodec::new();
        let mut buf = BytesMut::from(format!("{}\0", DbgpCodec::MAX_FRAME_LEN + 1).as_bytes());
        assert!(codec.decode(&mut buf).is_err());
    }

    #[tokio::test]
    async fn read_one_frame_returns_leftover_bytes() {
        let mut codec = DbgpCodec::new();
        let mut buf = BytesMut::new();
        Encoder::<&str>::encode(&mut codec, "<init/>", &mut buf).unwrap();
        buf.extend_from_slice(b"trailing");

        let mut cursor = std::io::Cursor::new(buf.to_vec());
        let (body, leftover) = read_one_frame(&mut cursor, DbgpCodec::MAX_FRAME_LEN)
            .await
            .unwrap();
        assert_eq!(body, "<init/>");
        assert_eq!(&leftover[..], b"trailing");
    }
}
