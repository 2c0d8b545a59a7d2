//! Netstring framing: `<decimal-length>":"<payload>","`.
//!
//! Both directions of an exchange are a sequence of these frames; a
//! zero-length frame (`0:,`) is the end-of-stream sentinel in both
//! directions. See spec §6.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};

/// A single netstring frame: a length-prefixed payload, or the empty
/// sentinel frame that ends the stream.
#[derive(Debug, Clone)]
pub struct Frame(pub Bytes);

impl Frame {
    /// The zero-length sentinel frame.
    pub fn sentinel() -> Frame {
        Frame(Bytes::new())
    }

    /// Whether this frame is the end-of-stream sentinel.
    pub fn is_sentinel(&self) -> bool {
        self.0.is_empty()
    }
}

/// Maximum single-frame payload size accepted while decoding.
///
/// Guards against a corrupt or hostile peer claiming an unbounded length
/// prefix; chosen generously above any body chunk a local worker would
/// reasonably emit in one frame.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// A `tokio_util::codec::{Encoder, Decoder}` implementing the netstring
/// wire format described in spec §6.
#[derive(Debug, Default)]
pub struct NetstringCodec {
    // Length of the payload currently being decoded, once the length
    // prefix and `:` have been consumed, until the whole payload plus
    // trailing `,` has arrived.
    decoding_len: Option<usize>,
}

impl Encoder<Bytes> for NetstringCodec {
    type Error = Error;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<()> {
        let mut len_buf = itoa::Buffer::new();
        let len_str = len_buf.format(payload.len());
        dst.reserve(len_str.len() + payload.len() + 2);
        dst.put_slice(len_str.as_bytes());
        dst.put_u8(b':');
        dst.put_slice(&payload);
        dst.put_u8(b',');
        Ok(())
    }
}

impl Decoder for NetstringCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let payload_len = match self.decoding_len {
            Some(len) => len,
            None => {
                let colon = match src.iter().position(|&b| b == b':') {
                    Some(idx) => idx,
                    None => {
                        if src.len() > 20 {
                            return Err(Error::new_protocol("netstring length prefix too long"));
                        }
                        return Ok(None);
                    }
                };
                if colon == 0 {
                    return Err(Error::new_protocol("netstring missing length prefix"));
                }
                let len: usize = std::str::from_utf8(&src[..colon])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Error::new_protocol("netstring length prefix is not a decimal integer"))?;
                if len > MAX_FRAME_LEN {
                    return Err(Error::new_protocol("netstring frame exceeds maximum size"));
                }
                src.advance(colon + 1);
                self.decoding_len = Some(len);
                len
            }
        };

        // payload + trailing comma
        if src.len() < payload_len + 1 {
            src.reserve(payload_len + 1 - src.len());
            return Ok(None);
        }

        if src[payload_len] != b',' {
            return Err(Error::new_protocol("netstring frame missing trailing ','"));
        }

        let payload = src.split_to(payload_len).freeze();
        src.advance(1); // the ','
        self.decoding_len = None;
        Ok(Some(Frame(payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn roundtrip(payload: &[u8]) {
        let mut codec = NetstringCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::copy_from_slice(payload), &mut buf)
            .unwrap();
        let frame = codec.decode(&mut buf).unwrap().expect("frame decoded");
        assert_eq!(&frame.0[..], payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn encodes_and_decodes_payload() {
        roundtrip(b"hello");
        roundtrip(b"");
    }

    #[test]
    fn sentinel_is_zero_length() {
        let mut codec = NetstringCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::new(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"0:,");
    }

    #[test]
    fn decodes_frame_split_across_reads() {
        let mut codec = NetstringCodec::default();
        let mut buf = BytesMut::from(&b"5:hel"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"lo,");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.0[..], b"hello");
    }

    #[test]
    fn rejects_missing_comma() {
        let mut codec = NetstringCodec::default();
        let mut buf = BytesMut::from(&b"3:abcX"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn rejects_non_numeric_length() {
        let mut codec = NetstringCodec::default();
        let mut buf = BytesMut::from(&b"ab:x,"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let mut codec = NetstringCodec::default();
        let mut buf = BytesMut::from(&b"2:hi,0:,"[..]);
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first.0[..], b"hi");
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(second.is_sentinel());
    }
}
