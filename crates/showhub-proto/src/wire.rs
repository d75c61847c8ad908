//! Binary encode/decode for [`crate::Message`].
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! u16  address length
//! ..   address bytes (UTF-8)
//! u16  argument count
//! per argument:
//!   u8   type tag (0=int 1=float 2=string 3=bool 4=blob)
//!   ..   payload: i32 | f32 | u32-len+bytes | u8 | u32-len+bytes
//! ```
//!
//! This is deliberately simple rather than byte-compatible with any external
//! standard: the spec only requires address-prefixed, typed-argument packets,
//! not interop with a specific binary format.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{Message, Value};

#[derive(Debug, Error, PartialEq)]
pub enum WireError {
    #[error("frame too short: need {need} more bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("address is not valid UTF-8")]
    InvalidAddress,
    #[error("string argument is not valid UTF-8")]
    InvalidString,
    #[error("unknown argument type tag {0:#x}")]
    UnknownTag(u8),
}

const TAG_INT: u8 = 0;
const TAG_FLOAT: u8 = 1;
const TAG_STRING: u8 = 2;
const TAG_BOOL: u8 = 3;
const TAG_BLOB: u8 = 4;

pub fn encode(msg: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(32 + msg.args.len() * 8);

    let addr_bytes = msg.address.as_bytes();
    buf.put_u16(addr_bytes.len() as u16);
    buf.put_slice(addr_bytes);

    buf.put_u16(msg.args.len() as u16);
    for arg in &msg.args {
        match arg {
            Value::Int(v) => {
                buf.put_u8(TAG_INT);
                buf.put_i32(*v);
            }
            Value::Float(v) => {
                buf.put_u8(TAG_FLOAT);
                buf.put_f32(*v);
            }
            Value::String(s) => {
                buf.put_u8(TAG_STRING);
                buf.put_u32(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            Value::Bool(b) => {
                buf.put_u8(TAG_BOOL);
                buf.put_u8(if *b { 1 } else { 0 });
            }
            Value::Blob(bytes) => {
                buf.put_u8(TAG_BLOB);
                buf.put_u32(bytes.len() as u32);
                buf.put_slice(bytes);
            }
        }
    }

    buf.freeze()
}

pub fn decode(bytes: &[u8]) -> Result<Message, WireError> {
    let mut buf = Bytes::copy_from_slice(bytes);

    let addr_len = read_u16(&mut buf)? as usize;
    if buf.remaining() < addr_len {
        return Err(WireError::Truncated {
            need: addr_len,
            have: buf.remaining(),
        });
    }
    let addr_bytes = buf.split_to(addr_len);
    let address = String::from_utf8(addr_bytes.to_vec()).map_err(|_| WireError::InvalidAddress)?;

    let arg_count = read_u16(&mut buf)? as usize;
    let mut args = Vec::with_capacity(arg_count);
    for _ in 0..arg_count {
        let tag = read_u8(&mut buf)?;
        let value = match tag {
            TAG_INT => Value::Int(read_i32(&mut buf)?),
            TAG_FLOAT => Value::Float(read_f32(&mut buf)?),
            TAG_STRING => {
                let len = read_u32(&mut buf)? as usize;
                if buf.remaining() < len {
                    return Err(WireError::Truncated {
                        need: len,
                        have: buf.remaining(),
                    });
                }
                let s = buf.split_to(len);
                Value::String(String::from_utf8(s.to_vec()).map_err(|_| WireError::InvalidString)?)
            }
            TAG_BOOL => Value::Bool(read_u8(&mut buf)? != 0),
            TAG_BLOB => {
                let len = read_u32(&mut buf)? as usize;
                if buf.remaining() < len {
                    return Err(WireError::Truncated {
                        need: len,
                        have: buf.remaining(),
                    });
                }
                Value::Blob(buf.split_to(len).to_vec())
            }
            other => return Err(WireError::UnknownTag(other)),
        };
        args.push(value);
    }

    Ok(Message { address, args })
}

fn read_u8(buf: &mut Bytes) -> Result<u8, WireError> {
    if buf.remaining() < 1 {
        return Err(WireError::Truncated { need: 1, have: 0 });
    }
    Ok(buf.get_u8())
}

fn read_u16(buf: &mut Bytes) -> Result<u16, WireError> {
    if buf.remaining() < 2 {
        return Err(WireError::Truncated {
            need: 2,
            have: buf.remaining(),
        });
    }
    Ok(buf.get_u16())
}

fn read_u32(buf: &mut Bytes) -> Result<u32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated {
            need: 4,
            have: buf.remaining(),
        });
    }
    Ok(buf.get_u32())
}

fn read_i32(buf: &mut Bytes) -> Result<i32, WireError> {
    read_u32(buf).map(|v| v as i32)
}

fn read_f32(buf: &mut Bytes) -> Result<f32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated {
            need: 4,
            have: buf.remaining(),
        });
    }
    Ok(buf.get_f32())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_mixed_args() {
        let msg = Message::new(
            "/avantis/ch/1/mix/fader",
            vec![Value::Float(0.75), Value::Int(3), Value::String("scurve".into()), Value::Bool(true)],
        );
        let bytes = encode(&msg);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn round_trips_no_args() {
        let msg = Message::new("/fade/stop", vec![]);
        assert_eq!(decode(&encode(&msg)).unwrap(), msg);
    }

    #[test]
    fn decode_reports_truncation_without_panicking() {
        let msg = Message::new("/ch/1", vec![Value::Int(1)]);
        let bytes = encode(&msg);
        let err = decode(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        let mut bytes = BytesMut::new();
        bytes.put_u16(1);
        bytes.put_slice(b"/");
        bytes.put_u16(1);
        bytes.put_u8(0xEE);
        assert_eq!(decode(&bytes).unwrap_err(), WireError::UnknownTag(0xEE));
    }
}
