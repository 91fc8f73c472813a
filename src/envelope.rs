use std::io::{self, Cursor, ErrorKind, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{BufMut, Bytes, BytesMut};

use crate::node::Addr;
use crate::protocol::Session;
use crate::SendError;

// Envelope layout
// proto(u32) + session(u32) + source(u32) + len(u32) + payload([u8; len])
const HEAD_LEN: usize = 16;

// max payload len, the remaining bits of a 32bit size word are reserved
pub(crate) const PAYLOAD_MAX_LEN: usize = 0x00ff_ffff;

/// in-process message routed between services
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// protocol id, selects the protocol entry on the receiving side
    pub proto: u8,
    /// correlation id, 0 when no response is expected
    pub session: Session,
    /// sender address
    pub source: Addr,
    /// packed arguments, opaque to the router
    pub payload: Bytes,
}

impl Envelope {
    /// encode the envelope into one contiguous frame
    pub fn encode(&self) -> Result<Bytes, SendError> {
        let len = self.payload.len();
        if len > PAYLOAD_MAX_LEN {
            error!("encode too big message. len={len}");
            return Err(SendError::TooLarge(len));
        }

        let mut buf = BytesMut::with_capacity(HEAD_LEN + len);
        {
            let mut w = (&mut buf).writer();
            // writing into memory can't fail
            w.write_u32::<LittleEndian>(self.proto as u32).ok();
            w.write_u32::<LittleEndian>(self.session).ok();
            w.write_u32::<LittleEndian>(self.source.0).ok();
            w.write_u32::<LittleEndian>(len as u32).ok();
            w.write_all(&self.payload).ok();
        }
        Ok(buf.freeze())
    }

    /// decode an envelope from a frame produced by `encode`
    pub fn decode(mut frame: Bytes) -> io::Result<Self> {
        let mut r = Cursor::new(&frame[..]);
        let proto = r.read_u32::<LittleEndian>()?;
        let session = r.read_u32::<LittleEndian>()?;
        let source = r.read_u32::<LittleEndian>()?;
        let len = r.read_u32::<LittleEndian>()? as usize;

        if proto > u8::MAX as u32 {
            let s = format!("decode invalid protocol id. proto={proto}");
            error!("{s}");
            return Err(io::Error::new(ErrorKind::InvalidData, s));
        }

        if len > PAYLOAD_MAX_LEN || frame.len() != HEAD_LEN + len {
            let s = format!("decode bad message length. len={len} frame={}", frame.len());
            error!("{s}");
            return Err(io::Error::new(ErrorKind::InvalidData, s));
        }

        // the payload shares the frame memory
        let payload = frame.split_off(HEAD_LEN);
        Ok(Envelope {
            proto: proto as u8,
            session,
            source: Addr(source),
            payload,
        })
    }
}
