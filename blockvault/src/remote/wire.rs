//! Wire framing for the remote client/server transport (§4.11, §6): every
//! message is a varint-encoded byte length followed by a JSON payload, the
//! same length-prefixing convention `blockvault-pages` documents for the
//! wire protocol's maps.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Get { key: String },
    Set { key: String, value: Vec<u8> },
    Delete { key: String },
    List { prefix: String },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Value(Vec<u8>),
    NotFound,
    Keys(Vec<String>),
    Ok,
    Pong,
    Err(String),
}

pub fn write_message<W: Write, T: Serialize>(w: &mut W, msg: &T) -> Result<()> {
    let body = serde_json::to_vec(msg).map_err(|e| Error::Remote(e.to_string()))?;
    let mut framed = Vec::with_capacity(body.len() + 10);
    blockvault_pages::varint::encode_u64(body.len() as u64, &mut framed);
    framed.extend_from_slice(&body);
    w.write_all(&framed).map_err(Error::Io)?;
    w.flush().map_err(Error::Io)
}

pub fn read_message<R: Read, T: for<'de> Deserialize<'de>>(r: &mut R) -> Result<T> {
    let len = read_varint_len(r)?;
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).map_err(Error::Io)?;
    serde_json::from_slice(&buf).map_err(|e| Error::Remote(e.to_string()))
}

fn read_varint_len<R: Read>(r: &mut R) -> Result<u64> {
    let mut bytes = Vec::with_capacity(10);
    loop {
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte).map_err(Error::Io)?;
        bytes.push(byte[0]);
        if byte[0] & 0x80 == 0 {
            break;
        }
    }
    let (value, _) = blockvault_pages::varint::decode_u64(&bytes)
        .map_err(|_| Error::Remote("malformed length prefix".into()))?;
    Ok(value)
}
