//! WebSocket frame encoding and decoding.

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{AppError, AppResult};

/// Upper bound on a single inbound payload.
pub const MAX_PAYLOAD: u64 = 64 << 20; // 64 MiB

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn as_u8(&self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = AppError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(AppError::Protocol(format!("unknown opcode 0x{:X}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    /// Masking key; always present on client-to-server frames.
    pub mask: Option<[u8; 4]>,
    /// Unmasked payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Final, unmasked frame.
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Final frame masked with a fresh random key, as a client must send it.
    pub fn client(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(opcode, payload).with_mask(random_mask())
    }

    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }

    /// Close status code, if the payload carries one.
    pub fn close_code(&self) -> Option<u16> {
        match (self.opcode, self.payload.as_slice()) {
            (Opcode::Close, [hi, lo, ..]) => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }

    /// Wire bytes. The payload is XORed with the key when one is set.
    pub fn encode(&self) -> Vec<u8> {
        let len = self.payload.len();
        let mut out = Vec::with_capacity(len + 14);
        let fin_bit = if self.fin { 0x80 } else { 0 };
        out.push(fin_bit | self.opcode.as_u8());

        let mask_bit = if self.mask.is_some() { 0x80 } else { 0 };
        if len <= 125 {
            out.push(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }

        match self.mask {
            Some(key) => {
                out.extend_from_slice(&key);
                let start = out.len();
                out.extend_from_slice(&self.payload);
                apply_mask(&mut out[start..], key);
            }
            None => out.extend_from_slice(&self.payload),
        }
        out
    }
}

/// XOR byte `i` with `key[i % 4]`. Applying it twice restores the input.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

pub fn random_mask() -> [u8; 4] {
    let mut key = [0u8; 4];
    OsRng.fill_bytes(&mut key);
    key
}

/// Byte transport a frame is read from and written to.
#[async_trait]
pub trait FrameIo: Send {
    /// Exactly `len` bytes, or an error if the stream ends first.
    async fn read_exact(&mut self, len: usize) -> AppResult<Vec<u8>>;

    async fn write_all(&mut self, data: &[u8]) -> AppResult<()>;
}

/// Read one complete frame and unmask its payload.
pub async fn read_frame<I: FrameIo + ?Sized>(io: &mut I) -> AppResult<Frame> {
    let header = io.read_exact(2).await?;
    let fin = header[0] & 0x80 != 0;
    if header[0] & 0x70 != 0 {
        return Err(AppError::Protocol("reserved bits set without an extension".to_string()));
    }
    let opcode = Opcode::try_from(header[0] & 0x0F)?;
    let masked = header[1] & 0x80 != 0;

    let len = match header[1] & 0x7F {
        126 => {
            let ext = io.read_exact(2).await?;
            u16::from_be_bytes([ext[0], ext[1]]) as u64
        }
        127 => {
            let ext = io.read_exact(8).await?;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&ext);
            u64::from_be_bytes(bytes)
        }
        n => n as u64,
    };
    if opcode.is_control() {
        if len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(AppError::Protocol(format!(
                "{:?} frame payload of {} bytes exceeds {}",
                opcode, len, MAX_CONTROL_PAYLOAD
            )));
        }
        if !fin {
            return Err(AppError::Protocol(format!("fragmented {:?} frame", opcode)));
        }
    }
    if len > MAX_PAYLOAD {
        return Err(AppError::Protocol(format!("frame payload of {} bytes is too large", len)));
    }

    let mask = if masked {
        let key = io.read_exact(4).await?;
        Some([key[0], key[1], key[2], key[3]])
    } else {
        None
    };
    let mut payload = io.read_exact(len as usize).await?;
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }
    Ok(Frame {
        fin,
        opcode,
        mask,
        payload,
    })
}

pub async fn write_frame<I: FrameIo + ?Sized>(io: &mut I, frame: &Frame) -> AppResult<()> {
    io.write_all(&frame.encode()).await
}
