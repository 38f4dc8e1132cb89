use crate::types::{SensorFrame, WireFormat};
use glam::{Quat, Vec3};
use std::collections::VecDeque;
use thiserror::Error;

/// Upper bound on buffered bytes before the oldest are discarded.
const MAX_BUFFERED: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq)]
pub enum FormatError {
    #[error("expected {expected} fields, got {actual}")]
    FieldCount { expected: usize, actual: usize },
    #[error("field {index} is not a number: {token:?}")]
    InvalidNumber { index: usize, token: String },
    #[error("binary frame must be {expected} bytes, got {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("text frame is not valid UTF-8")]
    NotUtf8,
    #[error("frame carries a NaN or infinite value")]
    NonFinite,
}

/// Decode `N` little-endian f32 values packed back to back.
fn read_floats<const N: usize>(bytes: &[u8]) -> [f32; N] {
    let mut out = [0.0f32; N];
    for (value, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    out
}

/// Layout: [ax, ay, az, gx, gy, gz]
pub fn decode_binary24(bytes: &[u8; 24]) -> SensorFrame {
    let f: [f32; 6] = read_floats(bytes);
    SensorFrame::SixAxis {
        accel: Vec3::new(f[0], f[1], f[2]),
        gyro: Vec3::new(f[3], f[4], f[5]),
    }
}

/// Layout: [ax, ay, az, qx, qy, qz, qw]. The quaternion is kept as sent.
pub fn decode_binary28(bytes: &[u8; 28]) -> SensorFrame {
    let f: [f32; 7] = read_floats(bytes);
    SensorFrame::SevenField {
        accel: Vec3::new(f[0], f[1], f[2]),
        quat: Quat::from_xyzw(f[3], f[4], f[5], f[6]),
    }
}

/// Layout: [ax, ay, az, gx, gy, gz, mx, my, mz]
pub fn decode_binary36(bytes: &[u8; 36]) -> SensorFrame {
    let f: [f32; 9] = read_floats(bytes);
    SensorFrame::NineAxis {
        accel: Vec3::new(f[0], f[1], f[2]),
        gyro: Vec3::new(f[3], f[4], f[5]),
        mag: Vec3::new(f[6], f[7], f[8]),
    }
}

/// Parse exactly `expected_fields` comma-separated floats.
///
/// The whole frame is rejected on a wrong token count or any bad token.
pub fn decode_text(text: &str, expected_fields: usize) -> Result<Vec<f32>, FormatError> {
    let tokens: Vec<&str> = text.trim().split(',').collect();
    if tokens.len() != expected_fields {
        return Err(FormatError::FieldCount {
            expected: expected_fields,
            actual: tokens.len(),
        });
    }

    tokens
        .iter()
        .enumerate()
        .map(|(index, token)| {
            token
                .trim()
                .parse::<f32>()
                .ok()
                .filter(|value| value.is_finite())
                .ok_or_else(|| FormatError::InvalidNumber {
                    index,
                    token: token.to_string(),
                })
        })
        .collect()
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<&[u8; N], FormatError> {
    bytes.try_into().map_err(|_| FormatError::WrongLength {
        expected: N,
        actual: bytes.len(),
    })
}

fn finite(frame: SensorFrame) -> Result<SensorFrame, FormatError> {
    if frame.is_finite() {
        Ok(frame)
    } else {
        Err(FormatError::NonFinite)
    }
}

/// Decode one complete frame of `format`. NaN and infinities are rejected.
pub fn decode_frame(format: WireFormat, bytes: &[u8]) -> Result<SensorFrame, FormatError> {
    match format {
        WireFormat::Binary24 => finite(decode_binary24(fixed(bytes)?)),
        WireFormat::Binary28 => finite(decode_binary28(fixed(bytes)?)),
        WireFormat::Binary36 => finite(decode_binary36(fixed(bytes)?)),
        WireFormat::TextCsv3 => {
            let text = std::str::from_utf8(bytes).map_err(|_| FormatError::NotUtf8)?;
            let v = decode_text(text, 3)?;
            Ok(SensorFrame::TextTriple {
                accel: Vec3::new(v[0], v[1], v[2]),
            })
        }
        WireFormat::TextCsv6 => {
            let text = std::str::from_utf8(bytes).map_err(|_| FormatError::NotUtf8)?;
            let v = decode_text(text, 6)?;
            Ok(SensorFrame::TextSix {
                accel: Vec3::new(v[0], v[1], v[2]),
                gyro: Vec3::new(v[3], v[4], v[5]),
            })
        }
    }
}

/// Serialize a frame in `format`. Fields the frame lacks are sent as zero.
pub fn encode_frame(format: WireFormat, frame: &SensorFrame) -> Vec<u8> {
    let accel = frame.accel();
    let gyro = frame.gyro().unwrap_or(Vec3::ZERO);

    match format {
        WireFormat::Binary24 => pack(&[accel.to_array(), gyro.to_array()].concat()),
        WireFormat::Binary28 => {
            let quat = frame.quat().unwrap_or(Quat::IDENTITY);
            pack(&[accel.to_array().as_slice(), quat.to_array().as_slice()].concat())
        }
        WireFormat::Binary36 => {
            let mag = frame.mag().unwrap_or(Vec3::ZERO);
            pack(&[accel.to_array(), gyro.to_array(), mag.to_array()].concat())
        }
        WireFormat::TextCsv3 => format!("{},{},{}", accel.x, accel.y, accel.z).into_bytes(),
        WireFormat::TextCsv6 => format!(
            "{},{},{},{},{},{}",
            accel.x, accel.y, accel.z, gyro.x, gyro.y, gyro.z
        )
        .into_bytes(),
    }
}

fn pack(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Streaming reassembly for one connection.
///
/// Binary formats accumulate bytes until a whole frame is present and keep
/// the remainder for the next one. Text formats treat every pushed chunk as
/// one message.
pub struct FrameAssembler {
    format: WireFormat,
    buffer: VecDeque<u8>,
    messages: VecDeque<Vec<u8>>,
}

impl FrameAssembler {
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            buffer: VecDeque::with_capacity(4096),
            messages: VecDeque::new(),
        }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Append bytes from one read.
    pub fn push_data(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.format.is_binary() {
            self.buffer.extend(data);
            if self.buffer.len() > MAX_BUFFERED {
                let frame_len = self.format.frame_len().unwrap_or(1);
                // Drop whole frames only, so alignment survives.
                let excess = self.buffer.len() - MAX_BUFFERED;
                let drop = excess.div_ceil(frame_len) * frame_len;
                tracing::warn!(dropped = drop, "Frame buffer overflow, discarding oldest bytes");
                self.buffer.drain(..drop.min(self.buffer.len()));
            }
        } else {
            self.messages.push_back(data.to_vec());
        }
    }

    /// Bytes waiting for the rest of a binary frame.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Next decoded frame, or `None` if nothing complete is buffered.
    pub fn next_frame(&mut self) -> Option<Result<SensorFrame, FormatError>> {
        match self.format.frame_len() {
            Some(frame_len) => {
                if self.buffer.len() < frame_len {
                    return None;
                }
                let frame: Vec<u8> = self.buffer.drain(..frame_len).collect();
                Some(decode_frame(self.format, &frame))
            }
            None => {
                let message = self.messages.pop_front()?;
                Some(decode_frame(self.format, &message))
            }
        }
    }
}
