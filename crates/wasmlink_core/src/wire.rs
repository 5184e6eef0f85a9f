//! Little-endian frame layouts exchanged with the remote client.
//!
//! Every decoder checks the frame length before reading a field. Encoders
//! exist for both directions so the loopback client and the tests speak the
//! same format as the device.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{ErrorCode, RuntimeError, WireError};
use crate::integrity::crc16_ccitt;
use crate::queue::{FunctionName, FUNCTION_NAME_SIZE, MAX_ARGS};
use crate::registry::{Verification, VerifyOutcome, RESOURCE_SIZE};
use crate::session::SessionState;
use crate::sprite::{RegistryStatus, SpriteOperation, SpriteStatus};
use crate::status::{ExecutionResult, StatusSnapshot};

/// `cmd:1, sequence:1, chunk_size:2, total_size:4`.
pub const UPLOAD_HEADER_SIZE: usize = 8;
pub const EXECUTE_REQUEST_SIZE: usize = FUNCTION_NAME_SIZE + 4 + 4 * MAX_ARGS;
pub const STATUS_RESPONSE_SIZE: usize = 18;
pub const RESULT_DATA_SIZE: usize = 32;
pub const RESULT_RESPONSE_SIZE: usize = 10 + RESULT_DATA_SIZE;
pub const RESOURCE_UPLOAD_SIZE: usize = 2 + RESOURCE_SIZE + 2;
pub const RESOURCE_REQUEST_SIZE: usize = 2;
pub const DOWNLOAD_RESPONSE_SIZE: usize = RESOURCE_UPLOAD_SIZE + 1;
pub const VERIFY_RESPONSE_SIZE: usize = 8;
pub const REGISTRY_STATUS_SIZE: usize = 12;
pub const DFU_CONTROL_SIZE: usize = 20;
pub const DFU_PACKET_MAX: usize = 20;

/// Most chunks a single upload can use; the sequence field is one byte.
pub const MAX_CHUNKS: usize = 256;

fn require(frame: &[u8], needed: usize) -> Result<(), WireError> {
    if frame.len() < needed {
        return Err(WireError::TooShort {
            needed,
            got: frame.len(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UploadCommand {
    Start = 0x01,
    Continue = 0x02,
    /// Legacy: finalize with whatever arrived.
    End = 0x03,
    Reset = 0x04,
}

impl TryFrom<u8> for UploadCommand {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0x01 => Ok(Self::Start),
            0x02 => Ok(Self::Continue),
            0x03 => Ok(Self::End),
            0x04 => Ok(Self::Reset),
            other => Err(WireError::UnknownCommand(other)),
        }
    }
}

/// One upload frame. `data` borrows the frame it was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadPacket<'a> {
    pub command: UploadCommand,
    pub sequence: u8,
    /// Meaningful only for `Start`.
    pub total_size: u32,
    pub data: &'a [u8],
}

impl<'a> UploadPacket<'a> {
    /// The declared `chunk_size` must fit in the frame; trailing bytes past
    /// it are ignored.
    pub fn decode(frame: &'a [u8]) -> Result<Self, WireError> {
        require(frame, UPLOAD_HEADER_SIZE)?;
        let command = UploadCommand::try_from(frame[0])?;
        let sequence = frame[1];
        let chunk_size = LittleEndian::read_u16(&frame[2..4]) as usize;
        let total_size = LittleEndian::read_u32(&frame[4..8]);
        require(frame, UPLOAD_HEADER_SIZE + chunk_size)?;
        Ok(Self {
            command,
            sequence,
            total_size,
            data: &frame[UPLOAD_HEADER_SIZE..UPLOAD_HEADER_SIZE + chunk_size],
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(UPLOAD_HEADER_SIZE + self.data.len());
        out.push(self.command as u8);
        out.push(self.sequence);
        out.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.total_size.to_le_bytes());
        out.extend_from_slice(self.data);
        out
    }

    pub fn control(command: UploadCommand) -> Self {
        Self {
            command,
            sequence: 0,
            total_size: 0,
            data: &[],
        }
    }
}

/// Split `module` into Start/Continue frames no longer than `max_write_len`.
pub fn chunk_module(module: &[u8], max_write_len: usize) -> Result<Vec<Vec<u8>>, WireError> {
    let per_frame = max_write_len
        .saturating_sub(UPLOAD_HEADER_SIZE)
        .min(u16::MAX as usize);
    if per_frame == 0 {
        return Err(WireError::InvalidField("write length leaves no room for data"));
    }
    let total_size =
        u32::try_from(module.len()).map_err(|_| WireError::InvalidField("module size"))?;
    if module.len() > per_frame * MAX_CHUNKS {
        return Err(WireError::TooLong {
            len: module.len(),
            max: per_frame * MAX_CHUNKS,
        });
    }

    if module.is_empty() {
        return Ok(vec![UploadPacket {
            command: UploadCommand::Start,
            sequence: 0,
            total_size: 0,
            data: &[],
        }
        .encode()]);
    }

    Ok(module
        .chunks(per_frame)
        .enumerate()
        .map(|(i, chunk)| {
            UploadPacket {
                command: if i == 0 {
                    UploadCommand::Start
                } else {
                    UploadCommand::Continue
                },
                sequence: i as u8,
                total_size,
                data: chunk,
            }
            .encode()
        })
        .collect())
}

/// `function_name:32` (NUL-padded), `arg_count:4`, `args:4x4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteRequest {
    pub function_name: [u8; FUNCTION_NAME_SIZE],
    pub arg_count: u32,
    pub args: [i32; MAX_ARGS],
}

impl ExecuteRequest {
    pub fn new(name: &str, args: &[i32]) -> Result<Self, WireError> {
        if name.len() >= FUNCTION_NAME_SIZE {
            return Err(WireError::InvalidField("function name too long"));
        }
        if args.len() > MAX_ARGS {
            return Err(WireError::InvalidField("too many arguments"));
        }
        let mut function_name = [0u8; FUNCTION_NAME_SIZE];
        function_name[..name.len()].copy_from_slice(name.as_bytes());
        let mut padded = [0i32; MAX_ARGS];
        padded[..args.len()].copy_from_slice(args);
        Ok(Self {
            function_name,
            arg_count: args.len() as u32,
            args: padded,
        })
    }

    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        require(frame, EXECUTE_REQUEST_SIZE)?;
        let mut function_name = [0u8; FUNCTION_NAME_SIZE];
        function_name.copy_from_slice(&frame[..FUNCTION_NAME_SIZE]);
        let arg_count = LittleEndian::read_u32(&frame[FUNCTION_NAME_SIZE..FUNCTION_NAME_SIZE + 4]);
        let mut args = [0i32; MAX_ARGS];
        LittleEndian::read_i32_into(&frame[FUNCTION_NAME_SIZE + 4..EXECUTE_REQUEST_SIZE], &mut args);
        Ok(Self {
            function_name,
            arg_count,
            args,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(EXECUTE_REQUEST_SIZE);
        out.extend_from_slice(&self.function_name);
        out.extend_from_slice(&self.arg_count.to_le_bytes());
        for arg in self.args {
            out.extend_from_slice(&arg.to_le_bytes());
        }
        out
    }

    /// The name must be NUL-terminated inside the field, UTF-8 and
    /// non-empty.
    pub fn function(&self) -> Result<FunctionName, RuntimeError> {
        let Some(end) = self.function_name.iter().position(|&b| b == 0) else {
            return Err(RuntimeError::InvalidParams(
                "function name is not NUL-terminated".into(),
            ));
        };
        let name = std::str::from_utf8(&self.function_name[..end])
            .map_err(|_| RuntimeError::InvalidParams("function name is not UTF-8".into()))?;
        FunctionName::new(name)
    }

    pub fn arg_count(&self) -> Result<usize, RuntimeError> {
        let count = self.arg_count as usize;
        if count > MAX_ARGS {
            return Err(RuntimeError::InvalidParams(format!(
                "{count} arguments, at most {MAX_ARGS} supported"
            )));
        }
        Ok(count)
    }
}

/// `status:1, error_code:1, bytes_received:2, total_size:4, uptime:4,
/// reserved:6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusResponse {
    pub state: SessionState,
    pub error_code: ErrorCode,
    pub bytes_received: u16,
    pub total_size: u32,
    pub uptime_secs: u32,
}

impl From<StatusSnapshot> for StatusResponse {
    fn from(s: StatusSnapshot) -> Self {
        Self {
            state: s.state,
            error_code: s.error_code,
            bytes_received: u16::try_from(s.bytes_received).unwrap_or(u16::MAX),
            total_size: s.total_size,
            uptime_secs: s.uptime_secs,
        }
    }
}

impl StatusResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(STATUS_RESPONSE_SIZE);
        out.push(self.state.as_u8());
        out.push(self.error_code.as_u8());
        out.extend_from_slice(&self.bytes_received.to_le_bytes());
        out.extend_from_slice(&self.total_size.to_le_bytes());
        out.extend_from_slice(&self.uptime_secs.to_le_bytes());
        out.resize(STATUS_RESPONSE_SIZE, 0);
        out
    }

    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        require(frame, STATUS_RESPONSE_SIZE)?;
        Ok(Self {
            state: SessionState::from_u8(frame[0]),
            error_code: ErrorCode::from_u8(frame[1]),
            bytes_received: LittleEndian::read_u16(&frame[2..4]),
            total_size: LittleEndian::read_u32(&frame[4..8]),
            uptime_secs: LittleEndian::read_u32(&frame[8..12]),
        })
    }
}

/// `status:1, error_code:1, return_value:4, execution_time_us:4,
/// result_data:32`. `result_data` is always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultResponse(pub ExecutionResult);

impl ResultResponse {
    pub fn encode(&self) -> Vec<u8> {
        let r = &self.0;
        let mut out = Vec::with_capacity(RESULT_RESPONSE_SIZE);
        out.push(r.status.as_u8());
        out.push(r.error_code.as_u8());
        out.extend_from_slice(&r.return_value.to_le_bytes());
        out.extend_from_slice(&r.execution_time_us.to_le_bytes());
        out.resize(RESULT_RESPONSE_SIZE, 0);
        out
    }

    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        require(frame, RESULT_RESPONSE_SIZE)?;
        Ok(Self(ExecutionResult {
            status: SessionState::from_u8(frame[0]),
            error_code: ErrorCode::from_u8(frame[1]),
            return_value: LittleEndian::read_i32(&frame[2..6]),
            execution_time_us: LittleEndian::read_u32(&frame[6..10]),
        }))
    }
}

/// `id:2, payload:32, crc16:2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceUpload {
    pub id: u16,
    pub payload: [u8; RESOURCE_SIZE],
    pub crc16: u16,
}

impl ResourceUpload {
    /// Build an upload carrying the correct CRC for `payload`.
    pub fn new(id: u16, payload: [u8; RESOURCE_SIZE]) -> Self {
        Self {
            id,
            payload,
            crc16: crc16_ccitt(&payload),
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        require(frame, RESOURCE_UPLOAD_SIZE)?;
        let mut payload = [0u8; RESOURCE_SIZE];
        payload.copy_from_slice(&frame[2..2 + RESOURCE_SIZE]);
        Ok(Self {
            id: LittleEndian::read_u16(&frame[0..2]),
            payload,
            crc16: LittleEndian::read_u16(&frame[2 + RESOURCE_SIZE..RESOURCE_UPLOAD_SIZE]),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RESOURCE_UPLOAD_SIZE);
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.crc16.to_le_bytes());
        out
    }
}

/// `id:2`: both the download and the verify request.
pub fn decode_resource_request(frame: &[u8]) -> Result<u16, WireError> {
    require(frame, RESOURCE_REQUEST_SIZE)?;
    Ok(LittleEndian::read_u16(&frame[..2]))
}

pub fn encode_resource_request(id: u16) -> Vec<u8> {
    id.to_le_bytes().to_vec()
}

/// `id:2, payload:32, crc16:2, status:1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadResponse {
    pub id: u16,
    pub payload: [u8; RESOURCE_SIZE],
    pub crc16: u16,
    pub status: SpriteStatus,
}

impl DownloadResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DOWNLOAD_RESPONSE_SIZE);
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.crc16.to_le_bytes());
        out.push(self.status.as_u8());
        out
    }

    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        require(frame, DOWNLOAD_RESPONSE_SIZE)?;
        let upload = ResourceUpload::decode(frame)?;
        Ok(Self {
            id: upload.id,
            payload: upload.payload,
            crc16: upload.crc16,
            status: SpriteStatus::from_u8(frame[RESOURCE_UPLOAD_SIZE]),
        })
    }
}

/// `id:2, stored_crc16:2, calculated_crc16:2, verification_status:1,
/// reserved:1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyResponse(pub Verification);

impl VerifyResponse {
    pub fn encode(&self) -> Vec<u8> {
        let v = &self.0;
        let mut out = Vec::with_capacity(VERIFY_RESPONSE_SIZE);
        out.extend_from_slice(&v.id.to_le_bytes());
        out.extend_from_slice(&v.stored_crc16.to_le_bytes());
        out.extend_from_slice(&v.calculated_crc16.to_le_bytes());
        out.push(v.outcome.as_u8());
        out.push(0);
        out
    }

    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        require(frame, VERIFY_RESPONSE_SIZE)?;
        Ok(Self(Verification {
            id: LittleEndian::read_u16(&frame[0..2]),
            stored_crc16: LittleEndian::read_u16(&frame[2..4]),
            calculated_crc16: LittleEndian::read_u16(&frame[4..6]),
            outcome: VerifyOutcome::from_u8(frame[6]),
        }))
    }
}

/// `total:2, free:2, last_id:2, registry_status:1, last_operation:1,
/// crc_errors:2, reserved:2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStatusFrame {
    pub total: u16,
    pub free: u16,
    pub last_id: u16,
    pub registry_status: RegistryStatus,
    pub last_operation: SpriteOperation,
    pub crc_errors: u16,
}

impl RegistryStatusFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = [0u8; REGISTRY_STATUS_SIZE];
        out[0..2].copy_from_slice(&self.total.to_le_bytes());
        out[2..4].copy_from_slice(&self.free.to_le_bytes());
        out[4..6].copy_from_slice(&self.last_id.to_le_bytes());
        out[6] = self.registry_status.as_u8();
        out[7] = self.last_operation.as_u8();
        out[8..10].copy_from_slice(&self.crc_errors.to_le_bytes());
        out.to_vec()
    }

    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        require(frame, REGISTRY_STATUS_SIZE)?;
        Ok(Self {
            total: LittleEndian::read_u16(&frame[0..2]),
            free: LittleEndian::read_u16(&frame[2..4]),
            last_id: LittleEndian::read_u16(&frame[4..6]),
            registry_status: RegistryStatus::from_u8(frame[6]),
            last_operation: SpriteOperation::from_u8(frame[7]),
            crc_errors: LittleEndian::read_u16(&frame[8..10]),
        })
    }
}

/// `command:1, params:19`. Short frames are zero-extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuControl {
    pub command: u8,
    pub params: [u8; DFU_CONTROL_SIZE - 1],
}

impl DfuControl {
    pub fn new(command: u8, params: &[u8]) -> Result<Self, WireError> {
        if params.len() >= DFU_CONTROL_SIZE {
            return Err(WireError::TooLong {
                len: params.len() + 1,
                max: DFU_CONTROL_SIZE,
            });
        }
        let mut padded = [0u8; DFU_CONTROL_SIZE - 1];
        padded[..params.len()].copy_from_slice(params);
        Ok(Self {
            command,
            params: padded,
        })
    }

    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        require(frame, 1)?;
        Self::new(frame[0], &frame[1..])
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DFU_CONTROL_SIZE);
        out.push(self.command);
        out.extend_from_slice(&self.params);
        out
    }
}
