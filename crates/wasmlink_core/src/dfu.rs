//! Firmware update control point.
//!
//! Images are received and CRC-checked but never flashed: `ActivateAndReset`
//! only reports that activation was requested.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::integrity::crc16_ccitt;
use crate::wire::DfuControl;

/// Opcode that prefixes every control point indication.
pub const RESPONSE_OPCODE: u8 = 0x60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuCommand {
    Start = 0x01,
    Initialize = 0x02,
    ReceiveFirmware = 0x03,
    Validate = 0x04,
    ActivateAndReset = 0x05,
}

impl DfuCommand {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Start),
            0x02 => Some(Self::Initialize),
            0x03 => Some(Self::ReceiveFirmware),
            0x04 => Some(Self::Validate),
            0x05 => Some(Self::ActivateAndReset),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DfuResponse {
    Success = 0x01,
    InvalidState = 0x02,
    NotSupported = 0x03,
    DataSizeExceeds = 0x04,
    CrcError = 0x05,
    OperationFailed = 0x06,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum DfuState {
    #[default]
    Idle = 0x00,
    Ready = 0x01,
    Receiving = 0x02,
    Validated = 0x03,
}

/// `[0x60, opcode, response]`, as sent on the control point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuIndication {
    pub opcode: u8,
    pub response: DfuResponse,
}

impl DfuIndication {
    pub fn encode(&self) -> [u8; 3] {
        [RESPONSE_OPCODE, self.opcode, self.response as u8]
    }
}

/// Parameters carried by `Initialize`: `image_size:4, crc16:2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ImageHeader {
    size: u32,
    crc16: u16,
}

#[derive(Debug)]
pub struct DfuService {
    state: DfuState,
    capacity: usize,
    header: Option<ImageHeader>,
    image: Vec<u8>,
    last_indication: Option<DfuIndication>,
}

impl DfuService {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: DfuState::Idle,
            capacity,
            header: None,
            image: Vec::new(),
            last_indication: None,
        }
    }

    pub fn state(&self) -> DfuState {
        self.state
    }

    pub fn bytes_received(&self) -> usize {
        self.image.len()
    }

    pub fn last_indication(&self) -> Option<DfuIndication> {
        self.last_indication
    }

    /// Handle a control point write and record the indication it produces.
    pub fn control(&mut self, packet: &DfuControl) -> DfuIndication {
        let response = match DfuCommand::from_u8(packet.command) {
            Some(DfuCommand::Start) => self.start(),
            Some(DfuCommand::Initialize) => self.initialize(&packet.params),
            Some(DfuCommand::ReceiveFirmware) => self.receive_firmware(),
            Some(DfuCommand::Validate) => self.validate(),
            Some(DfuCommand::ActivateAndReset) => self.activate(),
            None => {
                warn!(opcode = packet.command, "unsupported dfu command");
                DfuResponse::NotSupported
            }
        };
        self.indicate(packet.command, response)
    }

    /// Append firmware data. Only accepted while receiving.
    pub fn packet(&mut self, data: &[u8]) -> DfuIndication {
        let opcode = DfuCommand::ReceiveFirmware as u8;
        if self.state != DfuState::Receiving {
            return self.indicate(opcode, DfuResponse::InvalidState);
        }
        let limit = self
            .header
            .map(|h| h.size as usize)
            .unwrap_or(self.capacity)
            .min(self.capacity);
        if self.image.len() + data.len() > limit {
            warn!(received = self.image.len(), extra = data.len(), limit, "dfu image overflow");
            return self.indicate(opcode, DfuResponse::DataSizeExceeds);
        }
        self.image.extend_from_slice(data);
        self.indicate(opcode, DfuResponse::Success)
    }

    pub fn reset(&mut self) {
        self.state = DfuState::Idle;
        self.header = None;
        self.image.clear();
    }

    fn start(&mut self) -> DfuResponse {
        self.reset();
        self.state = DfuState::Ready;
        info!("dfu started");
        DfuResponse::Success
    }

    fn initialize(&mut self, params: &[u8]) -> DfuResponse {
        if self.state != DfuState::Ready {
            return DfuResponse::InvalidState;
        }
        let header = ImageHeader {
            size: LittleEndian::read_u32(&params[0..4]),
            crc16: LittleEndian::read_u16(&params[4..6]),
        };
        if header.size as usize > self.capacity {
            return DfuResponse::DataSizeExceeds;
        }
        info!(size = header.size, crc = header.crc16, "dfu initialized");
        self.header = Some(header);
        DfuResponse::Success
    }

    fn receive_firmware(&mut self) -> DfuResponse {
        if self.state != DfuState::Ready || self.header.is_none() {
            return DfuResponse::InvalidState;
        }
        self.image.clear();
        self.state = DfuState::Receiving;
        DfuResponse::Success
    }

    fn validate(&mut self) -> DfuResponse {
        let Some(header) = self.header else {
            return DfuResponse::InvalidState;
        };
        if self.state != DfuState::Receiving {
            return DfuResponse::InvalidState;
        }
        if self.image.len() != header.size as usize {
            warn!(received = self.image.len(), expected = header.size, "dfu image incomplete");
            return DfuResponse::OperationFailed;
        }
        let calculated = crc16_ccitt(&self.image);
        if calculated != header.crc16 {
            warn!(declared = header.crc16, calculated, "dfu image crc mismatch");
            self.reset();
            return DfuResponse::CrcError;
        }
        self.state = DfuState::Validated;
        info!(size = header.size, "dfu image validated");
        DfuResponse::Success
    }

    fn activate(&mut self) -> DfuResponse {
        if self.state != DfuState::Validated {
            return DfuResponse::InvalidState;
        }
        info!(size = self.image.len(), "dfu activation requested");
        self.reset();
        DfuResponse::Success
    }

    fn indicate(&mut self, opcode: u8, response: DfuResponse) -> DfuIndication {
        let indication = DfuIndication { opcode, response };
        self.last_indication = Some(indication);
        indication
    }
}
