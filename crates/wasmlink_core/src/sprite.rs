//! Sprite service: the resource registry plus the bookkeeping the client
//! reads back (last id, last operation, CRC error count).
//!
//! Download and verify are two-step: the client writes an id to the request
//! characteristic, then reads the matching response characteristic.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::RegistryError;
use crate::registry::{
    ResourceRegistry, StoreOutcome, Verification, VerifyOutcome, INVALID_ID, RESOURCE_SIZE,
};
use crate::wire::{DownloadResponse, RegistryStatusFrame, ResourceUpload, VerifyResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum SpriteStatus {
    #[default]
    Success = 0,
    NotFound = 1,
    CrcError = 2,
    RegistryFull = 3,
    InvalidId = 4,
    InvalidData = 5,
}

impl SpriteStatus {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Success,
            1 => Self::NotFound,
            2 => Self::CrcError,
            3 => Self::RegistryFull,
            4 => Self::InvalidId,
            _ => Self::InvalidData,
        }
    }
}

impl From<RegistryError> for SpriteStatus {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::CrcMismatch { .. } => Self::CrcError,
            RegistryError::RegistryFull => Self::RegistryFull,
            RegistryError::InvalidId(_) => Self::InvalidId,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum RegistryStatus {
    #[default]
    Ready = 0,
    Busy = 1,
    Error = 2,
    Full = 3,
}

impl RegistryStatus {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Ready,
            1 => Self::Busy,
            3 => Self::Full,
            _ => Self::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum SpriteOperation {
    #[default]
    None = 0,
    Upload = 1,
    Download = 2,
    Verify = 3,
    Status = 4,
}

impl SpriteOperation {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Upload,
            2 => Self::Download,
            3 => Self::Verify,
            4 => Self::Status,
            _ => Self::None,
        }
    }
}

#[derive(Debug)]
pub struct SpriteService {
    registry: ResourceRegistry,
    crc_errors: u16,
    status: RegistryStatus,
    last_operation: SpriteOperation,
    last_id: u16,
    last_upload: SpriteStatus,
}

impl SpriteService {
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: ResourceRegistry::new(capacity),
            crc_errors: 0,
            status: RegistryStatus::Ready,
            last_operation: SpriteOperation::None,
            last_id: INVALID_ID,
            last_upload: SpriteStatus::Success,
        }
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ResourceRegistry {
        &mut self.registry
    }

    pub fn crc_errors(&self) -> u16 {
        self.crc_errors
    }

    pub fn last_id(&self) -> u16 {
        self.last_id
    }

    pub fn last_operation(&self) -> SpriteOperation {
        self.last_operation
    }

    /// Outcome of the most recent upload.
    pub fn last_upload(&self) -> SpriteStatus {
        self.last_upload
    }

    pub fn upload(&mut self, upload: &ResourceUpload) -> SpriteStatus {
        self.last_operation = SpriteOperation::Upload;
        self.status = RegistryStatus::Busy;

        let status = match self.registry.store(upload.id, &upload.payload, upload.crc16) {
            Ok(outcome) => {
                let slot = match outcome {
                    StoreOutcome::Inserted { slot } | StoreOutcome::Updated { slot } => slot,
                };
                self.last_id = upload.id;
                self.status = RegistryStatus::Ready;
                info!(id = upload.id, slot, crc = upload.crc16, "sprite stored");
                SpriteStatus::Success
            }
            Err(e) => {
                self.status = match e {
                    RegistryError::RegistryFull => RegistryStatus::Full,
                    _ => RegistryStatus::Error,
                };
                if matches!(e, RegistryError::CrcMismatch { .. }) {
                    self.crc_errors = self.crc_errors.saturating_add(1);
                }
                warn!(id = upload.id, error = %e, "sprite rejected");
                SpriteStatus::from(e)
            }
        };
        self.last_upload = status;
        status
    }

    /// First half of a download: remember which id the client wants.
    pub fn request_download(&mut self, id: u16) {
        self.last_operation = SpriteOperation::Download;
        self.last_id = id;
    }

    pub fn download_response(&self) -> DownloadResponse {
        let id = self.last_id;
        if id == INVALID_ID {
            return DownloadResponse {
                id,
                payload: [0; RESOURCE_SIZE],
                crc16: 0,
                status: SpriteStatus::InvalidId,
            };
        }
        match self.registry.fetch(id) {
            Some(entry) => DownloadResponse {
                id,
                payload: entry.payload,
                crc16: entry.crc16,
                status: SpriteStatus::Success,
            },
            None => DownloadResponse {
                id,
                payload: [0; RESOURCE_SIZE],
                crc16: 0,
                status: SpriteStatus::NotFound,
            },
        }
    }

    pub fn request_verify(&mut self, id: u16) {
        self.last_operation = SpriteOperation::Verify;
        self.last_id = id;
    }

    pub fn verify_response(&self) -> VerifyResponse {
        if self.last_id == INVALID_ID {
            return VerifyResponse(Verification {
                id: INVALID_ID,
                stored_crc16: 0,
                calculated_crc16: 0,
                outcome: VerifyOutcome::Error,
            });
        }
        VerifyResponse(self.registry.verify(self.last_id))
    }

    pub fn registry_status(&self) -> RegistryStatusFrame {
        RegistryStatusFrame {
            total: self.registry.len() as u16,
            free: self.registry.free_slots() as u16,
            last_id: self.last_id,
            registry_status: self.status,
            last_operation: self.last_operation,
            crc_errors: self.crc_errors,
        }
    }

    pub fn clear_all(&mut self) {
        self.registry.clear_all();
        self.last_id = INVALID_ID;
        self.status = RegistryStatus::Ready;
        info!("sprite registry cleared");
    }
}
