//! Characteristic layer between the transport's attribute callbacks and the
//! services.
//!
//! Each characteristic is a small view over the service it exposes and
//! implements [`Characteristic`]. [`attr_read`] and [`attr_write`] translate
//! the transport's offset-based calls onto that trait. Writes are
//! acknowledged whenever the frame itself is well formed; application-level
//! outcomes are read back from the status characteristics.

use std::fmt;

use tracing::debug;

use crate::dfu::DfuService;
use crate::engine::Engine;
use crate::error::{AttError, WireError};
use crate::sprite::SpriteService;
use crate::wire::{decode_resource_request, DfuControl, ResourceUpload, DFU_PACKET_MAX};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Uuid {
    Short(u16),
    Long(u128),
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Short(v) => write!(f, "{v:#06x}"),
            Self::Long(v) => write!(
                f,
                "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
                (v >> 96) as u32,
                (v >> 80) as u16,
                (v >> 64) as u16,
                (v >> 48) as u16,
                v & 0xFFFF_FFFF_FFFF
            ),
        }
    }
}

const fn module_uuid(suffix: u16) -> Uuid {
    Uuid::Long(0x12345678_1234_5678_9abc_def012340000 | suffix as u128)
}

pub const MODULE_SERVICE_UUID: Uuid = module_uuid(0x5006);
pub const SPRITE_SERVICE_UUID: Uuid = Uuid::Short(0xFFF8);
pub const DFU_SERVICE_UUID: Uuid = Uuid::Short(0xFE59);

/// Characteristic property bits, as advertised in the declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Properties(u8);

impl Properties {
    pub const READ: Self = Self(0x02);
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);
    pub const INDICATE: Self = Self(0x20);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    fn writable(self) -> bool {
        self.0 & (Self::WRITE.0 | Self::WRITE_WITHOUT_RESPONSE.0) != 0
    }
}

pub trait Characteristic {
    fn uuid(&self) -> Uuid;

    fn properties(&self) -> Properties;

    fn read(&self) -> Result<Vec<u8>, AttError> {
        Err(AttError::ReadNotPermitted)
    }

    fn write(&mut self, _data: &[u8]) -> Result<(), AttError> {
        Err(AttError::WriteNotPermitted)
    }
}

/// Serve a (possibly long) read: copy the value from `offset` into `buf`.
pub fn attr_read<C: Characteristic + ?Sized>(
    c: &C,
    buf: &mut [u8],
    offset: usize,
) -> Result<usize, AttError> {
    if !c.properties().contains(Properties::READ) {
        return Err(AttError::ReadNotPermitted);
    }
    let value = c.read()?;
    if offset > value.len() {
        return Err(AttError::InvalidOffset);
    }
    let len = buf.len().min(value.len() - offset);
    buf[..len].copy_from_slice(&value[offset..offset + len]);
    Ok(len)
}

/// Deliver a write. Prepared (offset) writes are not supported.
pub fn attr_write<C: Characteristic + ?Sized>(
    c: &mut C,
    data: &[u8],
    offset: usize,
) -> Result<usize, AttError> {
    if !c.properties().writable() {
        return Err(AttError::WriteNotPermitted);
    }
    if offset != 0 {
        return Err(AttError::InvalidOffset);
    }
    c.write(data)?;
    Ok(data.len())
}

/// Undersized frames are a transport error; every other rejection was
/// already published by the engine.
fn frame_outcome(result: Result<(), WireError>) -> Result<(), AttError> {
    match result {
        Err(e @ WireError::TooShort { .. }) => Err(e.into()),
        _ => Ok(()),
    }
}

pub struct ModuleUpload<'a>(pub &'a mut Engine);

impl Characteristic for ModuleUpload<'_> {
    fn uuid(&self) -> Uuid {
        Attribute::ModuleUpload.uuid()
    }
    fn properties(&self) -> Properties {
        Properties::WRITE.union(Properties::WRITE_WITHOUT_RESPONSE)
    }
    fn write(&mut self, data: &[u8]) -> Result<(), AttError> {
        frame_outcome(self.0.handle_upload_frame(data))
    }
}

pub struct ModuleExecute<'a>(pub &'a mut Engine);

impl Characteristic for ModuleExecute<'_> {
    fn uuid(&self) -> Uuid {
        Attribute::ModuleExecute.uuid()
    }
    fn properties(&self) -> Properties {
        Properties::WRITE
    }
    fn write(&mut self, data: &[u8]) -> Result<(), AttError> {
        frame_outcome(self.0.handle_execute_frame(data))
    }
}

pub struct ModuleStatus<'a>(pub &'a Engine);

impl Characteristic for ModuleStatus<'_> {
    fn uuid(&self) -> Uuid {
        Attribute::ModuleStatus.uuid()
    }
    fn properties(&self) -> Properties {
        Properties::READ.union(Properties::NOTIFY)
    }
    fn read(&self) -> Result<Vec<u8>, AttError> {
        Ok(self.0.status_response().encode())
    }
}

pub struct ModuleResult<'a>(pub &'a Engine);

impl Characteristic for ModuleResult<'_> {
    fn uuid(&self) -> Uuid {
        Attribute::ModuleResult.uuid()
    }
    fn properties(&self) -> Properties {
        Properties::READ.union(Properties::NOTIFY)
    }
    fn read(&self) -> Result<Vec<u8>, AttError> {
        Ok(self.0.result_response().encode())
    }
}

pub struct SpriteUpload<'a>(pub &'a mut SpriteService);

impl Characteristic for SpriteUpload<'_> {
    fn uuid(&self) -> Uuid {
        Attribute::SpriteUpload.uuid()
    }
    fn properties(&self) -> Properties {
        Properties::WRITE
    }
    fn write(&mut self, data: &[u8]) -> Result<(), AttError> {
        let upload = ResourceUpload::decode(data)?;
        self.0.upload(&upload);
        Ok(())
    }
}

pub struct SpriteDownloadRequest<'a>(pub &'a mut SpriteService);

impl Characteristic for SpriteDownloadRequest<'_> {
    fn uuid(&self) -> Uuid {
        Attribute::SpriteDownloadRequest.uuid()
    }
    fn properties(&self) -> Properties {
        Properties::WRITE
    }
    fn write(&mut self, data: &[u8]) -> Result<(), AttError> {
        self.0.request_download(decode_resource_request(data)?);
        Ok(())
    }
}

pub struct SpriteDownloadResponse<'a>(pub &'a SpriteService);

impl Characteristic for SpriteDownloadResponse<'_> {
    fn uuid(&self) -> Uuid {
        Attribute::SpriteDownloadResponse.uuid()
    }
    fn properties(&self) -> Properties {
        Properties::READ.union(Properties::NOTIFY)
    }
    fn read(&self) -> Result<Vec<u8>, AttError> {
        Ok(self.0.download_response().encode())
    }
}

pub struct SpriteRegistryStatus<'a>(pub &'a SpriteService);

impl Characteristic for SpriteRegistryStatus<'_> {
    fn uuid(&self) -> Uuid {
        Attribute::SpriteRegistryStatus.uuid()
    }
    fn properties(&self) -> Properties {
        Properties::READ.union(Properties::NOTIFY)
    }
    fn read(&self) -> Result<Vec<u8>, AttError> {
        Ok(self.0.registry_status().encode())
    }
}

pub struct SpriteVerifyRequest<'a>(pub &'a mut SpriteService);

impl Characteristic for SpriteVerifyRequest<'_> {
    fn uuid(&self) -> Uuid {
        Attribute::SpriteVerifyRequest.uuid()
    }
    fn properties(&self) -> Properties {
        Properties::WRITE
    }
    fn write(&mut self, data: &[u8]) -> Result<(), AttError> {
        self.0.request_verify(decode_resource_request(data)?);
        Ok(())
    }
}

pub struct SpriteVerifyResponse<'a>(pub &'a SpriteService);

impl Characteristic for SpriteVerifyResponse<'_> {
    fn uuid(&self) -> Uuid {
        Attribute::SpriteVerifyResponse.uuid()
    }
    fn properties(&self) -> Properties {
        Properties::READ.union(Properties::NOTIFY)
    }
    fn read(&self) -> Result<Vec<u8>, AttError> {
        Ok(self.0.verify_response().encode())
    }
}

pub struct DfuControlPoint<'a>(pub &'a mut DfuService);

impl Characteristic for DfuControlPoint<'_> {
    fn uuid(&self) -> Uuid {
        Attribute::DfuControlPoint.uuid()
    }
    fn properties(&self) -> Properties {
        Properties::WRITE.union(Properties::INDICATE)
    }
    fn write(&mut self, data: &[u8]) -> Result<(), AttError> {
        let control = DfuControl::decode(data)?;
        self.0.control(&control);
        Ok(())
    }
}

pub struct DfuPacket<'a>(pub &'a mut DfuService);

impl Characteristic for DfuPacket<'_> {
    fn uuid(&self) -> Uuid {
        Attribute::DfuPacket.uuid()
    }
    fn properties(&self) -> Properties {
        Properties::WRITE_WITHOUT_RESPONSE
    }
    fn write(&mut self, data: &[u8]) -> Result<(), AttError> {
        if data.len() > DFU_PACKET_MAX {
            return Err(AttError::InvalidAttributeLen);
        }
        self.0.packet(data);
        Ok(())
    }
}

/// Every attribute the server exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    ModuleUpload,
    ModuleExecute,
    ModuleStatus,
    ModuleResult,
    SpriteUpload,
    SpriteDownloadRequest,
    SpriteDownloadResponse,
    SpriteRegistryStatus,
    SpriteVerifyRequest,
    SpriteVerifyResponse,
    DfuControlPoint,
    DfuPacket,
}

impl Attribute {
    pub const ALL: [Attribute; 12] = [
        Self::ModuleUpload,
        Self::ModuleExecute,
        Self::ModuleStatus,
        Self::ModuleResult,
        Self::SpriteUpload,
        Self::SpriteDownloadRequest,
        Self::SpriteDownloadResponse,
        Self::SpriteRegistryStatus,
        Self::SpriteVerifyRequest,
        Self::SpriteVerifyResponse,
        Self::DfuControlPoint,
        Self::DfuPacket,
    ];

    pub fn uuid(self) -> Uuid {
        match self {
            Self::ModuleUpload => module_uuid(0x5016),
            Self::ModuleExecute => module_uuid(0x5026),
            Self::ModuleStatus => module_uuid(0x5036),
            Self::ModuleResult => module_uuid(0x5046),
            Self::SpriteUpload => Uuid::Short(0xFFF9),
            Self::SpriteDownloadRequest => Uuid::Short(0xFFFA),
            Self::SpriteDownloadResponse => Uuid::Short(0xFFFB),
            Self::SpriteRegistryStatus => Uuid::Short(0xFFFC),
            Self::SpriteVerifyRequest => Uuid::Short(0xFFFD),
            Self::SpriteVerifyResponse => Uuid::Short(0xFFFE),
            Self::DfuControlPoint => Uuid::Short(0xFFD0),
            Self::DfuPacket => Uuid::Short(0xFFD1),
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.uuid() == uuid)
    }

    pub fn service(self) -> Uuid {
        match self {
            Self::ModuleUpload | Self::ModuleExecute | Self::ModuleStatus | Self::ModuleResult => {
                MODULE_SERVICE_UUID
            }
            Self::DfuControlPoint | Self::DfuPacket => DFU_SERVICE_UUID,
            _ => SPRITE_SERVICE_UUID,
        }
    }
}

/// Owns the services and routes attribute accesses to them.
pub struct GattServer {
    engine: Engine,
    sprites: SpriteService,
    dfu: DfuService,
}

impl GattServer {
    pub fn new(engine: Engine, sprites: SpriteService, dfu: DfuService) -> Self {
        Self {
            engine,
            sprites,
            dfu,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    pub fn sprites(&self) -> &SpriteService {
        &self.sprites
    }

    pub fn sprites_mut(&mut self) -> &mut SpriteService {
        &mut self.sprites
    }

    pub fn dfu(&self) -> &DfuService {
        &self.dfu
    }

    pub fn on_mtu_changed(&mut self, mtu: u16) {
        self.engine.set_negotiated_mtu(mtu);
    }

    /// On connection loss the update service drops any partial image.
    pub fn on_disconnected(&mut self) {
        self.dfu.reset();
        debug!("link disconnected");
    }

    pub fn write(
        &mut self,
        attribute: Attribute,
        data: &[u8],
        offset: usize,
    ) -> Result<usize, AttError> {
        let result = match attribute {
            Attribute::ModuleUpload => attr_write(&mut ModuleUpload(&mut self.engine), data, offset),
            Attribute::ModuleExecute => {
                attr_write(&mut ModuleExecute(&mut self.engine), data, offset)
            }
            Attribute::ModuleStatus => attr_write(&mut ModuleStatus(&self.engine), data, offset),
            Attribute::ModuleResult => attr_write(&mut ModuleResult(&self.engine), data, offset),
            Attribute::SpriteUpload => {
                attr_write(&mut SpriteUpload(&mut self.sprites), data, offset)
            }
            Attribute::SpriteDownloadRequest => {
                attr_write(&mut SpriteDownloadRequest(&mut self.sprites), data, offset)
            }
            Attribute::SpriteDownloadResponse => {
                attr_write(&mut SpriteDownloadResponse(&self.sprites), data, offset)
            }
            Attribute::SpriteRegistryStatus => {
                attr_write(&mut SpriteRegistryStatus(&self.sprites), data, offset)
            }
            Attribute::SpriteVerifyRequest => {
                attr_write(&mut SpriteVerifyRequest(&mut self.sprites), data, offset)
            }
            Attribute::SpriteVerifyResponse => {
                attr_write(&mut SpriteVerifyResponse(&self.sprites), data, offset)
            }
            Attribute::DfuControlPoint => {
                attr_write(&mut DfuControlPoint(&mut self.dfu), data, offset)
            }
            Attribute::DfuPacket => attr_write(&mut DfuPacket(&mut self.dfu), data, offset),
        };
        if let Err(e) = result {
            debug!(attribute = ?attribute, len = data.len(), error = %e, "write refused");
        }
        result
    }

    pub fn read(
        &self,
        attribute: Attribute,
        buf: &mut [u8],
        offset: usize,
    ) -> Result<usize, AttError> {
        match attribute {
            Attribute::ModuleStatus => attr_read(&ModuleStatus(&self.engine), buf, offset),
            Attribute::ModuleResult => attr_read(&ModuleResult(&self.engine), buf, offset),
            Attribute::SpriteDownloadResponse => {
                attr_read(&SpriteDownloadResponse(&self.sprites), buf, offset)
            }
            Attribute::SpriteRegistryStatus => {
                attr_read(&SpriteRegistryStatus(&self.sprites), buf, offset)
            }
            Attribute::SpriteVerifyResponse => {
                attr_read(&SpriteVerifyResponse(&self.sprites), buf, offset)
            }
            Attribute::ModuleUpload
            | Attribute::ModuleExecute
            | Attribute::SpriteUpload
            | Attribute::SpriteDownloadRequest
            | Attribute::SpriteVerifyRequest
            | Attribute::DfuControlPoint
            | Attribute::DfuPacket => Err(AttError::ReadNotPermitted),
        }
    }

    /// Read the full value of `attribute` into a fresh buffer.
    pub fn read_value(&self, attribute: Attribute) -> Result<Vec<u8>, AttError> {
        let mut buf = [0u8; 64];
        let len = self.read(attribute, &mut buf, 0)?;
        Ok(buf[..len].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::EngineConfig;
    use crate::queue::{work_queue, WorkReceiver};
    use crate::registry::RESOURCE_SIZE;
    use crate::session::SessionState;
    use crate::sprite::SpriteStatus;
    use crate::status::StatusStore;
    use crate::wire::{
        DownloadResponse, RegistryStatusFrame, StatusResponse, UploadCommand, UploadPacket,
    };

    fn server() -> (GattServer, WorkReceiver) {
        let (tx, rx) = work_queue(4);
        let config = EngineConfig::default();
        let mut engine = Engine::new(&config, tx, Arc::new(StatusStore::new()));
        engine.set_negotiated_mtu(247);
        (
            GattServer::new(engine, SpriteService::new(8), DfuService::new(256)),
            rx,
        )
    }

    #[test]
    fn test_uuid_display() {
        assert_eq!(
            MODULE_SERVICE_UUID.to_string(),
            "12345678-1234-5678-9abc-def012345006"
        );
        assert_eq!(
            module_uuid(0x5046).to_string(),
            "12345678-1234-5678-9abc-def012345046"
        );
        assert_eq!(Uuid::Short(0xFE59).to_string(), "0xfe59");
    }

    #[test]
    fn test_attr_read_honours_offset() {
        let (server, _rx) = server();
        let mut buf = [0u8; 64];
        let len = server.read(Attribute::ModuleStatus, &mut buf, 0).unwrap();
        assert_eq!(len, 18);

        let mut small = [0u8; 4];
        assert_eq!(server.read(Attribute::ModuleStatus, &mut small, 16), Ok(2));
        assert_eq!(server.read(Attribute::ModuleStatus, &mut small, 18), Ok(0));
        assert_eq!(
            server.read(Attribute::ModuleStatus, &mut small, 19),
            Err(AttError::InvalidOffset)
        );
    }

    #[test]
    fn test_permissions() {
        let (mut server, _rx) = server();
        assert_eq!(
            server.write(Attribute::ModuleStatus, &[0], 0),
            Err(AttError::WriteNotPermitted)
        );
        assert_eq!(
            server.read(Attribute::ModuleUpload, &mut [0u8; 8], 0),
            Err(AttError::ReadNotPermitted)
        );
        let start = UploadPacket::control(UploadCommand::Reset).encode();
        assert_eq!(
            server.write(Attribute::ModuleUpload, &start, 1),
            Err(AttError::InvalidOffset)
        );
    }

    #[test]
    fn test_upload_write_acknowledges_application_errors() {
        let (mut server, _rx) = server();
        // Oversized Start is an application error: acknowledged, reported.
        let frame = UploadPacket {
            command: UploadCommand::Start,
            sequence: 0,
            total_size: 1 << 20,
            data: &[],
        }
        .encode();
        assert_eq!(server.write(Attribute::ModuleUpload, &frame, 0), Ok(8));

        let status = StatusResponse::decode(&server.read_value(Attribute::ModuleStatus).unwrap())
            .unwrap();
        assert_eq!(status.state, SessionState::Idle);
        assert_eq!(status.error_code, crate::error::ErrorCode::Overflow);

        // An undersized frame is a transport error.
        assert_eq!(
            server.write(Attribute::ModuleUpload, &[0x01, 0x00], 0),
            Err(AttError::InvalidAttributeLen)
        );
    }

    #[test]
    fn test_sprite_round_trip_through_attributes() {
        let (mut server, _rx) = server();
        let upload = ResourceUpload::new(4, [0xA5; RESOURCE_SIZE]);
        assert_eq!(
            server.write(Attribute::SpriteUpload, &upload.encode(), 0),
            Ok(36)
        );
        server
            .write(Attribute::SpriteDownloadRequest, &4u16.to_le_bytes(), 0)
            .unwrap();
        let response =
            DownloadResponse::decode(&server.read_value(Attribute::SpriteDownloadResponse).unwrap())
                .unwrap();
        assert_eq!(response.status, SpriteStatus::Success);
        assert_eq!(response.payload, upload.payload);

        let status = RegistryStatusFrame::decode(
            &server.read_value(Attribute::SpriteRegistryStatus).unwrap(),
        )
        .unwrap();
        assert_eq!(status.total, 1);
        assert_eq!(status.free, 7);
    }

    #[test]
    fn test_dfu_packet_length_limit() {
        let (mut server, _rx) = server();
        assert_eq!(
            server.write(Attribute::DfuPacket, &[0u8; 21], 0),
            Err(AttError::InvalidAttributeLen)
        );
        server.write(Attribute::DfuControlPoint, &[0x01], 0).unwrap();
        assert_eq!(
            server.dfu().last_indication().unwrap().encode(),
            [0x60, 0x01, 0x01]
        );
    }

    #[test]
    fn test_attribute_lookup() {
        let (server, _rx) = server();
        assert_eq!(
            Attribute::from_uuid(module_uuid(0x5026)),
            Some(Attribute::ModuleExecute)
        );
        assert_eq!(
            Attribute::from_uuid(Uuid::Short(0xFFFE)),
            Some(Attribute::SpriteVerifyResponse)
        );
        assert_eq!(Attribute::from_uuid(Uuid::Short(0x1234)), None);
        assert_eq!(ModuleStatus(server.engine()).uuid(), Attribute::ModuleStatus.uuid());
        assert_eq!(Attribute::DfuPacket.service(), DFU_SERVICE_UUID);
    }
}
