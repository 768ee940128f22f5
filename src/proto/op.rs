//! Operations handled by the user-space daemon before the connection is
//! switched over to transfer PDUs. Only `OP_REQ_IMPORT` is needed to turn a
//! socket into a device session.

use endian_codec::{DecodeBE, EncodeBE, PackedSize};

use crate::proto::char_buf::CharBuf;

pub const USBIP_VERSION: u16 = 0x0111;

pub const SYSFS_PATH_MAX: usize = 256;
pub const SYSFS_BUS_ID_SIZE: usize = 32;

const OP_REQUEST: u16 = 0x8000;
const OP_REPLY: u16 = 0x0000;

// implicitly packed due to layout, so we can avoid using `#[repr(packed)]`
#[derive(Debug, Clone, PackedSize, EncodeBE, DecodeBE)]
#[repr(C)]
pub struct OperationHeader {
    pub version: u16,
    pub code: u16,
    pub status: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u16)]
pub enum OperationKind {
    /// Dummy code, sent by some servers in error replies
    Unspecified = 0x00,
    /// Import a remote USB device
    Import = 0x03,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u32)]
pub enum OperationStatus {
    Ok = 0x00,
    Failure = 0x01,
    DeviceBusy = 0x02,
    DeviceError = 0x03,
    NoSuchDevice = 0x04,
    Error = 0x05,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("request failed")]
    RequestFailed,
    #[error("device is already exported")]
    DeviceBusy,
    #[error("device is in error state")]
    DeviceError,
    #[error("device does not exist on the server")]
    NoSuchDevice,
    #[error("version in header did not match expected")]
    VersionMismatch,
    #[error("reply header carried a request code")]
    DirectionMismatch,
    #[error("reply was for a different operation")]
    InvalidData,
    #[error("some other error occurred")]
    Other,
}

impl OperationHeader {
    pub fn request(kind: OperationKind) -> Self {
        Self {
            version: USBIP_VERSION,
            code: OP_REQUEST | kind as u16,
            status: OperationStatus::Ok as u32,
        }
    }

    /// Checks a reply header against the operation that was requested
    pub fn check_reply(&self, kind: OperationKind) -> Result<(), OperationError> {
        if self.version != USBIP_VERSION {
            return Err(OperationError::VersionMismatch);
        }

        if self.code & OP_REQUEST != OP_REPLY {
            return Err(OperationError::DirectionMismatch);
        }

        match OperationKind::try_from(self.code & !OP_REQUEST) {
            Ok(OperationKind::Unspecified) => {}
            Ok(k) if k == kind => {}
            _ => return Err(OperationError::InvalidData),
        }

        match OperationStatus::try_from(self.status).unwrap_or(OperationStatus::Error) {
            OperationStatus::Ok => Ok(()),
            OperationStatus::Failure => Err(OperationError::RequestFailed),
            OperationStatus::DeviceBusy => Err(OperationError::DeviceBusy),
            OperationStatus::DeviceError => Err(OperationError::DeviceError),
            OperationStatus::NoSuchDevice => Err(OperationError::NoSuchDevice),
            OperationStatus::Error => Err(OperationError::Other),
        }
    }
}

#[derive(Debug, Clone, PackedSize, EncodeBE, DecodeBE)]
#[repr(C)]
pub struct ImportRequest {
    pub bus_id: CharBuf<SYSFS_BUS_ID_SIZE>,
}

#[derive(Debug, Clone, PackedSize, EncodeBE, DecodeBE)]
#[repr(C)]
pub struct ImportReply {
    pub usb_device: RawUsbDeviceInfo,
}

#[derive(Debug, Clone, PackedSize, EncodeBE, DecodeBE)]
#[repr(C)]
pub struct RawUsbDeviceInfo {
    pub path: CharBuf<SYSFS_PATH_MAX>,
    pub bus_id: CharBuf<SYSFS_BUS_ID_SIZE>,

    pub bus_num: u32,
    pub dev_num: u32,
    pub speed: u32,

    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,

    pub b_device_class: u8,
    pub b_device_sub_class: u8,
    pub b_device_protocol: u8,
    pub b_configuration_value: u8,
    pub b_num_configurations: u8,
    pub b_num_interfaces: u8,
}
