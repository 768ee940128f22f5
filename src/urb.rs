//! Local requests submitted to a device session, in the shape the local USB
//! stack hands them over.

use std::sync::mpsc;

use crate::{
    proto::{
        Direction, SeqNum,
        setup::{Recipient, RequestType, SetupPacket},
    },
    status::{TransferFlags, UsbdStatus},
    transfer::DecodeError,
};

/// Transfer buffer of a request.
///
/// `data.len()` is the capacity provided by the caller, `length` the number
/// of bytes to transfer. After completion `length` holds the number of bytes
/// actually transferred.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferBuffer {
    pub data: Vec<u8>,
    pub length: u32,
}

impl TransferBuffer {
    /// Zeroed buffer for a read of `length` bytes
    pub fn for_read(length: u32) -> Self {
        Self {
            data: vec![0; length as usize],
            length,
        }
    }

    pub fn for_write(data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();

        Self {
            length: data.len() as u32,
            data,
        }
    }

    /// Bytes covered by `length`, or `None` if it exceeds the capacity
    pub fn active(&self) -> Option<&[u8]> {
        self.data.get(..self.length as usize)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlTransfer {
    /// Zero addresses the default pipe
    pub endpoint_address: u8,
    pub flags: TransferFlags,
    pub setup: SetupPacket,
    pub buffer: TransferBuffer,
    pub status: UsbdStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkOrInterruptTransfer {
    pub endpoint_address: u8,
    pub flags: TransferFlags,
    pub buffer: TransferBuffer,
    pub status: UsbdStatus,
}

/// One packet of an isochronous transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsoPacket {
    /// Offset of the packet in the transfer buffer
    pub offset: u32,
    /// Bytes transferred, filled in on completion
    pub length: u32,
    pub status: UsbdStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsochTransfer {
    pub endpoint_address: u8,
    pub flags: TransferFlags,
    pub start_frame: u32,
    pub error_count: u32,
    pub packets: Vec<IsoPacket>,
    pub buffer: TransferBuffer,
    pub status: UsbdStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorOrClassRequest {
    pub request_type: RequestType,
    pub recipient: Recipient,
    pub flags: TransferFlags,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub buffer: TransferBuffer,
    pub status: UsbdStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorRequest {
    pub recipient: Recipient,
    pub descriptor_type: u8,
    pub index: u8,
    /// Language of string descriptors, interface number for interface
    /// recipients
    pub language_id: u16,
    pub buffer: TransferBuffer,
    pub status: UsbdStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetStatusRequest {
    pub recipient: Recipient,
    pub index: u16,
    pub buffer: TransferBuffer,
    pub status: UsbdStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectConfiguration {
    /// `bConfigurationValue`, zero unconfigures the device
    pub configuration_value: u8,
    pub status: UsbdStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectInterface {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub status: UsbdStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetPipe {
    pub endpoint_address: u8,
    pub status: UsbdStatus,
}

/// A request that can be submitted to a device session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferRequest {
    Control(ControlTransfer),
    BulkOrInterrupt(BulkOrInterruptTransfer),
    Isoch(IsochTransfer),
    VendorOrClass(VendorOrClassRequest),
    GetDescriptor(DescriptorRequest),
    GetStatus(GetStatusRequest),
    SelectConfiguration(SelectConfiguration),
    SelectInterface(SelectInterface),
    ResetPipe(ResetPipe),
}

impl TransferRequest {
    pub fn status(&self) -> UsbdStatus {
        match self {
            Self::Control(r) => r.status,
            Self::BulkOrInterrupt(r) => r.status,
            Self::Isoch(r) => r.status,
            Self::VendorOrClass(r) => r.status,
            Self::GetDescriptor(r) => r.status,
            Self::GetStatus(r) => r.status,
            Self::SelectConfiguration(r) => r.status,
            Self::SelectInterface(r) => r.status,
            Self::ResetPipe(r) => r.status,
        }
    }

    pub fn set_status(&mut self, status: UsbdStatus) {
        let slot = match self {
            Self::Control(r) => &mut r.status,
            Self::BulkOrInterrupt(r) => &mut r.status,
            Self::Isoch(r) => &mut r.status,
            Self::VendorOrClass(r) => &mut r.status,
            Self::GetDescriptor(r) => &mut r.status,
            Self::GetStatus(r) => &mut r.status,
            Self::SelectConfiguration(r) => &mut r.status,
            Self::SelectInterface(r) => &mut r.status,
            Self::ResetPipe(r) => &mut r.status,
        };

        *slot = status;
    }

    pub fn is_isochronous(&self) -> bool {
        matches!(self, Self::Isoch(_))
    }

    /// Endpoint the data stage goes to. Everything but bulk, interrupt and
    /// isochronous transfers travels over a control pipe.
    pub fn endpoint_address(&self) -> u8 {
        match self {
            Self::Control(r) => r.endpoint_address,
            Self::BulkOrInterrupt(r) => r.endpoint_address,
            Self::Isoch(r) => r.endpoint_address,
            _ => 0,
        }
    }

    pub fn buffer(&self) -> Option<&TransferBuffer> {
        match self {
            Self::Control(r) => Some(&r.buffer),
            Self::BulkOrInterrupt(r) => Some(&r.buffer),
            Self::Isoch(r) => Some(&r.buffer),
            Self::VendorOrClass(r) => Some(&r.buffer),
            Self::GetDescriptor(r) => Some(&r.buffer),
            Self::GetStatus(r) => Some(&r.buffer),
            Self::SelectConfiguration(_) | Self::SelectInterface(_) | Self::ResetPipe(_) => None,
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Self::SelectConfiguration(_) => RequestKind::SelectConfig,
            Self::SelectInterface(_) => RequestKind::SelectInterface,
            Self::ResetPipe(_) => RequestKind::ResetPipe,
            _ => RequestKind::Urb,
        }
    }
}

/// What a tracked request stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::IntoStaticStr, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Urb,
    Unlink,
    SelectConfig,
    SelectInterface,
    ResetPipe,
}

/// Payload of a tracked request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackedRequest {
    Transfer(TransferRequest),
    /// Internally generated `CMD_UNLINK`
    Unlink { target: SeqNum },
}

impl TrackedRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Transfer(request) => request.kind(),
            Self::Unlink { .. } => RequestKind::Unlink,
        }
    }

    pub fn as_transfer(&self) -> Option<&TransferRequest> {
        match self {
            Self::Transfer(request) => Some(request),
            Self::Unlink { .. } => None,
        }
    }

    pub fn into_transfer(self) -> Option<TransferRequest> {
        match self {
            Self::Transfer(request) => Some(request),
            Self::Unlink { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("request was canceled")]
    Canceled,
    #[error("device is gone")]
    DeviceGone,
    #[error("reply carries {required} bytes, buffer holds {available}")]
    BufferTooSmall { required: u32, available: u32 },
    #[error("invalid reply ({0})")]
    InvalidParameter(#[from] DecodeError),
}

impl TransferError {
    /// Status left on a request that failed with this error
    pub const fn status(&self) -> UsbdStatus {
        match self {
            Self::Canceled => UsbdStatus::Canceled,
            Self::DeviceGone => UsbdStatus::DeviceGone,
            Self::BufferTooSmall { .. } | Self::InvalidParameter(_) => UsbdStatus::InvalidParameter,
        }
    }
}

/// A finished request handed back to its submitter
#[derive(Debug)]
pub struct Completed {
    pub seqnum: SeqNum,
    pub request: TrackedRequest,
    pub result: Result<(), TransferError>,
}

impl Completed {
    pub fn direction(&self) -> Direction {
        self.seqnum.direction()
    }

    pub fn into_transfer(self) -> Option<(TransferRequest, Result<(), TransferError>)> {
        Some((self.request.into_transfer()?, self.result))
    }
}

/// Callback invoked exactly once when a request leaves the session
pub struct Completion(Option<Box<dyn FnOnce(Completed) + Send>>);

impl Completion {
    pub fn new(f: impl FnOnce(Completed) + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    /// Completion that discards the result
    pub fn none() -> Self {
        Self(None)
    }

    pub(crate) fn deliver(self, completed: Completed) {
        if let Some(f) = self.0 {
            f(completed);
        }
    }
}

impl From<mpsc::Sender<Completed>> for Completion {
    fn from(tx: mpsc::Sender<Completed>) -> Self {
        Self::new(move |completed| {
            if tx.send(completed).is_err() {
                tracing::debug!("completion receiver dropped");
            }
        })
    }
}

impl core::fmt::Debug for Completion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(if self.0.is_some() {
            "Completion(..)"
        } else {
            "Completion(none)"
        })
    }
}
