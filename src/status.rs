//! Translation between the completion codes and transfer flags of the local
//! USB stack and the Linux values carried in USB/IP PDUs.

use core::fmt;

/// Completion code of a local request
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    strum::EnumIter,
    strum::IntoStaticStr,
    strum::Display,
    serde::Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum UsbdStatus {
    #[default]
    Success,
    Pending,
    Canceled,
    /// The endpoint returned a STALL handshake
    StallPid,
    EndpointHalted,
    /// Short packet on a transfer that did not allow short transfers
    ErrorShortTransfer,
    Timeout,
    DevNotResponding,
    BabbleDetected,
    DeviceGone,
    Crc,
    DataOverrun,
    DataUnderrun,
    InsufficientResources,
    BtStuff,
    InternalHcError,
    HubInternalError,
    NoBandwidth,
    IsochRequestFailed,
    IsoTdError,
    ErrorBusy,
    InvalidPipeHandle,
    InvalidParameter,
    InvalidUrbFunction,
}

impl UsbdStatus {
    pub const fn is_error(self) -> bool {
        !matches!(self, Self::Success | Self::Pending)
    }
}

/// Linux errno values that appear in `status` fields
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive,
)]
#[repr(i32)]
pub enum Errno {
    ENOENT = 2,
    ENXIO = 6,
    ENOMEM = 12,
    EBUSY = 16,
    EXDEV = 18,
    ENODEV = 19,
    EINVAL = 22,
    ENOSPC = 28,
    EPIPE = 32,
    ETIME = 62,
    ENOSR = 63,
    ECOMM = 70,
    EPROTO = 71,
    EOVERFLOW = 75,
    EILSEQ = 84,
    ECONNRESET = 104,
    ESHUTDOWN = 108,
    ETIMEDOUT = 110,
    EHOSTUNREACH = 113,
    EINPROGRESS = 115,
    EREMOTEIO = 121,
}

/// `status` field of a reply: zero or a negated errno
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct WireStatus(i32);

impl WireStatus {
    pub const SUCCESS: Self = Self(0);

    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn from_errno(errno: Errno) -> Self {
        Self(-(errno as i32))
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Some servers send positive codes, so the sign is ignored
    pub fn errno(self) -> Option<Errno> {
        Errno::try_from(self.0.checked_abs()?).ok()
    }

    pub const fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for WireStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errno() {
            Some(errno) => write!(f, "-{errno:?}"),
            None => write!(f, "{}", self.0),
        }
    }
}

/// Maps a local completion code to the status a server would report.
///
/// Codes without a dedicated errno map to `-EINVAL`, non-error codes other
/// than [`UsbdStatus::Pending`] to zero.
pub fn wire_status_from_local(status: UsbdStatus, is_isochronous: bool) -> WireStatus {
    use UsbdStatus::*;

    let errno = match status {
        Success => return WireStatus::SUCCESS,
        Pending => Errno::EINPROGRESS,
        StallPid | EndpointHalted => Errno::EPIPE,
        ErrorShortTransfer => Errno::EREMOTEIO,
        Timeout => Errno::ETIMEDOUT,
        Canceled => Errno::ECONNRESET,
        BabbleDetected => Errno::EOVERFLOW,
        DeviceGone => Errno::ENODEV,
        Crc => Errno::EILSEQ,
        DataOverrun => Errno::ECOMM,
        DataUnderrun => Errno::ENOSR,
        InsufficientResources => Errno::ENOMEM,
        BtStuff | InternalHcError | HubInternalError | DevNotResponding => Errno::EPROTO,
        NoBandwidth => Errno::ENOSPC,
        IsochRequestFailed => Errno::EXDEV,
        IsoTdError if is_isochronous => Errno::EXDEV,
        IsoTdError => Errno::EPROTO,
        ErrorBusy => Errno::EBUSY,
        InvalidPipeHandle => Errno::ENOENT,
        InvalidParameter | InvalidUrbFunction => Errno::EINVAL,
    };

    WireStatus::from_errno(errno)
}

/// Maps a reply status to a local completion code, for requests that are
/// not isochronous
pub fn local_status_from_wire(status: WireStatus) -> UsbdStatus {
    local_status_from_wire_ex(status, false)
}

/// `-EXDEV` means a failed isochronous packet when reported per packet and
/// a failed request otherwise
pub fn local_status_from_wire_ex(status: WireStatus, is_isochronous: bool) -> UsbdStatus {
    if status.is_success() {
        return UsbdStatus::Success;
    }

    let Some(errno) = status.errno() else {
        return UsbdStatus::InvalidParameter;
    };

    match errno {
        Errno::EPIPE => UsbdStatus::StallPid,
        Errno::EREMOTEIO => UsbdStatus::ErrorShortTransfer,
        Errno::ETIME => UsbdStatus::DevNotResponding,
        Errno::ETIMEDOUT => UsbdStatus::Timeout,
        Errno::ENOENT | Errno::ECONNRESET => UsbdStatus::Canceled,
        Errno::EOVERFLOW => UsbdStatus::BabbleDetected,
        Errno::ENODEV | Errno::ESHUTDOWN | Errno::EHOSTUNREACH => UsbdStatus::DeviceGone,
        Errno::EILSEQ => UsbdStatus::Crc,
        Errno::ECOMM => UsbdStatus::DataOverrun,
        Errno::ENOSR => UsbdStatus::DataUnderrun,
        Errno::ENOMEM => UsbdStatus::InsufficientResources,
        Errno::EPROTO => UsbdStatus::BtStuff,
        Errno::ENOSPC => UsbdStatus::NoBandwidth,
        Errno::EXDEV if is_isochronous => UsbdStatus::IsoTdError,
        Errno::EXDEV => UsbdStatus::IsochRequestFailed,
        Errno::ENXIO => UsbdStatus::InternalHcError,
        Errno::EBUSY => UsbdStatus::ErrorBusy,
        Errno::EINVAL | Errno::EINPROGRESS => UsbdStatus::InvalidParameter,
    }
}

bitflags::bitflags! {
    /// Transfer flags of a local request
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct TransferFlags: u32 {
        const DIRECTION_IN = 0x01;
        const SHORT_TRANSFER_OK = 0x02;
        const START_ISO_TRANSFER_ASAP = 0x04;
        const DEFAULT_PIPE_TRANSFER = 0x08;
    }
}

bitflags::bitflags! {
    /// `transfer_flags` of `CMD_SUBMIT` (Linux `URB_*` flags)
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct WireFlags: u32 {
        const SHORT_NOT_OK = 0x0001;
        const ISO_ASAP = 0x0002;
        const ZERO_PACKET = 0x0040;
        const NO_INTERRUPT = 0x0080;
        const DIR_IN = 0x0200;
    }
}

/// Flags for an outgoing submit. A read that did not allow short transfers
/// gets `URB_SHORT_NOT_OK`; the stub derives the direction itself.
pub fn wire_flags_from_local(flags: TransferFlags, dir_in: bool) -> WireFlags {
    let mut wire = WireFlags::empty();

    if flags.contains(TransferFlags::START_ISO_TRANSFER_ASAP) {
        wire |= WireFlags::ISO_ASAP;
    } else if dir_in && !flags.contains(TransferFlags::SHORT_TRANSFER_OK) {
        wire |= WireFlags::SHORT_NOT_OK;
    }

    wire
}

pub fn local_flags_from_wire(wire: WireFlags, dir_in: bool) -> TransferFlags {
    let mut flags = TransferFlags::empty();

    if dir_in {
        flags |= TransferFlags::DIRECTION_IN;

        if !wire.contains(WireFlags::SHORT_NOT_OK) {
            flags |= TransferFlags::SHORT_TRANSFER_OK;
        }
    }

    if wire.contains(WireFlags::ISO_ASAP) {
        flags |= TransferFlags::START_ISO_TRANSFER_ASAP;
    }

    flags
}
