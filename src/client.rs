//! Import handshake: asks a USB/IP server for one of its exported devices and
//! turns the connection into a [`DeviceSession`].

use std::{fmt, io, str::FromStr};

use compact_str::CompactString;

use crate::{
    UsbDeviceInfo, UsbDeviceInfoValidationError,
    net::{Transport, UsbIpSocket},
    proto::{
        char_buf::CharBuf,
        op::{ImportReply, ImportRequest, OperationError, OperationHeader, OperationKind, SYSFS_BUS_ID_SIZE},
    },
    session::{
        DeviceMetadata, DeviceSession, SessionConfig,
        state::TransitionError,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Network connection failed ({0})")]
    NetworkIo(io::Error),

    #[error("Invalid device location {0:?} (expected usbip://host[:port]/busid)")]
    InvalidLocation(String),
    #[error("Provided bus ID is too long (max size is {SYSFS_BUS_ID_SIZE} bytes)")]
    BusIdTooLong,
    #[error("Bus ID returned by the server did not match the one that was sent")]
    BusIdMismatch,

    #[error("Failed to parse PDU: {0}")]
    Protocol(#[from] UsbDeviceInfoValidationError),
    #[error("usbip network operation failed ({0})")]
    Operation(#[from] OperationError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// `usbip://host[:port]/busid`
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DeviceLocation {
    pub host: CompactString,
    pub port: u16,
    pub bus_id: CompactString,
}

impl DeviceLocation {
    pub fn new(host: &str, port: u16, bus_id: &str) -> Self {
        Self {
            host: host.into(),
            port,
            bus_id: bus_id.into(),
        }
    }
}

impl FromStr for DeviceLocation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidLocation(s.into());

        let (host, port, bus_id) = match sscanf::sscanf!(s, "usbip://{str}:{u16}/{str}") {
            Ok(parsed) => parsed,
            Err(_) => {
                let (host, bus_id) =
                    sscanf::sscanf!(s, "usbip://{str}/{str}").map_err(|_| invalid())?;

                (host, UsbIpSocket::DEFAULT_PORT, bus_id)
            }
        };

        if host.contains([':', '/']) || bus_id.contains('/') {
            return Err(invalid());
        }

        Ok(Self::new(host, port, bus_id))
    }
}

impl fmt::Display for DeviceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "usbip://{}:{}/{}", self.host, self.port, self.bus_id)
    }
}

/// Runs `OP_REQ_IMPORT` for `bus_id`. On success the connection carries
/// transfer PDUs from here on.
pub fn import_device<T: Transport>(transport: &T, bus_id: &str) -> Result<UsbDeviceInfo, Error> {
    let op_kind = OperationKind::Import;

    let request = ImportRequest {
        bus_id: CharBuf::new(bus_id).ok_or(Error::BusIdTooLong)?,
    };

    transport
        .send_encoded(&OperationHeader::request(op_kind))
        .map_err(Error::NetworkIo)?;
    transport.send_encoded(&request).map_err(Error::NetworkIo)?;

    transport
        .recv_encoded::<OperationHeader>()
        .map_err(Error::NetworkIo)?
        .check_reply(op_kind)?;

    let reply = transport
        .recv_encoded::<ImportReply>()
        .map_err(Error::NetworkIo)?;

    if reply.usb_device.bus_id.to_str() != Some(bus_id) {
        return Err(Error::BusIdMismatch);
    }

    tracing::debug!(?reply);

    Ok(reply.usb_device.try_into()?)
}

/// Connects, imports the device and returns a session ready for submits
pub fn attach(
    location: &DeviceLocation,
    config: SessionConfig,
) -> Result<(UsbDeviceInfo, DeviceSession<UsbIpSocket>), Error> {
    let socket = UsbIpSocket::connect_host_and_port(&location.host, location.port)
        .map_err(Error::NetworkIo)?;

    let device = import_device(&socket, &location.bus_id)?;

    tracing::info!(%location, devid = device.devid(), speed = %device.speed, "device imported");

    let session = DeviceSession::new(socket, DeviceMetadata::from(&device), config);

    session.begin_connect()?;
    session.connected()?;

    Ok((device, session))
}
