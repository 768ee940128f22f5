//! The small part of the USB descriptor hierarchy the transfer encoders need:
//! pipe type and polling interval per endpoint address.

use std::collections::BTreeMap;

use crate::proto::Direction;

pub const DEVICE: u8 = 0x01;
pub const CONFIGURATION: u8 = 0x02;
pub const STRING: u8 = 0x03;
pub const INTERFACE: u8 = 0x04;
pub const ENDPOINT: u8 = 0x05;
pub const DEVICE_QUALIFIER: u8 = 0x06;
pub const OTHER_SPEED_CONFIGURATION: u8 = 0x07;
pub const BOS: u8 = 0x0F;

/// `wMaxPacketSize` of the default pipe until the device descriptor says
/// otherwise
pub const DEFAULT_MAX_PACKET_SIZE: u16 = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("descriptor at offset {offset} runs past the end of the buffer")]
    Truncated { offset: usize },
    #[error("descriptor at offset {offset} has invalid bLength {length}")]
    InvalidLength { offset: usize, length: u8 },
    #[error("expected descriptor type {expected:#04x}, got {actual:#04x}")]
    UnexpectedType { expected: u8, actual: u8 },
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    num_enum::TryFromPrimitive,
    strum::Display,
    serde::Serialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PipeType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl PipeType {
    /// Transfer type from the low bits of `bmAttributes`
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => Self::Control,
            1 => Self::Isochronous,
            2 => Self::Bulk,
            _ => Self::Interrupt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct EndpointInfo {
    /// `bEndpointAddress`, direction bit included
    pub address: u8,
    pub pipe_type: PipeType,
    pub max_packet_size: u16,
    /// `bInterval`
    pub interval: u8,
}

impl EndpointInfo {
    pub const fn default_pipe(max_packet_size: u16) -> Self {
        Self {
            address: 0,
            pipe_type: PipeType::Control,
            max_packet_size,
            interval: 0,
        }
    }

    pub const fn number(&self) -> u8 {
        self.address & 0x0F
    }

    pub const fn direction(&self) -> Direction {
        Direction::from_address(self.address)
    }
}

/// Endpoint lookup used while encoding requests
pub trait DescriptorStore: Send + Sync {
    /// Returns `None` for addresses the active configuration does not define
    fn endpoint(&self, address: u8) -> Option<EndpointInfo>;
}

/// Endpoints of the active configuration keyed by address. Endpoint zero is
/// always present and always a control pipe.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct EndpointMap {
    default_pipe: EndpointInfo,
    endpoints: BTreeMap<u8, EndpointInfo>,
}

impl Default for EndpointMap {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointMap {
    pub fn new() -> Self {
        Self {
            default_pipe: EndpointInfo::default_pipe(DEFAULT_MAX_PACKET_SIZE),
            endpoints: BTreeMap::new(),
        }
    }

    /// Collects the endpoints of every interface and alternate setting of a
    /// full configuration descriptor. An address reused by a later
    /// alternate setting keeps its first definition; switch with
    /// [`EndpointMap::select_alternate_setting`] once the device accepted a
    /// SET_INTERFACE.
    pub fn from_configuration_descriptor(bytes: &[u8]) -> Result<Self, DescriptorError> {
        let mut map = Self::new();

        for_each_endpoint(bytes, |_, info| {
            map.endpoints.entry(info.address).or_insert(info);
        })?;

        Ok(map)
    }

    /// Replaces the endpoints of `interface` with the ones `alternate`
    /// defines in `configuration`. Endpoints only other alternate settings
    /// of the interface use are dropped.
    pub fn select_alternate_setting(
        &mut self,
        configuration: &[u8],
        interface: u8,
        alternate: u8,
    ) -> Result<(), DescriptorError> {
        let mut stale = Vec::new();
        let mut selected = Vec::new();

        for_each_endpoint(configuration, |setting, info| match setting {
            Some((number, alt)) if number == interface => {
                if alt == alternate {
                    selected.push(info);
                } else {
                    stale.push(info.address);
                }
            }
            _ => {}
        })?;

        tracing::debug!(interface, alternate, endpoints = selected.len(), "alternate setting selected");

        for address in stale {
            self.endpoints.remove(&address);
        }
        for info in selected {
            self.endpoints.insert(info.address, info);
        }

        Ok(())
    }

    pub fn set_default_max_packet_size(&mut self, max_packet_size: u16) {
        self.default_pipe.max_packet_size = max_packet_size;
    }

    pub fn insert(&mut self, info: EndpointInfo) {
        if info.number() == 0 {
            self.default_pipe = info;
        } else {
            self.endpoints.insert(info.address, info);
        }
    }

    /// Endpoint zero first, then by address
    pub fn iter(&self) -> impl Iterator<Item = &EndpointInfo> {
        core::iter::once(&self.default_pipe).chain(self.endpoints.values())
    }
}

impl DescriptorStore for EndpointMap {
    fn endpoint(&self, address: u8) -> Option<EndpointInfo> {
        if address & 0x0F == 0 {
            return Some(self.default_pipe);
        }

        self.endpoints.get(&address).copied()
    }
}

/// Calls `f` for every endpoint descriptor of a configuration together with
/// the `(bInterfaceNumber, bAlternateSetting)` it belongs to
fn for_each_endpoint(
    bytes: &[u8],
    mut f: impl FnMut(Option<(u8, u8)>, EndpointInfo),
) -> Result<(), DescriptorError> {
    let mut setting = None;

    for (offset, descriptor) in Descriptors::new(bytes) {
        let descriptor = descriptor?;
        let kind = descriptor[1];

        if offset == 0 && kind != CONFIGURATION {
            return Err(DescriptorError::UnexpectedType {
                expected: CONFIGURATION,
                actual: kind,
            });
        }

        match kind {
            INTERFACE if descriptor.len() >= 4 => setting = Some((descriptor[2], descriptor[3])),
            ENDPOINT => {
                if descriptor.len() < 7 {
                    return Err(DescriptorError::InvalidLength {
                        offset,
                        length: descriptor[0],
                    });
                }

                let info = EndpointInfo {
                    address: descriptor[2],
                    pipe_type: PipeType::from_attributes(descriptor[3]),
                    max_packet_size: u16::from_le_bytes([descriptor[4], descriptor[5]]) & 0x07FF,
                    interval: descriptor[6],
                };

                tracing::trace!(?info, ?setting, "found endpoint");

                f(setting, info);
            }
            _ => {}
        }
    }

    Ok(())
}

/// Walks concatenated descriptors, yielding each with its offset
struct Descriptors<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Descriptors<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }
}

impl<'a> Iterator for Descriptors<'a> {
    type Item = (usize, Result<&'a [u8], DescriptorError>);

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.offset;
        let rest = self.bytes.get(offset..).filter(|r| !r.is_empty())?;

        let length = rest[0];

        let item = if length < 2 {
            Err(DescriptorError::InvalidLength { offset, length })
        } else {
            rest.get(..length as usize)
                .ok_or(DescriptorError::Truncated { offset })
        };

        // stop after the first error
        self.offset = match item {
            Ok(_) => offset + length as usize,
            Err(_) => self.bytes.len(),
        };

        Some((offset, item))
    }
}

/// Standard device descriptor
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DeviceDescriptor {
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub const LENGTH: u16 = 18;

    pub fn parse(bytes: &[u8]) -> Result<Self, DescriptorError> {
        let d = expect_descriptor(bytes, DEVICE, Self::LENGTH as usize)?;
        let u16_at = |i: usize| u16::from_le_bytes([d[i], d[i + 1]]);

        Ok(Self {
            bcd_usb: u16_at(2),
            device_class: d[4],
            device_sub_class: d[5],
            device_protocol: d[6],
            max_packet_size0: d[7],
            id_vendor: u16_at(8),
            id_product: u16_at(10),
            bcd_device: u16_at(12),
            manufacturer_index: d[14],
            product_index: d[15],
            serial_number_index: d[16],
            num_configurations: d[17],
        })
    }
}

/// `wTotalLength` from the 9 byte header of a configuration descriptor
pub fn configuration_total_length(bytes: &[u8]) -> Result<u16, DescriptorError> {
    let d = expect_descriptor(bytes, CONFIGURATION, 9)?;

    Ok(u16::from_le_bytes([d[2], d[3]]))
}

fn expect_descriptor(bytes: &[u8], kind: u8, min_length: usize) -> Result<&[u8], DescriptorError> {
    let d = bytes
        .get(..min_length)
        .ok_or(DescriptorError::Truncated { offset: 0 })?;

    if d[1] != kind {
        return Err(DescriptorError::UnexpectedType {
            expected: kind,
            actual: d[1],
        });
    }

    if (d[0] as usize) < min_length {
        return Err(DescriptorError::InvalidLength {
            offset: 0,
            length: d[0],
        });
    }

    Ok(d)
}

#[cfg(test)]
mod tests {
    use super::*;

    // config, interface 0 alt 0 (bulk in/out), interface 0 alt 1 (iso in + bulk in again)
    const CONFIG: &[u8] = &[
        0x09, 0x02, 0x37, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32, //
        0x09, 0x04, 0x00, 0x00, 0x02, 0xFF, 0x00, 0x00, 0x00, //
        0x07, 0x05, 0x81, 0x02, 0x00, 0x02, 0x00, //
        0x07, 0x05, 0x02, 0x02, 0x00, 0x02, 0x00, //
        0x09, 0x04, 0x00, 0x01, 0x02, 0xFF, 0x00, 0x00, 0x00, //
        0x07, 0x05, 0x83, 0x05, 0xC0, 0x13, 0x01, //
        0x07, 0x05, 0x81, 0x03, 0x40, 0x00, 0x04, //
    ];

    #[test]
    fn endpoints_from_configuration() {
        let map = EndpointMap::from_configuration_descriptor(CONFIG).unwrap();

        assert_eq!(
            map.endpoint(0x81),
            Some(EndpointInfo {
                address: 0x81,
                pipe_type: PipeType::Bulk,
                max_packet_size: 512,
                interval: 0,
            })
        );
        assert_eq!(map.endpoint(0x02).map(|e| e.pipe_type), Some(PipeType::Bulk));

        let iso = map.endpoint(0x83).unwrap();
        assert_eq!(iso.pipe_type, PipeType::Isochronous);
        assert_eq!(iso.max_packet_size, 0x3C0);
        assert_eq!(iso.interval, 1);
        assert_eq!(iso.direction(), Direction::In);

        assert_eq!(map.endpoint(0x01), None);
        assert_eq!(map.iter().count(), 4);
    }

    #[test]
    fn alternate_setting_replaces_interface_endpoints() {
        let mut map = EndpointMap::from_configuration_descriptor(CONFIG).unwrap();

        map.select_alternate_setting(CONFIG, 0, 1).unwrap();

        assert_eq!(
            map.endpoint(0x81),
            Some(EndpointInfo {
                address: 0x81,
                pipe_type: PipeType::Interrupt,
                max_packet_size: 64,
                interval: 4,
            })
        );
        assert_eq!(map.endpoint(0x83).map(|e| e.pipe_type), Some(PipeType::Isochronous));
        assert_eq!(map.endpoint(0x02), None);

        map.select_alternate_setting(CONFIG, 0, 0).unwrap();

        assert_eq!(map.endpoint(0x81).map(|e| e.pipe_type), Some(PipeType::Bulk));
        assert_eq!(map.endpoint(0x02).map(|e| e.pipe_type), Some(PipeType::Bulk));
        assert_eq!(map.endpoint(0x83), None);
    }

    #[test]
    fn endpoint_zero_is_always_control() {
        let map = EndpointMap::new();

        assert_eq!(map.endpoint(0x00).map(|e| e.pipe_type), Some(PipeType::Control));
        assert_eq!(map.endpoint(0x80).map(|e| e.pipe_type), Some(PipeType::Control));
    }

    #[test]
    fn truncated_configuration_is_rejected() {
        assert_eq!(
            EndpointMap::from_configuration_descriptor(&CONFIG[..CONFIG.len() - 3]),
            Err(DescriptorError::Truncated { offset: 48 })
        );
        assert!(matches!(
            EndpointMap::from_configuration_descriptor(&[0x00, 0x02]),
            Err(DescriptorError::InvalidLength { offset: 0, .. })
        ));
        assert!(matches!(
            EndpointMap::from_configuration_descriptor(&CONFIG[9..]),
            Err(DescriptorError::UnexpectedType { .. })
        ));
    }

    #[test]
    fn device_descriptor() {
        let bytes = [
            0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x6B, 0x1D, 0x04, 0x01, 0x10, 0x05,
            0x01, 0x02, 0x03, 0x01,
        ];

        let device = DeviceDescriptor::parse(&bytes).unwrap();

        assert_eq!(device.bcd_usb, 0x0200);
        assert_eq!(device.id_vendor, 0x1D6B);
        assert_eq!(device.id_product, 0x0104);
        assert_eq!(device.max_packet_size0, 64);
        assert_eq!(device.num_configurations, 1);

        assert!(DeviceDescriptor::parse(&bytes[..10]).is_err());
        assert_eq!(configuration_total_length(CONFIG), Ok(0x37));
    }
}
