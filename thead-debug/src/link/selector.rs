use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::LinkDevice;

/// Selects one adapter out of an enumeration.
///
/// Parsed from a string in the form `VID:PID[:SERIAL]`, with VID and PID in hexadecimal.
///
/// ## Example:
///
/// ```
/// let selector: thead_debug::link::LinkSelector = "32bf:b210:CK0001".parse().unwrap();
///
/// assert_eq!(selector.vendor_id, 0x32bf);
/// assert_eq!(selector.product_id, 0xb210);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkSelector {
    /// The USB vendor id of the adapter.
    pub vendor_id: u16,
    /// The USB product id of the adapter.
    pub product_id: u16,
    /// The serial number of the adapter.
    pub serial_number: Option<String>,
}

impl LinkSelector {
    /// Check if the given adapter matches this selector.
    pub fn matches(&self, device: &LinkDevice) -> bool {
        tracing::trace!(
            "Matching link selector {self} against {:04x}:{:04x}:{:?}",
            device.vendor_id,
            device.product_id,
            device.serial_number
        );

        device.vendor_id == self.vendor_id
            && device.product_id == self.product_id
            && self
                .serial_number
                .as_ref()
                .map(|s| match &device.serial_number {
                    Some(serial_number) => serial_number == s,
                    // "VID:PID:" selects adapters without serial number
                    None => s.is_empty(),
                })
                .unwrap_or(true)
    }
}

/// An error which can occur while parsing a [`LinkSelector`].
#[derive(thiserror::Error, Debug, docsplay::Display)]
pub enum LinkSelectorParseError {
    /// Could not parse VID or PID: {0}
    ParseInt(#[from] std::num::ParseIntError),

    /// The format of the selector is invalid. Please use a string in the form `VID:PID:<Serial>`, where Serial is optional.
    Format,
}

impl std::str::FromStr for LinkSelector {
    type Err = LinkSelectorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Serial numbers may contain colons themselves.
        let mut split = s.splitn(3, ':');

        let vendor_id = split.next().ok_or(LinkSelectorParseError::Format)?;
        let product_id = split.next().ok_or(LinkSelectorParseError::Format)?;
        let serial_number = split.next().map(|s| s.to_string());

        Ok(LinkSelector {
            vendor_id: u16::from_str_radix(vendor_id, 16)?,
            product_id: u16::from_str_radix(product_id, 16)?,
            serial_number,
        })
    }
}

impl From<&LinkDevice> for LinkSelector {
    fn from(device: &LinkDevice) -> Self {
        LinkSelector {
            vendor_id: device.vendor_id,
            product_id: device.product_id,
            serial_number: device.serial_number.clone(),
        }
    }
}

impl fmt::Display for LinkSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)?;
        if let Some(ref sn) = self.serial_number {
            write!(f, ":{sn}")?;
        }
        Ok(())
    }
}

impl Serialize for LinkSelector {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'a> Deserialize<'a> for LinkSelector {
    fn deserialize<D>(deserializer: D) -> Result<LinkSelector, D::Error>
    where
        D: Deserializer<'a>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::link::LinkState;

    fn device(serial_number: Option<&str>) -> LinkDevice {
        LinkDevice {
            vendor_id: 0x32bf,
            product_id: 0xb210,
            bcd_device: 0x0100,
            description: "CKLink_Lite".to_string(),
            serial_number: serial_number.map(str::to_string),
            state: LinkState::Idle,
        }
    }

    #[test]
    fn serial_with_colons() {
        let selector: LinkSelector = "32bf:b210:DC:DA:0C:D3".parse().unwrap();

        assert_eq!(selector.vendor_id, 0x32bf);
        assert_eq!(selector.product_id, 0xb210);
        assert_eq!(selector.serial_number, Some("DC:DA:0C:D3".to_string()));
    }

    #[test]
    fn missing_serial_matches_any() {
        let selector: LinkSelector = "32bf:b210".parse().unwrap();

        assert!(selector.matches(&device(None)));
        assert!(selector.matches(&device(Some("CK0001"))));
    }

    #[test]
    fn empty_serial_matches_only_without_serial() {
        let selector: LinkSelector = "32bf:b210:".parse().unwrap();

        assert!(selector.matches(&device(None)));
        assert!(!selector.matches(&device(Some("CK0001"))));
    }

    #[test]
    fn missing_product_id_is_rejected() {
        assert!(matches!(
            "32bf".parse::<LinkSelector>(),
            Err(LinkSelectorParseError::Format)
        ));
    }

    #[test]
    fn yaml_round_trip() {
        let selector: LinkSelector = serde_yaml::from_str("\"c510:b210:abc\"").unwrap();
        assert_eq!(selector.to_string(), "c510:b210:abc");
    }
}
