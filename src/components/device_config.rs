//! Device plugin configuration
//!
//! Maps product card names to PCI device IDs and renders the JSON resource
//! list both device plugin flavors read from `/etc/pcidp/config.json`.

use serde::Serialize;

use crate::crd::DevicePluginResource;
use crate::error::{Error, Result};

pub const VENDOR_CODE: &str = "1eff";
pub const DEVICE_TYPE_ACCELERATOR: &str = "accelerator";
pub const KERNEL_DRIVER: &str = "rebellions";
pub const VFIO_DRIVER: &str = "vfio-pci";

/// PCI device IDs for one product card
pub fn device_ids(card: &str) -> Option<&'static [&'static str]> {
    match card {
        "RBLN-CA12" => Some(&["1120", "1121"]),
        "RBLN-CA22" => Some(&["1220", "1221"]),
        "RBLN-CA25" => Some(&["1250", "1251"]),
        "RBLN-CR03" => Some(&["2030", "2031"]),
        _ => None,
    }
}

/// Device IDs for every card, in card order
pub fn collect_devices(cards: &[String]) -> Result<Vec<String>> {
    let mut devices = Vec::new();
    for card in cards {
        let ids = device_ids(card)
            .ok_or_else(|| Error::Configuration(format!("unknown product card name: {}", card)))?;
        devices.extend(ids.iter().map(|id| id.to_string()));
    }
    Ok(devices)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceList {
    resource_list: Vec<ConfigResource>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigResource {
    resource_name: String,
    resource_prefix: String,
    device_type: &'static str,
    selectors: DeviceSelector,
}

#[derive(Debug, Serialize)]
struct DeviceSelector {
    vendors: Vec<&'static str>,
    devices: Vec<String>,
    drivers: Vec<&'static str>,
}

/// Pretty JSON config for a device plugin bound to `driver`
pub fn render_config(resources: &[DevicePluginResource], driver: &'static str) -> Result<String> {
    let resource_list = resources
        .iter()
        .map(|resource| {
            Ok(ConfigResource {
                resource_name: resource.resource_name.clone(),
                resource_prefix: resource.resource_prefix.clone(),
                device_type: DEVICE_TYPE_ACCELERATOR,
                selectors: DeviceSelector {
                    vendors: vec![VENDOR_CODE],
                    devices: collect_devices(&resource.product_card_names)?,
                    drivers: vec![driver],
                },
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(serde_json::to_string_pretty(&ResourceList { resource_list })?)
}
