//! Node configuration
//!
//! One TOML document describes a node: its identity and its peer's, the
//! endpoint it serves, the PCIe window it carves IOVAs from and the control
//! channel geometry. Every field has a default so an empty file is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::channel::FRAME_SIZE;
use crate::copy::CopyLimits;
use crate::error::{C2cError, Result};
use crate::PAGE_SIZE;

/// Largest board/soc/controller/endpoint id (4-bit descriptor fields)
pub const MAX_ID_FIELD: u8 = 0xF;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct C2cConfig {
    #[serde(default = "default_local")]
    pub local: NodeIdentity,
    #[serde(default = "default_peer")]
    pub peer: NodeIdentity,
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub driver_mode: DriverMode,
    #[serde(default)]
    pub iova: IovaConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Default for C2cConfig {
    fn default() -> Self {
        Self {
            local: default_local(),
            peer: default_peer(),
            endpoint: EndpointConfig::default(),
            driver_mode: DriverMode::default(),
            iova: IovaConfig::default(),
            channel: ChannelConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

fn default_local() -> NodeIdentity { NodeIdentity { board_id: 0, soc_id: 0, cntrlr_id: 0 } }
fn default_peer() -> NodeIdentity { NodeIdentity { board_id: 0, soc_id: 1, cntrlr_id: 0 } }

/// Board/SoC/controller tuple naming one side of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub board_id: u8,
    pub soc_id: u8,
    pub cntrlr_id: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default)]
    pub id: u8,
    #[serde(default = "default_endpoint_name")]
    pub name: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self { id: 0, name: default_endpoint_name() }
    }
}

fn default_endpoint_name() -> String { "c2c-ep0".to_string() }

/// Which side of the PCIe link this node drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DriverMode {
    /// Root port: DMA writes land through the peer aperture
    #[default]
    RootPort,
    /// PCIe endpoint function: DMA writes target the import IOVA
    Endpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IovaConfig {
    #[serde(default = "default_iova_base")]
    pub base: u64,
    #[serde(default = "default_iova_size")]
    pub size: u64,
    /// Leading bytes of the window kept out of circulation
    #[serde(default = "default_iova_skip")]
    pub skip: u64,
}

impl Default for IovaConfig {
    fn default() -> Self {
        Self { base: default_iova_base(), size: default_iova_size(), skip: default_iova_skip() }
    }
}

fn default_iova_base() -> u64 { 0x8000_0000 }
fn default_iova_size() -> u64 { 32 * 1024 * 1024 }
fn default_iova_skip() -> u64 { 128 * 1024 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_nframes")]
    pub nframes: u32,
    #[serde(default = "default_frame_size")]
    pub frame_size: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self { nframes: default_nframes(), frame_size: default_frame_size() }
    }
}

fn default_nframes() -> u32 { 1024 }
fn default_frame_size() -> u32 { FRAME_SIZE as u32 }

impl ChannelConfig {
    /// Bytes one receive fifo occupies in the window, page aligned
    pub fn region_size(&self) -> u64 {
        let raw = FRAME_SIZE as u64 + u64::from(self.nframes) * u64::from(self.frame_size);
        // Saturates so that an absurd fifo fails window validation.
        raw.checked_next_multiple_of(PAGE_SIZE).unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Applied at bring-up when present; otherwise `set_limits` must be called
    #[serde(default)]
    pub limits: Option<CopyLimits>,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { limits: None, drain_timeout_ms: default_drain_timeout() }
    }
}

fn default_drain_timeout() -> u64 { 5000 }

impl C2cConfig {
    /// Parse a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| C2cError::Config(e.to_string()))
    }

    /// Reject configurations the link cannot run with
    pub fn validate(&self) -> Result<()> {
        for (side, node) in [("local", &self.local), ("peer", &self.peer)] {
            if node.board_id > MAX_ID_FIELD
                || node.soc_id > MAX_ID_FIELD
                || node.cntrlr_id > MAX_ID_FIELD
            {
                return Err(C2cError::Config(format!("{side} identity out of range: {node:?}")));
            }
        }
        if self.local == self.peer {
            return Err(C2cError::Config("local and peer identity are the same".into()));
        }
        if self.endpoint.id > MAX_ID_FIELD {
            return Err(C2cError::Config(format!("endpoint id {} out of range", self.endpoint.id)));
        }
        if self.endpoint.name.is_empty() {
            return Err(C2cError::Config("endpoint name is empty".into()));
        }

        let ch = &self.channel;
        if ch.nframes == 0 {
            return Err(C2cError::Config("channel nframes must be non-zero".into()));
        }
        if ch.frame_size < FRAME_SIZE as u32 || ch.frame_size % FRAME_SIZE as u32 != 0 {
            return Err(C2cError::Config(format!(
                "frame size {} must be a non-zero multiple of {FRAME_SIZE}",
                ch.frame_size
            )));
        }

        let iova = &self.iova;
        if iova.base % PAGE_SIZE != 0 || iova.skip % PAGE_SIZE != 0 {
            return Err(C2cError::Config("iova base and skip must be page aligned".into()));
        }
        // Skip area, receive fifo and the doorbell page must fit.
        let needed = iova.skip.checked_add(ch.region_size()).and_then(|n| n.checked_add(PAGE_SIZE));
        match needed {
            Some(needed) if needed <= iova.size => {}
            Some(needed) => {
                return Err(C2cError::Config(format!(
                    "iova window of {:#x} bytes is smaller than the {needed:#x} bytes \
                     reserved at bring-up",
                    iova.size
                )));
            }
            None => {
                return Err(C2cError::Config(
                    "skip area and fifo overflow the address space".into(),
                ))
            }
        }

        if let Some(limits) = &self.engine.limits {
            limits.validate()?;
        }
        Ok(())
    }
}

/// Load a configuration file, falling back to defaults if it does not exist
pub fn load_config(path: &Path) -> Result<C2cConfig> {
    let config = if path.exists() {
        let contents = std::fs::read_to_string(path)?;
        C2cConfig::from_toml_str(&contents)?
    } else {
        C2cConfig::default()
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = C2cConfig::from_toml_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.channel.nframes, 1024);
        assert_eq!(config.channel.frame_size, 64);
        assert_eq!(config.engine.drain_timeout_ms, 5000);
        assert_eq!(config.driver_mode, DriverMode::RootPort);
    }

    #[test]
    fn test_parse_full_document() {
        let config = C2cConfig::from_toml_str(
            r#"
            driver_mode = "endpoint"

            [local]
            board_id = 1
            soc_id = 2
            cntrlr_id = 3

            [peer]
            board_id = 1
            soc_id = 3
            cntrlr_id = 3

            [endpoint]
            id = 4
            name = "camera"

            [channel]
            nframes = 16
            frame_size = 128

            [engine.limits]
            max_copy_requests = 8
            max_flush_ranges = 4
            max_post_fences = 2
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.driver_mode, DriverMode::Endpoint);
        assert_eq!(config.endpoint.id, 4);
        assert_eq!(config.engine.limits.unwrap().max_flush_ranges, 4);
    }

    #[test]
    fn test_rejects_same_identity() {
        let mut config = C2cConfig::default();
        config.peer = config.local;
        assert!(matches!(config.validate(), Err(C2cError::Config(_))));
    }

    #[test]
    fn test_rejects_wide_identity() {
        let mut config = C2cConfig::default();
        config.local.board_id = 16;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unaligned_frame() {
        let mut config = C2cConfig::default();
        config.channel.frame_size = 96;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_region_size_page_aligned() {
        let ch = ChannelConfig { nframes: 3, frame_size: 64 };
        assert_eq!(ch.region_size(), PAGE_SIZE);
    }

    #[test]
    fn test_rejects_skip_past_address_space() {
        let mut config = C2cConfig::default();
        config.iova.skip = u64::MAX - PAGE_SIZE + 1;
        assert!(matches!(config.validate(), Err(C2cError::Config(_))));
    }
}
