use std::time::Duration;

use bon::Builder;

use crate::message::InstanceId;

/// Byte order of the 4-byte frame length prefix. Both ends must agree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
    /// Whatever the host uses.
    Native,
}

impl ByteOrder {
    pub fn read_len(self, bytes: [u8; 4]) -> u32 {
        match self {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
            ByteOrder::Native => u32::from_ne_bytes(bytes),
        }
    }

    pub fn write_len(self, len: u32) -> [u8; 4] {
        match self {
            ByteOrder::Little => len.to_le_bytes(),
            ByteOrder::Big => len.to_be_bytes(),
            ByteOrder::Native => len.to_ne_bytes(),
        }
    }
}

/// Configuration for the router.
///
/// ```ignore
/// let config = RouterConfig::builder()
///     .byte_order(ByteOrder::Big)
///     .ingest_pause(Duration::ZERO)
///     .build();
/// ```
#[derive(Debug, Clone, Builder)]
pub struct RouterConfig {
    /// Per-instance inbound buffer size. The oldest message is dropped on overflow.
    #[builder(default = 10)]
    pub buffer_capacity: usize,

    #[builder(default)]
    pub byte_order: ByteOrder,

    /// Largest accepted frame payload, checked before allocating.
    #[builder(default = 1024 * 1024)]
    pub max_frame_len: usize,

    /// The shell session whose vocabulary is always part of the effective grammar.
    #[builder(default = InstanceId::new(1))]
    pub root_instance: InstanceId,

    /// Pause between ingested frames. Zero only yields to the scheduler.
    #[builder(default = Duration::from_millis(100))]
    pub ingest_pause: Duration,

    /// Minimum spacing of announcements from a backgrounded session.
    #[builder(default = Duration::from_secs(1))]
    pub background_synthesis_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
