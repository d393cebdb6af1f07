use log::warn;

pub const STATE_SENTINEL: u32 = 0xCAFE_BABE;

/// Size of the retained record: sentinel, boot count, last sync time,
/// failed captures and WiFi retries, little-endian.
pub const STATE_RECORD_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistentState {
    pub sentinel: u32,
    pub boot_count: u32,
    pub last_sync_time: i64,
    pub consecutive_failed_captures: u32,
    pub wifi_retry_count: u32,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            sentinel: STATE_SENTINEL,
            boot_count: 0,
            last_sync_time: 0,
            consecutive_failed_captures: 0,
            wifi_retry_count: 0,
        }
    }
}

impl PersistentState {
    pub fn is_valid(&self) -> bool {
        self.sentinel == STATE_SENTINEL
    }

    pub fn to_bytes(&self) -> [u8; STATE_RECORD_LEN] {
        let mut raw = [0_u8; STATE_RECORD_LEN];
        raw[0..4].copy_from_slice(&self.sentinel.to_le_bytes());
        raw[4..8].copy_from_slice(&self.boot_count.to_le_bytes());
        raw[8..16].copy_from_slice(&self.last_sync_time.to_le_bytes());
        raw[16..20].copy_from_slice(&self.consecutive_failed_captures.to_le_bytes());
        raw[20..24].copy_from_slice(&self.wifi_retry_count.to_le_bytes());
        raw
    }

    pub fn from_bytes(raw: &[u8; STATE_RECORD_LEN]) -> Self {
        let u32_at = |offset: usize| {
            let mut word = [0_u8; 4];
            word.copy_from_slice(&raw[offset..offset + 4]);
            u32::from_le_bytes(word)
        };
        let mut sync = [0_u8; 8];
        sync.copy_from_slice(&raw[8..16]);

        Self {
            sentinel: u32_at(0),
            boot_count: u32_at(4),
            last_sync_time: i64::from_le_bytes(sync),
            consecutive_failed_captures: u32_at(16),
            wifi_retry_count: u32_at(20),
        }
    }

    pub fn record_boot(&mut self) -> u32 {
        self.boot_count = self.boot_count.saturating_add(1);
        self.boot_count
    }

    pub fn record_capture_success(&mut self) {
        self.consecutive_failed_captures = 0;
    }

    pub fn record_capture_failure(&mut self) -> u32 {
        self.consecutive_failed_captures = self.consecutive_failed_captures.saturating_add(1);
        self.consecutive_failed_captures
    }

    pub fn record_wifi_retry(&mut self) -> u32 {
        self.wifi_retry_count = self.wifi_retry_count.saturating_add(1);
        self.wifi_retry_count
    }

    pub fn reset_wifi_retries(&mut self) {
        self.wifi_retry_count = 0;
    }

    pub fn record_time_sync(&mut self, epoch_secs: i64) {
        self.last_sync_time = epoch_secs;
    }
}

/// Storage that keeps its contents across deep sleep and loses them on
/// power loss or reset.
pub trait RetentionMemory {
    fn read(&self) -> [u8; STATE_RECORD_LEN];
    fn write(&mut self, record: &[u8; STATE_RECORD_LEN]);
}

/// Plain in-process retention. Starts zeroed, which never carries the sentinel.
#[derive(Debug, Clone, Default)]
pub struct MemoryRetention {
    bytes: [u8; STATE_RECORD_LEN],
}

impl MemoryRetention {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bytes(bytes: [u8; STATE_RECORD_LEN]) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &[u8; STATE_RECORD_LEN] {
        &self.bytes
    }
}

impl RetentionMemory for MemoryRetention {
    fn read(&self) -> [u8; STATE_RECORD_LEN] {
        self.bytes
    }

    fn write(&mut self, record: &[u8; STATE_RECORD_LEN]) {
        self.bytes = *record;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateOrigin {
    Retained,
    Reinitialized,
}

pub struct PersistentStore<R> {
    memory: R,
}

impl<R: RetentionMemory> PersistentStore<R> {
    pub fn new(memory: R) -> Self {
        Self { memory }
    }

    pub fn validate(state: &PersistentState) -> bool {
        state.is_valid()
    }

    /// Reads the retained record, falling back to defaults (and writing them
    /// back) when the sentinel does not match.
    pub fn load(&mut self) -> (PersistentState, StateOrigin) {
        let state = PersistentState::from_bytes(&self.memory.read());
        if Self::validate(&state) {
            return (state, StateOrigin::Retained);
        }

        warn!(
            "retained state sentinel {:#010x} does not match; reinitializing",
            state.sentinel
        );
        (self.reset(), StateOrigin::Reinitialized)
    }

    pub fn save(&mut self, state: &PersistentState) {
        let stamped = PersistentState {
            sentinel: STATE_SENTINEL,
            ..*state
        };
        self.memory.write(&stamped.to_bytes());
    }

    pub fn reset(&mut self) -> PersistentState {
        let state = PersistentState::default();
        self.memory.write(&state.to_bytes());
        state
    }

    pub fn memory(&self) -> &R {
        &self.memory
    }

    pub fn into_inner(self) -> R {
        self.memory
    }
}
