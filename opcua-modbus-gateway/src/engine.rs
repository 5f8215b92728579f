//! Synchronization engine: the polling loop that reconciles registers and OPC UA variables.
//!
//! Each cycle reads the poll window, decodes every tag and compares three
//! values: the device's, the OPC UA variable's, and the tag's
//! `last_observed`. The device wins whenever it moved; otherwise an OPC UA
//! change is written back (writable tags) or merely acknowledged (read-only
//! tags). A failure only affects the cycle or the tag it happened on.

use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address_space::{AddressSpace, AddressSpaceError};
use crate::codec;
use crate::config::ReadMode;
use crate::modbus::{RegisterClient, TransportError};
use crate::registry::{MAX_READ_REGISTERS, PollWindow, TagRegistry};
use crate::tag::{ModbusType, Tag};
use crate::value::TagValue;

/// Error type for synchronization.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("Modbus transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Address space error: {0}")]
    AddressSpace(#[from] AddressSpaceError),
    #[error("Tag '{tag}': modbus_type {modbus_type} is not supported (only holding_register)")]
    UnsupportedModbusType { tag: String, modbus_type: ModbusType },
    #[error("Tag '{tag}': register {address} is outside the acquired registers")]
    OutOfWindow { tag: String, address: u16 },
}

/// Which side, if any, must be updated for a tag this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The device value moved: push it to OPC UA.
    FromDevice,
    /// The OPC UA value moved while the device did not: write it back.
    FromOpcUa,
    /// Nothing changed.
    Unchanged,
}

/// Decide the direction for one tag. The device takes precedence.
pub fn reconcile(decoded: &TagValue, current: &TagValue, last: Option<&TagValue>) -> Direction {
    if last != Some(decoded) {
        Direction::FromDevice
    } else if last != Some(current) {
        Direction::FromOpcUa
    } else {
        Direction::Unchanged
    }
}

/// What a tag did during one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagOutcome {
    Unchanged,
    /// Device value written to the OPC UA variable.
    PushedToOpcUa,
    /// OPC UA value written to the register.
    WrittenToDevice,
    /// OPC UA change on a read-only tag, acknowledged without a write.
    Suppressed,
    /// OPC UA value could not be encoded; the variable was reset to the device value.
    Reverted,
}

/// Counters for one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub unchanged: usize,
    pub pushed_to_opcua: usize,
    pub written_to_device: usize,
    pub suppressed: usize,
    pub reverted: usize,
    /// Tags whose reconcile failed this cycle.
    pub failed: usize,
    /// Tags permanently skipped because their register type is unsupported.
    pub skipped: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: TagOutcome) {
        match outcome {
            TagOutcome::Unchanged => self.unchanged += 1,
            TagOutcome::PushedToOpcUa => self.pushed_to_opcua += 1,
            TagOutcome::WrittenToDevice => self.written_to_device += 1,
            TagOutcome::Suppressed => self.suppressed += 1,
            TagOutcome::Reverted => self.reverted += 1,
        }
    }
}

/// Engine tuning.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Delay between the end of one cycle and the start of the next.
    pub interval: Duration,
    pub read_mode: ReadMode,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            read_mode: ReadMode::Batched,
        }
    }
}

/// Registers acquired this cycle, addressed by absolute register number.
#[derive(Debug, Clone)]
struct RegisterBlock {
    start: u16,
    words: Vec<u16>,
}

impl RegisterBlock {
    fn index(&self, address: u16) -> Option<usize> {
        let offset = usize::from(address.checked_sub(self.start)?);
        (offset < self.words.len()).then_some(offset)
    }

    fn get(&self, address: u16) -> Option<u16> {
        self.index(address).map(|i| self.words[i])
    }

    fn set(&mut self, address: u16, word: u16) {
        if let Some(i) = self.index(address) {
            self.words[i] = word;
        }
    }
}

/// Polling loop between one Modbus device and one address space.
pub struct SyncEngine<C, S> {
    registry: TagRegistry,
    client: C,
    space: S,
    options: EngineOptions,
    /// Tags already reported as unsupported.
    unsupported: HashSet<String>,
}

impl<C: RegisterClient, S: AddressSpace> SyncEngine<C, S> {
    pub fn new(registry: TagRegistry, client: C, space: S, options: EngineOptions) -> Self {
        Self {
            registry,
            client,
            space,
            options,
            unsupported: HashSet::new(),
        }
    }

    pub fn registry(&self) -> &TagRegistry {
        &self.registry
    }

    /// Take the Modbus client back, e.g. to close it.
    pub fn into_client(self) -> C {
        self.client
    }

    /// Run poll cycles until `shutdown` is cancelled.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(
            tags = self.registry.len(),
            interval_ms = self.options.interval.as_millis() as u64,
            mode = ?self.options.read_mode,
            "Starting synchronization loop"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.poll_once() => match result {
                    Ok(report) => debug!(?report, "Poll cycle complete"),
                    Err(e) => warn!(error = %e, "Poll cycle skipped"),
                },
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.options.interval) => {}
            }
        }

        info!("Synchronization loop stopped");
    }

    /// Perform a single poll cycle.
    ///
    /// Returns an error, without touching any tag, when the batched read fails.
    pub async fn poll_once(&mut self) -> Result<CycleReport, SyncError> {
        let mut report = CycleReport::default();
        let Some(window) = self.registry.window() else {
            return Ok(report);
        };

        match self.options.read_mode {
            ReadMode::Batched => {
                let mut block = self.read_window(window).await?;
                for index in 0..self.registry.len() {
                    self.sync_tag(index, &mut block, &mut report).await;
                }
            }
            ReadMode::PerTag => {
                for index in 0..self.registry.len() {
                    let address = self.registry.tags()[index].modbus_address;
                    if !self.check_supported(index, &mut report) {
                        continue;
                    }
                    match self.client.read_holding_registers(address, 1).await {
                        Ok(words) => {
                            let mut block = RegisterBlock {
                                start: address,
                                words,
                            };
                            self.sync_tag(index, &mut block, &mut report).await;
                        }
                        Err(e) => {
                            warn!(
                                tag = %self.registry.tags()[index].name,
                                address,
                                error = %e,
                                "Register read failed"
                            );
                            report.failed += 1;
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    async fn read_window(&mut self, window: PollWindow) -> Result<RegisterBlock, SyncError> {
        let mut words = Vec::with_capacity(window.width());
        for (start, count) in window.chunks(MAX_READ_REGISTERS) {
            words.extend(self.client.read_holding_registers(start, count).await?);
        }
        Ok(RegisterBlock {
            start: window.min,
            words,
        })
    }

    /// Skip tags on unsupported register types, reporting each one once.
    fn check_supported(&mut self, index: usize, report: &mut CycleReport) -> bool {
        let tag = &self.registry.tags()[index];
        if tag.modbus_type.is_supported() {
            return true;
        }

        if self.unsupported.insert(tag.name.clone()) {
            let err = SyncError::UnsupportedModbusType {
                tag: tag.name.clone(),
                modbus_type: tag.modbus_type,
            };
            warn!(error = %err, "Skipping tag");
        }
        report.skipped += 1;
        false
    }

    async fn sync_tag(&mut self, index: usize, block: &mut RegisterBlock, report: &mut CycleReport) {
        if !self.check_supported(index, report) {
            return;
        }

        let Self {
            registry,
            client,
            space,
            ..
        } = self;
        let tag = &mut registry.tags_mut()[index];

        match reconcile_tag(tag, block, client, space).await {
            Ok(outcome) => report.record(outcome),
            Err(e) => {
                warn!(tag = %tag.name, error = %e, "Tag sync failed");
                report.failed += 1;
            }
        }
    }
}

/// Reconcile one tag against the acquired registers.
///
/// `last_observed` changes only once the corresponding side effect succeeded.
async fn reconcile_tag<C: RegisterClient, S: AddressSpace>(
    tag: &mut Tag,
    block: &mut RegisterBlock,
    client: &mut C,
    space: &S,
) -> Result<TagOutcome, SyncError> {
    let raw = block
        .get(tag.modbus_address)
        .ok_or_else(|| SyncError::OutOfWindow {
            tag: tag.name.clone(),
            address: tag.modbus_address,
        })?;

    let decoded = codec::decode(raw, &tag.kind);
    let current = space.get_value(&tag.node)?;

    match reconcile(&decoded, &current, tag.last_observed.as_ref()) {
        Direction::Unchanged => Ok(TagOutcome::Unchanged),
        Direction::FromDevice => {
            space.set_value(&tag.node, decoded)?;
            tag.last_observed = Some(decoded);
            info!(tag = %tag.name, value = %decoded, "Device value changed");
            Ok(TagOutcome::PushedToOpcUa)
        }
        Direction::FromOpcUa if !tag.writable => {
            tag.last_observed = Some(current);
            info!(tag = %tag.name, value = %current, "OPC UA change on read-only tag, not written");
            Ok(TagOutcome::Suppressed)
        }
        Direction::FromOpcUa => match codec::encode(&current, raw, &tag.kind) {
            Ok(word) => {
                client.write_registers(tag.modbus_address, &[word]).await?;
                // Later tags packed into the same register must see this write
                block.set(tag.modbus_address, word);
                tag.last_observed = Some(current);
                info!(
                    tag = %tag.name,
                    value = %current,
                    address = tag.modbus_address,
                    "OPC UA value written to device"
                );
                Ok(TagOutcome::WrittenToDevice)
            }
            Err(e) => {
                warn!(tag = %tag.name, value = %current, error = %e, "Rejected OPC UA value, reverting");
                space.set_value(&tag.node, decoded)?;
                tag.last_observed = Some(decoded);
                Ok(TagOutcome::Reverted)
            }
        },
    }
}
