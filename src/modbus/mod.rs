/*!
Modbus plumbing: bus clients, block scanners, probes, and the write queue.

Purpose:
- Each bus client (TCP for the internal SPI boards, RTU for serial
  extensions) is owned by exactly one scanner. Other tasks never touch a
  client; output writes arrive over a bounded queue and are applied at the
  start of the owning scanner's next tick.
- A scan tick reads every declared register block sequentially, in
  declaration order, and stores the words in the register cache. Timeouts
  and Modbus exception replies are logged and skipped; nothing is retried
  within the same tick.

Probes:
- SPI boards answer on units 1..=3 at input register 1000; the register
  carries the firmware as major/minor bytes. Units that do not answer are
  skipped silently.
- The Eastron SDM120M reports its firmware in two holding registers at
  0xFC02. A failed probe is logged; the extension is registered anyway and
  later read failures get logged the same way.
*/

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_modbus::client::{Context, Reader, Writer};
use tokio_modbus::slave::{Slave, SlaveContext};
use tracing::{debug, info, warn};

use crate::config::{ModbusSerialConfig, ModbusTcpConfig};
use crate::error::{Error, HardwareError};
use crate::hardware::{HardwareMap, RegisterType};
use crate::logging::prefix;
use crate::registers::{Bus, SharedCache};

pub const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_RTU_TIMEOUT: Duration = Duration::from_secs(2);

/// Capacity of the per-bus coil write queue.
const WRITE_QUEUE_DEPTH: usize = 32;

/// An SPI board that answered the startup probe.
#[derive(Clone, Debug)]
pub struct Board {
    /// Board index; doubles as the Modbus unit on the TCP bus.
    pub index: u8,
    pub firmware: String,
}

/// Probe result for one RTU extension.
#[derive(Clone, Debug)]
pub struct ProbedExtension {
    pub unit: u8,
    pub firmware: Option<String>,
}

/// A coil write requested by a subscriber or the cover engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoilWrite {
    pub unit: u8,
    pub coil: u16,
    pub value: bool,
    /// Circuit id, for logging only.
    pub circuit: String,
}

pub fn write_channel() -> (mpsc::Sender<CoilWrite>, mpsc::Receiver<CoilWrite>) {
    mpsc::channel(WRITE_QUEUE_DEPTH)
}

/// One contiguous block read per tick.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ScanBlock {
    pub unit: u8,
    pub start: u16,
    pub count: u16,
    pub register_type: RegisterType,
}

/// Blocks the TCP scanner reads: every declared block of each present board.
pub fn tcp_blocks(hardware: &HardwareMap, boards: &[Board]) -> Result<Vec<ScanBlock>, HardwareError> {
    let mut blocks = Vec::new();
    for board in boards {
        for def in hardware.neuron.blocks_for_board(board.index) {
            blocks.push(ScanBlock {
                unit: board.index,
                start: def.start_reg,
                count: def.count,
                register_type: def.register_type,
            });
        }
    }
    check_block_overlap(Bus::Tcp, &blocks)?;
    Ok(blocks)
}

/// Blocks the RTU scanner reads: every declared block of each extension.
pub fn rtu_blocks(hardware: &HardwareMap) -> Result<Vec<ScanBlock>, HardwareError> {
    let mut blocks = Vec::new();
    for extension in &hardware.extensions {
        for def in &extension.definition.modbus_register_blocks {
            blocks.push(ScanBlock {
                unit: extension.unit,
                start: def.start_reg,
                count: def.count,
                register_type: def.register_type,
            });
        }
    }
    check_block_overlap(Bus::Rtu, &blocks)?;
    Ok(blocks)
}

/// No register address may appear in more than one block on the same unit.
fn check_block_overlap(bus: Bus, blocks: &[ScanBlock]) -> Result<(), HardwareError> {
    for (i, a) in blocks.iter().enumerate() {
        for b in &blocks[i + 1..] {
            if a.unit != b.unit || a.register_type != b.register_type {
                continue;
            }
            let a_end = a.start + a.count;
            let b_end = b.start + b.count;
            if a.start < b_end && b.start < a_end {
                return Err(HardwareError::Definition {
                    path: Default::default(),
                    reason: format!(
                        "overlapping register blocks at address {} (unit: {}, bus: {})",
                        b.start.max(a.start),
                        a.unit,
                        bus.as_str()
                    ),
                });
            }
        }
    }
    Ok(())
}

/// `(reg >> 8).(reg & 0xff)`, the firmware encoding of board register 1000.
pub fn firmware_version(word: u16) -> String {
    format!("{}.{}", word >> 8, word & 0x00ff)
}

/// Firmware string from the Eastron 0xFC02 holding register pair.
pub fn eastron_firmware(words: &[u16]) -> Option<String> {
    words.get(1).map(|&w| firmware_version(w))
}

/// Open the TCP client for the internal SPI boards.
pub async fn connect_tcp(config: &ModbusTcpConfig) -> Result<Context, Error> {
    let addr = tokio::net::lookup_host((config.host.as_str(), config.port))
        .await
        .map_err(Error::ModbusConnect)?
        .next()
        .ok_or_else(|| {
            Error::ModbusConnect(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address for {}:{}", config.host, config.port),
            ))
        })?;
    tokio_modbus::client::tcp::connect(addr).await.map_err(Error::ModbusConnect)
}

/// Open the RTU client for the serial extension bus (8 data bits, 1 stop
/// bit, parity per configuration).
pub fn connect_rtu(config: &ModbusSerialConfig) -> Result<Context, Error> {
    let parity = match config.parity.as_str() {
        "E" => tokio_serial::Parity::Even,
        "O" => tokio_serial::Parity::Odd,
        _ => tokio_serial::Parity::None,
    };
    let builder = tokio_serial::new(config.port.as_str(), config.baud_rate)
        .parity(parity)
        .data_bits(tokio_serial::DataBits::Eight)
        .stop_bits(tokio_serial::StopBits::One);
    let port = tokio_serial::SerialStream::open(&builder)
        .map_err(|e| Error::ModbusConnect(std::io::Error::other(e)))?;
    Ok(tokio_modbus::client::rtu::attach(port))
}

/// Probe SPI boards on units 1..=3 and collect the ones that answer.
pub async fn probe_boards(ctx: &mut Context, call_timeout: Duration) -> Vec<Board> {
    info!("{} Reading SPI boards", prefix::MODBUS);

    let mut boards = Vec::new();
    for index in 1..=3u8 {
        ctx.set_slave(Slave(index));
        match timeout(call_timeout, ctx.read_input_registers(1000, 1)).await {
            Ok(Ok(Ok(words))) if !words.is_empty() => {
                let firmware = firmware_version(words[0]);
                info!("{} Found board {} on SPI", prefix::MODBUS, index);
                debug!("{} Firmware version on board {} is {}", prefix::MODBUS, index, firmware);
                boards.push(Board { index, firmware });
            }
            _ => info!("{} No board on SPI {}", prefix::MODBUS, index),
        }
    }
    boards
}

/// Probe each declared RTU extension for its firmware version.
pub async fn probe_extensions(
    ctx: &mut Context,
    hardware: &HardwareMap,
    call_timeout: Duration,
) -> Vec<ProbedExtension> {
    info!("{} Reading extensions", prefix::MODBUS);

    let mut probed = Vec::new();
    for extension in &hardware.extensions {
        info!(
            "{} [RTU] Found device with unit {} (manufacturer: {}, model: {})",
            prefix::MODBUS,
            extension.unit,
            extension.definition.manufacturer,
            extension.definition.model,
        );

        ctx.set_slave(Slave(extension.unit));
        let firmware = match timeout(call_timeout, ctx.read_holding_registers(0xFC02, 2)).await {
            Ok(Ok(Ok(words))) => eastron_firmware(&words),
            _ => {
                warn!(
                    "{} [RTU] No firmware version from unit {}",
                    prefix::MODBUS, extension.unit
                );
                None
            }
        };
        probed.push(ProbedExtension { unit: extension.unit, firmware });
    }
    probed
}

/// Periodic reader for one bus. Owns the Modbus client; applies queued coil
/// writes at the start of every tick, then reads each block into the cache.
pub struct Scanner {
    bus: Bus,
    ctx: Context,
    blocks: Vec<ScanBlock>,
    cache: SharedCache,
    call_timeout: Duration,
    writes: mpsc::Receiver<CoilWrite>,
}

impl Scanner {
    pub fn new(
        bus: Bus,
        ctx: Context,
        blocks: Vec<ScanBlock>,
        cache: SharedCache,
        call_timeout: Duration,
        writes: mpsc::Receiver<CoilWrite>,
    ) -> Self {
        Self { bus, ctx, blocks, cache, call_timeout, writes }
    }

    pub fn bus(&self) -> Bus {
        self.bus
    }

    /// Apply pending writes, then read every block once.
    pub async fn tick(&mut self) {
        self.drain_writes().await;

        for i in 0..self.blocks.len() {
            let block = self.blocks[i];
            self.read_block(block).await;
        }
    }

    /// Apply queued writes without a block scan; used on shutdown so relay
    /// release requests still reach the bus.
    pub async fn flush_writes(&mut self) {
        self.drain_writes().await;
    }

    async fn drain_writes(&mut self) {
        while let Ok(write) = self.writes.try_recv() {
            self.apply_write(write).await;
        }
    }

    async fn apply_write(&mut self, write: CoilWrite) {
        self.ctx.set_slave(Slave(write.unit));
        match timeout(self.call_timeout, self.ctx.write_single_coil(write.coil, write.value)).await
        {
            Ok(Ok(Ok(()))) => {
                debug!(
                    "{} Coil {} set to {} (unit: {}, circuit: {})",
                    prefix::MODBUS, write.coil, write.value, write.unit, write.circuit
                );
            }
            Ok(Ok(Err(exception))) => {
                warn!(
                    "{} Modbus Error: {} on coil write {} (unit: {}, circuit: {})",
                    prefix::MODBUS, exception, write.coil, write.unit, write.circuit
                );
            }
            Ok(Err(error)) => {
                warn!(
                    "{} Error on coil write {} (unit: {}, circuit: {}): {}",
                    prefix::MODBUS, write.coil, write.unit, write.circuit, error
                );
            }
            Err(_) => {
                warn!(
                    "{} Timeout on coil write {} (unit: {}, circuit: {})",
                    prefix::MODBUS, write.coil, write.unit, write.circuit
                );
            }
        }
    }

    async fn read_block(&mut self, block: ScanBlock) {
        self.ctx.set_slave(Slave(block.unit));

        let words: Option<Vec<u16>> = match block.register_type {
            RegisterType::Input => {
                let result =
                    timeout(self.call_timeout, self.ctx.read_input_registers(block.start, block.count))
                        .await;
                unwrap_read(block, result)
            }
            RegisterType::Holding => {
                let result = timeout(
                    self.call_timeout,
                    self.ctx.read_holding_registers(block.start, block.count),
                )
                .await;
                unwrap_read(block, result)
            }
            RegisterType::Coil => {
                let result =
                    timeout(self.call_timeout, self.ctx.read_coils(block.start, block.count)).await;
                unwrap_read(block, result).map(|bits| bits.into_iter().map(u16::from).collect())
            }
        };

        if let Some(words) = words {
            self.cache.lock().unwrap().update_block(self.bus, block.unit, block.start, &words);
        }
    }
}

/// Collapse the timeout/transport/exception nesting of a block read into an
/// optional payload, logging each failure class once.
fn unwrap_read<T, Exc, Err>(
    block: ScanBlock,
    result: Result<Result<Result<Vec<T>, Exc>, Err>, tokio::time::error::Elapsed>,
) -> Option<Vec<T>>
where
    Exc: std::fmt::Display,
    Err: std::fmt::Display,
{
    match result {
        Ok(Ok(Ok(words))) => Some(words),
        Ok(Ok(Err(exception))) => {
            warn!(
                "{} Modbus Error: {} (address: {}, count: {}, unit: {})",
                prefix::MODBUS, exception, block.start, block.count, block.unit
            );
            None
        }
        Ok(Err(error)) => {
            warn!(
                "{} Error on address {} (count: {}, unit: {}): {}",
                prefix::MODBUS, block.start, block.count, block.unit, error
            );
            None
        }
        Err(_) => {
            warn!(
                "{} Timeout on address {} (count: {}, unit: {})",
                prefix::MODBUS, block.start, block.count, block.unit
            );
            None
        }
    }
}
