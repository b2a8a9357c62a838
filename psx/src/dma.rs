//! The DMA controller: seven channels moving words between RAM and devices.
//!
//! The controller only does the register side. When the guest starts a channel its owner is
//! told to begin, it moves the data through a `MemoryHandle` in whatever way suits it (now, later,
//! from another thread) and calls `transfer_complete` when it is done. Writing the start bit
//! back to zero while a transfer is in flight cancels it.

use std::sync::{Arc, Mutex, MutexGuard};

use common::util::ByteMask;
use common::{EnumMap, MakeNamed, Named};

use crate::address_space::MemoryHandle;
use crate::interrupts::{Interrupt, InterruptController};
use crate::registry::{Device, Wiring};
use crate::ConfigError;

pub const DMA_BASE: u32 = 0x1f80_1080;
pub const DPCR: u32 = 0x1f80_10f0;
pub const DICR: u32 = 0x1f80_10f4;

const CHCR_START: u32 = 1 << 24;
const CHCR_TRIGGER: u32 = 1 << 28;
const DICR_FORCE: u32 = 1 << 15;
const DICR_MASTER_ENABLE: u32 = 1 << 23;
const DICR_MASTER_FLAG: u32 = 1 << 31;
const DICR_WRITABLE: u32 = 0x00ff_803f;
const DICR_FLAGS: u32 = 0x7f00_0000;

#[derive(Named, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaChannel {
    #[named(name = "mdec-in")]
    MdecIn,
    #[named(name = "mdec-out")]
    MdecOut,
    Gpu,
    Cdrom,
    Spu,
    Pio,
    #[named(name = "gpu-otc")]
    Otc,
}

impl DmaChannel {
    pub fn index(self) -> usize {
        self.into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToDevice,
    FromDevice,
}

/// A transfer as the guest programmed it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub channel: DmaChannel,
    pub direction: Direction,
    /// RAM address of the first word
    pub address: u32,
    /// True if the address counts down between words
    pub backwards: bool,
    pub sync_mode: u32,
    pub block_size: u32,
    pub block_count: u32,
}

impl Transfer {
    /// Words moved by a block or manual transfer. Linked list transfers are sized by the list.
    pub fn words(&self) -> u32 {
        match self.sync_mode {
            0 => if self.block_size == 0 { 0x1_0000 } else { self.block_size },
            1 => self.block_size * self.block_count,
            _ => 0,
        }
    }

    /// RAM address of word `index`
    pub fn word_address(&self, index: u32) -> u32 {
        let step = index.wrapping_mul(4);
        let address = if self.backwards { self.address.wrapping_sub(step) } else { self.address.wrapping_add(step) };
        address & 0x1f_fffc
    }
}

/// The device side of a DMA channel
pub trait DmaOwner: Send + Sync {
    fn begin_to_device(&self, dma: &Arc<DmaController>, transfer: Transfer);
    fn begin_from_device(&self, dma: &Arc<DmaController>, transfer: Transfer);
    fn cancel(&self, channel: DmaChannel);
}

#[derive(Default, Clone, Copy)]
struct ChannelRegs {
    madr: u32,
    bcr: u32,
    chcr: u32,
}

struct Registers {
    channels: [ChannelRegs; 7],
    /// Handed to an owner and not yet completed
    active: [bool; 7],
    dpcr: u32,
    dicr: u32,
}

pub struct DmaController {
    regs: Mutex<Registers>,
    owners: Mutex<EnumMap<Option<(String, Arc<dyn DmaOwner>)>, DmaChannel>>,
    memory: MemoryHandle,
    interrupts: Arc<InterruptController>,
}

/// Master flag as the hardware computes it
fn master_flag(dicr: u32) -> bool {
    let enabled = (dicr >> 16) & 0x7f;
    let flags = (dicr >> 24) & 0x7f;
    dicr & DICR_FORCE != 0 || (dicr & DICR_MASTER_ENABLE != 0 && enabled & flags != 0)
}

fn with_master_flag(dicr: u32) -> u32 {
    if master_flag(dicr) { dicr | DICR_MASTER_FLAG } else { dicr & !DICR_MASTER_FLAG }
}

enum Action {
    Begin(Arc<dyn DmaOwner>, Transfer),
    Cancel(Arc<dyn DmaOwner>, DmaChannel),
}

impl DmaController {
    pub fn new(memory: MemoryHandle, interrupts: Arc<InterruptController>) -> Arc<Self> {
        Arc::new(DmaController {
            regs: Mutex::new(Registers {
                channels: [ChannelRegs::default(); 7],
                active: [false; 7],
                dpcr: 0x0765_4321,
                dicr: 0,
            }),
            owners: Mutex::new(EnumMap::new()),
            memory,
            interrupts,
        })
    }

    pub fn memory(&self) -> &MemoryHandle {
        &self.memory
    }

    pub fn register_channel(&self, channel: DmaChannel, name: &str, owner: Arc<dyn DmaOwner>) -> Result<(), ConfigError> {
        let mut owners = self.owners.lock().expect("DMA owners poisoned");
        if let Some((existing, _)) = &owners[channel] {
            return Err(ConfigError::DuplicateDmaOwner { channel: channel.name(), owner: existing.clone() });
        }
        owners[channel] = Some((name.to_owned(), owner));
        Ok(())
    }

    /// Called by a channel owner when its transfer is done. Raises the DMA interrupt if asked to
    /// and the guest enabled it for the channel.
    pub fn transfer_complete(&self, channel: DmaChannel, interrupt: bool) {
        let raise = {
            let mut regs = self.lock();
            regs.channels[channel.index()].chcr &= !(CHCR_START | CHCR_TRIGGER);
            regs.active[channel.index()] = false;
            let enabled = regs.dicr & (1 << (16 + channel.index())) != 0;
            if interrupt && enabled {
                let before = master_flag(regs.dicr);
                regs.dicr = with_master_flag(regs.dicr | 1 << (24 + channel.index()));
                !before && master_flag(regs.dicr)
            } else {
                false
            }
        };
        tracing::trace!("DMA {} complete", channel.name());
        if raise {
            self.interrupts.raise_interrupt(Interrupt::Dma);
        }
    }

    pub fn is_busy(&self, channel: DmaChannel) -> bool {
        self.lock().channels[channel.index()].chcr & CHCR_START != 0
    }

    pub fn read_register(&self, address: u32) -> u32 {
        let regs = self.lock();
        match address {
            DPCR => regs.dpcr,
            DICR => regs.dicr,
            _ => {
                let (index, register) = channel_register(address);
                let channel = &regs.channels[index];
                match register {
                    0 => channel.madr,
                    4 => channel.bcr,
                    8 => channel.chcr,
                    _ => 0,
                }
            }
        }
    }

    pub fn write_register(self: &Arc<Self>, address: u32, value: u32, mask: ByteMask) {
        let action = {
            let mut regs = self.lock();
            match address {
                DPCR => {
                    mask.masked_insert(&mut regs.dpcr, value);
                    None
                }
                DICR => {
                    let mut dicr = regs.dicr;
                    mask.masked_insert(&mut dicr, value);
                    // Flags are cleared by writing ones
                    let acked = mask.apply(value) & DICR_FLAGS;
                    let flags = regs.dicr & DICR_FLAGS & !acked;
                    regs.dicr = with_master_flag((dicr & DICR_WRITABLE) | flags);
                    None
                }
                _ => {
                    let (index, register) = channel_register(address);
                    let channel_enabled = regs.dpcr & (8 << (index * 4)) != 0;
                    let channel = &mut regs.channels[index];
                    match register {
                        0 => {
                            mask.masked_insert(&mut channel.madr, value);
                            channel.madr &= 0x00ff_ffff;
                            None
                        }
                        4 => {
                            mask.masked_insert(&mut channel.bcr, value);
                            None
                        }
                        8 => {
                            let was_busy = channel.chcr & CHCR_START != 0;
                            mask.masked_insert(&mut channel.chcr, value);
                            let busy = channel.chcr & CHCR_START != 0;
                            let transfer = decode_transfer(DmaChannel::from(index), channel);
                            let active = regs.active[index];
                            match (was_busy, busy) {
                                (false, true) if channel_enabled => {
                                    let owner = self.owner(transfer.channel);
                                    regs.active[index] = owner.is_some();
                                    owner.map(|owner| Action::Begin(owner, transfer))
                                }
                                (true, false) if active => {
                                    regs.active[index] = false;
                                    self.owner(transfer.channel).map(|owner| Action::Cancel(owner, transfer.channel))
                                }
                                _ => None,
                            }
                        }
                        _ => None,
                    }
                }
            }
        };

        // Owners may complete straight away, which takes the lock again
        match action {
            Some(Action::Begin(owner, transfer)) => {
                tracing::trace!("DMA {} begin {:?}", transfer.channel.name(), transfer);
                match transfer.direction {
                    Direction::ToDevice => owner.begin_to_device(self, transfer),
                    Direction::FromDevice => owner.begin_from_device(self, transfer),
                }
            }
            Some(Action::Cancel(owner, channel)) => {
                tracing::debug!("DMA {} cancelled", channel.name());
                owner.cancel(channel);
            }
            None => {}
        }
    }

    fn owner(&self, channel: DmaChannel) -> Option<Arc<dyn DmaOwner>> {
        let owner = self.owners.lock().expect("DMA owners poisoned")[channel].as_ref().map(|(_, owner)| owner.clone());
        if owner.is_none() {
            tracing::warn!("DMA {} started with no owner", channel.name());
        }
        owner
    }

    fn lock(&self) -> MutexGuard<'_, Registers> {
        self.regs.lock().expect("DMA registers poisoned")
    }
}

/// Channel index and register offset of a channel register address
fn channel_register(address: u32) -> (usize, u32) {
    let offset = address.wrapping_sub(DMA_BASE);
    (((offset >> 4) as usize).min(6), offset & 0xc)
}

fn decode_transfer(channel: DmaChannel, regs: &ChannelRegs) -> Transfer {
    Transfer {
        channel,
        direction: if regs.chcr & 1 != 0 { Direction::ToDevice } else { Direction::FromDevice },
        address: regs.madr & 0x1f_fffc,
        backwards: regs.chcr & 2 != 0,
        sync_mode: (regs.chcr >> 9) & 3,
        block_size: regs.bcr & 0xffff,
        block_count: regs.bcr >> 16,
    }
}

impl Device for DmaController {
    fn attach(self: Arc<Self>, wiring: &mut Wiring<'_>) -> Result<(), ConfigError> {
        let addresses = (0..7u32)
            .flat_map(|channel| [0, 4, 8].map(|register| DMA_BASE + channel * 0x10 + register))
            .chain([DPCR, DICR]);
        for address in addresses {
            let dma = self.clone();
            wiring.address_space.register_read32_callback(address, true, move |address| dma.read_register(address))?;
            let dma = self.clone();
            wiring.address_space.register_write32_callback(address, true, move |address, value, mask| {
                dma.write_register(address, value, mask)
            })?;
        }
        wiring.interrupts.register_owner(Interrupt::Dma, "dma")?;
        self.register_channel(DmaChannel::Otc, "gpu-otc", Arc::new(OrderingTableClear))?;
        Ok(())
    }
}

/// Channel 6: fills RAM with an empty GPU ordering table, a linked list running backwards from
/// the start address with the end marker in the last word.
pub struct OrderingTableClear;

impl DmaOwner for OrderingTableClear {
    fn begin_to_device(&self, dma: &Arc<DmaController>, transfer: Transfer) {
        tracing::warn!("GPU-OTC only transfers to RAM");
        dma.transfer_complete(transfer.channel, false);
    }

    fn begin_from_device(&self, dma: &Arc<DmaController>, transfer: Transfer) {
        let words = transfer.words();
        let backwards = Transfer { backwards: true, ..transfer };
        for index in 0..words {
            let address = backwards.word_address(index);
            let link = if index + 1 == words { 0x00ff_ffff } else { address.wrapping_sub(4) & 0x1f_ffff };
            if let Err(e) = dma.memory().internal_write32(address, link) {
                tracing::warn!("GPU-OTC write failed: {}", e);
                break;
            }
        }
        dma.transfer_complete(transfer.channel, true);
    }

    fn cancel(&self, _channel: DmaChannel) {
        // Finishes synchronously, nothing is ever in flight
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use r3000::InterruptHandle;
    use timing::Rendezvous;

    use super::*;
    use crate::address_space::{AddressSpace, PollConfig};

    fn controller() -> (AddressSpace, Arc<InterruptController>, Arc<DmaController>) {
        let rendezvous = Arc::new(Rendezvous::new());
        let space = AddressSpace::new(PollConfig::default(), rendezvous.clone());
        let ic = InterruptController::new(rendezvous, InterruptHandle::new());
        let dma = DmaController::new(space.memory(), ic.clone());
        (space, ic, dma)
    }

    #[test]
    fn ordering_table_clear() {
        let (_space, ic, dma) = controller();
        dma.register_channel(DmaChannel::Otc, "gpu-otc", Arc::new(OrderingTableClear)).unwrap();
        dma.write_register(DPCR, 0x0800_0000, ByteMask::WORD);
        dma.write_register(DICR, (1 << 23) | (1 << 22), ByteMask::WORD);
        dma.write_register(0x1f80_10e0, 0x100c, ByteMask::WORD);
        dma.write_register(0x1f80_10e4, 4, ByteMask::WORD);
        dma.write_register(0x1f80_10e8, 0x1100_0002, ByteMask::WORD);

        let memory = dma.memory();
        assert_eq!(memory.internal_read32(0x100c), Ok(0x1008));
        assert_eq!(memory.internal_read32(0x1008), Ok(0x1004));
        assert_eq!(memory.internal_read32(0x1004), Ok(0x1000));
        assert_eq!(memory.internal_read32(0x1000), Ok(0x00ff_ffff));

        assert!(!dma.is_busy(DmaChannel::Otc));
        assert_eq!(dma.read_register(DICR) >> 24, 0xc0);
        assert_eq!(ic.stat(), Interrupt::Dma.bit());

        // Writing the flag back acknowledges it and drops the master flag
        dma.write_register(DICR, (1 << 23) | (1 << 22) | (1 << 30), ByteMask::WORD);
        assert_eq!(dma.read_register(DICR) >> 24, 0);
    }

    struct Recorder {
        cancelled: AtomicU32,
        started: Mutex<Vec<Transfer>>,
    }

    impl DmaOwner for Recorder {
        fn begin_to_device(&self, _dma: &Arc<DmaController>, transfer: Transfer) {
            self.started.lock().unwrap().push(transfer);
        }

        fn begin_from_device(&self, _dma: &Arc<DmaController>, transfer: Transfer) {
            self.started.lock().unwrap().push(transfer);
        }

        fn cancel(&self, _channel: DmaChannel) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn disabled_channels_do_not_start_and_clearing_start_cancels() {
        let (_space, _ic, dma) = controller();
        let gpu = Arc::new(Recorder { cancelled: AtomicU32::new(0), started: Mutex::new(Vec::new()) });
        dma.register_channel(DmaChannel::Gpu, "gpu", gpu.clone()).unwrap();

        dma.write_register(DPCR, 0, ByteMask::WORD);
        dma.write_register(0x1f80_10a8, 0x0100_0201, ByteMask::WORD);
        assert!(gpu.started.lock().unwrap().is_empty());
        dma.write_register(0x1f80_10a8, 0, ByteMask::WORD);

        dma.write_register(DPCR, 0x800, ByteMask::WORD);
        dma.write_register(0x1f80_10a0, 0x8000_2000, ByteMask::WORD);
        dma.write_register(0x1f80_10a4, 0x0004_0010, ByteMask::WORD);
        dma.write_register(0x1f80_10a8, 0x0100_0201, ByteMask::WORD);
        let transfer = gpu.started.lock().unwrap()[0];
        assert_eq!(transfer.direction, Direction::ToDevice);
        assert_eq!(transfer.address, 0x2000);
        assert_eq!(transfer.words(), 0x40);
        assert!(dma.is_busy(DmaChannel::Gpu));

        dma.write_register(0x1f80_10a8, 0x201, ByteMask::WORD);
        assert_eq!(gpu.cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn channels_have_one_owner() {
        let (_space, _ic, dma) = controller();
        dma.register_channel(DmaChannel::Spu, "spu", Arc::new(OrderingTableClear)).unwrap();
        assert!(matches!(
            dma.register_channel(DmaChannel::Spu, "other", Arc::new(OrderingTableClear)),
            Err(ConfigError::DuplicateDmaOwner { channel: "spu", .. })));
    }
}
