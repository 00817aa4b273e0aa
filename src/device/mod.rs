//! Device manager: a fixed `(name, instance) -> open fn` registry,
//! dispatched with a linear scan, plus the tagged `DeviceIo` variant that
//! `crate::io::IoKind::Device` wraps.
//!
//! Device-specific protocol detail (UART register layout, VirtIO queue
//! mechanics, RTC register offsets) is out of the core's scope;
//! what lives here is only the contract the rest of the kernel consumes:
//! `devopen` hands back an `IoRef`, and a claimed PLIC source is routed to
//! the owning driver's ISR by `dispatch_irq`.

pub mod rtc;
pub mod uart;
pub mod virtio;
pub mod virtio_blk;
pub mod virtio_rng;

use crate::io::{IoKind, IoObject, IoRef};
use crate::lib::error::{KernelError, KResult};

const MAX_DEVICES: usize = 8;

type OpenFn = fn(instance: u32) -> KResult<IoRef>;

struct Registration {
    name: &'static str,
    instance: u32,
    open: OpenFn,
    irq: u32,
}

struct Registry {
    entries: [Option<Registration>; MAX_DEVICES],
    count: usize,
}

static mut REGISTRY: Registry = Registry {
    entries: [const { None }; MAX_DEVICES],
    count: 0,
};

/// Device-specific I/O endpoints, one arm per driver (the same tagged-variant
/// shape `io::IoKind` uses one level up).
pub enum DeviceIo {
    Uart(uart::UartIo),
    Rtc(rtc::RtcIo),
    VirtioBlk(virtio_blk::BlkIo),
    VirtioRng(virtio_rng::RngIo),
}

impl DeviceIo {
    pub fn read(&mut self, buf: &mut [u8]) -> KResult<usize> {
        match self {
            DeviceIo::Uart(d) => d.read(buf),
            DeviceIo::Rtc(d) => d.read(buf),
            DeviceIo::VirtioRng(d) => d.read(buf),
            DeviceIo::VirtioBlk(_) => Err(KernelError::Unsupported),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> KResult<usize> {
        match self {
            DeviceIo::Uart(d) => d.write(buf),
            _ => Err(KernelError::Unsupported),
        }
    }

    pub fn readat(&mut self, pos: u64, buf: &mut [u8]) -> KResult<usize> {
        match self {
            DeviceIo::VirtioBlk(d) => d.readat(pos, buf),
            _ => Err(KernelError::Unsupported),
        }
    }

    pub fn writeat(&mut self, pos: u64, buf: &[u8]) -> KResult<usize> {
        match self {
            DeviceIo::VirtioBlk(d) => d.writeat(pos, buf),
            _ => Err(KernelError::Unsupported),
        }
    }

    pub fn cntl(&mut self, cmd: i64, arg: i64) -> KResult<i64> {
        match self {
            DeviceIo::VirtioBlk(d) => d.cntl(cmd, arg),
            _ => match cmd {
                crate::io::CNTL_GETBLKSZ => Ok(1),
                _ => Err(KernelError::Unsupported),
            },
        }
    }
}

fn registry() -> &'static mut Registry {
    unsafe { &mut *core::ptr::addr_of_mut!(REGISTRY) }
}

/// Add `(name, instance)` to the registry, mapping it to an open function.
/// Called once per driver instance at boot.
pub fn register(name: &'static str, instance: u32, irq: u32, open: OpenFn) {
    let r = registry();
    if r.count >= MAX_DEVICES {
        crate::warn!("device: registry full, dropping {}#{}", name, instance);
        return;
    }
    r.entries[r.count] = Some(Registration { name, instance, open, irq });
    r.count += 1;
    crate::info!("device: registered {}#{}", name, instance);
}

/// `devopen(name, instance)` syscall backing: a linear scan over the
/// registered devices for a matching name/instance pair.
pub fn open(name: &str, instance: u32) -> KResult<IoRef> {
    let r = registry();
    for slot in r.entries[..r.count].iter().flatten() {
        if slot.name == name && slot.instance == instance {
            return (slot.open)(instance);
        }
    }
    Err(KernelError::NoSuchEntry)
}

/// Route a claimed PLIC source to the owning driver's ISR.
pub fn dispatch_irq(irq: u32) {
    let r = registry();
    for slot in r.entries[..r.count].iter().flatten() {
        if slot.irq == irq {
            match slot.name {
                "uart" => uart::isr(),
                "vioblk" => virtio_blk::isr(slot.instance),
                "rng" => virtio_rng::isr(slot.instance),
                _ => {}
            }
            return;
        }
    }
    crate::warn!("device: unclaimed irq {}", irq);
}

pub fn new_io(kind: DeviceIo) -> IoRef {
    IoObject::new(IoKind::Device(kind))
}

/// Probe and register every device this kernel drives, in boot order: UART
/// first (console needs it immediately), then RTC and the VirtIO slots
/// discovered by `virtio::probe_all`.
pub fn init() {
    uart::init();
    register("uart", 0, crate::arch::riscv64::plic::UART0_IRQ, |_| {
        Ok(new_io(DeviceIo::Uart(uart::UartIo::new())))
    });

    rtc::init();
    register("rtc", 0, 0, |_| Ok(new_io(DeviceIo::Rtc(rtc::RtcIo::new()))));

    virtio::probe_all();
}
