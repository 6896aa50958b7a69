#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
extern crate alloc;

#[cfg(target_os = "none")]
mod boot {
    use alloc::vec::Vec;

    use lazy_static::lazy_static;
    use limine::memory_map::EntryType;
    use limine::request::{
        HhdmRequest, MemoryMapRequest, RequestsEndMarker, RequestsStartMarker,
    };
    use limine::BaseRevision;

    use ferrite::memory::{self, MemoryRegion, MemoryRegionKind};
    use ferrite::sync::Mutex;
    use ferrite::{arch, idle_loop, interrupts, logging, sched, serial_println, time};

    #[used]
    #[link_section = ".requests"]
    static BASE_REVISION: BaseRevision = BaseRevision::new();

    #[used]
    #[link_section = ".requests"]
    static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

    #[used]
    #[link_section = ".requests"]
    static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

    #[used]
    #[link_section = ".requests_start_marker"]
    static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

    #[used]
    #[link_section = ".requests_end_marker"]
    static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

    lazy_static! {
        static ref CONSOLE_LOCK: Mutex = Mutex::new();
    }

    #[no_mangle]
    extern "C" fn kmain() -> ! {
        assert!(BASE_REVISION.is_supported());

        logging::init();
        log::info!("booting");

        let hhdm = HHDM_REQUEST.get_response().expect("HHDM request failed");
        let memory_map = MEMORY_MAP_REQUEST
            .get_response()
            .expect("memory map request failed");

        // Allocators work on HHDM virtual addresses so every granted
        // page is directly writable.
        let offset = hhdm.offset() as usize;
        let regions: Vec<MemoryRegion> = memory_map
            .entries()
            .iter()
            .map(|entry| MemoryRegion {
                base: offset + entry.base as usize,
                length: entry.length as usize,
                kind: if entry.entry_type == EntryType::USABLE {
                    MemoryRegionKind::Usable
                } else {
                    MemoryRegionKind::Reserved
                },
            })
            .collect();

        unsafe { memory::init(&regions, offset) };
        interrupts::init();
        sched::init("main");
        time::init();

        sched::spawn(ping, "ping");
        sched::spawn(pong, "pong");

        arch::enable_interrupts();
        log::info!("entering idle loop");
        idle_loop();
    }

    fn ping() {
        loop {
            CONSOLE_LOCK.lock();
            serial_println!("ping @ tick {}", time::now_ticks());
            CONSOLE_LOCK.unlock();
            time::sleep(500);
        }
    }

    fn pong() {
        loop {
            CONSOLE_LOCK.lock();
            serial_println!("pong @ tick {}", time::now_ticks());
            CONSOLE_LOCK.unlock();
            time::sleep(750);
        }
    }

    #[panic_handler]
    fn rust_panic(info: &core::panic::PanicInfo) -> ! {
        arch::disable_interrupts();
        serial_println!("Kernel panic: {}", info);
        loop {
            arch::halt();
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
