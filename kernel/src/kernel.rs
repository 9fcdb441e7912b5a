//! The kernel value
//!
//! Every process-wide singleton -- coremap, TLB, swap manager, process
//! table, VFS and loader seams -- hangs off one [`Kernel`] constructed at
//! boot. Nothing in the core reaches for ambient globals; the trap glue
//! passes the kernel (and the current process) into every entry point.

use alloc::sync::Arc;

use crate::{
    error::Errno,
    fs::{FileSystem, Vnode},
    mm::{addrspace::AddressSpace, coremap::Coremap, swap::SwapManager, tlb::Tlb, PhysicalAddress},
    process::{loader::ProgramLoader, Process, ProcessTable},
};

/// Everything boot must supply.
pub struct KernelConfig {
    /// First physical address the coremap may manage.
    pub ram_first_free: PhysicalAddress,
    /// One past the last manageable physical address.
    pub ram_last: PhysicalAddress,
    /// Raw swap device, if the platform has one. `None` disables paging
    /// to disk; the frame allocator then fails under pressure.
    pub swap_device: Option<Arc<dyn Vnode>>,
    /// The virtual filesystem.
    pub filesystem: Arc<dyn FileSystem>,
    /// The program loader `execv` uses.
    pub loader: Arc<dyn ProgramLoader>,
}

/// The kernel.
pub struct Kernel {
    pub coremap: Coremap,
    pub tlb: Tlb,
    pub swap: SwapManager,
    pub procs: ProcessTable,
    pub vfs: Arc<dyn FileSystem>,
    pub loader: Arc<dyn ProgramLoader>,
}

impl Kernel {
    /// Bring the VM system up: size the coremap, probe the swap device,
    /// and mark the allocator live.
    pub fn bootstrap(config: KernelConfig) -> Kernel {
        let coremap = Coremap::bootstrap(config.ram_first_free, config.ram_last);
        let swap = SwapManager::bootstrap(config.swap_device);
        coremap.set_booted();
        log::info!(
            "kernel: vm live, {} frames, swap {}",
            coremap.frame_count(),
            if swap.enabled() { "enabled" } else { "disabled" }
        );
        Kernel {
            coremap,
            tlb: Tlb::new(),
            swap,
            procs: ProcessTable::new(),
            vfs: config.filesystem,
            loader: config.loader,
        }
    }

    /// Create a top-level user process: fresh address space with a heap,
    /// standard descriptors opened on the console, working directory at
    /// the root.
    pub fn create_user_process(&self) -> Result<Arc<Process>, Errno> {
        let process = self.procs.spawn(None)?;
        if let Err(errno) = process.files.init_std(&*self.vfs) {
            self.procs.remove(process.pid);
            return Err(errno);
        }
        process.set_address_space(Some(AddressSpace::new(true)));
        Ok(process)
    }
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod test_support {
    //! Shared boot fixture for unit and integration tests.

    use alloc::sync::Arc;

    use super::{Kernel, KernelConfig};
    use crate::{
        fs::ramfs::{RamDisk, RamFs},
        mm::{PhysicalAddress, PAGE_SIZE},
        process::loader::FlatBinaryLoader,
    };

    /// Boot a kernel over `ram_bytes` of physical memory and a RAM-backed
    /// swap area of `swap_pages` pages (0 disables swapping).
    pub fn boot_kernel(ram_bytes: usize, swap_pages: usize) -> (Arc<Kernel>, Arc<RamFs>) {
        let fs = RamFs::new();
        let swap_device: Option<Arc<dyn crate::fs::Vnode>> = if swap_pages > 0 {
            Some(Arc::new(RamDisk::new(swap_pages * PAGE_SIZE)))
        } else {
            None
        };
        let kernel = Kernel::bootstrap(KernelConfig {
            ram_first_free: PhysicalAddress::new(0x0100_0000),
            ram_last: PhysicalAddress::new(0x0100_0000 + ram_bytes as u64),
            swap_device,
            filesystem: fs.clone(),
            loader: Arc::new(FlatBinaryLoader),
        });
        (Arc::new(kernel), fs)
    }
}
