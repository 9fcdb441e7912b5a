//! Program loader seam
//!
//! `execv` hands the opened program vnode to a [`ProgramLoader`] and gets
//! back the entry point; what happens in between (ELF parsing, segment
//! layout) is the loader's business. The crate ships
//! [`FlatBinaryLoader`], which maps a raw image at the conventional text
//! base; the platform install its ELF loader here.

use alloc::{sync::Arc, vec};

use crate::{
    error::Errno,
    fs::Vnode,
    kernel::Kernel,
    mm::{usercopy, SegmentPerms, VirtualAddress, PAGE_SIZE},
    process::Process,
};

/// Conventional base address of the text image.
pub const TEXT_BASE: u64 = 0x0040_0000;

/// Loads an executable image into the current (already activated)
/// address space of `proc` and reports the entry point.
pub trait ProgramLoader: Send + Sync {
    fn load(
        &self,
        kernel: &Kernel,
        proc: &Arc<Process>,
        vnode: &Arc<dyn Vnode>,
    ) -> Result<VirtualAddress, Errno>;
}

/// Raw-image loader: the whole file becomes one read/execute segment at
/// [`TEXT_BASE`], entry at its first byte.
pub struct FlatBinaryLoader;

impl ProgramLoader for FlatBinaryLoader {
    fn load(
        &self,
        kernel: &Kernel,
        proc: &Arc<Process>,
        vnode: &Arc<dyn Vnode>,
    ) -> Result<VirtualAddress, Errno> {
        let stat = vnode.stat()?;
        if stat.size == 0 {
            return Err(Errno::Einval);
        }
        let size = stat.size as usize;
        let aspace = proc.address_space().ok_or(Errno::Efault)?;

        let pages = size.div_ceil(PAGE_SIZE);
        aspace.define_region(
            VirtualAddress::new(TEXT_BASE),
            pages * PAGE_SIZE,
            SegmentPerms::READ | SegmentPerms::EXEC,
        )?;

        // Stream the image through the user-copy boundary one page at a
        // time; the first touch of each page allocates it.
        let mut buffer = vec![0u8; PAGE_SIZE];
        let mut copied = 0usize;
        while copied < size {
            let wanted = (size - copied).min(PAGE_SIZE);
            let got = vnode.read_at(copied as u64, &mut buffer[..wanted])?;
            if got == 0 {
                return Err(Errno::Eio);
            }
            usercopy::copyout(
                kernel,
                proc,
                &buffer[..got],
                VirtualAddress::new(TEXT_BASE + copied as u64),
            )?;
            copied += got;
        }
        Ok(VirtualAddress::new(TEXT_BASE))
    }
}
