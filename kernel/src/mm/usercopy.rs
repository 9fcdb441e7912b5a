//! Checked copies across the user/kernel boundary
//!
//! Syscalls never dereference user pointers directly: all traffic goes
//! through `copyin`/`copyout` and the string variants. Each page touched
//! is faulted in through the ordinary [`vm_fault`] path (so demand paging
//! and swap-in just work) and then pinned with its busy lock for the
//! duration of the byte copy. A pointer outside a resident user segment
//! surfaces as `EFAULT`.

use alloc::{string::String, sync::Arc, vec::Vec};

use super::{fault::vm_fault, FaultKind, VirtualAddress, PAGE_SIZE, USER_SPACE_TOP};
use crate::{error::Errno, kernel::Kernel, process::Process};

/// Reject ranges that leave user space or wrap.
fn check_user_range(uaddr: VirtualAddress, len: usize) -> Result<(), Errno> {
    let end = uaddr
        .as_u64()
        .checked_add(len as u64)
        .ok_or(Errno::Efault)?;
    if end > USER_SPACE_TOP {
        return Err(Errno::Efault);
    }
    Ok(())
}

/// Fault in the page containing `uaddr`, pin it, and run `f` over its
/// frame contents. The fault uses the unaligned address (segments need
/// not start on a page boundary); the page-table lookup uses the aligned
/// one. Retries if the page is evicted between the fault and the pin.
fn with_user_page<R>(
    kernel: &Kernel,
    proc: &Arc<Process>,
    uaddr: VirtualAddress,
    kind: FaultKind,
    f: impl FnOnce(&mut [u8]) -> R,
) -> Result<R, Errno> {
    let page_vaddr = uaddr.page_align_down();
    let mut f = Some(f);
    loop {
        vm_fault(kernel, Some(proc), kind, uaddr).map_err(|fault| fault.errno())?;

        let aspace = proc.address_space().ok_or(Errno::Efault)?;
        let segment = aspace.find_segment(uaddr).ok_or(Errno::Efault)?;
        let page = segment.lookup_page(page_vaddr).ok_or(Errno::Efault)?;

        page.busy().acquire();
        if let Some(paddr) = page.resident_paddr() {
            let func = f.take().expect("copy closure consumed once");
            let result = kernel.coremap.with_frame(paddr, func);
            page.busy().release();
            return Ok(result);
        }
        // Swapped out between the fault and the pin; fault it back.
        page.busy().release();
    }
}

/// Copy `dst.len()` bytes from user address `uaddr` into the kernel.
pub fn copyin(
    kernel: &Kernel,
    proc: &Arc<Process>,
    uaddr: VirtualAddress,
    dst: &mut [u8],
) -> Result<(), Errno> {
    check_user_range(uaddr, dst.len())?;
    let mut copied = 0usize;
    while copied < dst.len() {
        let addr = uaddr.add(copied as u64);
        let offset = addr.page_offset();
        let chunk = (PAGE_SIZE - offset).min(dst.len() - copied);
        let range = copied..copied + chunk;
        let dst_chunk = &mut dst[range];
        with_user_page(kernel, proc, addr, FaultKind::Read, |frame| {
            dst_chunk.copy_from_slice(&frame[offset..offset + chunk]);
        })?;
        copied += chunk;
    }
    Ok(())
}

/// Copy `src` out to user address `uaddr`.
pub fn copyout(
    kernel: &Kernel,
    proc: &Arc<Process>,
    src: &[u8],
    uaddr: VirtualAddress,
) -> Result<(), Errno> {
    check_user_range(uaddr, src.len())?;
    let mut copied = 0usize;
    while copied < src.len() {
        let addr = uaddr.add(copied as u64);
        let offset = addr.page_offset();
        let chunk = (PAGE_SIZE - offset).min(src.len() - copied);
        let src_chunk = &src[copied..copied + chunk];
        with_user_page(kernel, proc, addr, FaultKind::Write, |frame| {
            frame[offset..offset + chunk].copy_from_slice(src_chunk);
        })?;
        copied += chunk;
    }
    Ok(())
}

/// Copy a NUL-terminated string in from user space, bounded by `maxlen`
/// bytes including the terminator. A missing terminator within the bound
/// is `E2BIG`; callers at the path boundary fold that into `EFAULT`.
pub fn copyinstr(
    kernel: &Kernel,
    proc: &Arc<Process>,
    uaddr: VirtualAddress,
    maxlen: usize,
) -> Result<String, Errno> {
    let mut bytes: Vec<u8> = Vec::new();
    let mut scanned = 0usize;
    'pages: while scanned < maxlen {
        let addr = uaddr.add(scanned as u64);
        check_user_range(addr, 1)?;
        let offset = addr.page_offset();
        let chunk = (PAGE_SIZE - offset).min(maxlen - scanned);

        let (copied, terminated) =
            with_user_page(kernel, proc, addr, FaultKind::Read, |frame| {
                let window = &frame[offset..offset + chunk];
                match window.iter().position(|&b| b == 0) {
                    Some(nul) => (window[..nul].to_vec(), true),
                    None => (window.to_vec(), false),
                }
            })?;
        bytes.extend_from_slice(&copied);
        if terminated {
            break 'pages;
        }
        scanned += chunk;
        if scanned >= maxlen {
            return Err(Errno::E2big);
        }
    }
    String::from_utf8(bytes).map_err(|_| Errno::Einval)
}

/// Copy a string (plus NUL) out to user space, bounded by `maxlen`.
pub fn copyoutstr(
    kernel: &Kernel,
    proc: &Arc<Process>,
    s: &str,
    uaddr: VirtualAddress,
    maxlen: usize,
) -> Result<(), Errno> {
    if s.len() + 1 > maxlen {
        return Err(Errno::E2big);
    }
    copyout(kernel, proc, s.as_bytes(), uaddr)?;
    copyout(kernel, proc, &[0u8], uaddr.add(s.len() as u64))
}

/// Copy one scalar in (target byte order).
pub fn copyin_u32(
    kernel: &Kernel,
    proc: &Arc<Process>,
    uaddr: VirtualAddress,
) -> Result<u32, Errno> {
    let mut bytes = [0u8; 4];
    copyin(kernel, proc, uaddr, &mut bytes)?;
    Ok(u32::from_ne_bytes(bytes))
}

/// Copy one scalar out (target byte order).
pub fn copyout_u32(
    kernel: &Kernel,
    proc: &Arc<Process>,
    value: u32,
    uaddr: VirtualAddress,
) -> Result<(), Errno> {
    copyout(kernel, proc, &value.to_ne_bytes(), uaddr)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::kernel::test_support::boot_kernel;
    use crate::mm::SegmentPerms;

    fn proc_with_buffer(kernel: &Kernel) -> (Arc<Process>, VirtualAddress) {
        let process = kernel
            .create_user_process()
            .expect("process creation should succeed");
        let base = VirtualAddress::new(0x1000_0000);
        process
            .address_space()
            .expect("aspace")
            .define_region(base, 8 * PAGE_SIZE, SegmentPerms::rw())
            .expect("region definition");
        (process, base)
    }

    #[test]
    fn round_trip_within_one_page() {
        let (kernel, _fs) = boot_kernel(512 * 1024, 0);
        let (process, base) = proc_with_buffer(&kernel);

        copyout(&kernel, &process, b"orcinus", base.add(100)).expect("copyout");
        let mut read_back = [0u8; 7];
        copyin(&kernel, &process, base.add(100), &mut read_back).expect("copyin");
        assert_eq!(&read_back, b"orcinus");
    }

    #[test]
    fn round_trip_across_page_boundary() {
        let (kernel, _fs) = boot_kernel(512 * 1024, 0);
        let (process, base) = proc_with_buffer(&kernel);

        let data: Vec<u8> = (0..PAGE_SIZE + 100).map(|i| (i % 251) as u8).collect();
        let start = base.add(PAGE_SIZE as u64 - 50);
        copyout(&kernel, &process, &data, start).expect("straddling copyout");
        let mut read_back = alloc::vec![0u8; data.len()];
        copyin(&kernel, &process, start, &mut read_back).expect("straddling copyin");
        assert_eq!(read_back, data);
    }

    #[test]
    fn unmapped_and_kernel_pointers_fault() {
        let (kernel, _fs) = boot_kernel(512 * 1024, 0);
        let (process, _base) = proc_with_buffer(&kernel);

        let mut buf = [0u8; 4];
        let unmapped = copyin(&kernel, &process, VirtualAddress::new(0x7500_0000), &mut buf);
        assert_eq!(unmapped.unwrap_err(), Errno::Efault);

        let kernel_ptr = copyin(
            &kernel,
            &process,
            VirtualAddress::new(USER_SPACE_TOP - 2),
            &mut buf,
        );
        assert_eq!(kernel_ptr.unwrap_err(), Errno::Efault, "range crosses the split");

        let null = copyout(&kernel, &process, b"x", VirtualAddress::new(0));
        assert_eq!(null.unwrap_err(), Errno::Efault);
    }

    #[test]
    fn strings_stop_at_nul_and_respect_bounds() {
        let (kernel, _fs) = boot_kernel(512 * 1024, 0);
        let (process, base) = proc_with_buffer(&kernel);

        copyout(&kernel, &process, b"/bin/sh\0junk", base).expect("copyout");
        let s = copyinstr(&kernel, &process, base, 64).expect("copyinstr");
        assert_eq!(s, "/bin/sh");

        // No terminator within the bound.
        copyout(&kernel, &process, &[b'a'; 32], base.add(0x100)).expect("copyout");
        let unterminated = copyinstr(&kernel, &process, base.add(0x100), 16);
        assert_eq!(unterminated.unwrap_err(), Errno::E2big);
    }

    #[test]
    fn copyoutstr_appends_the_terminator() {
        let (kernel, _fs) = boot_kernel(512 * 1024, 0);
        let (process, base) = proc_with_buffer(&kernel);

        copyoutstr(&kernel, &process, "pod", base, 16).expect("copyoutstr");
        let mut bytes = [0xFFu8; 4];
        copyin(&kernel, &process, base, &mut bytes).expect("copyin");
        assert_eq!(&bytes, b"pod\0");

        let too_long = copyoutstr(&kernel, &process, "pod", base, 3);
        assert_eq!(too_long.unwrap_err(), Errno::E2big);
    }

    #[test]
    fn scalar_round_trip() {
        let (kernel, _fs) = boot_kernel(512 * 1024, 0);
        let (process, base) = proc_with_buffer(&kernel);
        copyout_u32(&kernel, &process, 0xDEAD_BEEF, base.add(12)).expect("copyout_u32");
        assert_eq!(
            copyin_u32(&kernel, &process, base.add(12)).expect("copyin_u32"),
            0xDEAD_BEEF
        );
    }
}
