use std::{fs, io, ops::Range};

use libc::{c_void, iovec, pid_t, process_vm_readv};
use log::trace;
use once_cell::sync::Lazy;

use crate::{
    error::UnreadableMemory,
    source::{checked_end, MemorySource, SourceKind},
};

static PAGE_SIZE: Lazy<u64> = Lazy::new(|| page_size::get() as u64);

/// Another process on this machine, read with `process_vm_readv(2)`.
///
/// The process is not stopped by us. Reads race with its threads unless the
/// caller has stopped it (with `ptrace` or `SIGSTOP`).
pub struct LiveProcess {
    pid: pid_t,
}

/// One line of `/proc/<pid>/maps`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub range: Range<u64>,
    pub readable: bool,
    pub writable: bool,
    pub path: Option<String>,
}

impl LiveProcess {
    pub fn attach(pid: u32) -> io::Result<Self> {
        let pid = pid_t::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        // fail early for processes that do not exist
        fs::metadata(format!("/proc/{pid}"))?;
        Ok(Self { pid })
    }

    pub fn pid(&self) -> u32 {
        self.pid as u32
    }

    pub fn mappings(&self) -> io::Result<Vec<Mapping>> {
        let maps = fs::read_to_string(format!("/proc/{}/maps", self.pid))?;
        Ok(maps.lines().filter_map(parse_maps_line).collect())
    }

    /// Ranges worth handing to [`Snapshot::capture`](crate::source::Snapshot::capture).
    pub fn readable_ranges(&self) -> io::Result<Vec<Range<u64>>> {
        Ok(self
            .mappings()?
            .into_iter()
            .filter(|m| m.readable)
            .map(|m| m.range)
            .collect())
    }

    /// A single `process_vm_readv` call that must not cross a page boundary,
    /// so that a short read means exactly "this page is not readable".
    fn read_page_piece(&self, address: u64, buf: &mut [u8]) -> bool {
        let local = iovec {
            iov_base: buf.as_mut_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
        let remote = iovec {
            iov_base: address as usize as *mut c_void,
            iov_len: buf.len(),
        };
        // SAFETY:
        // - `local` describes exactly `buf`, which we borrow mutably for the
        //   duration of the call
        // - the remote side is never dereferenced in this process
        let n = unsafe { process_vm_readv(self.pid, &local, 1, &remote, 1, 0) };
        n >= 0 && n as usize == buf.len()
    }
}

impl MemorySource for LiveProcess {
    fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<(), UnreadableMemory> {
        let end = checked_end(address, buf.len())?;
        let mut at = address;
        while at < end {
            let page_end = (at - at % *PAGE_SIZE).saturating_add(*PAGE_SIZE).min(end);
            let from = (at - address) as usize;
            let to = (page_end - address) as usize;
            if !self.read_page_piece(at, &mut buf[from..to]) {
                trace!("pid {}: unreadable page at {at:#x}", self.pid);
                return Err(UnreadableMemory::new(address, buf.len()));
            }
            at = page_end;
        }
        Ok(())
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Live
    }
}

/// `7f12a000-7f12b000 rw-p 00000000 00:00 0    [heap]`
fn parse_maps_line(line: &str) -> Option<Mapping> {
    let mut parts = line.split_whitespace();
    let (start, end) = parts.next()?.split_once('-')?;
    let perms = parts.next()?.as_bytes();
    let path = parts.nth(3).map(str::to_owned);
    Some(Mapping {
        range: u64::from_str_radix(start, 16).ok()?..u64::from_str_radix(end, 16).ok()?,
        readable: perms.first() == Some(&b'r'),
        writable: perms.get(1) == Some(&b'w'),
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_lines_parse() {
        assert_eq!(
            parse_maps_line("55d0c0a00000-55d0c0a21000 rw-p 00000000 00:00 0    [heap]"),
            Some(Mapping {
                range: 0x55d0c0a00000..0x55d0c0a21000,
                readable: true,
                writable: true,
                path: Some("[heap]".into()),
            })
        );
        let anon = parse_maps_line("7f0000000000-7f0000001000 ---p 00000000 00:00 0").unwrap();
        assert!(!anon.readable);
        assert_eq!(anon.path, None);
        assert_eq!(parse_maps_line("garbage"), None);
    }

    #[test]
    fn reads_own_memory() {
        let process = LiveProcess::attach(std::process::id()).unwrap();
        let data: Vec<u8> = (0..0x3000u32).map(|i| i as u8).collect();
        let address = data.as_ptr() as u64;
        // spans at least two page boundaries
        assert_eq!(process.read(address, data.len()).unwrap(), data);
        assert!(process.read(0, 8).is_err());
        assert!(process
            .readable_ranges()
            .unwrap()
            .iter()
            .any(|r| r.contains(&address)));
    }
}
