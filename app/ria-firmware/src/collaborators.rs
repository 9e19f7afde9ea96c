// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Board-level collaborators for `ria_api`'s `BlockStore`/`ConfigStore`/
//! `UsbHost` traits. The real FAT-over-USB-mass-storage filesystem,
//! little filesystem on internal flash, and USB host stack are each
//! specified only by the interface they present (spec.md's own framing
//! for these three subsystems); wiring an actual `embedded-sdmmc`/
//! `littlefs2`/`usb-device` stack in is board bring-up work outside this
//! port's scope. These stand-ins give `app/ria-firmware` something real
//! to link and boot against: a tiny in-RAM file table and a no-op USB
//! host that never mounts anything, both honoring the trait's error
//! contract exactly (`NoSys`/`NoEnt`/etc. where the real driver would).

use ria_abi::{Errno, OpenFlags};
use ria_api::{BlockStore, ConfigStore, FileStat, SeekFrom, UsbHost};

const MAX_FILES: usize = 8;
const MAX_FILE_SIZE: usize = 4096;
const MAX_NAME: usize = 32;

#[derive(Clone, Copy)]
struct StoredFile {
    name: [u8; MAX_NAME],
    name_len: u8,
    data: [u8; MAX_FILE_SIZE],
    len: usize,
}

impl StoredFile {
    const fn empty() -> Self {
        Self { name: [0; MAX_NAME], name_len: 0, data: [0; MAX_FILE_SIZE], len: 0 }
    }

    fn name(&self) -> &[u8] {
        &self.name[..self.name_len as usize]
    }
}

/// An open file's cursor into [`RamBlockStore`]'s table. Index into the
/// slot array plus a read/write position, the same shape FatFs's own
/// handle carries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RamHandle {
    slot: u8,
    pos: u32,
}

/// Fixed-capacity in-RAM stand-in for the FAT-over-USB-mass-storage
/// volume. No directories: every path is a flat name, matching the
/// boot-ROM/config use this port actually exercises.
pub struct RamBlockStore {
    files: [StoredFile; MAX_FILES],
}

impl RamBlockStore {
    pub const fn new() -> Self {
        Self { files: [StoredFile::empty(); MAX_FILES] }
    }

    fn find(&self, path: &[u8]) -> Option<usize> {
        self.files.iter().position(|f| f.name_len != 0 && f.name() == path)
    }

    fn find_or_create(&mut self, path: &[u8]) -> Result<usize, Errno> {
        if let Some(i) = self.find(path) {
            return Ok(i);
        }
        if path.len() > MAX_NAME {
            return Err(Errno::NoSpc);
        }
        let slot = self.files.iter().position(|f| f.name_len == 0).ok_or(Errno::NoSpc)?;
        let f = &mut self.files[slot];
        f.name[..path.len()].copy_from_slice(path);
        f.name_len = path.len() as u8;
        f.len = 0;
        Ok(slot)
    }
}

impl Default for RamBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for RamBlockStore {
    type Handle = RamHandle;

    fn open(&mut self, path: &[u8], flags: OpenFlags) -> Result<Self::Handle, Errno> {
        let slot = if flags.contains(OpenFlags::CREATE) {
            self.find_or_create(path)?
        } else {
            self.find(path).ok_or(Errno::NoEnt)?
        };
        if flags.contains(OpenFlags::TRUNC) {
            self.files[slot].len = 0;
        }
        let pos = if flags.contains(OpenFlags::APPEND) { self.files[slot].len as u32 } else { 0 };
        Ok(RamHandle { slot: slot as u8, pos })
    }

    fn close(&mut self, _handle: Self::Handle) -> Result<(), Errno> {
        Ok(())
    }

    fn read(&mut self, handle: Self::Handle, buf: &mut [u8]) -> Result<usize, Errno> {
        let f = &self.files[handle.slot as usize];
        let pos = handle.pos as usize;
        if pos >= f.len {
            return Ok(0);
        }
        let n = buf.len().min(f.len - pos);
        buf[..n].copy_from_slice(&f.data[pos..pos + n]);
        Ok(n)
    }

    fn write(&mut self, handle: Self::Handle, buf: &[u8]) -> Result<usize, Errno> {
        let f = &mut self.files[handle.slot as usize];
        let pos = handle.pos as usize;
        if pos >= MAX_FILE_SIZE {
            return Err(Errno::NoSpc);
        }
        let n = buf.len().min(MAX_FILE_SIZE - pos);
        f.data[pos..pos + n].copy_from_slice(&buf[..n]);
        f.len = f.len.max(pos + n);
        Ok(n)
    }

    fn seek(&mut self, handle: Self::Handle, pos: SeekFrom) -> Result<u32, Errno> {
        let len = self.files[handle.slot as usize].len as u32;
        let new_pos = match pos {
            SeekFrom::Start(p) => p,
            SeekFrom::Current(d) => (handle.pos as i64 + d as i64).max(0) as u32,
            SeekFrom::End(d) => (len as i64 + d as i64).max(0) as u32,
        };
        Ok(new_pos)
    }

    fn stat(&mut self, path: &[u8]) -> Result<FileStat, Errno> {
        let i = self.find(path).ok_or(Errno::NoEnt)?;
        Ok(FileStat { size: self.files[i].len as u32, is_dir: false })
    }

    fn fstat(&mut self, handle: Self::Handle) -> Result<FileStat, Errno> {
        Ok(FileStat { size: self.files[handle.slot as usize].len as u32, is_dir: false })
    }

    fn unlink(&mut self, path: &[u8]) -> Result<(), Errno> {
        let i = self.find(path).ok_or(Errno::NoEnt)?;
        self.files[i] = StoredFile::empty();
        Ok(())
    }

    fn rename(&mut self, from: &[u8], to: &[u8]) -> Result<(), Errno> {
        let i = self.find(from).ok_or(Errno::NoEnt)?;
        if to.len() > MAX_NAME {
            return Err(Errno::NoSpc);
        }
        self.files[i].name[..to.len()].copy_from_slice(to);
        self.files[i].name_len = to.len() as u8;
        Ok(())
    }

    fn mkdir(&mut self, _path: &[u8]) -> Result<(), Errno> {
        Err(Errno::NoSys)
    }

    fn rmdir(&mut self, _path: &[u8]) -> Result<(), Errno> {
        Err(Errno::NoSys)
    }

    fn opendir(&mut self, _path: &[u8]) -> Result<Self::Handle, Errno> {
        Err(Errno::NoSys)
    }

    fn readdir(&mut self, _handle: Self::Handle, _out: &mut [u8]) -> Result<usize, Errno> {
        Err(Errno::NoSys)
    }

    fn chdir(&mut self, _path: &[u8]) -> Result<(), Errno> {
        Err(Errno::NoSys)
    }

    fn getcwd(&mut self, out: &mut [u8]) -> Result<usize, Errno> {
        if out.is_empty() {
            return Ok(0);
        }
        out[0] = b'/';
        Ok(1)
    }
}

/// In-RAM stand-in for the little-filesystem `CONFIG.SYS` record the
/// real board would persist to internal flash. Holds exactly one blob;
/// `ria_api::Config` owns parsing it.
pub struct RamConfigStore {
    data: [u8; 512],
    len: usize,
}

impl RamConfigStore {
    pub const fn new() -> Self {
        Self { data: [0; 512], len: 0 }
    }
}

impl Default for RamConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore for RamConfigStore {
    fn load(&mut self, out: &mut [u8]) -> Result<usize, Errno> {
        let n = out.len().min(self.len);
        out[..n].copy_from_slice(&self.data[..n]);
        Ok(n)
    }

    fn save(&mut self, data: &[u8]) -> Result<(), Errno> {
        if data.len() > self.data.len() {
            return Err(Errno::NoSpc);
        }
        self.data[..data.len()].copy_from_slice(data);
        self.len = data.len();
        Ok(())
    }
}

/// No-op USB host: never mounts mass storage, never produces a HID
/// report. A real board replaces this with a TinyUSB/`usb-device` host
/// stack driver; until then the monitor and API dispatcher see an
/// always-empty bus, which they're required to tolerate per spec.md's
/// own non-fatal error handling for missing peripherals.
#[derive(Default)]
pub struct NullUsbHost;

impl UsbHost for NullUsbHost {
    fn poll_hid(&mut self) -> Option<[u8; 8]> {
        None
    }

    fn mount(&mut self) -> bool {
        false
    }

    fn unmount(&mut self) {}
}
