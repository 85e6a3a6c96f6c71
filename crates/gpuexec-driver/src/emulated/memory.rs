//! Emulated device address space.
//!
//! Device memory lives in host `Vec`s indexed by a synthetic address range.
//! Virtual reservations come from the same range, so mapped physical memory
//! is reachable through ordinary device pointers once access is granted.

use std::collections::{BTreeMap, HashMap};

use gpuexec_core::handle::{ContextHandle, DevicePtr, HostPtr, MemHandle};

use crate::driver::{Device, CU_MEMORYTYPE_DEVICE, CU_MEMORYTYPE_HOST};
use crate::result::{
    CUresult, CUDA_ERROR_ILLEGAL_ADDRESS, CUDA_ERROR_INVALID_VALUE, CUDA_ERROR_NOT_FOUND,
    CUDA_ERROR_OUT_OF_MEMORY,
};

const DEVICE_ADDRESS_BASE: u64 = 0x7f00_0000_0000;
const ALLOCATION_ALIGNMENT: u64 = 256;

/// Granularity of physical allocations and reservations.
pub const EMULATED_GRANULARITY: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RegionKind {
    Device,
    Managed,
    /// Stream-ordered allocation; owned by a pool rather than a context.
    Pooled,
    Mapped,
}

enum Backing {
    Owned(Vec<u8>),
    Physical(MemHandle),
}

struct Region {
    size: u64,
    kind: RegionKind,
    context: ContextHandle,
    device: Device,
    accessible: bool,
    backing: Backing,
}

struct Physical {
    data: Vec<u8>,
    device: Device,
    mappings: u32,
    released: bool,
}

struct HostRegion {
    size: u64,
    // None for registered caller memory.
    owned: Option<Box<[u8]>>,
}

pub(super) struct MemoryState {
    next_address: u64,
    capacity: u64,
    used: Vec<u64>,
    regions: BTreeMap<u64, Region>,
    reservations: BTreeMap<u64, u64>,
    physical: HashMap<MemHandle, Physical>,
    next_physical: u64,
    host: BTreeMap<u64, HostRegion>,
}

fn align_up(value: u64, alignment: u64) -> Option<u64> {
    value.div_ceil(alignment).checked_mul(alignment)
}

impl MemoryState {
    pub(super) fn new(devices: usize, capacity: u64) -> Self {
        Self {
            next_address: DEVICE_ADDRESS_BASE,
            capacity,
            used: vec![0; devices],
            regions: BTreeMap::new(),
            reservations: BTreeMap::new(),
            physical: HashMap::new(),
            next_physical: 1,
            host: BTreeMap::new(),
        }
    }

    pub(super) fn capacity(&self) -> u64 {
        self.capacity
    }

    pub(super) fn used(&self, device: Device) -> u64 {
        self.used.get(device as usize).copied().unwrap_or(0)
    }

    /// Fails with out-of-memory once the synthetic address space runs out.
    fn take_address(&mut self, bytes: u64, alignment: u64) -> Result<u64, CUresult> {
        let base = align_up(self.next_address, alignment).ok_or(CUDA_ERROR_OUT_OF_MEMORY)?;
        // Leave a gap so neighbouring allocations never touch.
        self.next_address = align_up(bytes.max(1), alignment)
            .and_then(|len| base.checked_add(len))
            .and_then(|end| end.checked_add(alignment))
            .ok_or(CUDA_ERROR_OUT_OF_MEMORY)?;
        Ok(base)
    }

    fn charge(&mut self, device: Device, bytes: u64) -> Result<(), CUresult> {
        let used = self
            .used
            .get_mut(device as usize)
            .ok_or(CUDA_ERROR_INVALID_VALUE)?;
        if used.checked_add(bytes).map_or(true, |total| total > self.capacity) {
            return Err(CUDA_ERROR_OUT_OF_MEMORY);
        }
        *used += bytes;
        Ok(())
    }

    fn refund(&mut self, device: Device, bytes: u64) {
        if let Some(used) = self.used.get_mut(device as usize) {
            *used = used.saturating_sub(bytes);
        }
    }

    // ── Allocation ──────────────────────────────────────────────────

    pub(super) fn allocate(
        &mut self,
        bytes: u64,
        kind: RegionKind,
        context: ContextHandle,
        device: Device,
    ) -> Result<DevicePtr, CUresult> {
        if bytes == 0 {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        self.charge(device, bytes)?;
        let base = match self.take_address(bytes, ALLOCATION_ALIGNMENT) {
            Ok(base) => base,
            Err(e) => {
                self.refund(device, bytes);
                return Err(e);
            }
        };
        self.regions.insert(
            base,
            Region {
                size: bytes,
                kind,
                context,
                device,
                accessible: true,
                backing: Backing::Owned(vec![0; bytes as usize]),
            },
        );
        Ok(DevicePtr::from_raw(base))
    }

    /// Free an allocation by its base address.
    pub(super) fn free(&mut self, ptr: DevicePtr) -> Result<(), CUresult> {
        match self.regions.get(&ptr.as_raw()) {
            Some(region) if region.kind != RegionKind::Mapped => {}
            _ => return Err(CUDA_ERROR_INVALID_VALUE),
        }
        if let Some(region) = self.regions.remove(&ptr.as_raw()) {
            self.refund(region.device, region.size);
        }
        Ok(())
    }

    /// Drop every allocation owned by `context`, as a context reset does.
    pub(super) fn release_context(&mut self, context: ContextHandle) {
        let owned: Vec<u64> = self
            .regions
            .iter()
            .filter(|(_, r)| r.context == context && r.kind != RegionKind::Mapped)
            .map(|(base, _)| *base)
            .collect();
        for base in owned {
            if let Some(region) = self.regions.remove(&base) {
                self.refund(region.device, region.size);
            }
        }
    }

    pub(super) fn host_allocate(&mut self, bytes: u64) -> Result<HostPtr, CUresult> {
        if bytes == 0 {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        let mut owned = vec![0u8; bytes as usize].into_boxed_slice();
        let ptr = HostPtr::from_ptr(owned.as_mut_ptr());
        self.host.insert(
            ptr.as_raw(),
            HostRegion {
                size: bytes,
                owned: Some(owned),
            },
        );
        Ok(ptr)
    }

    pub(super) fn host_free(&mut self, ptr: HostPtr) -> Result<(), CUresult> {
        match self.host.get(&ptr.as_raw()) {
            Some(region) if region.owned.is_some() => {
                self.host.remove(&ptr.as_raw());
                Ok(())
            }
            _ => Err(CUDA_ERROR_INVALID_VALUE),
        }
    }

    pub(super) fn host_register(&mut self, ptr: HostPtr, bytes: u64) -> Result<(), CUresult> {
        if ptr.is_null() || bytes == 0 || self.host_region(ptr.as_raw()).is_some() {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        self.host.insert(ptr.as_raw(), HostRegion { size: bytes, owned: None });
        Ok(())
    }

    pub(super) fn host_unregister(&mut self, ptr: HostPtr) -> Result<(), CUresult> {
        match self.host.get(&ptr.as_raw()) {
            Some(region) if region.owned.is_none() => {
                self.host.remove(&ptr.as_raw());
                Ok(())
            }
            _ => Err(CUDA_ERROR_INVALID_VALUE),
        }
    }

    // ── Lookup and access ───────────────────────────────────────────

    fn region_base(&self, address: u64) -> Option<u64> {
        let (base, region) = self.regions.range(..=address).next_back()?;
        (address < base.saturating_add(region.size)).then_some(*base)
    }

    fn host_region(&self, address: u64) -> Option<(u64, &HostRegion)> {
        let (base, region) = self.host.range(..=address).next_back()?;
        (address < base.saturating_add(region.size)).then_some((*base, region))
    }

    fn span(&self, ptr: DevicePtr, len: u64) -> Result<(u64, usize), CUresult> {
        let base = self.region_base(ptr.as_raw()).ok_or(CUDA_ERROR_INVALID_VALUE)?;
        let region = &self.regions[&base];
        let offset = ptr.as_raw() - base;
        if offset.checked_add(len).map_or(true, |end| end > region.size) {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        if !region.accessible {
            return Err(CUDA_ERROR_ILLEGAL_ADDRESS);
        }
        Ok((base, offset as usize))
    }

    pub(super) fn read(&self, ptr: DevicePtr, len: usize) -> Result<Vec<u8>, CUresult> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let (base, offset) = self.span(ptr, len as u64)?;
        let data = match &self.regions[&base].backing {
            Backing::Owned(data) => data,
            Backing::Physical(handle) => {
                &self.physical.get(handle).ok_or(CUDA_ERROR_ILLEGAL_ADDRESS)?.data
            }
        };
        Ok(data[offset..offset + len].to_vec())
    }

    pub(super) fn write(&mut self, ptr: DevicePtr, bytes: &[u8]) -> Result<(), CUresult> {
        if bytes.is_empty() {
            return Ok(());
        }
        let (base, offset) = self.span(ptr, bytes.len() as u64)?;
        let data = match &mut self.regions.get_mut(&base).ok_or(CUDA_ERROR_INVALID_VALUE)?.backing {
            Backing::Owned(data) => data,
            Backing::Physical(handle) => {
                let handle = *handle;
                &mut self
                    .physical
                    .get_mut(&handle)
                    .ok_or(CUDA_ERROR_ILLEGAL_ADDRESS)?
                    .data
            }
        };
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub(super) fn copy(&mut self, dst: DevicePtr, src: DevicePtr, bytes: u64) -> Result<(), CUresult> {
        let data = self.read(src, bytes as usize)?;
        self.write(dst, &data)
    }

    /// Repeat `pattern` `count` times starting at `dst`.
    pub(super) fn fill(&mut self, dst: DevicePtr, pattern: &[u8], count: u64) -> Result<(), CUresult> {
        let data = pattern.repeat(count as usize);
        self.write(dst, &data)
    }

    // ── Pointer attributes ──────────────────────────────────────────

    pub(super) fn pointer_context(&self, ptr: DevicePtr) -> Result<ContextHandle, CUresult> {
        if let Some(base) = self.region_base(ptr.as_raw()) {
            let region = &self.regions[&base];
            return Ok(match region.kind {
                RegionKind::Pooled | RegionKind::Mapped => ContextHandle::null(),
                RegionKind::Device | RegionKind::Managed => region.context,
            });
        }
        Err(CUDA_ERROR_INVALID_VALUE)
    }

    pub(super) fn pointer_memory_type(&self, ptr: DevicePtr) -> Result<i32, CUresult> {
        if self.region_base(ptr.as_raw()).is_some() {
            return Ok(CU_MEMORYTYPE_DEVICE);
        }
        if self.host_region(ptr.as_raw()).is_some() {
            return Ok(CU_MEMORYTYPE_HOST);
        }
        Err(CUDA_ERROR_INVALID_VALUE)
    }

    pub(super) fn pointer_device(&self, ptr: DevicePtr) -> Result<Device, CUresult> {
        let base = self.region_base(ptr.as_raw()).ok_or(CUDA_ERROR_INVALID_VALUE)?;
        Ok(self.regions[&base].device)
    }

    pub(super) fn address_range(&self, ptr: DevicePtr) -> Result<(DevicePtr, u64), CUresult> {
        let base = self.region_base(ptr.as_raw()).ok_or(CUDA_ERROR_NOT_FOUND)?;
        Ok((DevicePtr::from_raw(base), self.regions[&base].size))
    }

    // ── Virtual memory ──────────────────────────────────────────────

    pub(super) fn reserve(&mut self, bytes: u64, alignment: u64) -> Result<DevicePtr, CUresult> {
        if bytes == 0 || bytes % EMULATED_GRANULARITY != 0 {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        let alignment = alignment.max(EMULATED_GRANULARITY);
        let base = self.take_address(bytes, alignment)?;
        self.reservations.insert(base, bytes);
        Ok(DevicePtr::from_raw(base))
    }

    pub(super) fn free_reservation(&mut self, ptr: DevicePtr, bytes: u64) -> Result<(), CUresult> {
        let base = ptr.as_raw();
        if self.reservations.get(&base) != Some(&bytes) {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        if self.regions.range(base..base.saturating_add(bytes)).next().is_some() {
            // Still mapped.
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        self.reservations.remove(&base);
        Ok(())
    }

    pub(super) fn create_physical(&mut self, bytes: u64, device: Device) -> Result<MemHandle, CUresult> {
        if bytes == 0 || bytes % EMULATED_GRANULARITY != 0 {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        self.charge(device, bytes)?;
        let handle = MemHandle::from_raw(self.next_physical);
        self.next_physical += 1;
        self.physical.insert(
            handle,
            Physical {
                data: vec![0; bytes as usize],
                device,
                mappings: 0,
                released: false,
            },
        );
        Ok(handle)
    }

    fn drop_physical_if_unused(&mut self, handle: MemHandle) {
        let unused = matches!(self.physical.get(&handle), Some(p) if p.released && p.mappings == 0);
        if unused {
            if let Some(physical) = self.physical.remove(&handle) {
                self.refund(physical.device, physical.data.len() as u64);
            }
        }
    }

    /// Physical memory outlives its handle while it is still mapped.
    pub(super) fn release_physical(&mut self, handle: MemHandle) -> Result<(), CUresult> {
        let physical = self.physical.get_mut(&handle).ok_or(CUDA_ERROR_INVALID_VALUE)?;
        if physical.released {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        physical.released = true;
        self.drop_physical_if_unused(handle);
        Ok(())
    }

    pub(super) fn map(&mut self, ptr: DevicePtr, bytes: u64, handle: MemHandle) -> Result<(), CUresult> {
        let address = ptr.as_raw();
        let inside_reservation = self
            .reservations
            .range(..=address)
            .next_back()
            .is_some_and(|(base, size)| {
                address
                    .checked_add(bytes)
                    .is_some_and(|end| end <= base.saturating_add(*size))
            });
        if !inside_reservation {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        if self.regions.range(address..address.saturating_add(bytes)).next().is_some()
            || self.region_base(address).is_some()
        {
            return Err(crate::result::CUDA_ERROR_ALREADY_MAPPED);
        }

        let physical = self.physical.get_mut(&handle).ok_or(CUDA_ERROR_INVALID_VALUE)?;
        if physical.released || bytes > physical.data.len() as u64 {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        physical.mappings += 1;
        let device = physical.device;

        self.regions.insert(
            address,
            Region {
                size: bytes,
                kind: RegionKind::Mapped,
                context: ContextHandle::null(),
                device,
                accessible: false,
                backing: Backing::Physical(handle),
            },
        );
        Ok(())
    }

    pub(super) fn set_access(&mut self, ptr: DevicePtr, bytes: u64) -> Result<(), CUresult> {
        match self.regions.get_mut(&ptr.as_raw()) {
            Some(region) if region.kind == RegionKind::Mapped && region.size == bytes => {
                region.accessible = true;
                Ok(())
            }
            _ => Err(CUDA_ERROR_INVALID_VALUE),
        }
    }

    pub(super) fn unmap(&mut self, ptr: DevicePtr, bytes: u64) -> Result<(), CUresult> {
        let start = ptr.as_raw();
        let mapped: Vec<u64> = self
            .regions
            .range(start..start.saturating_add(bytes))
            .filter(|(_, r)| r.kind == RegionKind::Mapped)
            .map(|(base, _)| *base)
            .collect();
        if mapped.is_empty() {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        for base in mapped {
            if let Some(Region {
                backing: Backing::Physical(handle),
                ..
            }) = self.regions.remove(&base)
            {
                if let Some(physical) = self.physical.get_mut(&handle) {
                    physical.mappings = physical.mappings.saturating_sub(1);
                }
                self.drop_physical_if_unused(handle);
            }
        }
        Ok(())
    }

    pub(super) fn is_mapped(&self, ptr: DevicePtr) -> bool {
        matches!(self.regions.get(&ptr.as_raw()), Some(r) if r.kind == RegionKind::Mapped)
    }
}
