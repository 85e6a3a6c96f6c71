//! Opaque native handles.
//!
//! Every handle is a plain integer wrapper around the driver's pointer-sized
//! value. Zero is the null handle. The layer never tracks their lifetime:
//! whoever created a handle owns it and must destroy it exactly once.

use std::fmt;

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(u64);

        impl $name {
            pub const fn null() -> Self {
                Self(0)
            }

            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn as_raw(self) -> u64 {
                self.0
            }

            pub const fn is_null(self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

opaque_handle!(
    /// Native context handle (`CUcontext`).
    ContextHandle
);
opaque_handle!(
    /// Native stream handle. The null stream is the legacy default stream.
    StreamHandle
);
opaque_handle!(
    /// Native event handle.
    EventHandle
);
opaque_handle!(
    /// Loaded module handle.
    ModuleHandle
);
opaque_handle!(
    /// Kernel entry point resolved from a module.
    FunctionHandle
);
opaque_handle!(
    /// Execution graph under construction.
    GraphHandle
);
opaque_handle!(
    /// Instantiated, launchable graph.
    GraphExecHandle
);
opaque_handle!(
    /// Node inside a graph.
    GraphNodeHandle
);
opaque_handle!(
    /// Generic physical allocation handle used with virtual memory mappings.
    MemHandle
);
opaque_handle!(
    /// Address in the device (unified) address space.
    DevicePtr
);
opaque_handle!(
    /// Page-locked host allocation returned by the driver.
    HostPtr
);

impl DevicePtr {
    /// Pointer `bytes` past this one.
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

impl HostPtr {
    pub fn as_ptr(self) -> *mut u8 {
        self.0 as usize as *mut u8
    }

    pub fn from_ptr(ptr: *mut u8) -> Self {
        Self(ptr as usize as u64)
    }

    /// View the allocation as a byte slice.
    ///
    /// # Safety
    /// The pointer must come from a live host allocation of at least `len`
    /// bytes, and no other reference to that memory may be alive for `'a`.
    pub unsafe fn as_mut_slice<'a>(self, len: usize) -> &'a mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.as_ptr(), len) }
    }
}

/// A reserved, possibly unmapped, range of device virtual address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmemSpan {
    pub base: DevicePtr,
    pub size_bytes: u64,
}

/// Physical allocation created for mapping into a [`VmemSpan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenericMemoryHandle {
    pub handle: MemHandle,
    pub bytes: u64,
}
