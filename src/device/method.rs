use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Method {
    Nop = 0x0100,
    WaitForIdle = 0x0110,
    SemaphoreAcquire = 0x0150,
    SemaphoreRelease = 0x0154,
    SemaphoreWrite = 0x0158,
    Write32 = 0x0200,
}

impl Method {
    pub fn from_raw(method: u32) -> Option<Self> {
        Self::from_u32(method)
    }

    pub fn operand_count(&self) -> usize {
        match self {
            Method::Nop | Method::WaitForIdle => 0,
            Method::SemaphoreAcquire
            | Method::SemaphoreRelease
            | Method::SemaphoreWrite
            | Method::Write32 => 3,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Method::Nop => "NOP",
            Method::WaitForIdle => "WFI",
            Method::SemaphoreAcquire => "SEM_ACQUIRE",
            Method::SemaphoreRelease => "SEM_RELEASE",
            Method::SemaphoreWrite => "SEM_WRITE",
            Method::Write32 => "WRITE32",
        };
        f.write_str(name)
    }
}

/// One recorded command. Semaphore methods and `Write32` carry
/// `[va_lo, va_hi, payload]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Command {
    pub method: u32,
    pub data: Vec<u32>,
}

fn split(va: u64) -> [u32; 2] {
    [va as u32, (va >> 32) as u32]
}

impl Command {
    pub fn raw(method: u32, data: &[u32]) -> Self {
        Self {
            method,
            data: data.to_vec(),
        }
    }

    fn addressed(method: Method, va: u64, payload: u32) -> Self {
        let [lo, hi] = split(va);
        Self {
            method: method as u32,
            data: vec![lo, hi, payload],
        }
    }

    pub fn nop() -> Self {
        Self::raw(Method::Nop as u32, &[])
    }

    pub fn wait_for_idle() -> Self {
        Self::raw(Method::WaitForIdle as u32, &[])
    }

    /// Stall the stream until the word at `va` is >= `payload`.
    pub fn acquire(va: u64, payload: u32) -> Self {
        Self::addressed(Method::SemaphoreAcquire, va, payload)
    }

    /// Atomically add `step` to the word at `va`.
    pub fn release(va: u64, step: u32) -> Self {
        Self::addressed(Method::SemaphoreRelease, va, step)
    }

    pub fn semaphore_write(va: u64, payload: u32) -> Self {
        Self::addressed(Method::SemaphoreWrite, va, payload)
    }

    pub fn write32(va: u64, value: u32) -> Self {
        Self::addressed(Method::Write32, va, value)
    }

    pub fn kind(&self) -> Option<Method> {
        Method::from_raw(self.method)
    }

    /// Address and payload of an addressed method.
    pub fn target(&self) -> Option<(u64, u32)> {
        if let [lo, hi, payload, ..] = self.data.as_slice() {
            Some(((*lo as u64) | ((*hi as u64) << 32), *payload))
        } else {
            None
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind() {
            Some(method) => write!(f, "{method}")?,
            None => write!(f, "0x{:x}", self.method)?,
        }
        if let Some((va, payload)) = self.target() {
            write!(f, "(0x{va:x}, {payload})")?;
        }
        Ok(())
    }
}
