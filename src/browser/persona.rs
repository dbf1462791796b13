use rand::{thread_rng, Rng};

/// OS persona rotated across browser instances to reduce fingerprinting
/// consistency. The variant is picked deterministically from the slot id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsPersona {
    Windows,
    MacOs,
    Linux,
}

/// Viewport dimensions
#[derive(Debug, Clone, Copy)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl OsPersona {
    /// Deterministic 3-way rotation over the slot id
    pub fn for_slot(slot_id: u64) -> Self {
        match slot_id % 3 {
            0 => OsPersona::Windows,
            1 => OsPersona::MacOs,
            _ => OsPersona::Linux,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OsPersona::Windows => "windows",
            OsPersona::MacOs => "macos",
            OsPersona::Linux => "linux",
        }
    }

    pub fn user_agent(&self) -> &'static str {
        match self {
            OsPersona::Windows => {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
            }
            OsPersona::MacOs => {
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
            }
            OsPersona::Linux => {
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
            }
        }
    }

    pub fn platform(&self) -> &'static str {
        match self {
            OsPersona::Windows => "Win32",
            OsPersona::MacOs => "MacIntel",
            OsPersona::Linux => "Linux x86_64",
        }
    }

    /// Desktop viewport with a little jitter so instances don't all report
    /// the same dimensions
    pub fn viewport(&self) -> Viewport {
        let mut rng = thread_rng();
        Viewport {
            width: rng.gen_range(1280..1920),
            height: rng.gen_range(800..1080),
        }
    }
}
