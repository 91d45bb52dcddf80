/// Memory budgets derived from host capabilities and user percentages
///
/// Percent changes only mark the controller dirty. The streaming context
/// applies them at the next frame start, so nothing is evicted mid-frame.
use crate::config::validate_percent;
use crate::error::OctreeResult;

const GIB: u64 = 1024 * 1024 * 1024;

/// Installed RAM assumed when the host cannot be queried
pub const FALLBACK_INSTALLED_RAM: u64 = 4 * GIB;

/// Video memory assumed when the renderer reports none
pub const FALLBACK_VIDEO_MEMORY: u64 = 2 * GIB;

/// Source of memory capabilities
pub trait MemoryProbe: Send + Sync {
    /// Installed system RAM in bytes
    fn installed_ram(&self) -> Option<u64>;

    /// Dedicated video memory in bytes
    fn video_memory(&self) -> Option<u64>;
}

/// Queries the operating system for installed RAM
///
/// Video memory cannot be read portably from here; the embedding renderer
/// passes it in with `with_video_memory`.
#[derive(Debug, Clone, Default)]
pub struct HostMemoryProbe {
    video_memory: Option<u64>,
}

impl HostMemoryProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_video_memory(mut self, bytes: u64) -> Self {
        self.video_memory = Some(bytes);
        self
    }
}

impl MemoryProbe for HostMemoryProbe {
    #[cfg(target_os = "linux")]
    fn installed_ram(&self) -> Option<u64> {
        // SAFETY: sysinfo only writes into the zeroed struct we hand it.
        unsafe {
            let mut info: libc::sysinfo = std::mem::zeroed();
            if libc::sysinfo(&mut info) == 0 {
                Some(info.totalram as u64 * info.mem_unit.max(1) as u64)
            } else {
                None
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn installed_ram(&self) -> Option<u64> {
        None
    }

    fn video_memory(&self) -> Option<u64> {
        self.video_memory
    }
}

/// Fixed capabilities, for tests and headless tools
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedMemoryProbe {
    pub installed_ram: Option<u64>,
    pub video_memory: Option<u64>,
}

impl FixedMemoryProbe {
    pub fn new(installed_ram: u64, video_memory: u64) -> Self {
        Self {
            installed_ram: Some(installed_ram),
            video_memory: Some(video_memory),
        }
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn installed_ram(&self) -> Option<u64> {
        self.installed_ram
    }

    fn video_memory(&self) -> Option<u64> {
        self.video_memory
    }
}

/// Read-only snapshot of budget state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetTelemetry {
    pub cpu_ram_budget: u64,
    pub gpu_memory_budget: u64,
    pub cpu_bytes_in_use: u64,
    pub cpu_bytes_remaining: u64,
    pub slot_capacity: u32,
    pub free_slots: usize,
}

pub struct BudgetController {
    probe: Box<dyn MemoryProbe>,
    installed_ram: u64,
    video_memory: u64,
    cpu_ram_percent: f32,
    gpu_memory_percent: f32,
    cpu_ram_budget: u64,
    gpu_memory_budget: u64,
    dirty: bool,
}

impl BudgetController {
    pub fn new(
        probe: Box<dyn MemoryProbe>,
        cpu_ram_percent: f32,
        gpu_memory_percent: f32,
    ) -> OctreeResult<Self> {
        validate_percent("cpu_ram_percent", cpu_ram_percent)?;
        validate_percent("gpu_memory_percent", gpu_memory_percent)?;

        let installed_ram = probe.installed_ram().unwrap_or_else(|| {
            log::warn!(
                "[BudgetController::new] Installed RAM unknown, assuming {} bytes",
                FALLBACK_INSTALLED_RAM
            );
            FALLBACK_INSTALLED_RAM
        });
        let video_memory = probe.video_memory().unwrap_or(FALLBACK_VIDEO_MEMORY);

        let mut controller = Self {
            probe,
            installed_ram,
            video_memory,
            cpu_ram_percent,
            gpu_memory_percent,
            cpu_ram_budget: 0,
            gpu_memory_budget: 0,
            dirty: false,
        };
        controller.recompute();
        log::info!(
            "[BudgetController::new] CPU budget {} bytes ({}%), GPU budget {} bytes ({}%)",
            controller.cpu_ram_budget,
            cpu_ram_percent,
            controller.gpu_memory_budget,
            gpu_memory_percent
        );
        Ok(controller)
    }

    /// Takes effect at the next frame start
    pub fn set_cpu_ram_percent(&mut self, percent: f32) -> OctreeResult<()> {
        validate_percent("cpu_ram_percent", percent)?;
        if percent != self.cpu_ram_percent {
            self.cpu_ram_percent = percent;
            self.dirty = true;
        }
        Ok(())
    }

    /// Takes effect at the next frame start
    pub fn set_gpu_memory_percent(&mut self, percent: f32) -> OctreeResult<()> {
        validate_percent("gpu_memory_percent", percent)?;
        if percent != self.gpu_memory_percent {
            self.gpu_memory_percent = percent;
            self.dirty = true;
        }
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Recompute budgets if a percentage changed; true when they did
    pub fn apply_pending(&mut self) -> bool {
        if !self.dirty {
            return false;
        }
        self.dirty = false;
        if let Some(video_memory) = self.probe.video_memory() {
            self.video_memory = video_memory;
        }
        self.recompute();
        log::info!(
            "[BudgetController::apply_pending] CPU budget {} bytes, GPU budget {} bytes",
            self.cpu_ram_budget,
            self.gpu_memory_budget
        );
        true
    }

    fn recompute(&mut self) {
        self.cpu_ram_budget = (self.installed_ram as f64 * self.cpu_ram_percent as f64 / 100.0) as u64;
        self.gpu_memory_budget = (self.video_memory as f64 * self.gpu_memory_percent as f64 / 100.0) as u64;
    }

    pub fn cpu_ram_budget(&self) -> u64 {
        self.cpu_ram_budget
    }

    pub fn gpu_memory_budget(&self) -> u64 {
        self.gpu_memory_budget
    }

    pub fn cpu_ram_percent(&self) -> f32 {
        self.cpu_ram_percent
    }

    pub fn gpu_memory_percent(&self) -> f32 {
        self.gpu_memory_percent
    }

    /// Chunk slots that fit in the GPU budget
    pub fn slot_capacity(&self, chunk_size_bytes: u64) -> u32 {
        if chunk_size_bytes == 0 {
            return 0;
        }
        (self.gpu_memory_budget / chunk_size_bytes).min(u32::MAX as u64) as u32
    }
}

impl std::fmt::Debug for BudgetController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetController")
            .field("cpu_ram_budget", &self.cpu_ram_budget)
            .field("gpu_memory_budget", &self.gpu_memory_budget)
            .field("dirty", &self.dirty)
            .finish()
    }
}
