use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};

use crate::error::{Result, TracerError};

/// Adapter selection knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextOptions {
    pub power_preference: wgpu::PowerPreference,
    pub backends: wgpu::Backends,
    pub force_fallback_adapter: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            backends: wgpu::Backends::all(),
            force_fallback_adapter: false,
        }
    }
}

#[derive(Default)]
struct DeviceHealth {
    lost: AtomicBool,
    message: Mutex<Option<String>>,
}

/// The adapter, device and queue shared by everything that touches the GPU.
pub struct GpuContext {
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    health: Arc<DeviceHealth>,
}

pub fn create_instance(options: &ContextOptions) -> wgpu::Instance {
    wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: options.backends,
        flags: wgpu::InstanceFlags::default(),
        memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
        backend_options: wgpu::BackendOptions::default(),
    })
}

impl GpuContext {
    /// Context with no presentation surface; frames only leave through readback.
    pub fn headless(options: ContextOptions) -> Result<Self> {
        let instance = create_instance(&options);
        Self::from_instance(instance, None, options)
    }

    /// Context whose adapter can present to `surface`. The surface must have
    /// been created from `instance`.
    pub fn for_surface(
        instance: wgpu::Instance,
        surface: &wgpu::Surface<'_>,
        options: ContextOptions,
    ) -> Result<Self> {
        Self::from_instance(instance, Some(surface), options)
    }

    fn from_instance(
        instance: wgpu::Instance,
        compatible_surface: Option<&wgpu::Surface<'_>>,
        options: ContextOptions,
    ) -> Result<Self> {
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: options.power_preference,
            compatible_surface,
            force_fallback_adapter: options.force_fallback_adapter,
        }))?;

        let info = adapter.get_info();
        let limits = adapter.limits();
        let is_software = info.device_type == wgpu::DeviceType::Cpu;
        debug!(
            name = %info.name,
            backend = ?info.backend,
            device_type = ?info.device_type,
            is_software,
            "selected GPU adapter"
        );
        if is_software {
            warn!(name = %info.name, "software adapter selected; frames will be slow");
        }

        // Read-write rgba32float storage images are only available through
        // adapter-specific format features.
        let required_features =
            adapter.features() & wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("raytrace device"),
            required_features,
            required_limits: limits,
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))?;

        let health = Arc::new(DeviceHealth::default());
        let callback_health = Arc::clone(&health);
        device.set_device_lost_callback(move |reason, message| {
            if matches!(reason, wgpu::DeviceLostReason::Destroyed) {
                debug!(%message, "GPU device destroyed");
                return;
            }
            error!(?reason, %message, "GPU device lost");
            if let Ok(mut slot) = callback_health.message.lock() {
                *slot = Some(message);
            }
            callback_health.lost.store(true, Ordering::Release);
        });

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
            health,
        })
    }

    pub fn instance(&self) -> &wgpu::Instance {
        &self.instance
    }

    pub fn adapter(&self) -> &wgpu::Adapter {
        &self.adapter
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn adapter_info(&self) -> wgpu::AdapterInfo {
        self.adapter.get_info()
    }

    /// Rejects viewports the output image cannot be created for.
    pub fn check_viewport(&self, width: u32, height: u32) -> Result<()> {
        let invalid = |reason: String| TracerError::Viewport {
            width,
            height,
            reason,
        };
        if width == 0 || height == 0 {
            return Err(invalid("both dimensions must be non-zero".into()));
        }
        let max_dimension = self.device.limits().max_texture_dimension_2d;
        if width > max_dimension || height > max_dimension {
            return Err(invalid(format!(
                "GPU max texture dimension is {max_dimension}"
            )));
        }
        Ok(())
    }

    /// Fails once the device-lost callback has fired.
    pub fn ensure_alive(&self) -> Result<()> {
        if !self.health.lost.load(Ordering::Acquire) {
            return Ok(());
        }
        let message = self
            .health
            .message
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .unwrap_or_else(|| "no reason reported".to_string());
        Err(TracerError::DeviceLost(message))
    }
}

/// Runs `create` inside validation and out-of-memory error scopes and turns
/// whatever the device reports into [`TracerError::Resource`].
pub(crate) fn capture<T>(
    device: &wgpu::Device,
    label: &'static str,
    create: impl FnOnce() -> T,
) -> Result<T> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = create();
    let validation = pollster::block_on(device.pop_error_scope());
    let out_of_memory = pollster::block_on(device.pop_error_scope());
    match validation.or(out_of_memory) {
        None => Ok(value),
        Some(err) => Err(TracerError::Resource {
            label,
            message: err.to_string(),
        }),
    }
}
