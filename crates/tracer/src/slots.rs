use std::fmt;

use crate::encode::{CAMERA_BYTES, LIGHT_BYTES, PARAMS_BYTES};

/// Number of bindings in the kernel's group 0.
pub const SLOT_COUNT: usize = 4;

/// Bind group index the slot table is bound at.
pub const BIND_GROUP_INDEX: u32 = 0;

/// The four fixed binding indices shared with the kernel.
///
/// The discriminants are the binding numbers; they never change for the
/// lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingSlot {
    Camera = 0,
    Light = 1,
    OutputImage = 2,
    Params = 3,
}

impl BindingSlot {
    pub const ALL: [BindingSlot; SLOT_COUNT] = [
        BindingSlot::Camera,
        BindingSlot::Light,
        BindingSlot::OutputImage,
        BindingSlot::Params,
    ];

    pub fn index(self) -> u32 {
        self as u32
    }

    pub fn from_index(index: u32) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn kind(self) -> SlotKind {
        match self {
            BindingSlot::OutputImage => SlotKind::StorageImage,
            _ => SlotKind::StorageBuffer,
        }
    }

    /// Whether the slot is rewritten on every frame.
    pub fn is_dynamic(self) -> bool {
        matches!(self, BindingSlot::Camera | BindingSlot::Params)
    }

    /// Bytes the frame loop encodes into the slot; zero for the image.
    pub fn payload_bytes(self) -> u64 {
        let bytes = match self {
            BindingSlot::Camera => CAMERA_BYTES,
            BindingSlot::Light => LIGHT_BYTES,
            BindingSlot::OutputImage => 0,
            BindingSlot::Params => PARAMS_BYTES,
        };
        bytes as u64
    }

    pub(crate) fn label(self) -> &'static str {
        match self {
            BindingSlot::Camera => "camera buffer",
            BindingSlot::Light => "light buffer",
            BindingSlot::OutputImage => "output image",
            BindingSlot::Params => "params buffer",
        }
    }
}

impl fmt::Display for BindingSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    StorageBuffer,
    StorageImage,
}

/// How the kernel accesses a slot. Derived from the kernel's declarations so
/// the layout matches what the module expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

pub(crate) fn layout_entry(
    slot: BindingSlot,
    access: SlotAccess,
    image_format: wgpu::TextureFormat,
) -> wgpu::BindGroupLayoutEntry {
    let ty = match slot.kind() {
        SlotKind::StorageBuffer => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage {
                read_only: matches!(access, SlotAccess::ReadOnly),
            },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        SlotKind::StorageImage => wgpu::BindingType::StorageTexture {
            access: match access {
                SlotAccess::ReadOnly => wgpu::StorageTextureAccess::ReadOnly,
                SlotAccess::WriteOnly => wgpu::StorageTextureAccess::WriteOnly,
                SlotAccess::ReadWrite => wgpu::StorageTextureAccess::ReadWrite,
            },
            format: image_format,
            view_dimension: wgpu::TextureViewDimension::D2,
        },
    };
    wgpu::BindGroupLayoutEntry {
        binding: slot.index(),
        visibility: wgpu::ShaderStages::COMPUTE,
        ty,
        count: None,
    }
}

/// The GPU object a slot currently points at.
pub(crate) enum SlotResource {
    Buffer(wgpu::Buffer),
    Image(wgpu::TextureView),
}

impl SlotResource {
    fn binding(&self) -> wgpu::BindingResource<'_> {
        match self {
            SlotResource::Buffer(buffer) => buffer.as_entire_binding(),
            SlotResource::Image(view) => wgpu::BindingResource::TextureView(view),
        }
    }

    /// Frees GPU memory now instead of waiting for the last handle to drop.
    pub(crate) fn release(self) {
        if let SlotResource::Buffer(buffer) = self {
            buffer.destroy();
        }
    }
}

struct SlotEntry {
    resource: SlotResource,
    generation: u64,
}

/// The full set of slot resources, always complete, indexed by binding.
///
/// Handles cannot be patched inside an existing bind group, so replacing a
/// slot here is followed by recreating the whole group from [`Self::entries_with`].
pub(crate) struct SlotTable {
    entries: [SlotEntry; SLOT_COUNT],
}

impl SlotTable {
    pub(crate) fn new(
        camera: wgpu::Buffer,
        light: wgpu::Buffer,
        output: wgpu::TextureView,
        params: wgpu::Buffer,
    ) -> Self {
        let entry = |resource| SlotEntry {
            resource,
            generation: 0,
        };
        Self {
            entries: [
                entry(SlotResource::Buffer(camera)),
                entry(SlotResource::Buffer(light)),
                entry(SlotResource::Image(output)),
                entry(SlotResource::Buffer(params)),
            ],
        }
    }

    /// Points `slot` at a new resource and hands back the previous one.
    pub(crate) fn replace(&mut self, slot: BindingSlot, resource: SlotResource) -> SlotResource {
        let entry = &mut self.entries[slot.index() as usize];
        entry.generation += 1;
        std::mem::replace(&mut entry.resource, resource)
    }

    pub(crate) fn generations(&self) -> SlotGenerations {
        SlotGenerations(std::array::from_fn(|index| self.entries[index].generation))
    }

    /// Bind group entries for every slot, taking `staged` resources in place
    /// of the current ones. The table itself is not modified, so a failed
    /// bind group leaves the previous slots intact.
    pub(crate) fn entries_with<'a>(
        &'a self,
        staged: &'a [(BindingSlot, SlotResource)],
    ) -> Vec<wgpu::BindGroupEntry<'a>> {
        BindingSlot::ALL
            .iter()
            .map(|slot| {
                let resource = staged
                    .iter()
                    .find(|(candidate, _)| candidate == slot)
                    .map(|(_, resource)| resource)
                    .unwrap_or(&self.entries[slot.index() as usize].resource);
                wgpu::BindGroupEntry {
                    binding: slot.index(),
                    resource: resource.binding(),
                }
            })
            .collect()
    }

    pub(crate) fn release(self) {
        for entry in self.entries {
            entry.resource.release();
        }
    }
}

/// How many times each slot has been re-pointed since setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotGenerations([u64; SLOT_COUNT]);

impl SlotGenerations {
    pub fn get(&self, slot: BindingSlot) -> u64 {
        self.0[slot.index() as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_indices_are_fixed() {
        let indices: Vec<u32> = BindingSlot::ALL.iter().map(|slot| slot.index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        for index in 0..SLOT_COUNT as u32 {
            assert_eq!(BindingSlot::from_index(index).map(BindingSlot::index), Some(index));
        }
        assert_eq!(BindingSlot::from_index(4), None);
    }

    #[test]
    fn only_camera_and_params_are_dynamic() {
        let dynamic: Vec<BindingSlot> = BindingSlot::ALL
            .into_iter()
            .filter(|slot| slot.is_dynamic())
            .collect();
        assert_eq!(dynamic, vec![BindingSlot::Camera, BindingSlot::Params]);
    }

    #[test]
    fn layout_entries_follow_slot_kind() {
        let image = layout_entry(
            BindingSlot::OutputImage,
            SlotAccess::WriteOnly,
            wgpu::TextureFormat::Rgba32Float,
        );
        assert_eq!(image.binding, 2);
        assert!(matches!(
            image.ty,
            wgpu::BindingType::StorageTexture {
                access: wgpu::StorageTextureAccess::WriteOnly,
                format: wgpu::TextureFormat::Rgba32Float,
                ..
            }
        ));

        let light = layout_entry(
            BindingSlot::Light,
            SlotAccess::ReadOnly,
            wgpu::TextureFormat::Rgba32Float,
        );
        assert_eq!(light.binding, 1);
        assert!(matches!(
            light.ty,
            wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: true },
                ..
            }
        ));
    }
}
