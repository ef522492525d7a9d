// Descriptor sets for bound images
//
// Every bound image gets one combined image sampler set. Sets come out
// of fixed size pools which are added as the window count grows.
//
// Austin Shafer - 2024
use ash::vk;

use crate::device::Device;
use crate::{GranizoError, Result};
use utils::log;

use std::sync::{Arc, Mutex};

/// Sets per VkDescriptorPool
pub(crate) const POOL_SIZE: u32 = 32;

/// One image's descriptor set
///
/// The set goes back to its pool when this is dropped.
pub struct Descriptor {
    d_pool: Arc<Mutex<DescPool>>,
    pub(crate) d_set: vk::DescriptorSet,
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        match self.d_pool.lock() {
            Ok(mut pool) => pool.free_set(self.d_set),
            Err(_) => log::error!("Descriptor pool lock poisoned, leaking descriptor set"),
        }
    }
}

/// One VkDescriptorPool and how full it is
pub struct DescPool {
    dp_dev: Arc<Device>,
    dp_pool: vk::DescriptorPool,
    /// live sets, at most POOL_SIZE
    dp_capacity: u32,
}

impl Drop for DescPool {
    fn drop(&mut self) {
        unsafe {
            self.dp_dev.dev.destroy_descriptor_pool(self.dp_pool, None);
        }
    }
}

impl DescPool {
    /// Allocate one set from this pool
    ///
    /// Returns None if this pool is full.
    fn alloc_set(&mut self, layout: vk::DescriptorSetLayout) -> Result<Option<vk::DescriptorSet>> {
        if self.dp_capacity >= POOL_SIZE {
            return Ok(None);
        }

        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.dp_pool)
            .set_layouts(&layouts);

        let sets = unsafe {
            self.dp_dev
                .dev
                .allocate_descriptor_sets(&info)
                .or_else(|e| {
                    log::error!("Failed to allocate descriptor set: {:?}", e);
                    Err(GranizoError::COULD_NOT_ALLOCATE_DESCRIPTOR)
                })?
        };
        let set = sets
            .get(0)
            .copied()
            .ok_or(GranizoError::COULD_NOT_ALLOCATE_DESCRIPTOR)?;

        self.dp_capacity += 1;

        Ok(Some(set))
    }

    /// Hand `set` back to the pool
    fn free_set(&mut self, set: vk::DescriptorSet) {
        unsafe {
            if let Err(e) = self.dp_dev.dev.free_descriptor_sets(self.dp_pool, &[set]) {
                log::error!("Failed to free descriptor set: {:?}", e);
            }
        }
        self.dp_capacity = self.dp_capacity.saturating_sub(1);
    }
}

/// Owns every descriptor pool
///
/// This also holds the one set layout and sampler every bound image uses, and
/// fulfills allocation requests by finding an open pool to allocate from.
pub struct DescriptorSystem {
    ds_dev: Arc<Device>,
    /// A single combined image sampler at binding 0, used by the
    /// compose fragment shader as set 0
    pub(crate) ds_layout: vk::DescriptorSetLayout,
    ds_sampler: vk::Sampler,
    ds_pools: Vec<Arc<Mutex<DescPool>>>,
}

impl DescriptorSystem {
    pub fn new(dev: Arc<Device>) -> Result<Self> {
        let mut ret = Self {
            ds_dev: dev,
            ds_layout: vk::DescriptorSetLayout::null(),
            ds_sampler: vk::Sampler::null(),
            ds_pools: Vec::new(),
        };

        ret.ds_layout = ret.create_layout()?;
        ret.ds_sampler = ret.create_sampler()?;

        Ok(ret)
    }

    /// The layout of every image's set: one combined image sampler
    fn create_layout(&self) -> Result<vk::DescriptorSetLayout> {
        let bindings = [vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .descriptor_count(1)
            .build()];
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

        unsafe {
            self.ds_dev
                .dev
                .create_descriptor_set_layout(&info, None)
                .or_else(|e| {
                    log::error!("Failed to create descriptor set layout: {:?}", e);
                    Err(GranizoError::INIT_FAILED)
                })
        }
    }

    /// The sampler used for every window image
    ///
    /// Windows are drawn 1:1, so nearest filtering is all we need.
    fn create_sampler(&self) -> Result<vk::Sampler> {
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::NEAREST)
            .min_filter(vk::Filter::NEAREST)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_anisotropy(1.0)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .compare_op(vk::CompareOp::NEVER)
            .max_lod(vk::LOD_CLAMP_NONE);

        unsafe {
            self.ds_dev.dev.create_sampler(&info, None).or_else(|e| {
                log::error!("Failed to create sampler: {:?}", e);
                Err(GranizoError::INIT_FAILED)
            })
        }
    }

    /// Create another pool and start tracking it
    fn add_pool(&mut self) -> Result<Arc<Mutex<DescPool>>> {
        let sizes = [vk::DescriptorPoolSize::builder()
            .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(POOL_SIZE)
            .build()];

        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            // sets are freed one at a time as images are released
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(POOL_SIZE);

        let pool = unsafe {
            self.ds_dev
                .dev
                .create_descriptor_pool(&info, None)
                .or_else(|e| {
                    log::error!("Failed to create descriptor pool: {:?}", e);
                    Err(GranizoError::COULD_NOT_ALLOCATE_DESCRIPTOR)
                })?
        };

        let ret = Arc::new(Mutex::new(DescPool {
            dp_dev: self.ds_dev.clone(),
            dp_pool: pool,
            dp_capacity: 0,
        }));
        self.ds_pools.push(ret.clone());

        log::debug!("Added descriptor pool, {} total", self.ds_pools.len());
        Ok(ret)
    }

    fn alloc_from(&self, pool: &Arc<Mutex<DescPool>>) -> Result<Option<Descriptor>> {
        let set = match pool.lock() {
            Ok(mut p) => p.alloc_set(self.ds_layout)?,
            Err(_) => return Ok(None),
        };

        Ok(set.map(|s| Descriptor {
            d_pool: pool.clone(),
            d_set: s,
        }))
    }

    /// Get a set from the first pool with room, growing if all are
    /// full
    pub fn alloc_descriptor(&mut self) -> Result<Descriptor> {
        for pool in self.ds_pools.iter() {
            if let Some(desc) = self.alloc_from(pool)? {
                return Ok(desc);
            }
        }

        // everything is full
        let pool = self.add_pool()?;
        self.alloc_from(&pool)?
            .ok_or(GranizoError::COULD_NOT_ALLOCATE_DESCRIPTOR)
    }

    /// Point `desc` at `view`, sampled with our sampler
    pub fn write(&self, desc: &Descriptor, view: vk::ImageView) {
        let info = [vk::DescriptorImageInfo::builder()
            .sampler(self.ds_sampler)
            .image_view(view)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .build()];
        let write_info = [vk::WriteDescriptorSet::builder()
            .dst_set(desc.d_set)
            .dst_binding(0)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&info)
            .build()];

        unsafe {
            self.ds_dev.dev.update_descriptor_sets(&write_info, &[]);
        }
    }
}

impl Drop for DescriptorSystem {
    fn drop(&mut self) {
        unsafe {
            if self.ds_sampler != vk::Sampler::null() {
                self.ds_dev.dev.destroy_sampler(self.ds_sampler, None);
            }
            if self.ds_layout != vk::DescriptorSetLayout::null() {
                self.ds_dev
                    .dev
                    .destroy_descriptor_set_layout(self.ds_layout, None);
            }
        }
    }
}
