//! GPU backend implementation using wgpu.
//!
//! Scores one query code against a block of codes with a compute shader.

use std::sync::OnceLock;
use wgpu::util::DeviceExt;

use crate::error::{Error, Result};

/// Global GPU availability check (cached).
static GPU_AVAILABLE: OnceLock<bool> = OnceLock::new();

/// Packs byte codes into little-endian u32 words, zero-padding each code.
pub(super) fn pack_words(codes: &[u8], code_size: usize) -> (Vec<u32>, usize) {
    let words = code_size.div_ceil(4);
    let mut packed = Vec::with_capacity(codes.len() / code_size.max(1) * words);
    for code in codes.chunks_exact(code_size) {
        for chunk in code.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            packed.push(u32::from_le_bytes(word));
        }
    }
    (packed, words)
}

/// GPU accelerator for batch Hamming scoring.
///
/// # Example
///
/// ```ignore
/// use ivfbin_core::gpu::GpuHammingAccelerator;
///
/// if let Some(gpu) = GpuHammingAccelerator::new() {
///     let distances = gpu.batch_hamming(&query, &codes, 32)?;
/// }
/// ```
pub struct GpuHammingAccelerator {
    device: wgpu::Device,
    queue: wgpu::Queue,
    hamming_pipeline: wgpu::ComputePipeline,
}

impl GpuHammingAccelerator {
    /// Creates a new GPU accelerator if GPU is available.
    ///
    /// Returns `None` if no compatible GPU is found.
    #[must_use]
    pub fn new() -> Option<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("ivfbin GPU"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .ok()?;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Hamming Shader"),
            source: wgpu::ShaderSource::Wgsl(HAMMING_SHADER.into()),
        });

        let storage_entry = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Hamming Bind Group Layout"),
            entries: &[
                // Query code
                storage_entry(0, true),
                // Inverted list codes
                storage_entry(1, true),
                // Distances
                storage_entry(2, false),
                // Params (words per code, number of codes)
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Hamming Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let hamming_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Hamming Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("batch_hamming"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        Some(Self {
            device,
            queue,
            hamming_pipeline,
        })
    }

    /// Checks if GPU acceleration is available (cached).
    #[must_use]
    pub fn is_available() -> bool {
        *GPU_AVAILABLE.get_or_init(|| Self::new().is_some())
    }

    /// Computes Hamming distances between `query` and each code in `codes`.
    ///
    /// # Errors
    ///
    /// Returns `DeviceExecution` if the result buffer cannot be mapped back.
    pub fn batch_hamming(&self, query: &[u8], codes: &[u8], code_size: usize) -> Result<Vec<u32>> {
        if code_size == 0 || codes.len() < code_size {
            return Ok(Vec::new());
        }
        let num_codes = codes.len() / code_size;

        let (query_words, words) = pack_words(&query[..code_size], code_size);
        let (code_words, _) = pack_words(&codes[..num_codes * code_size], code_size);

        let query_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Query Buffer"),
                contents: bytemuck::cast_slice(&query_words),
                usage: wgpu::BufferUsages::STORAGE,
            });

        let codes_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Codes Buffer"),
                contents: bytemuck::cast_slice(&code_words),
                usage: wgpu::BufferUsages::STORAGE,
            });

        let results_size = (num_codes * std::mem::size_of::<u32>()) as u64;
        let results_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Distances Buffer"),
            size: results_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size: results_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        // Params: [words, num_codes, pad, pad]
        #[allow(clippy::cast_possible_truncation)]
        let params = [words as u32, num_codes as u32, 0, 0];
        let params_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Params Buffer"),
                contents: bytemuck::cast_slice(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let bind_group_layout = self.hamming_pipeline.get_bind_group_layout(0);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Hamming Bind Group"),
            layout: &bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: query_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: codes_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: results_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: params_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Hamming Encoder"),
            });

        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Hamming Pass"),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(&self.hamming_pipeline);
            compute_pass.set_bind_group(0, &bind_group, &[]);

            #[allow(clippy::cast_possible_truncation)]
            let workgroups = num_codes.div_ceil(256) as u32;
            compute_pass.dispatch_workgroups(workgroups, 1, 1);
        }

        encoder.copy_buffer_to_buffer(&results_buffer, 0, &staging_buffer, 0, results_size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        if rx.recv().ok().and_then(|r| r.ok()).is_none() {
            return Err(Error::DeviceExecution(
                "failed to map Hamming distance buffer".to_string(),
            ));
        }

        let data = buffer_slice.get_mapped_range();
        let results: Vec<u32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging_buffer.unmap();

        Ok(results)
    }
}

/// WGSL compute shader for batch Hamming distance.
const HAMMING_SHADER: &str = r"
struct Params {
    words: u32,
    num_codes: u32,
    _pad0: u32,
    _pad1: u32,
}

@group(0) @binding(0) var<storage, read> query: array<u32>;
@group(0) @binding(1) var<storage, read> codes: array<u32>;
@group(0) @binding(2) var<storage, read_write> results: array<u32>;
@group(0) @binding(3) var<uniform> params: Params;

@compute @workgroup_size(256)
fn batch_hamming(@builtin(global_invocation_id) id: vec3<u32>) {
    let idx = id.x;
    if (idx >= params.num_codes) {
        return;
    }

    let offset = idx * params.words;
    var count: u32 = 0u;

    for (var i: u32 = 0u; i < params.words; i = i + 1u) {
        count = count + countOneBits(query[i] ^ codes[offset + i]);
    }

    results[idx] = count;
}
";

