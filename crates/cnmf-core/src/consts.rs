/// Minimum pixel count (h*w) to use pixel-level Rayon parallelism.
pub const PARALLEL_PIXEL_THRESHOLD: usize = 65_536;

/// Minimum component count to trace contours in parallel.
pub const PARALLEL_COMPONENT_THRESHOLD: usize = 8;

/// Number of frames decoded per batch while building the array caches.
/// At 512x512 f32, 64 frames = 64 MB of decoded data in flight.
pub const CACHE_BATCH_FRAMES: usize = 64;

/// Cumulative-energy threshold used to turn final footprints into ROIs.
pub const DEFAULT_CONTOUR_THRESHOLD: f64 = 0.9;

/// Default Gaussian half-width of a neuron, in pixels (per axis).
pub const DEFAULT_GSIG: [usize; 2] = [9, 9];

/// Default iteration caps for component initialization.
pub const DEFAULT_INIT_ITERATIONS: usize = 10;

/// Default correlation threshold for merging in the whole-frame pass.
pub const DEFAULT_MERGE_THRESHOLD: f64 = 0.7;

/// Default maximum number of components merged at once in the whole-frame pass.
pub const DEFAULT_MAX_MERGE: usize = 100;

/// Default correlation threshold for the global merge after patch reduction.
pub const DEFAULT_PATCH_MERGE_THRESHOLD: f64 = 0.8;

/// Default patch half-size in pixels. rf = 16 gives 33x33 patches.
pub const DEFAULT_PATCH_HALF_SIZE: usize = 16;

/// Default overlap between neighbouring patches, in pixels.
pub const DEFAULT_PATCH_STRIDE: usize = 2;

/// Memory factor handed to the patch map-reduce.
pub const DEFAULT_MEMORY_FACT: f64 = 4.0;

/// Recording length (in frames) at which the per-process pixel budget of the
/// global patched updates starts to shrink.
pub const DEFAULT_MEMORY_SAFETY_FRAMES: f64 = 2000.0;

/// Divisor applied to the available CPU count when sizing the worker pool.
pub const WORKER_CPU_DIVISOR: usize = 2;

/// Points of the placeholder polygon emitted for components without a contour.
pub const DEGENERATE_POLYGON: [[f64; 2]; 3] = [[0.0, 0.0], [0.0, 0.0], [0.0, 0.0]];

/// File suffixes of the persisted artifacts, appended to `<cache_dir>/<name>`.
pub const CUBE_SUFFIX: &str = "_Y.npy";
pub const FLAT_SUFFIX: &str = "_Yr.npy";
pub const BUNDLE_SUFFIX: &str = "_cnmf.mat";
pub const PROJECTION_SUFFIX: &str = "_proj.npy";
pub const FINGERPRINT_EXTENSION: &str = "fingerprint";
