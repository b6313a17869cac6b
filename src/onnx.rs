// ============================================================================
// ONNX RUNTIME - dynamically loaded inference backend
// ============================================================================
//
// Uses `libloading` to open onnxruntime.dll / libonnxruntime.so /
// libonnxruntime.dylib at runtime, so the binary has NO compile-time
// dependency on ONNX Runtime. The library path comes from settings
// (`onnx_runtime_path`), the `MEDSCAN_ORT_PATH` variable, or `--ort`.
//
// One `OrtRuntime` (library + API table + environment) is shared by every
// session. Sessions are opened once at startup and run many times; the
// runtime documents `Run` as safe to call concurrently on one session.

#![allow(unsafe_op_in_unsafe_fn)]
#![allow(unused_unsafe)]

use std::ffi::{CStr, CString, c_char, c_void};
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::error::CheckpointError;
use crate::model::network::{Network, NetworkLoader};
use crate::{log_info, log_warn};

/// Errors that can occur during ONNX Runtime operations.
#[derive(Debug)]
pub enum OnnxError {
    DllNotFound(String),
    DllLoadFailed(String),
    ModelNotFound(String),
    ModelLoadFailed(String),
    ApiInitFailed(String),
    SessionCreateFailed(String),
    InferenceFailed(String),
    InvalidOutput(String),
}

impl fmt::Display for OnnxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnnxError::DllNotFound(p) => write!(f, "ONNX Runtime library not found: {}", p),
            OnnxError::DllLoadFailed(e) => write!(f, "Failed to load ONNX Runtime library: {}", e),
            OnnxError::ModelNotFound(p) => write!(f, "ONNX model file not found: {}", p),
            OnnxError::ModelLoadFailed(e) => write!(f, "Failed to load ONNX model: {}", e),
            OnnxError::ApiInitFailed(e) => write!(f, "ONNX Runtime API init failed: {}", e),
            OnnxError::SessionCreateFailed(e) => write!(f, "Failed to create ONNX session: {}", e),
            OnnxError::InferenceFailed(e) => write!(f, "ONNX inference failed: {}", e),
            OnnxError::InvalidOutput(e) => write!(f, "Invalid ONNX output: {}", e),
        }
    }
}

impl std::error::Error for OnnxError {}

// ============================================================================
// DEVICE
// ============================================================================

/// Where forward passes execute.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(i32),
}

impl Device {
    pub fn is_accelerator(&self) -> bool {
        !matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(id) => write!(f, "cuda:{}", id),
        }
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda(0)),
            _ => match s.strip_prefix("cuda:") {
                Some(id) => id
                    .parse::<i32>()
                    .ok()
                    .filter(|id| *id >= 0)
                    .map(Device::Cuda)
                    .ok_or_else(|| format!("invalid CUDA device index in '{}'", s)),
                None => Err(format!("unknown device '{}', expected cpu or cuda[:N]", s)),
            },
        }
    }
}

// --- ONNX Runtime C API types --------------------------------------
// Opaque handles (never dereferenced, used as pointers only)

#[repr(C)]
struct OrtEnv {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtSession {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtSessionOptions {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtValue {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtMemoryInfo {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtStatus {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtRunOptions {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtAllocator {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtTensorTypeAndShapeInfo {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtTypeInfo {
    _private: [u8; 0],
}

/// ORT API version we target (compatible with ONNX Runtime 1.16+)
const ORT_API_VERSION: u32 = 18;

/// Minimum supported ONNX Runtime version. Older builds lay out the
/// API table differently for version 18.
const ORT_MIN_VERSION: (u32, u32) = (1, 16);

#[allow(dead_code)]
#[repr(u32)]
enum OrtLoggingLevel {
    Verbose = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
    Fatal = 4,
}

#[allow(dead_code)]
#[repr(u32)]
enum ONNXTensorElementDataType {
    Undefined = 0,
    Float = 1,
}

#[repr(i32)]
#[allow(dead_code)]
enum OrtAllocatorType {
    Invalid = -1,
    DeviceAllocator = 0,
    ArenaAllocator = 1,
}

#[repr(i32)]
#[allow(dead_code)]
enum OrtMemType {
    CpuInput = -2,
    CpuOutput = -1,
    Default = 0,
}

#[cfg(windows)]
type OrtChar = u16;
#[cfg(not(windows))]
type OrtChar = c_char;

type CreateEnvFn = unsafe extern "C" fn(
    log_level: OrtLoggingLevel,
    logid: *const c_char,
    out: *mut *mut OrtEnv,
) -> *mut OrtStatus;
type CreateSessionOptionsFn =
    unsafe extern "C" fn(out: *mut *mut OrtSessionOptions) -> *mut OrtStatus;
type CreateSessionFn = unsafe extern "C" fn(
    env: *const OrtEnv,
    model_path: *const OrtChar,
    options: *const OrtSessionOptions,
    out: *mut *mut OrtSession,
) -> *mut OrtStatus;
type CreateTensorWithDataAsOrtValueFn = unsafe extern "C" fn(
    info: *const OrtMemoryInfo,
    data: *mut c_void,
    data_len: usize,
    shape: *const i64,
    shape_len: usize,
    element_type: ONNXTensorElementDataType,
    out: *mut *mut OrtValue,
) -> *mut OrtStatus;
type CreateCpuMemoryInfoFn = unsafe extern "C" fn(
    alloc_type: OrtAllocatorType,
    mem_type: OrtMemType,
    out: *mut *mut OrtMemoryInfo,
) -> *mut OrtStatus;
type RunFn = unsafe extern "C" fn(
    session: *mut OrtSession,
    run_options: *const OrtRunOptions,
    input_names: *const *const c_char,
    inputs: *const *const OrtValue,
    input_count: usize,
    output_names: *const *const c_char,
    output_count: usize,
    outputs: *mut *mut OrtValue,
) -> *mut OrtStatus;
type GetTensorMutableDataFn =
    unsafe extern "C" fn(value: *mut OrtValue, out: *mut *mut c_void) -> *mut OrtStatus;
type GetTensorTypeAndShapeFn = unsafe extern "C" fn(
    value: *const OrtValue,
    out: *mut *mut OrtTensorTypeAndShapeInfo,
) -> *mut OrtStatus;
type GetDimensionsCountFn =
    unsafe extern "C" fn(info: *const OrtTensorTypeAndShapeInfo, out: *mut usize) -> *mut OrtStatus;
type GetDimensionsFn = unsafe extern "C" fn(
    info: *const OrtTensorTypeAndShapeInfo,
    dim_values: *mut i64,
    dim_values_length: usize,
) -> *mut OrtStatus;
type ReleaseEnvFn = unsafe extern "C" fn(env: *mut OrtEnv);
type ReleaseSessionFn = unsafe extern "C" fn(session: *mut OrtSession);
type ReleaseSessionOptionsFn = unsafe extern "C" fn(options: *mut OrtSessionOptions);
type ReleaseValueFn = unsafe extern "C" fn(value: *mut OrtValue);
type ReleaseMemoryInfoFn = unsafe extern "C" fn(info: *mut OrtMemoryInfo);
type ReleaseTensorTypeAndShapeInfoFn = unsafe extern "C" fn(info: *mut OrtTensorTypeAndShapeInfo);
type ReleaseStatusFn = unsafe extern "C" fn(status: *mut OrtStatus);
type GetErrorMessageFn = unsafe extern "C" fn(status: *const OrtStatus) -> *const c_char;
type SetIntraOpNumThreadsFn =
    unsafe extern "C" fn(options: *mut OrtSessionOptions, threads: i32) -> *mut OrtStatus;
type SetSessionGraphOptimizationLevelFn =
    unsafe extern "C" fn(options: *mut OrtSessionOptions, level: u32) -> *mut OrtStatus;
type SessionGetNameFn = unsafe extern "C" fn(
    session: *const OrtSession,
    index: usize,
    allocator: *mut OrtAllocator,
    out: *mut *mut c_char,
) -> *mut OrtStatus;
type SessionGetTypeInfoFn = unsafe extern "C" fn(
    session: *const OrtSession,
    index: usize,
    type_info: *mut *mut OrtTypeInfo,
) -> *mut OrtStatus;
type GetAllocatorWithDefaultOptionsFn =
    unsafe extern "C" fn(out: *mut *mut OrtAllocator) -> *mut OrtStatus;
type AllocatorFreeFn =
    unsafe extern "C" fn(allocator: *mut OrtAllocator, ptr: *mut c_void) -> *mut OrtStatus;
type CastTypeInfoToTensorInfoFn = unsafe extern "C" fn(
    type_info: *const OrtTypeInfo,
    out: *mut *const OrtTensorTypeAndShapeInfo,
) -> *mut OrtStatus;
type ReleaseTypeInfoFn = unsafe extern "C" fn(type_info: *mut OrtTypeInfo);
/// Exported by GPU builds only, outside the API table.
type AppendCudaProviderFn =
    unsafe extern "C" fn(options: *mut OrtSessionOptions, device_id: i32) -> *mut OrtStatus;

/// OrtApiBase: the entry point struct returned by OrtGetApiBase()
#[repr(C)]
struct OrtApiBase {
    get_api: unsafe extern "C" fn(version: u32) -> *const c_void,
    get_version_string: unsafe extern "C" fn() -> *const c_char,
}

/// The OrtApi struct is a flat table of function pointers; entries are
/// fetched by index (see onnxruntime_c_api.h for the layout).
struct OrtApi {
    raw: *const c_void,
}

impl OrtApi {
    unsafe fn get_fn<T>(&self, index: usize) -> T {
        let ptr = self.raw as *const *const c_void;
        let fn_ptr = *ptr.add(index);
        std::mem::transmute_copy(&fn_ptr)
    }

    //  2: GetErrorMessage     3: CreateEnv           7: CreateSession
    //  9: Run                10: CreateSessionOptions
    // 23: SetSessionGraphOptimizationLevel          24: SetIntraOpNumThreads
    // 34: SessionGetOutputTypeInfo
    // 36: SessionGetInputName 37: SessionGetOutputName
    // 49: CreateTensorWithDataAsOrtValue            51: GetTensorMutableData
    // 55: CastTypeInfoToTensorInfo
    // 61: GetDimensionsCount 62: GetDimensions      65: GetTensorTypeAndShape
    // 69: CreateCpuMemoryInfo 76: AllocatorFree     78: GetAllocatorWithDefaultOptions
    // 92: ReleaseEnv         93: ReleaseStatus      94: ReleaseMemoryInfo
    // 95: ReleaseSession     96: ReleaseValue       98: ReleaseTypeInfo
    // 99: ReleaseTensorTypeAndShapeInfo            100: ReleaseSessionOptions

    fn get_error_message(&self) -> GetErrorMessageFn {
        unsafe { self.get_fn(2) }
    }
    fn create_env(&self) -> CreateEnvFn {
        unsafe { self.get_fn(3) }
    }
    fn create_session(&self) -> CreateSessionFn {
        unsafe { self.get_fn(7) }
    }
    fn run(&self) -> RunFn {
        unsafe { self.get_fn(9) }
    }
    fn create_session_options(&self) -> CreateSessionOptionsFn {
        unsafe { self.get_fn(10) }
    }
    fn set_session_graph_optimization_level(&self) -> SetSessionGraphOptimizationLevelFn {
        unsafe { self.get_fn(23) }
    }
    fn set_intra_op_num_threads(&self) -> SetIntraOpNumThreadsFn {
        unsafe { self.get_fn(24) }
    }
    fn session_get_output_type_info(&self) -> SessionGetTypeInfoFn {
        unsafe { self.get_fn(34) }
    }
    fn session_get_input_name(&self) -> SessionGetNameFn {
        unsafe { self.get_fn(36) }
    }
    fn session_get_output_name(&self) -> SessionGetNameFn {
        unsafe { self.get_fn(37) }
    }
    fn create_tensor_with_data(&self) -> CreateTensorWithDataAsOrtValueFn {
        unsafe { self.get_fn(49) }
    }
    fn get_tensor_mutable_data(&self) -> GetTensorMutableDataFn {
        unsafe { self.get_fn(51) }
    }
    fn cast_type_info_to_tensor_info(&self) -> CastTypeInfoToTensorInfoFn {
        unsafe { self.get_fn(55) }
    }
    fn get_dimensions_count(&self) -> GetDimensionsCountFn {
        unsafe { self.get_fn(61) }
    }
    fn get_dimensions(&self) -> GetDimensionsFn {
        unsafe { self.get_fn(62) }
    }
    fn get_tensor_type_and_shape(&self) -> GetTensorTypeAndShapeFn {
        unsafe { self.get_fn(65) }
    }
    fn create_cpu_memory_info(&self) -> CreateCpuMemoryInfoFn {
        unsafe { self.get_fn(69) }
    }
    fn allocator_free(&self) -> AllocatorFreeFn {
        unsafe { self.get_fn(76) }
    }
    fn get_allocator_with_default_options(&self) -> GetAllocatorWithDefaultOptionsFn {
        unsafe { self.get_fn(78) }
    }
    fn release_env(&self) -> ReleaseEnvFn {
        unsafe { self.get_fn(92) }
    }
    fn release_status(&self) -> ReleaseStatusFn {
        unsafe { self.get_fn(93) }
    }
    fn release_memory_info(&self) -> ReleaseMemoryInfoFn {
        unsafe { self.get_fn(94) }
    }
    fn release_session(&self) -> ReleaseSessionFn {
        unsafe { self.get_fn(95) }
    }
    fn release_value(&self) -> ReleaseValueFn {
        unsafe { self.get_fn(96) }
    }
    fn release_type_info(&self) -> ReleaseTypeInfoFn {
        unsafe { self.get_fn(98) }
    }
    fn release_tensor_type_and_shape_info(&self) -> ReleaseTensorTypeAndShapeInfoFn {
        unsafe { self.get_fn(99) }
    }
    fn release_session_options(&self) -> ReleaseSessionOptionsFn {
        unsafe { self.get_fn(100) }
    }
}

/// Turn an OrtStatus into a Result, releasing the status. Null is success.
unsafe fn status_to_result(api: &OrtApi, status: *mut OrtStatus) -> Result<(), String> {
    if status.is_null() {
        return Ok(());
    }
    let msg_ptr = (api.get_error_message())(status);
    let msg = if msg_ptr.is_null() {
        "Unknown error".to_string()
    } else {
        CStr::from_ptr(msg_ptr).to_string_lossy().into_owned()
    };
    (api.release_status())(status);
    Err(msg)
}

// ============================================================================
// PATH CHECKS
// ============================================================================

/// Validate that a runtime library or model path is safe to load:
/// absolute, no `..` components, and the right extension. Rejections name
/// the runtime library or the model, whichever `for_dll` says was checked.
pub fn validate_onnx_path(path: &Path, for_dll: bool) -> Result<(), OnnxError> {
    let reject = |msg: String| {
        if for_dll {
            OnnxError::DllLoadFailed(msg)
        } else {
            OnnxError::ModelLoadFailed(msg)
        }
    };
    if path.as_os_str().is_empty() {
        let msg = "Path is empty".to_string();
        return Err(if for_dll {
            OnnxError::DllNotFound(msg)
        } else {
            OnnxError::ModelNotFound(msg)
        });
    }
    if !path.is_absolute() {
        return Err(reject(format!(
            "ONNX path must be absolute: {}",
            path.display()
        )));
    }
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(reject(format!(
            "ONNX path must not contain '..' components: {}",
            path.display()
        )));
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    if for_dll {
        if !["dll", "so", "dylib"].contains(&ext.as_str()) && !is_versioned_so(path) {
            return Err(reject(format!(
                "Expected a .dll/.so/.dylib file, got '.{}'",
                ext
            )));
        }
    } else if ext != "onnx" {
        return Err(reject(format!(
            "Expected a .onnx model file, got '.{}'",
            ext
        )));
    }
    Ok(())
}

/// Canonical form of a user-supplied path: symlinks and `..` resolved
/// against the current directory. Falls back to a plain absolute path, then
/// to the input, when the path does not exist yet.
pub fn resolve_path(path: &Path) -> PathBuf {
    fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// `libonnxruntime.so.1.18.0` style names.
fn is_versioned_so(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.contains(".so."))
}

/// Parse a version string like "1.18.0" into (major, minor).
fn parse_ort_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split('.');
    let major: u32 = parts.next()?.trim().parse().ok()?;
    let minor: u32 = parts.next()?.trim().parse().ok()?;
    Some((major, minor))
}

fn is_supported_version(version: &str) -> bool {
    match parse_ort_version(version) {
        Some((major, minor)) => (major, minor) >= ORT_MIN_VERSION,
        // Unparseable strings are let through; the API table check still runs.
        None => true,
    }
}

// ============================================================================
// RUNTIME
// ============================================================================

/// A loaded ONNX Runtime library plus its API table and environment.
pub struct OrtRuntime {
    api: OrtApi,
    env: *mut OrtEnv,
    version: String,
    // Dropped last: every function pointer above lives in this library.
    lib: libloading::Library,
}

// The API table and environment are immutable after creation and the
// runtime is documented as thread-safe at this level.
unsafe impl Send for OrtRuntime {}
unsafe impl Sync for OrtRuntime {}

impl OrtRuntime {
    /// Open the runtime library, enforce the minimum version and create
    /// the shared environment.
    pub fn load(dll_path: &Path) -> Result<Arc<Self>, OnnxError> {
        validate_onnx_path(dll_path, true)?;
        if !dll_path.exists() {
            return Err(OnnxError::DllNotFound(dll_path.display().to_string()));
        }

        unsafe {
            let lib = libloading::Library::new(dll_path)
                .map_err(|e| OnnxError::DllLoadFailed(e.to_string()))?;

            let api_base = {
                let get_api_base: libloading::Symbol<unsafe extern "C" fn() -> *const OrtApiBase> =
                    lib.get(b"OrtGetApiBase").map_err(|e| {
                        OnnxError::DllLoadFailed(format!("Symbol OrtGetApiBase not found: {}", e))
                    })?;
                get_api_base()
            };
            if api_base.is_null() {
                return Err(OnnxError::ApiInitFailed(
                    "OrtGetApiBase returned null".to_string(),
                ));
            }

            let version_ptr = ((*api_base).get_version_string)();
            let version = if version_ptr.is_null() {
                "unknown".to_string()
            } else {
                CStr::from_ptr(version_ptr).to_string_lossy().into_owned()
            };
            if !is_supported_version(&version) {
                return Err(OnnxError::ApiInitFailed(format!(
                    "ONNX Runtime {} is too old, minimum supported version is {}.{}",
                    version, ORT_MIN_VERSION.0, ORT_MIN_VERSION.1
                )));
            }

            let api_ptr = ((*api_base).get_api)(ORT_API_VERSION);
            if api_ptr.is_null() {
                return Err(OnnxError::ApiInitFailed(format!(
                    "OrtGetApi({}) returned null, library version {} may be too old",
                    ORT_API_VERSION, version
                )));
            }
            let api = OrtApi { raw: api_ptr };

            let log_id =
                CString::new("medscan").map_err(|e| OnnxError::ApiInitFailed(e.to_string()))?;
            let mut env: *mut OrtEnv = std::ptr::null_mut();
            status_to_result(
                &api,
                (api.create_env())(OrtLoggingLevel::Warning, log_id.as_ptr(), &mut env),
            )
            .map_err(OnnxError::ApiInitFailed)?;

            log_info!("[onnx] runtime {} loaded from {}", version, dll_path.display());
            Ok(Arc::new(Self { api, env, version, lib }))
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Register the CUDA provider on `options`. `false` when this build of
    /// the runtime has no CUDA support or the device cannot be used.
    unsafe fn append_cuda(&self, options: *mut OrtSessionOptions, device_id: i32) -> bool {
        let append: libloading::Symbol<AppendCudaProviderFn> =
            match self.lib.get(b"OrtSessionOptionsAppendExecutionProvider_CUDA") {
                Ok(sym) => sym,
                Err(_) => {
                    log_warn!("[onnx] runtime has no CUDA provider, using CPU");
                    return false;
                }
            };
        match status_to_result(&self.api, append(options, device_id)) {
            Ok(()) => true,
            Err(e) => {
                log_warn!("[onnx] CUDA device {} unavailable ({}), using CPU", device_id, e);
                false
            }
        }
    }
}

impl Drop for OrtRuntime {
    fn drop(&mut self) {
        unsafe { (self.api.release_env())(self.env) };
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// One loaded graph, ready to run.
pub struct OnnxSession {
    runtime: Arc<OrtRuntime>,
    session: *mut OrtSession,
    options: *mut OrtSessionOptions,
    memory_info: *mut OrtMemoryInfo,
    input_name: CString,
    output_name: CString,
    output_classes: Option<usize>,
    device: Device,
}

// Run is thread-safe on one session; every other handle is read-only here.
unsafe impl Send for OnnxSession {}
unsafe impl Sync for OnnxSession {}

impl OnnxSession {
    pub fn open(
        runtime: Arc<OrtRuntime>,
        model_path: &Path,
        device: Device,
        intra_op_threads: usize,
    ) -> Result<Self, OnnxError> {
        validate_onnx_path(model_path, false)?;
        if !model_path.exists() {
            return Err(OnnxError::ModelNotFound(model_path.display().to_string()));
        }
        let api = &runtime.api;

        unsafe {
            let mut options: *mut OrtSessionOptions = std::ptr::null_mut();
            status_to_result(api, (api.create_session_options())(&mut options))
                .map_err(OnnxError::SessionCreateFailed)?;

            let threads = if intra_op_threads == 0 {
                std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
            } else {
                intra_op_threads
            };
            let _ = status_to_result(
                api,
                (api.set_intra_op_num_threads())(options, threads as i32),
            );
            // ORT_ENABLE_ALL = 99
            let _ = status_to_result(
                api,
                (api.set_session_graph_optimization_level())(options, 99),
            );

            let device = match device {
                Device::Cuda(id) if runtime.append_cuda(options, id) => Device::Cuda(id),
                _ => Device::Cpu,
            };

            let path_c = match encode_model_path(model_path) {
                Ok(p) => p,
                Err(e) => {
                    (api.release_session_options())(options);
                    return Err(e);
                }
            };
            let mut session: *mut OrtSession = std::ptr::null_mut();
            let status =
                (api.create_session())(runtime.env, path_c.as_ptr(), options, &mut session);
            if let Err(e) = status_to_result(api, status) {
                (api.release_session_options())(options);
                return Err(OnnxError::ModelLoadFailed(e));
            }

            let mut memory_info: *mut OrtMemoryInfo = std::ptr::null_mut();
            if let Err(e) = status_to_result(
                api,
                (api.create_cpu_memory_info())(
                    OrtAllocatorType::ArenaAllocator,
                    OrtMemType::Default,
                    &mut memory_info,
                ),
            ) {
                (api.release_session())(session);
                (api.release_session_options())(options);
                return Err(OnnxError::SessionCreateFailed(format!("Create memory info: {}", e)));
            }

            // From here on Drop cleans up.
            let mut this = Self {
                runtime: runtime.clone(),
                session,
                options,
                memory_info,
                input_name: CString::default(),
                output_name: CString::default(),
                output_classes: None,
                device,
            };

            let mut allocator: *mut OrtAllocator = std::ptr::null_mut();
            status_to_result(api, (api.get_allocator_with_default_options())(&mut allocator))
                .map_err(|e| OnnxError::SessionCreateFailed(format!("Get allocator: {}", e)))?;
            this.input_name =
                session_name(api, session, 0, allocator, api.session_get_input_name())?;
            this.output_name =
                session_name(api, session, 0, allocator, api.session_get_output_name())?;
            this.output_classes = output_class_count(api, session);

            log_info!(
                "[onnx] loaded {} on {} (input '{}', output '{}', classes {:?})",
                model_path.display(),
                device,
                this.input_name.to_string_lossy(),
                this.output_name.to_string_lossy(),
                this.output_classes
            );
            Ok(this)
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Run one NCHW float tensor of shape `[1, 3, size, size]` and return
    /// the first output flattened.
    pub fn run(&self, input: &[f32], size: u32) -> Result<Vec<f32>, OnnxError> {
        let expected = 3 * size as usize * size as usize;
        if input.len() != expected {
            return Err(OnnxError::InferenceFailed(format!(
                "input has {} values, expected {}",
                input.len(),
                expected
            )));
        }
        let api = &self.runtime.api;
        let shape: [i64; 4] = [1, 3, size as i64, size as i64];
        // The runtime takes a mutable pointer but does not write inputs.
        let mut data = input.to_vec();

        unsafe {
            let mut input_tensor: *mut OrtValue = std::ptr::null_mut();
            status_to_result(
                api,
                (api.create_tensor_with_data())(
                    self.memory_info,
                    data.as_mut_ptr() as *mut c_void,
                    data.len() * std::mem::size_of::<f32>(),
                    shape.as_ptr(),
                    shape.len(),
                    ONNXTensorElementDataType::Float,
                    &mut input_tensor,
                ),
            )
            .map_err(|e| OnnxError::InferenceFailed(format!("Create input tensor: {}", e)))?;

            let input_names = [self.input_name.as_ptr()];
            let output_names = [self.output_name.as_ptr()];
            let inputs = [input_tensor as *const OrtValue];
            let mut output: *mut OrtValue = std::ptr::null_mut();

            let status = (api.run())(
                self.session,
                std::ptr::null(),
                input_names.as_ptr(),
                inputs.as_ptr(),
                1,
                output_names.as_ptr(),
                1,
                &mut output,
            );
            let result = status_to_result(api, status)
                .map_err(OnnxError::InferenceFailed)
                .and_then(|_| read_output(api, output));

            if !output.is_null() {
                (api.release_value())(output);
            }
            (api.release_value())(input_tensor);
            result
        }
    }
}

impl Drop for OnnxSession {
    fn drop(&mut self) {
        let api = &self.runtime.api;
        unsafe {
            (api.release_memory_info())(self.memory_info);
            (api.release_session())(self.session);
            (api.release_session_options())(self.options);
        }
    }
}

impl Network for OnnxSession {
    fn forward(&self, input: &[f32], size: u32) -> Result<Vec<f32>, OnnxError> {
        self.run(input, size)
    }

    fn output_classes(&self) -> Option<usize> {
        self.output_classes
    }

    fn device(&self) -> Option<Device> {
        Some(self.device)
    }
}

#[cfg(windows)]
fn encode_model_path(path: &Path) -> Result<Vec<u16>, OnnxError> {
    use std::os::windows::ffi::OsStrExt;
    Ok(path.as_os_str().encode_wide().chain(std::iter::once(0)).collect())
}

#[cfg(not(windows))]
fn encode_model_path(path: &Path) -> Result<CString, OnnxError> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| OnnxError::ModelLoadFailed(format!("invalid model path: {}", e)))
}

/// Input or output name at `index`, copied out of the runtime's allocator.
unsafe fn session_name(
    api: &OrtApi,
    session: *mut OrtSession,
    index: usize,
    allocator: *mut OrtAllocator,
    getter: SessionGetNameFn,
) -> Result<CString, OnnxError> {
    let mut name_ptr: *mut c_char = std::ptr::null_mut();
    status_to_result(api, getter(session as *const _, index, allocator, &mut name_ptr))
        .map_err(|e| OnnxError::SessionCreateFailed(format!("Get tensor name: {}", e)))?;
    if name_ptr.is_null() {
        return Err(OnnxError::SessionCreateFailed("tensor name is null".to_string()));
    }
    let name = CStr::from_ptr(name_ptr).to_owned();
    let _ = status_to_result(api, (api.allocator_free())(allocator, name_ptr as *mut c_void));
    Ok(name)
}

/// Size of the last dimension of output 0, when the graph declares it.
unsafe fn output_class_count(api: &OrtApi, session: *mut OrtSession) -> Option<usize> {
    let mut type_info: *mut OrtTypeInfo = std::ptr::null_mut();
    if status_to_result(
        api,
        (api.session_get_output_type_info())(session as *const _, 0, &mut type_info),
    )
    .is_err()
        || type_info.is_null()
    {
        return None;
    }

    // tensor_info is owned by type_info, do NOT release separately
    let mut tensor_info: *const OrtTensorTypeAndShapeInfo = std::ptr::null();
    let classes = if status_to_result(
        api,
        (api.cast_type_info_to_tensor_info())(type_info as *const _, &mut tensor_info),
    )
    .is_ok()
        && !tensor_info.is_null()
    {
        dimensions(api, tensor_info)
            .and_then(|dims| dims.last().copied())
            .filter(|&d| d > 0)
            .map(|d| d as usize)
    } else {
        None
    };
    (api.release_type_info())(type_info);
    classes
}

unsafe fn dimensions(api: &OrtApi, info: *const OrtTensorTypeAndShapeInfo) -> Option<Vec<i64>> {
    let mut count: usize = 0;
    status_to_result(api, (api.get_dimensions_count())(info, &mut count)).ok()?;
    let mut dims = vec![0i64; count];
    status_to_result(api, (api.get_dimensions())(info, dims.as_mut_ptr(), count)).ok()?;
    Some(dims)
}

unsafe fn read_output(api: &OrtApi, output: *mut OrtValue) -> Result<Vec<f32>, OnnxError> {
    if output.is_null() {
        return Err(OnnxError::InvalidOutput("no output tensor".to_string()));
    }
    let mut info: *mut OrtTensorTypeAndShapeInfo = std::ptr::null_mut();
    status_to_result(api, (api.get_tensor_type_and_shape())(output as *const _, &mut info))
        .map_err(|e| OnnxError::InvalidOutput(format!("Get output shape: {}", e)))?;
    let dims = dimensions(api, info);
    (api.release_tensor_type_and_shape_info())(info);
    let dims = dims.ok_or_else(|| OnnxError::InvalidOutput("unreadable output shape".to_string()))?;
    if dims.iter().any(|&d| d < 0) {
        return Err(OnnxError::InvalidOutput(format!("dynamic output shape {:?}", dims)));
    }
    let total: usize = dims.iter().map(|&d| d as usize).product();

    let mut data_ptr: *mut c_void = std::ptr::null_mut();
    status_to_result(api, (api.get_tensor_mutable_data())(output, &mut data_ptr))
        .map_err(|e| OnnxError::InvalidOutput(format!("Get tensor data: {}", e)))?;
    if data_ptr.is_null() || total == 0 {
        return Err(OnnxError::InvalidOutput(format!("empty output {:?}", dims)));
    }
    Ok(std::slice::from_raw_parts(data_ptr as *const f32, total).to_vec())
}

// ============================================================================
// LOADER
// ============================================================================

/// Opens checkpoint graphs as ONNX Runtime sessions.
pub struct OnnxLoader {
    runtime: Arc<OrtRuntime>,
    device: Device,
    intra_op_threads: usize,
}

impl OnnxLoader {
    pub fn new(runtime: Arc<OrtRuntime>, device: Device, intra_op_threads: usize) -> Self {
        Self {
            runtime,
            device,
            intra_op_threads,
        }
    }
}

impl NetworkLoader for OnnxLoader {
    fn load(&self, graph: &Path) -> Result<Box<dyn Network>, CheckpointError> {
        if !graph.exists() {
            return Err(CheckpointError::Missing(graph.to_path_buf()));
        }
        let session = OnnxSession::open(
            self.runtime.clone(),
            graph,
            self.device,
            self.intra_op_threads,
        )?;
        Ok(Box::new(session))
    }
}
