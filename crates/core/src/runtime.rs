//! Discovery of ONNX Runtime and the GPU libraries its providers need.
//!
//! `ort` is built with `load-dynamic`, so `libonnxruntime` is resolved at
//! runtime through `ORT_DYLIB_PATH`. CUDA, cuDNN and TensorRT are preloaded by
//! absolute path because the dynamic loader ignores `LD_LIBRARY_PATH` changes
//! made after process start.

use std::collections::HashSet;
use std::env;
#[cfg(windows)]
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Where the ONNX Runtime library came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrtDylib {
    FromEnv(PathBuf),
    Discovered(PathBuf),
    Missing,
}

/// GPU runtime families, in load order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GpuLibTier {
    CudaRuntime,
    Cudnn,
    TensorRt,
}

#[derive(Debug, Clone)]
pub struct RuntimeLibReport {
    pub search_dirs: Vec<PathBuf>,
    pub ort_dylib: OrtDylib,
    pub preloaded: Vec<PathBuf>,
}

/// Probe order: `<exe>/` (Windows), `<exe>/lib`, `<exe>/../lib`, `<cwd>/lib`,
/// then `/usr/local/lib` and `/usr/lib` on Unix.
pub fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

pub fn find_ort_dylib(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// `None` for anything that must not be preloaded. ORT's own provider
/// libraries need symbols from `libonnxruntime` and are left to `ort`.
#[cfg(unix)]
pub fn gpu_lib_tier(name: &str) -> Option<GpuLibTier> {
    let name = name.to_ascii_lowercase();
    const CUDA: [&str; 4] = ["libcudart", "libcublas", "libcufft", "libcurand"];
    if CUDA.iter().any(|prefix| name.starts_with(prefix)) {
        Some(GpuLibTier::CudaRuntime)
    } else if name.starts_with("libcudnn") {
        Some(GpuLibTier::Cudnn)
    } else if name.starts_with("libnvinfer") || name.starts_with("libnvonnxparser") {
        Some(GpuLibTier::TensorRt)
    } else {
        None
    }
}

#[cfg(windows)]
pub fn gpu_lib_tier(name: &str) -> Option<GpuLibTier> {
    let name = name.to_ascii_lowercase();
    const CUDA: [&str; 3] = ["cudart64_", "cublas64_", "cublaslt64_"];
    if CUDA.iter().any(|prefix| name.starts_with(prefix)) {
        Some(GpuLibTier::CudaRuntime)
    } else if name.starts_with("cudnn64_") {
        Some(GpuLibTier::Cudnn)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(GpuLibTier::TensorRt)
    } else {
        None
    }
}

#[cfg(unix)]
fn is_shared_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_shared_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// GPU libraries found in `dirs`, sorted by tier then file name. The first
/// directory holding a given file name wins.
pub fn preload_plan(dirs: &[PathBuf]) -> Vec<(GpuLibTier, PathBuf)> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut libs: Vec<(GpuLibTier, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for path in entries.flatten().map(|entry| entry.path()) {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if !is_shared_lib(&name, &path) {
                continue;
            }
            let Some(tier) = gpu_lib_tier(&name) else {
                continue;
            };
            if seen.insert(name.clone()) {
                libs.push((tier, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    libs.into_iter().map(|(tier, _, path)| (tier, path)).collect()
}

#[cfg(unix)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL) {
        Ok(lib) => {
            // stays mapped for the life of the process
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::Library::new(path) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
fn prepend_to_path(dirs: &[PathBuf]) {
    let current = env::var_os("PATH");
    let mut merged: Vec<PathBuf> = dirs.iter().filter(|d| d.is_dir()).cloned().collect();
    if let Some(path) = current.as_ref() {
        let existing: Vec<PathBuf> = env::split_paths(path)
            .filter(|d| !d.as_os_str().is_empty() && !merged.contains(d))
            .collect();
        merged.extend(existing);
    }
    let joined = env::join_paths(merged).unwrap_or_else(|_| current.unwrap_or_else(OsString::new));
    env::set_var("PATH", joined);
}

/// Resolve ONNX Runtime and preload GPU libraries.
///
/// Call at the start of `main()`, before any session is created. Tracing is
/// usually not installed yet, so the outcome is returned for
/// [`RuntimeLibReport::log`].
pub fn setup_runtime_libs() -> RuntimeLibReport {
    let search_dirs = candidate_lib_dirs();

    let ort_dylib = match env::var_os(ORT_DYLIB_ENV) {
        Some(path) => OrtDylib::FromEnv(PathBuf::from(path)),
        None => match find_ort_dylib(&search_dirs) {
            Some(path) => {
                env::set_var(ORT_DYLIB_ENV, &path);
                OrtDylib::Discovered(path)
            }
            None => OrtDylib::Missing,
        },
    };

    #[cfg(windows)]
    {
        if !matches!(ort_dylib, OrtDylib::FromEnv(_)) {
            prepend_to_path(&search_dirs);
        }
    }

    let preloaded = preload_plan(&search_dirs)
        .into_iter()
        .filter(|(_, path)| unsafe { load_library(path) })
        .map(|(_, path)| path)
        .collect();

    RuntimeLibReport {
        search_dirs,
        ort_dylib,
        preloaded,
    }
}

impl RuntimeLibReport {
    pub fn log(&self) {
        match &self.ort_dylib {
            OrtDylib::FromEnv(path) if !path.is_file() => {
                warn!(path = %path.display(), "ORT_DYLIB_PATH is set but the file does not exist")
            }
            OrtDylib::FromEnv(path) => {
                info!(path = %path.display(), "ORT library from environment")
            }
            OrtDylib::Discovered(path) => info!(path = %path.display(), "ORT library discovered"),
            OrtDylib::Missing => warn!(
                searched = self.search_dirs.len(),
                "ONNX Runtime not found next to the executable, relying on default search paths"
            ),
        }
        for path in &self.preloaded {
            debug!(path = %path.display(), "Preloaded GPU runtime library");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn candidate_lib_dirs_contains_system_paths() {
        let dirs = candidate_lib_dirs();
        assert!(dirs.contains(&PathBuf::from("/usr/local/lib")));
        assert!(dirs.contains(&PathBuf::from("/usr/lib")));
    }

    #[test]
    fn candidate_lib_dirs_includes_cwd_lib() {
        let dirs = candidate_lib_dirs();
        if let Ok(cwd) = env::current_dir() {
            assert!(dirs.contains(&cwd.join("lib")));
        }
    }

    #[test]
    fn find_ort_dylib_prefers_first_directory() {
        let temp = tempfile::tempdir().expect("temp dir");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).expect("first dir");
        std::fs::create_dir_all(&second).expect("second dir");
        std::fs::write(second.join(ORT_LIB_NAME), b"").expect("second lib");
        assert_eq!(
            find_ort_dylib(&[first.clone(), second.clone()]),
            Some(second.join(ORT_LIB_NAME))
        );

        std::fs::write(first.join(ORT_LIB_NAME), b"").expect("first lib");
        assert_eq!(find_ort_dylib(&[first.clone(), second]), Some(first.join(ORT_LIB_NAME)));
    }

    #[cfg(unix)]
    #[test]
    fn gpu_lib_tiers_order_cuda_before_cudnn_before_trt() {
        assert!(gpu_lib_tier("libcudart.so.12") < gpu_lib_tier("libcudnn.so.9"));
        assert!(gpu_lib_tier("libcublasLt.so.12") < gpu_lib_tier("libcudnn_ops.so.9"));
        assert!(gpu_lib_tier("libcudnn.so.9") < gpu_lib_tier("libnvinfer.so.10"));
        assert_eq!(gpu_lib_tier("libonnxruntime_providers_cuda.so"), None);
        assert_eq!(gpu_lib_tier("libpng16.so"), None);
    }

    #[cfg(unix)]
    #[test]
    fn preload_plan_sorts_by_tier_and_dedupes_names() {
        let temp = tempfile::tempdir().expect("temp dir");
        let first = temp.path().join("a");
        let second = temp.path().join("b");
        std::fs::create_dir_all(&first).expect("first dir");
        std::fs::create_dir_all(&second).expect("second dir");
        for name in ["libnvinfer.so.10", "libcudnn.so.9", "libz.so.1"] {
            std::fs::write(first.join(name), b"").expect("write lib");
        }
        for name in ["libcudart.so.12", "libcudnn.so.9"] {
            std::fs::write(second.join(name), b"").expect("write lib");
        }

        let plan = preload_plan(&[first.clone(), second.clone()]);
        let tiers: Vec<GpuLibTier> = plan.iter().map(|(tier, _)| *tier).collect();
        assert_eq!(
            tiers,
            vec![GpuLibTier::CudaRuntime, GpuLibTier::Cudnn, GpuLibTier::TensorRt]
        );
        assert_eq!(plan[1].1, first.join("libcudnn.so.9"));
        assert_eq!(plan[0].1, second.join("libcudart.so.12"));
    }

    #[test]
    fn preload_plan_skips_missing_dirs() {
        assert!(preload_plan(&[PathBuf::from("/definitely/not/here")]).is_empty());
    }
}
