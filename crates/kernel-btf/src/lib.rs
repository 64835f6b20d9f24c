//! One-shot discovery and loading of kernel BTF type metadata.
//!
//! The observer needs the kernel's type information exactly once, at
//! startup, before any probe is loaded. [`init_cached_btf`] locates the
//! BTF blob, parses it, and caches both the chosen path and the spec for
//! the lifetime of the process; everything after boot reads the cached
//! value through [`cached_btf`].
//!
//! Discovery prefers, in order: an explicit caller-provided path, the
//! `KESTREL_BTF` environment override, the blob exposed by the kernel
//! itself, a versioned `vmlinux-<release>` under the agent lib
//! directory, and finally a plain `btf` file there.

use std::{
    env,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use aya_obj::btf::{Btf, BtfError};
use nix::sys::utsname::uname;
use object::Endianness;
use thiserror::Error;

/// Environment variable overriding BTF auto-discovery.
pub const BTF_PATH_ENV: &str = "KESTREL_BTF";
/// BTF blob exposed by the running kernel.
const DEFAULT_KERNEL_BTF: &str = "/sys/kernel/btf/vmlinux";
/// Split BTF carrying types added on top of the base kernel.
const OVERLAY_BTF: &str = "/sys/kernel/btf/overlay";

#[derive(Error, Debug)]
pub enum KernelBtfError {
    #[error("specified BTF file {0} does not exist")]
    MissingFile(PathBuf),
    #[error("kernel release lookup (uname -r) failed")]
    Uname(#[source] nix::Error),
    #[error("no BTF metadata found for kernel {kernel}")]
    NotFound { kernel: String },
    #[error("loading BTF from {path}")]
    Load {
        path: PathBuf,
        #[source]
        source: BtfError,
    },
    #[error("kernel BTF already initialized")]
    AlreadyInitialized,
}

/// Kernel type metadata, loaded once at startup.
pub struct KernelBtf {
    file: PathBuf,
    spec: Btf,
    overlay: Option<Btf>,
}

impl KernelBtf {
    /// Path the spec was loaded from.
    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn spec(&self) -> &Btf {
        &self.spec
    }

    /// Types the running kernel exposes on top of the base spec, when an
    /// overlay is present and parses. Consumers that resolve a type
    /// should consult this first.
    pub fn overlay(&self) -> Option<&Btf> {
        self.overlay.as_ref()
    }
}

static KERNEL_BTF: OnceLock<KernelBtf> = OnceLock::new();

/// Locates, parses and caches the kernel BTF spec. `lib` is the agent
/// library directory searched for packaged metadata; `btf_file` is an
/// explicit path that bypasses discovery. Errors on a second call.
pub fn init_cached_btf(lib: &Path, btf_file: Option<&Path>) -> Result<(), KernelBtfError> {
    if KERNEL_BTF.get().is_some() {
        return Err(KernelBtfError::AlreadyInitialized);
    }
    let file = find_btf(lib, btf_file)?;
    let spec = load_spec(&file)?;
    let overlay = load_overlay(Path::new(OVERLAY_BTF));
    KERNEL_BTF
        .set(KernelBtf {
            file,
            spec,
            overlay,
        })
        .map_err(|_| KernelBtfError::AlreadyInitialized)
}

/// The spec cached by [`init_cached_btf`], if initialization ran.
pub fn cached_btf() -> Option<&'static KernelBtf> {
    KERNEL_BTF.get()
}

/// The path the cached spec was loaded from.
pub fn cached_btf_file() -> Option<&'static Path> {
    KERNEL_BTF.get().map(KernelBtf::file)
}

fn find_btf(lib: &Path, btf_file: Option<&Path>) -> Result<PathBuf, KernelBtfError> {
    let env_override = env::var_os(BTF_PATH_ENV).map(PathBuf::from);
    let release = kernel_release()?;
    discover(
        btf_file,
        env_override,
        Path::new(DEFAULT_KERNEL_BTF),
        lib,
        &release,
    )
}

fn kernel_release() -> Result<String, KernelBtfError> {
    let utsname = uname().map_err(KernelBtfError::Uname)?;
    Ok(utsname.release().to_string_lossy().into_owned())
}

fn discover(
    explicit: Option<&Path>,
    env_override: Option<PathBuf>,
    kernel_btf: &Path,
    lib: &Path,
    kernel_release: &str,
) -> Result<PathBuf, KernelBtfError> {
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(KernelBtfError::MissingFile(path.to_owned()));
        }
        log::info!("BTF discovery: using specified file {}", path.display());
        return Ok(path.to_owned());
    }
    if let Some(path) = env_override {
        if !path.exists() {
            return Err(KernelBtfError::MissingFile(path));
        }
        log::info!("BTF discovery: using {BTF_PATH_ENV} override {}", path.display());
        return Ok(path);
    }
    if kernel_btf.exists() {
        log::info!("BTF discovery: kernel btf file found {}", kernel_btf.display());
        return Ok(kernel_btf.to_owned());
    }
    log::info!(
        "BTF discovery: kernel btf file {} does not exist",
        kernel_btf.display()
    );
    let candidate = lib.join("metadata").join(format!("vmlinux-{kernel_release}"));
    if candidate.exists() {
        log::info!("BTF discovery: candidate btf file found {}", candidate.display());
        return Ok(candidate);
    }
    let candidate = lib.join("btf");
    if candidate.exists() {
        log::info!("BTF discovery: candidate btf file found {}", candidate.display());
        return Ok(candidate);
    }
    Err(KernelBtfError::NotFound {
        kernel: kernel_release.to_owned(),
    })
}

fn load_spec(path: &Path) -> Result<Btf, KernelBtfError> {
    Btf::parse_file(path, Endianness::default()).map_err(|source| KernelBtfError::Load {
        path: path.to_owned(),
        source,
    })
}

/// Best effort: kernels without an overlay, or with one we cannot parse,
/// leave the base spec as is.
fn load_overlay(path: &Path) -> Option<Btf> {
    if !path.exists() {
        return None;
    }
    match Btf::parse_file(path, Endianness::default()) {
        Ok(spec) => {
            log::info!("BTF discovery: overlay loaded from {}", path.display());
            Some(spec)
        }
        Err(err) => {
            log::warn!("failed to load BTF overlay {}: {err}", path.display());
            None
        }
    }
}
