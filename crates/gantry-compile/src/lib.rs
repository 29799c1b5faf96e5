//! # gantry-compile
//!
//! Turns CUDA kernel source into a [`Cubin`] the driver can load, by running
//! `nvcc -cubin` in a scratch directory.
//!
//! ```no_run
//! use gantry_compile::Compiler;
//!
//! # fn main() -> gantry_core::Result<()> {
//! let compiler = Compiler::new("nvcc").with_arch("sm_80");
//! let compiled = compiler.compile(
//!     "extern \"C\" __global__ void increment_kernel(int *d, int v) { d[threadIdx.x] += v; }",
//! )?;
//! println!("{}", compiled.cubin().path().display());
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::process::Command;

use gantry_core::{Cubin, Error, Result, RuntimeConfig};
use tempfile::TempDir;

/// Runs the device-code compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compiler {
    nvcc: PathBuf,
    arch: Option<String>,
    extra_args: Vec<String>,
}

impl Compiler {
    pub fn new(nvcc: impl Into<PathBuf>) -> Self {
        Self {
            nvcc: nvcc.into(),
            arch: None,
            extra_args: Vec::new(),
        }
    }

    /// Compiler executable and target architecture from `config`.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            nvcc: config.nvcc_path(),
            arch: config.arch.clone(),
            extra_args: Vec::new(),
        }
    }

    /// Target architecture, passed as `-arch`.
    pub fn with_arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = Some(arch.into());
        self
    }

    /// Append a raw compiler flag.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    pub fn nvcc(&self) -> &Path {
        &self.nvcc
    }

    pub fn arch(&self) -> Option<&str> {
        self.arch.as_deref()
    }

    /// Compile kernel source held in memory.
    pub fn compile(&self, source: &str) -> Result<CompiledCubin> {
        self.run(source, "kernel")
    }

    /// Compile a `.cu` file from disk.
    pub fn compile_file(&self, path: &Path) -> Result<CompiledCubin> {
        let source = std::fs::read_to_string(path)?;
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("kernel");
        self.run(&source, stem)
    }

    fn run(&self, source: &str, stem: &str) -> Result<CompiledCubin> {
        let dir = tempfile::Builder::new().prefix("gantry-nvcc").tempdir()?;
        let cu_name = format!("{stem}.cu");
        let cubin_name = format!("{stem}.cubin");
        std::fs::write(dir.path().join(&cu_name), source)?;

        let mut cmd = Command::new(&self.nvcc);
        cmd.current_dir(dir.path())
            .arg("-cubin")
            .arg(&cu_name)
            .arg("-o")
            .arg(&cubin_name);
        if let Some(arch) = &self.arch {
            cmd.arg("-arch").arg(arch);
        }
        cmd.args(&self.extra_args);

        tracing::debug!(nvcc = %self.nvcc.display(), source = %cu_name, "compiling");
        let output = cmd.output().map_err(|e| Error::CompileFailure {
            diagnostics: format!("unable to execute {}: {e}", self.nvcc.display()),
        })?;

        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(Error::CompileFailure {
                diagnostics: format!("{} exited with {}\n{log}", self.nvcc.display(), output.status),
            });
        }
        let cubin_path = dir.path().join(&cubin_name);
        if !cubin_path.is_file() {
            return Err(Error::CompileFailure {
                diagnostics: format!("{} produced no {cubin_name}\n{log}", self.nvcc.display()),
            });
        }
        tracing::debug!(cubin = %cubin_path.display(), "compiled");
        Ok(CompiledCubin {
            cubin: Cubin::new(cubin_path),
            log,
            _dir: dir,
        })
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

/// Compiler output. The cubin lives in a scratch directory removed on drop.
#[derive(Debug)]
pub struct CompiledCubin {
    cubin: Cubin,
    log: String,
    _dir: TempDir,
}

impl CompiledCubin {
    pub fn cubin(&self) -> &Cubin {
        &self.cubin
    }

    /// Everything the compiler printed.
    pub fn log(&self) -> &str {
        &self.log
    }

    /// Copy the cubin to `dest` so it outlives this value.
    pub fn persist(&self, dest: &Path) -> Result<Cubin> {
        std::fs::copy(self.cubin.path(), dest)?;
        Ok(Cubin::new(dest))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::OnceLock;

    const OK_SCRIPT: &str = r#"#!/bin/sh
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift ;;
  esac
  shift
done
[ -f kernel.cu ] || [ -f scale.cu ] || { echo "no source" >&2; exit 1; }
echo "ptxas info: args ok"
printf 'CUBIN' > "$out"
"#;

    const ARGS_SCRIPT: &str = r#"#!/bin/sh
echo "$@" > args.txt
cp args.txt kernel.cubin
"#;

    const FAIL_SCRIPT: &str = r#"#!/bin/sh
echo "kernel.cu(3): error: expected a \";\"" >&2
exit 2
"#;

    const SILENT_SCRIPT: &str = "#!/bin/sh\nexit 0\n";

    /// All fake compilers are written before any test spawns one, so no
    /// script is still open for writing when another test forks.
    fn fakes() -> &'static Path {
        static DIR: OnceLock<TempDir> = OnceLock::new();
        DIR.get_or_init(|| {
            let dir = tempfile::tempdir().unwrap();
            for (name, body) in [
                ("nvcc-ok", OK_SCRIPT),
                ("nvcc-args", ARGS_SCRIPT),
                ("nvcc-fail", FAIL_SCRIPT),
                ("nvcc-silent", SILENT_SCRIPT),
            ] {
                let path = dir.path().join(name);
                std::fs::write(&path, body).unwrap();
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            }
            dir
        })
        .path()
    }

    fn fake(name: &str) -> Compiler {
        Compiler::new(fakes().join(name))
    }

    #[test]
    fn test_compile_success() {
        let compiled = fake("nvcc-ok").compile("__global__ void k() {}").unwrap();
        assert!(compiled.log().contains("ptxas info"));
        assert_eq!(std::fs::read(compiled.cubin().path()).unwrap(), b"CUBIN");
        assert_eq!(compiled.cubin().path().file_name().unwrap(), "kernel.cubin");
    }

    #[test]
    fn test_scratch_dir_removed_on_drop() {
        let compiled = fake("nvcc-ok").compile("__global__ void k() {}").unwrap();
        let path = compiled.cubin().path().to_path_buf();
        assert!(path.exists());
        drop(compiled);
        assert!(!path.exists());
    }

    #[test]
    fn test_persist() {
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("saved.cubin");
        let cubin = {
            let compiled = fake("nvcc-ok").compile("__global__ void k() {}").unwrap();
            compiled.persist(&dest).unwrap()
        };
        assert_eq!(std::fs::read(cubin.path()).unwrap(), b"CUBIN");
    }

    #[test]
    fn test_arguments() {
        let compiled = fake("nvcc-args")
            .with_arch("sm_80")
            .arg("-O3")
            .compile("")
            .unwrap();
        let args = std::fs::read_to_string(compiled.cubin().path()).unwrap();
        assert_eq!(args.trim(), "-cubin kernel.cu -o kernel.cubin -arch sm_80 -O3");
    }

    #[test]
    fn test_compile_file_keeps_stem() {
        let src = tempfile::tempdir().unwrap();
        let path = src.path().join("scale.cu");
        std::fs::write(&path, "__global__ void scale() {}").unwrap();
        let compiled = fake("nvcc-ok").compile_file(&path).unwrap();
        assert_eq!(compiled.cubin().path().file_name().unwrap(), "scale.cubin");
    }

    #[test]
    fn test_compile_file_missing_is_io_error() {
        let src = tempfile::tempdir().unwrap();
        let err = fake("nvcc-ok").compile_file(&src.path().join("absent.cu")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_nonzero_exit_is_compile_failure() {
        let err = fake("nvcc-fail").compile("broken").unwrap_err();
        match err {
            Error::CompileFailure { diagnostics } => {
                assert!(diagnostics.contains("expected a"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_output_is_compile_failure() {
        let err = fake("nvcc-silent").compile("").unwrap_err();
        match err {
            Error::CompileFailure { diagnostics } => {
                assert!(diagnostics.contains("produced no kernel.cubin"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_executable_is_compile_failure() {
        let missing = fakes().join("no-such-nvcc");
        let err = Compiler::new(&missing).compile("").unwrap_err();
        match err {
            Error::CompileFailure { diagnostics } => {
                assert!(diagnostics.contains("unable to execute"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_from_config() {
        let cfg = RuntimeConfig {
            nvcc: Some(PathBuf::from("/opt/cuda/bin/nvcc")),
            arch: Some("sm_75".into()),
            ..Default::default()
        };
        let compiler = Compiler::from_config(&cfg);
        assert_eq!(compiler.nvcc(), Path::new("/opt/cuda/bin/nvcc"));
        assert_eq!(compiler.arch(), Some("sm_75"));
        assert_eq!(Compiler::default().nvcc(), RuntimeConfig::default().nvcc_path());
    }
}
