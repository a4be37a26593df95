//! Installation recipe for PySeg and its native dependencies.
//!
//! # Responsibility
//! - Check that the host compilers can build DisPerSE.
//! - Emit the ordered shell steps that fetch and build the toolsuite.
//!
//! # Invariants
//! - Each step creates a flag file so a rerun skips finished work.
//! - Nothing is executed here; steps are handed to an installer.

use crate::config::{disperse_build_dir, CFITSIO, DEFAULT_VERSION, DISPERSE, PYSEG, PYSEG_ENV_NAME};
use crate::error::ErrorKind;
use log::{info, warn};
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::process::Command;

pub const PYSEG_SOURCE_URL: &str =
    "https://github.com/anmartinezs/pyseg_system/archive/refs/tags/v1.1.tar.gz";
pub const DISPERSE_SOURCE_URL: &str =
    "https://github.com/thierry-sousbie/DisPerSE/archive/refs/heads/master.tar.gz";
pub const CFITSIO_TARBALL: &str = "cfitsio_3.380.tar.gz";

pub const MIN_COMPILER_MAJOR: u32 = 5;
pub const MAX_COMPILER_MAJOR: u32 = 12;

/// Programs the recipe shells out to.
pub const NEEDED_PROGRAMS: &[&str] = &["wget", "make", "cmake", "tar"];
/// pkg-config names checked before building.
pub const LIB_CHECKS: &[&str] = &["gsl"];
/// DisPerSE binaries the graphs stage calls.
pub const DISPERSE_BINARIES: &[&str] = &["fieldconv", "mse", "netconv", "skelconv"];

const PIP_PACKAGES: &[&str] = &[
    "setuptools<58",
    "beautifulsoup4==4.9.3",
    "lxml==4.6.3",
    "pillow==6.2.2",
    "pywavelets==1.1.1",
    "pyfits==3.5",
    "scikit-image==0.14.5",
    "scikit-learn==0.20.4",
    "scikit-fmm==2021.2.2",
    "scipy==1.2.1",
    "vtk==8.1.2",
    "astropy==4.1",
    "imageio==2.9.0",
];

/// Installation failures.
#[derive(Debug)]
pub enum InstallError {
    /// Host toolchain cannot build the native dependencies.
    Configuration(String),
    CompilerProbe {
        compiler: String,
        message: String,
    },
}

impl InstallError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

impl Display for InstallError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration(message) => f.write_str(message),
            Self::CompilerProbe { compiler, message } => {
                write!(f, "cannot query `{compiler}` version: {message}")
            }
        }
    }
}

impl Error for InstallError {}

/// Reports the major version of a C/C++ compiler.
pub trait CompilerProbe {
    fn major_version(&self, compiler: &str) -> Result<u32, InstallError>;
}

/// Runs `<compiler> -dumpversion`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DumpVersionProbe;

impl CompilerProbe for DumpVersionProbe {
    fn major_version(&self, compiler: &str) -> Result<u32, InstallError> {
        let probe_err = |message: String| InstallError::CompilerProbe {
            compiler: compiler.to_string(),
            message,
        };
        let output = Command::new(compiler)
            .arg("-dumpversion")
            .output()
            .map_err(|err| probe_err(err.to_string()))?;
        let text = String::from_utf8_lossy(&output.stdout);
        parse_major_version(&text).ok_or_else(|| probe_err(format!("unexpected output `{}`", text.trim())))
    }
}

/// Major component of a dotted version string.
pub fn parse_major_version(text: &str) -> Option<u32> {
    text.trim().split('.').next()?.parse().ok()
}

/// Checks that gcc and g++ share one major version inside the supported
/// range.
pub fn check_compiling_drivers(gcc: u32, gpp: u32) -> Result<(), InstallError> {
    let in_range = (MIN_COMPILER_MAJOR..=MAX_COMPILER_MAJOR).contains(&gcc);
    if gcc == gpp && in_range {
        return Ok(());
    }
    Err(InstallError::Configuration(format!(
        "gcc-{gcc} detected. g++-{gpp} detected. Required conditions: \
         [1] Both compilers version must be the same. \
         [2] Compiler version must be in range [{MIN_COMPILER_MAJOR}, {MAX_COMPILER_MAJOR}]."
    )))
}

/// One shell command and the files proving it completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallStep {
    pub command: String,
    pub targets: Vec<String>,
}

/// Installable package: ordered steps plus host prerequisites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallPackage {
    pub name: String,
    pub version: String,
    pub home: PathBuf,
    pub steps: Vec<InstallStep>,
    pub needed_programs: Vec<String>,
    pub lib_checks: Vec<String>,
    pub default: bool,
}

fn installed_flag(name: &str) -> String {
    format!("{name}_installed")
}

/// Builds the PySeg installation package rooted at `<em_root>/pyseg-v1.1`.
///
/// `conda_activation` is the prefix making `conda` usable in a
/// non-interactive shell; it may be empty.
pub fn define_binaries(
    em_root: &Path,
    conda_activation: &str,
    probe: &impl CompilerProbe,
) -> Result<InstallPackage, InstallError> {
    let gcc = probe.major_version("gcc")?;
    let gpp = probe.major_version("g++")?;
    if let Err(err) = check_compiling_drivers(gcc, gpp) {
        warn!(
            "event=install_recipe module=install status=error error_code=compiler_mismatch gcc={} gpp={}",
            gcc, gpp
        );
        return Err(err);
    }

    let home = em_root.join(format!("{PYSEG}-{DEFAULT_VERSION}"));
    let system_dir = home.join(format!("pyseg_system-{}", DEFAULT_VERSION.trim_start_matches('v')));
    let third_party = system_dir
        .join("sys")
        .join("install")
        .join(DISPERSE)
        .join("0.9.24_pyseg_gcc7")
        .join("sources");
    let cfitsio_build = home.join(format!("{CFITSIO}_build"));

    let env_flag = installed_flag(PYSEG_ENV_NAME);
    let src_flag = installed_flag("pysegSrcDl");
    let cfitsio_flag = installed_flag(CFITSIO);
    let disperse_flag = installed_flag(DISPERSE);
    let pyseg_flag = installed_flag(PYSEG);

    let mut final_targets = vec![pyseg_flag.clone()];
    final_targets.extend(
        DISPERSE_BINARIES
            .iter()
            .map(|bin| disperse_build_dir(&home).join("bin").join(bin).display().to_string()),
    );

    let steps = vec![
        InstallStep {
            command: conda_env_command(conda_activation, &env_flag),
            targets: vec![env_flag],
        },
        InstallStep {
            command: source_download_command(&home, &src_flag),
            targets: vec![src_flag],
        },
        InstallStep {
            command: cfitsio_command(&third_party, &home, &cfitsio_build, &cfitsio_flag),
            targets: vec![cfitsio_flag],
        },
        InstallStep {
            command: disperse_command(&home, &cfitsio_build, &disperse_flag),
            targets: vec![disperse_flag],
        },
        InstallStep {
            command: format!("cd {} && touch {pyseg_flag}", home.display()),
            targets: final_targets,
        },
    ];

    info!(
        "event=install_recipe module=install status=ok home={} steps={} gcc={}",
        home.display(),
        steps.len(),
        gcc
    );
    Ok(InstallPackage {
        name: PYSEG.to_string(),
        version: DEFAULT_VERSION.to_string(),
        home,
        steps,
        needed_programs: NEEDED_PROGRAMS.iter().map(|p| p.to_string()).collect(),
        lib_checks: LIB_CHECKS.iter().map(|l| l.to_string()).collect(),
        default: true,
    })
}

fn conda_env_command(conda_activation: &str, flag: &str) -> String {
    let mut parts = Vec::new();
    let activation = conda_activation.trim().trim_end_matches("&&").trim();
    if !activation.is_empty() {
        parts.push(activation.to_string());
    }
    parts.push(format!(
        "conda create -y -n {PYSEG_ENV_NAME} -c conda-forge -c anaconda python=3.7 \
         opencv=4.2.0 graph-tool=2.29 future=0.18.2=py37_0"
    ));
    parts.push(format!("conda activate {PYSEG_ENV_NAME}"));
    parts.extend(PIP_PACKAGES.iter().map(|pkg| format!("pip install \"{pkg}\"")));
    parts.push(format!("touch {flag}"));
    parts.join(" && ")
}

fn source_download_command(home: &Path, flag: &str) -> String {
    let archive = PYSEG_SOURCE_URL.rsplit('/').next().unwrap_or_default();
    [
        format!("wget {PYSEG_SOURCE_URL}"),
        format!(
            "tar zxf {} --directory={}",
            home.join(archive).display(),
            home.display()
        ),
        format!("rm -rf {}", home.join(archive).display()),
        format!("cd {}", home.display()),
        format!("touch {flag}"),
    ]
    .join(" && ")
}

fn cfitsio_command(third_party: &Path, home: &Path, build: &Path, flag: &str) -> String {
    [
        format!(
            "tar zxf {} --directory={}",
            third_party.join(CFITSIO_TARBALL).display(),
            home.display()
        ),
        format!("cd {}", home.join(CFITSIO).display()),
        format!("mkdir {}", build.display()),
        format!("./configure --prefix={}", build.display()),
        "make && make install".to_string(),
        format!("cd {}", home.display()),
        format!("touch {flag}"),
    ]
    .join(" && ")
}

fn disperse_command(home: &Path, cfitsio_build: &Path, flag: &str) -> String {
    let archive = DISPERSE_SOURCE_URL.rsplit('/').next().unwrap_or_default();
    [
        format!("cd {} && rm -rf {DISPERSE}*", home.display()),
        format!("wget {DISPERSE_SOURCE_URL}"),
        format!("tar zxf {archive} --directory={}", home.display()),
        format!("cd {}", home.join(format!("{DISPERSE}-master")).display()),
        format!(
            "cmake . -DCMAKE_INSTALL_PREFIX={} -DCFITSIO_DIR={}",
            disperse_build_dir(home).display(),
            cfitsio_build.display()
        ),
        "make && make install".to_string(),
        format!("cd {}", home.display()),
        format!("touch {flag}"),
    ]
    .join(" && ")
}
