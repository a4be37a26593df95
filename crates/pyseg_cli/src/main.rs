//! Command-line front end for the PySeg stages.
//!
//! Subcommands:
//! - `preseg`, `graphs`, `fils`, `picking`, `gfp`: run one stage from a
//!   JSON parameter file, optionally recording it in an output catalog
//! - `split`, `merge`: star package helpers
//! - `install-recipe`: print the PySeg installation steps as JSON
//! - `protocols`: list the registered protocols
//! - `view`: open a graphs, fils or picking run in the vesicle viewer

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use pyseg_core::config::EM_ROOT_VAR;
use pyseg_core::install::DumpVersionProbe;
use pyseg_core::protocol::ProtocolReport;
use pyseg_core::stages::{
    FilsParams, FilsStage, GfpParams, GfpStage, GraphsParams, GraphsStage, PickingParams,
    PickingStage, PresegParams, PresegStage, StageResult,
};
use pyseg_core::star::{merge_star_files, split_star_file, DEFAULT_SPLIT_PREFIX};
use pyseg_core::viewer::{SegmentationInput, VIEWER_PROGRAM_VAR};
use pyseg_core::{
    default_log_level, define_binaries, init_logging, open_db, run_and_record, run_protocol,
    CommandViewerLauncher, MrcHeaderProbe, OutputCatalog, ProcessRunner, Protocol,
    ProtocolRegistry, PysegConfig, StageContext, StageKind, ViewerLauncher, VisualizationRequest,
};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// PySeg membrane, filament and picking workflows
#[derive(Parser, Debug)]
#[command(name = "pyseg")]
#[command(version)]
struct Args {
    /// Directory for rolling log files
    #[arg(long, global = true, default_value = "logs")]
    log_dir: PathBuf,

    /// trace|debug|info|warn|error
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct StageArgs {
    /// JSON parameter file
    #[arg(long)]
    params: PathBuf,

    /// Run directory; staged files go to `<work-dir>/extra`
    #[arg(long)]
    work_dir: PathBuf,

    /// SQLite output catalog recording the run
    #[arg(long)]
    catalog: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pre-segment annotated membranes
    Preseg(StageArgs),
    /// Build membrane graphs, one job per vesicle package
    Graphs(StageArgs),
    /// Extract the filament network
    Fils(StageArgs),
    /// Pick particles on the filament network
    Picking(StageArgs),
    /// Graphs, fils and picking in one run
    Gfp(StageArgs),

    /// Split a star file into fixed-size packages
    Split {
        in_star: PathBuf,
        out_dir: PathBuf,

        #[arg(long, default_value_t = 1)]
        group_size: usize,

        #[arg(long, default_value = DEFAULT_SPLIT_PREFIX)]
        prefix: String,
    },

    /// Concatenate star files sharing one column set
    Merge {
        #[arg(long)]
        out: PathBuf,

        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },

    /// Print the installation steps as JSON
    InstallRecipe {
        /// Software root; defaults to $EM_ROOT
        #[arg(long)]
        em_root: Option<PathBuf>,
    },

    /// List registered protocols
    Protocols {
        /// Only protocols declaring this capability
        #[arg(long)]
        capability: Option<String>,
    },

    /// Open a run in the vesicle viewer
    View {
        /// graphs, fils or picking
        stage: String,

        /// Work directory of the graphs run the outputs descend from
        graphs_work_dir: PathBuf,

        /// Vesicles are tomo masks rather than pre-segmented crops
        #[arg(long)]
        tomo_masks: bool,

        /// Viewer program; defaults to $PYSEG_VIEWER
        #[arg(long)]
        viewer: Option<String>,

        #[arg(required = true)]
        vesicles: Vec<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let log_dir = if args.log_dir.is_absolute() {
        args.log_dir.clone()
    } else {
        std::env::current_dir()?.join(&args.log_dir)
    };
    let level = args.log_level.as_deref().unwrap_or(default_log_level());
    init_logging(level, &log_dir.to_string_lossy())?;

    let runtime = Runtime::from_env();
    match args.command {
        Command::Preseg(stage) => run_stage(&stage, &runtime, |params: PresegParams, ctx| {
            PresegStage::new(params, ctx)
        }),
        Command::Graphs(stage) => run_stage(&stage, &runtime, |params: GraphsParams, ctx| {
            GraphsStage::new(params, ctx)
        }),
        Command::Fils(stage) => run_stage(&stage, &runtime, |params: FilsParams, ctx| {
            FilsStage::new(params, ctx)
        }),
        Command::Picking(stage) => run_stage(&stage, &runtime, |params: PickingParams, ctx| {
            PickingStage::new(params, ctx)
        }),
        Command::Gfp(stage) => run_stage(&stage, &runtime, |params: GfpParams, ctx| {
            GfpStage::new(params, ctx)
        }),
        Command::Split {
            in_star,
            out_dir,
            group_size,
            prefix,
        } => {
            std::fs::create_dir_all(&out_dir)
                .with_context(|| format!("cannot create {}", out_dir.display()))?;
            for file in split_star_file(&in_star, &out_dir, group_size, &prefix)? {
                println!("{}", file.display());
            }
            Ok(())
        }
        Command::Merge { out, inputs } => {
            let merged = merge_star_files(&inputs, &out)?;
            println!("{} rows -> {}", merged.len(), out.display());
            Ok(())
        }
        Command::InstallRecipe { em_root } => {
            let em_root = em_root
                .or_else(|| std::env::var(EM_ROOT_VAR).ok().map(PathBuf::from))
                .context("no software root: pass --em-root or set EM_ROOT")?;
            let config = PysegConfig::from_env();
            let package = define_binaries(&em_root, &config.conda_activation, &DumpVersionProbe)?;
            println!("{}", serde_json::to_string_pretty(&package)?);
            Ok(())
        }
        Command::Protocols { capability } => {
            let registry = ProtocolRegistry::builtin()?;
            let manifests = match &capability {
                Some(capability) => registry.with_capability(capability),
                None => registry.iter().collect(),
            };
            for manifest in manifests {
                println!(
                    "{}\t{}\t{}",
                    manifest.id,
                    manifest.label,
                    manifest.capabilities.join(",")
                );
            }
            Ok(())
        }
        Command::View {
            stage,
            graphs_work_dir,
            tomo_masks,
            viewer,
            vesicles,
        } => {
            let kind = parse_stage(&stage)?;
            let input = if tomo_masks {
                SegmentationInput::TomoMasks(vesicles)
            } else {
                SegmentationInput::PresegVesicles(vesicles)
            };
            let request = VisualizationRequest::for_stage(kind, &graphs_work_dir, input)?;
            let program = viewer
                .or_else(|| std::env::var(VIEWER_PROGRAM_VAR).ok())
                .context("no viewer program: pass --viewer or set PYSEG_VIEWER")?;
            CommandViewerLauncher::new(program).launch(&request)?;
            Ok(())
        }
    }
}

/// Accepts `fils` as well as `pyseg.fils`.
fn parse_stage(value: &str) -> Result<StageKind> {
    let id = if value.contains('.') {
        value.to_string()
    } else {
        format!("pyseg.{value}")
    };
    match StageKind::from_id(&id) {
        Some(kind) => Ok(kind),
        None => bail!("unknown stage `{value}`"),
    }
}

fn read_params<T: DeserializeOwned>(path: &Path) -> Result<(T, serde_json::Value)> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read parameters {}", path.display()))?;
    let raw: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;
    let params = serde_json::from_value(raw.clone())
        .with_context(|| format!("invalid parameters in {}", path.display()))?;
    Ok((params, raw))
}

/// Configuration and collaborators shared by every stage of one invocation.
struct Runtime {
    config: PysegConfig,
    runner: ProcessRunner,
    probe: MrcHeaderProbe,
}

impl Runtime {
    fn from_env() -> Self {
        Self {
            config: PysegConfig::from_env(),
            runner: ProcessRunner::new(),
            probe: MrcHeaderProbe,
        }
    }

    fn context<'a>(&'a self, work_dir: &'a Path) -> StageContext<'a> {
        StageContext::new(work_dir, &self.config, &self.runner, &self.probe)
    }
}

fn run_stage<'a, T, P, F>(args: &'a StageArgs, runtime: &'a Runtime, build: F) -> Result<()>
where
    T: DeserializeOwned,
    P: Protocol,
    F: FnOnce(T, StageContext<'a>) -> StageResult<P>,
{
    let (params, raw) = read_params::<T>(&args.params)?;
    std::fs::create_dir_all(&args.work_dir)
        .with_context(|| format!("cannot create {}", args.work_dir.display()))?;
    let mut stage = build(params, runtime.context(&args.work_dir))?;

    let report = match &args.catalog {
        Some(path) => {
            let mut conn = open_db(path)?;
            let mut catalog = OutputCatalog::new(&mut conn);
            let (run_id, report) = run_and_record(&mut stage, &mut catalog, &args.work_dir, &raw)?;
            println!("run_id={run_id}");
            report
        }
        None => run_protocol(&mut stage)?,
    };
    print_report(&report);
    Ok(())
}

fn print_report(report: &ProtocolReport) {
    info!(
        "event=cli_stage module=cli status=ok protocol={} outputs={}",
        report.protocol_id,
        report.outputs.len()
    );
    for set in &report.outputs {
        println!("{}\t{}\t{} items", set.name, set.kind.as_str(), set.items.len());
    }
    for line in &report.summary {
        println!("{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_stage, Args, Command};
    use clap::{CommandFactory, Parser};
    use pyseg_core::star::DEFAULT_SPLIT_PREFIX;
    use pyseg_core::StageKind;
    use std::path::Path;

    #[test]
    fn command_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn stage_subcommand_parses_with_default_log_dir() {
        let args = Args::try_parse_from([
            "pyseg",
            "graphs",
            "--params",
            "graphs.json",
            "--work-dir",
            "runs/graphs",
            "--catalog",
            "catalog.db",
        ])
        .expect("valid command line");
        assert_eq!(args.log_dir, Path::new("logs"));
        assert!(args.log_level.is_none());
        let Command::Graphs(stage) = args.command else {
            panic!("expected graphs subcommand");
        };
        assert_eq!(stage.params, Path::new("graphs.json"));
        assert_eq!(stage.work_dir, Path::new("runs/graphs"));
        assert_eq!(stage.catalog.as_deref(), Some(Path::new("catalog.db")));
    }

    #[test]
    fn split_defaults_and_global_flags_after_subcommand() {
        let args = Args::try_parse_from([
            "pyseg",
            "split",
            "in.star",
            "out",
            "--log-level",
            "warn",
        ])
        .expect("valid command line");
        assert_eq!(args.log_level.as_deref(), Some("warn"));
        match args.command {
            Command::Split {
                group_size, prefix, ..
            } => {
                assert_eq!(group_size, 1);
                assert_eq!(prefix, DEFAULT_SPLIT_PREFIX);
            }
            other => panic!("unexpected subcommand {other:?}"),
        }
    }

    #[test]
    fn stage_requires_params_and_work_dir() {
        assert!(Args::try_parse_from(["pyseg", "fils", "--params", "p.json"]).is_err());
    }

    #[test]
    fn stage_names_accept_short_and_full_ids() {
        assert_eq!(parse_stage("fils").expect("short id"), StageKind::Fils);
        assert_eq!(parse_stage("pyseg.picking").expect("full id"), StageKind::Picking);
        assert!(parse_stage("preseg2").is_err());
    }
}
