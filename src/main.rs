//! acpc-align CLI: matrix inspection tools used around the alignment pipeline.

use std::path::{Path, PathBuf};

use acpc_align::{
    AffineMatrix, Axis, BoxInset, BoxOrigin, RotationTriple, VolumeMeta,
    extent::{inset_axis_bounds, transformed_dim},
    rotation::{decompose, rotation_affine},
};
use clap::{Args, Parser, Subcommand, ValueEnum};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "acpc-align")]
#[command(about = "Inspect and build affine matrices for ACPC alignment")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the rotation angles (degrees, x y z) of a matrix file.
    Decompose {
        /// Path to a 4x4 matrix text file.
        #[arg(long)]
        xform: PathBuf,
    },

    /// Print the bounds of a transformed voxel grid along one axis.
    AxisBounds(AxisBoundsArgs),

    /// Print the rotation matrix for the given angles.
    Compose {
        /// Rotation about x in degrees.
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        xrot: f64,

        /// Rotation about y in degrees.
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        yrot: f64,

        /// Rotation about z in degrees.
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        zrot: f64,
    },
}

#[derive(Debug, Clone, Args)]
struct AxisBoundsArgs {
    #[arg(long)]
    dim1: usize,

    #[arg(long)]
    dim2: usize,

    #[arg(long)]
    dim3: usize,

    #[arg(long, default_value_t = 1.0)]
    pixdim1: f64,

    #[arg(long, default_value_t = 1.0)]
    pixdim2: f64,

    #[arg(long, default_value_t = 1.0)]
    pixdim3: f64,

    /// Path to a 4x4 matrix text file.
    #[arg(long)]
    xform: PathBuf,

    #[arg(long, value_enum, default_value_t = AxisArg::Z)]
    axis: AxisArg,

    /// Whether voxel indices address corners or centres.
    #[arg(long, value_enum, default_value_t = OriginArg::Centre)]
    origin: OriginArg,

    /// Box faces pulled inwards by `--offset` before transforming.
    #[arg(long, value_enum, default_value_t = BoundaryArg::Both)]
    boundary: BoundaryArg,

    /// Inset distance in voxels.
    #[arg(long, default_value_t = 1e-4)]
    offset: f64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AxisArg {
    X,
    Y,
    Z,
}

impl From<AxisArg> for Axis {
    fn from(arg: AxisArg) -> Self {
        match arg {
            AxisArg::X => Axis::X,
            AxisArg::Y => Axis::Y,
            AxisArg::Z => Axis::Z,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OriginArg {
    Corner,
    Centre,
}

impl From<OriginArg> for BoxOrigin {
    fn from(arg: OriginArg) -> Self {
        match arg {
            OriginArg::Corner => BoxOrigin::Corner,
            OriginArg::Centre => BoxOrigin::Centre,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BoundaryArg {
    None,
    Low,
    High,
    Both,
}

impl From<BoundaryArg> for BoxInset {
    fn from(arg: BoundaryArg) -> Self {
        match arg {
            BoundaryArg::None => BoxInset::Neither,
            BoundaryArg::Low => BoxInset::Low,
            BoundaryArg::High => BoxInset::High,
            BoundaryArg::Both => BoxInset::Both,
        }
    }
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Decompose { xform } => run_decompose(&xform),
        Commands::AxisBounds(args) => run_axis_bounds(&args),
        Commands::Compose { xrot, yrot, zrot } => {
            run_compose(RotationTriple::new(xrot, yrot, zrot))
        }
    }
}

fn run_decompose(xform: &Path) -> CliResult<()> {
    let matrix = AffineMatrix::read_from_file(xform)?;
    let decomposition = decompose(&matrix)?;
    let angles = decomposition.rotations;
    tracing::debug!(scales = ?decomposition.scales, "Decomposed {}", xform.display());
    println!("{:.3} {:.3} {:.3}", angles.x, angles.y, angles.z);
    Ok(())
}

fn run_axis_bounds(args: &AxisBoundsArgs) -> CliResult<()> {
    let matrix = AffineMatrix::read_from_file(&args.xform)?;
    let meta = VolumeMeta::new(
        [args.dim1, args.dim2, args.dim3],
        [args.pixdim1, args.pixdim2, args.pixdim3],
    );
    let axis = Axis::from(args.axis);
    let bounds = inset_axis_bounds(
        &meta,
        &matrix,
        args.origin.into(),
        args.boundary.into(),
        args.offset,
    )?[axis.index()];
    println!("({}, {}) = {}", bounds.lo, bounds.hi, bounds.extent());

    let dim = transformed_dim(&meta, &matrix, axis, meta.pixdim(axis))?;
    tracing::info!(%axis, original = meta.dim(axis), transformed = dim, "Voxels needed along axis");
    Ok(())
}

fn run_compose(angles: RotationTriple) -> CliResult<()> {
    print!("{}", rotation_affine(angles));
    Ok(())
}
